//! Synthetic consent records and their encoded form.
//!
//! The builder turns live CMP metadata plus a configured [`ConsentPolicy`]
//! into a [`ConsentRecord`]; a [`ConsentCodec`] turns that into the string
//! written into the page's cookies and local storage.

pub(crate) mod bits;
pub mod builder;
pub mod codec;
pub mod record;

pub use builder::{ConsentPolicy, ConsentRecordBuilder};
pub use codec::{core_segment, ConsentCodec, TcfV2Codec};
pub use record::{CmpIdentity, ConsentRecord, PublisherTc, VendorRange, VendorSection};
