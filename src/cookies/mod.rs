//! Third-party cookie capture.
//!
//! | Type | Responsibility |
//! |------|----------------|
//! | [`CapturedCookie`](capturedcookie::CapturedCookie) | One cookie parsed from a `Set-Cookie` header |
//! | [`CookieStore`](store::CookieStore) | Per-domain collection, one entry per `(name, domain)` |
//!
//! A store lives for exactly one domain visit. The proxy writes into it from
//! concurrent response handlers while the request path reads snapshots; the
//! runner drains it once the browser session is over.
//!
//! ```rust
//! use tcfaudit::cookies::{CapturedCookie, CookieStore};
//! use time::OffsetDateTime;
//!
//! let store = CookieStore::new();
//! let now = OffsetDateTime::now_utc();
//! for value in ["1", "2"] {
//!     let line = format!("id={value}; Path=/");
//!     if let Some(c) = CapturedCookie::from_set_cookie(&line, "ads.example", now) {
//!         store.upsert(c);
//!     }
//! }
//! assert_eq!(store.snapshot()[0].value, "2");
//! ```

pub mod capturedcookie;
pub mod store;

pub use capturedcookie::CapturedCookie;
pub use store::{CookieStore, Upsert};
