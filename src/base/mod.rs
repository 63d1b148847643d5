//! Base types and error handling.
//!
//! - [`AuditError`](error::AuditError): every failure the harness can report
//! - [`ErrorClass`](error::ErrorClass): how far a failure may propagate
//! - [`context`]: IO error context helpers

pub mod context;
pub mod error;

pub use error::{AuditError, ErrorClass};
