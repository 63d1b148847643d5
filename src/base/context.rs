//! Ergonomic error context helpers.
//!
//! Extension traits that lift `std::io::Error` into the matching
//! [`AuditError`] variant with the address or path that failed.

use crate::base::error::AuditError;
use std::io;
use std::path::Path;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Attach the listen address to a bind error.
    ///
    /// # Example
    /// ```ignore
    /// use tcfaudit::base::context::IoResultExt;
    ///
    /// let listener = socket.bind(addr).bind_context(&addr.to_string())?;
    /// // Error: "proxy could not bind 127.0.0.1:8080: address in use"
    /// ```
    fn bind_context(self, addr: &str) -> Result<T, AuditError>;

    /// Attach the file path to a filesystem error.
    fn file_context(self, path: &Path) -> Result<T, AuditError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn bind_context(self, addr: &str) -> Result<T, AuditError> {
        self.map_err(|source| AuditError::ProxyBind {
            addr: addr.to_string(),
            source,
        })
    }

    fn file_context(self, path: &Path) -> Result<T, AuditError> {
        self.map_err(|source| AuditError::File {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_bind_context() {
        let result: Result<(), io::Error> = Err(Error::new(ErrorKind::AddrInUse, "in use"));
        let err = result.bind_context("127.0.0.1:8080").unwrap_err();

        match err {
            AuditError::ProxyBind { addr, source } => {
                assert_eq!(addr, "127.0.0.1:8080");
                assert_eq!(source.kind(), ErrorKind::AddrInUse);
            }
            _ => panic!("Expected ProxyBind"),
        }
    }

    #[test]
    fn test_file_context() {
        let result: Result<(), io::Error> = Err(Error::new(ErrorKind::NotFound, "missing"));
        let err = result.file_context(Path::new("output.csv")).unwrap_err();

        match err {
            AuditError::File { path, .. } => assert_eq!(path, Path::new("output.csv")),
            _ => panic!("Expected File"),
        }
    }
}
