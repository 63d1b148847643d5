//! Resume point of a batch: the index of the next domain to process.

use crate::base::error::AuditError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub trait Checkpoint: Send {
    /// Next index to process. Never fails; unusable state reads as 0.
    fn load(&mut self) -> usize;

    fn save(&mut self, next_index: usize) -> Result<(), AuditError>;
}

/// A plaintext file holding one integer.
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Checkpoint for FileCheckpoint {
    fn load(&mut self) -> usize {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "checkpoint unreadable, starting at 0");
                return 0;
            }
        };
        match text.trim().parse::<usize>() {
            Ok(index) => index,
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    content = %text.trim(),
                    error = %e,
                    "checkpoint unparsable, starting at 0"
                );
                0
            }
        }
    }

    fn save(&mut self, next_index: usize) -> Result<(), AuditError> {
        fs::write(&self.path, next_index.to_string()).map_err(|e| AuditError::Checkpoint {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

/// In-memory checkpoint that records every saved value.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    current: usize,
    history: Mutex<Vec<usize>>,
}

impl MemoryCheckpoint {
    pub fn starting_at(index: usize) -> Self {
        Self {
            current: index,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Every value passed to `save`, oldest first.
    pub fn history(&self) -> Vec<usize> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

impl Checkpoint for MemoryCheckpoint {
    fn load(&mut self) -> usize {
        self.current
    }

    fn save(&mut self, next_index: usize) -> Result<(), AuditError> {
        self.current = next_index;
        if let Ok(mut history) = self.history.lock() {
            history.push(next_index);
        }
        Ok(())
    }
}

impl<T: Checkpoint + ?Sized> Checkpoint for &mut T {
    fn load(&mut self) -> usize {
        (**self).load()
    }

    fn save(&mut self, next_index: usize) -> Result<(), AuditError> {
        (**self).save(next_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_zero() {
        let dir = tempdir().unwrap();
        let mut checkpoint = FileCheckpoint::new(dir.path().join("progress.txt"));
        assert_eq!(checkpoint.load(), 0);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.txt");
        let mut checkpoint = FileCheckpoint::new(&path);
        checkpoint.save(17).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "17");
        assert_eq!(checkpoint.load(), 17);
    }

    #[test]
    fn test_whitespace_trimmed_and_garbage_is_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("progress.txt");
        fs::write(&path, " 42\n").unwrap();
        assert_eq!(FileCheckpoint::new(&path).load(), 42);

        fs::write(&path, "forty-two").unwrap();
        assert_eq!(FileCheckpoint::new(&path).load(), 0);
    }

    #[test]
    fn test_unwritable_path_is_checkpoint_error() {
        let dir = tempdir().unwrap();
        let mut checkpoint = FileCheckpoint::new(dir.path().join("missing").join("progress.txt"));
        let err = checkpoint.save(1).unwrap_err();
        assert!(matches!(err, AuditError::Checkpoint { .. }));
    }

    #[test]
    fn test_memory_history() {
        let mut checkpoint = MemoryCheckpoint::starting_at(3);
        assert_eq!(checkpoint.load(), 3);
        checkpoint.save(4).unwrap();
        checkpoint.save(0).unwrap();
        assert_eq!(checkpoint.history(), vec![4, 0]);
        assert_eq!(checkpoint.current(), 0);
    }
}
