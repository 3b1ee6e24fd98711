//! Capability-scoped access to the single shared folder.
//!
//! The folder can disappear or lose its permissions while the server runs, so
//! every operation re-validates the root and reports failures explicitly.
//! Handles obtained earlier are only names; they are resolved again on use.

pub mod local;

use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::LocalFolder;

/// Readable byte stream for a stored file.
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;
/// Writable byte stream for a stored file.
pub type WriteStream = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The folder itself is gone or no longer readable/writable.
    #[error("shared folder is not accessible: {0}")]
    Access(String),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A regular file in the shared folder, as seen by the last listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modified: SystemTime,
    pub mime: String,
}

impl FileEntry {
    pub fn handle(&self) -> FileHandle {
        FileHandle::new(self.name.clone())
    }
}

/// Opaque reference to a file by exact name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle {
    name: String,
}

impl FileHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn into_name(self) -> String {
        self.name
    }
}

/// Operations the server may perform on the shared folder.
#[async_trait]
pub trait SharedFolder: Send + Sync {
    /// Human-readable location, for logs and the console.
    fn describe(&self) -> String;

    /// Fails with [`StorageError::Access`] if the folder cannot be used.
    async fn check_access(&self) -> Result<(), StorageError>;

    /// Readable regular files, sorted by name.
    async fn list(&self) -> Result<Vec<FileEntry>, StorageError>;

    async fn find(&self, name: &str) -> Result<Option<FileEntry>, StorageError>;

    /// Create an empty file. Never replaces an existing one.
    async fn create(&self, name: &str) -> Result<FileHandle, StorageError>;

    /// Returns `false` if nothing by that name existed.
    async fn delete(&self, name: &str) -> Result<bool, StorageError>;

    async fn open_read(&self, handle: &FileHandle) -> Result<ReadStream, StorageError>;

    /// Opens an existing file for writing, truncating it.
    async fn open_write(&self, handle: &FileHandle) -> Result<WriteStream, StorageError>;
}

/// Reject names that could escape the folder or are not a single flat entry.
pub fn validate_name(name: &str) -> Result<(), StorageError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StorageError::InvalidName(name.to_owned()));
    }
    Ok(())
}
