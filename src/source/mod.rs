pub mod memory;

#[cfg(feature = "fs")]
pub mod file;

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }
}

/// Blob store. Chunks are stored under the decimal string of their begin
/// id; the metadata document under its well-known name. Implementations
/// handle their own retries; the engine treats a returned error as
/// terminal.
pub trait Source: Send + Sync {
    fn get(&self, name: &str) -> Result<Bytes, SourceError>;

    fn put(&self, name: &str, data: &[u8]) -> Result<(), SourceError>;
}

impl<S: Source + ?Sized> Source for Arc<S> {
    fn get(&self, name: &str) -> Result<Bytes, SourceError> {
        (**self).get(name)
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<(), SourceError> {
        (**self).put(name, data)
    }
}
