use super::{Source, SourceError};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory blob store; stands in for an object store and backs tests.
#[derive(Default)]
pub struct MemorySource {
    blobs: RwLock<HashMap<String, Bytes>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blobs.read().contains_key(name)
    }
}

impl Source for MemorySource {
    fn get(&self, name: &str) -> Result<Bytes, SourceError> {
        self.blobs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(name.to_string()))
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<(), SourceError> {
        self.blobs
            .write()
            .insert(name.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }
}
