use super::{Source, SourceError};
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Blob store rooted in a local directory; one file per blob.
#[derive(Clone, Debug)]
pub struct FileSource {
    root: PathBuf,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }
}

impl Source for FileSource {
    fn get(&self, name: &str) -> Result<Bytes, SourceError> {
        match std::fs::read(self.root.join(name)) {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SourceError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, name: &str, data: &[u8]) -> Result<(), SourceError> {
        Ok(std::fs::write(self.root.join(name), data)?)
    }
}
