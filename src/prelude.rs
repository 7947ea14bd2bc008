pub use crate::bounds::Bounds;
pub use crate::metadata::Metadata;
pub use crate::point::PointInfo;
pub use crate::reader::cache::{Cache, ChunkBlock, FetchInfo};
pub use crate::reader::query::{CancelToken, Query};
pub use crate::reader::Reader;
pub use crate::schema::{Dimension, ScalarType, Schema};
pub use crate::source::memory::MemorySource;
pub use crate::source::Source;
pub use crate::tree::registry::{Clipper, Registry, Roller};
pub use crate::tree::structure::{Structure, StructureConfig};

#[cfg(feature = "fs")]
pub use crate::source::file::FileSource;

// Error types
pub use crate::compression::CompressionError;
pub use crate::metadata::MetadataError;
pub use crate::reader::query::QueryError;
pub use crate::reader::ReaderError;
pub use crate::source::SourceError;
pub use crate::tree::chunk::ChunkError;
pub use crate::tree::registry::RegistryError;
pub use crate::tree::structure::StructureError;
