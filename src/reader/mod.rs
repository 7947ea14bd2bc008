pub mod cache;
pub mod chunk_reader;
pub mod query;

use crate::bounds::Bounds;
use crate::metadata::{Metadata, MetadataError};
use crate::reader::cache::Cache;
use crate::reader::chunk_reader::BaseChunkReader;
use crate::reader::query::Query;
use crate::schema::Schema;
use crate::source::{Source, SourceError};
use crate::tree::chunk::ChunkError;
use crate::tree::structure::{Structure, StructureError};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Read handle over a persisted index: the metadata document, the
/// hydrated base subtree, and the set of persisted chunk ids queries may
/// fetch.
pub struct Reader {
    path: String,
    source: Arc<dyn Source>,
    metadata: Metadata,
    structure: Structure,
    bounds: Bounds,
    ids: BTreeSet<u64>,
    base: Option<BaseChunkReader>,
}

impl Reader {
    /// `path` identifies this index in the process-wide cache; the
    /// metadata document and chunk blobs come from `source`.
    pub fn new(path: impl Into<String>, source: Arc<dyn Source>) -> Result<Reader, ReaderError> {
        let path = path.into();
        let metadata = Metadata::fetch(&source)?;
        let structure = Structure::new(metadata.structure.clone())?;
        let bounds: Bounds = metadata.bounds.clone().into();

        let base = if structure.base_index_span() > 0 {
            let base_id = structure.base_index_begin();
            match source.get(&base_id.to_string()) {
                Ok(bytes) => Some(BaseChunkReader::new(
                    &metadata.schema,
                    &structure,
                    bytes.to_vec(),
                )?),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        info!(
            path,
            points = metadata.num_points,
            chunks = metadata.ids.len(),
            "opened reader"
        );

        Ok(Reader {
            ids: metadata.ids.iter().copied().collect(),
            path,
            source,
            structure,
            bounds,
            base,
            metadata,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn schema(&self) -> &Schema {
        &self.metadata.schema
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    /// Cubic bounds the index was built over.
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn num_points(&self) -> u64 {
        self.metadata.num_points
    }

    pub fn base(&self) -> Option<&BaseChunkReader> {
        self.base.as_ref()
    }

    /// Whether a chunk blob was persisted under this begin id.
    pub fn exists(&self, chunk_id: u64) -> bool {
        self.ids.contains(&chunk_id)
    }

    /// Start a query against this index. `depth_end` of zero means
    /// unbounded.
    pub fn query<'a>(
        &'a self,
        cache: &Arc<Cache>,
        out_schema: Schema,
        query_bounds: &Bounds,
        depth_begin: u64,
        depth_end: u64,
        normalize: bool,
    ) -> Query<'a> {
        Query::new(
            self,
            cache.clone(),
            out_schema,
            query_bounds.clone(),
            depth_begin,
            depth_end,
            normalize,
        )
    }
}
