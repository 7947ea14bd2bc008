use crate::bounds::Bounds;
use crate::schema::Schema;
use crate::source::{Source, SourceError};
use crate::tree::structure::StructureConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known blob name of the index document.
pub const METADATA_NAME: &str = "metadata.json";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// The persisted description of an index: everything a reader needs
/// before touching any chunk blob.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub schema: Schema,
    pub structure: StructureConfig,
    /// Cubic bounds the tree was built over.
    pub bounds: BoundingBox,
    pub num_points: u64,
    /// Begin ids of every persisted chunk blob, ascending.
    pub ids: Vec<u64>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Metadata {
    pub fn fetch(source: &dyn Source) -> Result<Metadata, MetadataError> {
        let bytes = source.get(METADATA_NAME)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn store(&self, source: &dyn Source) -> Result<(), MetadataError> {
        let bytes = serde_json::to_vec(self)?;
        source.put(METADATA_NAME, &bytes)?;
        Ok(())
    }
}

impl From<BoundingBox> for Bounds {
    fn from(b: BoundingBox) -> Self {
        Bounds::new(b.min.into(), b.max.into())
    }
}

impl From<Bounds> for BoundingBox {
    fn from(b: Bounds) -> Self {
        BoundingBox {
            min: b.min.into(),
            max: b.max.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;
    use glam::DVec3;

    #[test]
    fn store_fetch_round_trip() {
        let source = MemorySource::new();
        let metadata = Metadata {
            schema: Schema::xyz(),
            structure: StructureConfig {
                base_depth_begin: 0,
                base_depth_end: 4,
                cold_depth_begin: 4,
                cold_depth_end: Some(8),
                chunk_points: 64,
                is3d: true,
            },
            bounds: Bounds::new(DVec3::ZERO, DVec3::splat(256.0)).into(),
            num_points: 12,
            ids: vec![585, 649],
        };

        metadata.store(&source).unwrap();
        let back = Metadata::fetch(&source).unwrap();

        assert_eq!(back.schema, metadata.schema);
        assert_eq!(back.ids, metadata.ids);
        assert_eq!(back.num_points, 12);
        assert_eq!(Bounds::from(back.bounds).max, DVec3::splat(256.0));
    }

    #[test]
    fn document_is_camel_case() {
        let metadata = Metadata {
            schema: Schema::xyz(),
            structure: StructureConfig {
                base_depth_begin: 0,
                base_depth_end: 2,
                cold_depth_begin: 2,
                cold_depth_end: None,
                chunk_points: 8,
                is3d: false,
            },
            bounds: Bounds::new(DVec3::ZERO, DVec3::ONE).into(),
            num_points: 0,
            ids: Vec::new(),
        };

        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"numPoints\""));
        assert!(json.contains("\"baseDepthBegin\""));
        assert!(!json.contains("coldDepthEnd"));
    }
}
