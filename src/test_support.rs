use crate::bounds::Bounds;
use crate::metadata::Metadata;
use crate::point::PointInfo;
use crate::schema::Schema;
use crate::source::memory::MemorySource;
use crate::source::Source;
use crate::tree::registry::{Clipper, Registry};
use crate::tree::structure::{Structure, StructureConfig};
use glam::DVec3;
use std::sync::Arc;

/// Build and persist an XYZ index over the standard 8-unit cube.
pub fn build_index(
    source: &Arc<MemorySource>,
    points: &[DVec3],
    config: StructureConfig,
) -> Metadata {
    build_index_over(
        source,
        points,
        config,
        &Bounds::new(DVec3::ZERO, DVec3::splat(8.0)),
    )
}

pub fn build_index_over(
    source: &Arc<MemorySource>,
    points: &[DVec3],
    config: StructureConfig,
    bounds: &Bounds,
) -> Metadata {
    let schema = Schema::xyz();
    let structure = Structure::new(config).unwrap();
    let registry = Registry::new(
        source.clone() as Arc<dyn Source>,
        schema.clone(),
        structure,
        bounds,
    )
    .unwrap();

    let mut clipper = Clipper::new();
    for point in points {
        let info = PointInfo::new(*point, schema.pack_position(*point));
        let mut roller = registry.roller();
        assert!(registry.add_point(&info, &mut roller, &mut clipper).unwrap());
    }

    registry.clip_all(&mut clipper).unwrap();
    registry.save().unwrap()
}
