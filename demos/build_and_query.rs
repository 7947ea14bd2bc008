use cloudtree::prelude::*;
use glam::DVec3;
use std::sync::Arc;

pub fn main() {
    tracing_subscriber::fmt::init();

    let source = Arc::new(MemorySource::new());
    let schema = Schema::xyz();
    let bounds = Bounds::new(DVec3::ZERO, DVec3::splat(64.0));

    let structure = Structure::new(StructureConfig {
        base_depth_begin: 0,
        base_depth_end: 4,
        cold_depth_begin: 4,
        cold_depth_end: Some(10),
        chunk_points: 64,
        is3d: false,
    })
    .expect("valid structure");

    tracing::info!("Building an index over a synthetic swath");
    let registry = Registry::new(
        source.clone() as Arc<dyn Source>,
        schema.clone(),
        structure,
        &bounds,
    )
    .expect("schema carries XYZ");

    let mut clipper = Clipper::new();
    let mut inserted = 0u64;
    for i in 0..40_000u64 {
        let x = (i % 200) as f64 * 0.32;
        let y = (i / 200) as f64 * 0.32;
        let z = 16.0 + 8.0 * ((x * 0.4).sin() + (y * 0.25).cos());

        let point = DVec3::new(x, y, z);
        let info = PointInfo::new(point, schema.pack_position(point));
        let mut roller = registry.roller();

        if registry
            .add_point(&info, &mut roller, &mut clipper)
            .expect("insert")
        {
            inserted += 1;
        }
    }
    registry.clip_all(&mut clipper).expect("clip");

    let metadata = registry.save().expect("save");
    tracing::info!(
        "Indexed {} points into {} blobs",
        inserted,
        metadata.ids.len()
    );

    let reader = Reader::new("demo", source).expect("open reader");
    let cache = Cache::new(32);

    let query_bounds = Bounds::new(DVec3::new(8.0, 8.0, 0.0), DVec3::new(40.0, 40.0, 64.0));
    let mut query = reader.query(&cache, Schema::xyz(), &query_bounds, 0, 0, false);

    let mut buffer = Vec::new();
    let mut found = 0usize;
    loop {
        let more = query.next(&mut buffer).expect("query");
        found += buffer.len() / schema.point_size();
        buffer.clear();
        if !more {
            break;
        }
    }

    tracing::info!("Query returned {} points", found);
}
