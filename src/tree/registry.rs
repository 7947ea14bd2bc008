use crate::bounds::Bounds;
use crate::metadata::{Metadata, MetadataError};
use crate::point::PointInfo;
use crate::schema::Schema;
use crate::source::{Source, SourceError};
use crate::tree::chunk::{BaseChunkData, Chunk, ChunkError};
use crate::tree::structure::Structure;
use crate::tree::tube::calc_tick;
use glam::DVec3;
use parking_lot::Mutex;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Tree cursor descending toward a point, one child step per level.
#[derive(Clone, Debug)]
pub struct Roller {
    index: u64,
    depth: u64,
    bounds: Bounds,
    is3d: bool,
}

impl Roller {
    pub fn new(bounds: Bounds, is3d: bool) -> Self {
        Self {
            index: 0,
            depth: 0,
            bounds,
            is3d,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Step into the child cell containing `point`.
    pub fn magnify(&mut self, point: DVec3) {
        let factor = if self.is3d { 8 } else { 4 };
        let step = self.bounds.step_of(point, self.is3d);
        self.bounds = self.bounds.child(step, self.is3d);
        self.index = self.index * factor + 1 + step as u64;
        self.depth += 1;
    }
}

/// Tracks which cold chunks one producer touched, so the registry can
/// retire chunks once nobody is feeding them.
#[derive(Default, Debug)]
pub struct Clipper {
    touched: HashSet<u64>,
}

impl Clipper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.touched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.touched.is_empty()
    }

    fn remember(&mut self, chunk_id: u64) -> bool {
        self.touched.insert(chunk_id)
    }

    fn forget(&mut self, chunk_id: u64) -> bool {
        self.touched.remove(&chunk_id)
    }

    fn drain(&mut self) -> Vec<u64> {
        self.touched.drain().collect()
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("schema is missing X/Y/Z dimensions")]
    Schema,

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

struct ColdSlot {
    chunk: Arc<Chunk>,
    refs: usize,
}

/// Build orchestrator: routes each insert to the in-memory base subtree
/// or a cold chunk, instantiating each cold chunk exactly once, and
/// persists everything on save.
pub struct Registry {
    source: Arc<dyn Source>,
    schema: Schema,
    structure: Structure,
    bounds: Bounds,
    base: BaseChunkData,
    cold: Mutex<HashMap<u64, ColdSlot>>,
    /// Chunks already serialized by a clip; their blobs are final unless
    /// reloaded, but their ids still belong in the metadata.
    retired: Mutex<Vec<u64>>,
    num_points: AtomicU64,
}

impl Registry {
    /// `bounds` are the raw data bounds; the tree is built over their
    /// cubic expansion.
    pub fn new(
        source: Arc<dyn Source>,
        schema: Schema,
        structure: Structure,
        bounds: &Bounds,
    ) -> Result<Registry, RegistryError> {
        if !schema.has_position() {
            return Err(RegistryError::Schema);
        }

        Ok(Registry {
            base: BaseChunkData::new(schema.clone(), &structure),
            bounds: bounds.cubic(),
            source,
            schema,
            structure,
            cold: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            num_points: AtomicU64::new(0),
        })
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    pub fn base(&self) -> &BaseChunkData {
        &self.base
    }

    pub fn num_points(&self) -> u64 {
        self.num_points.load(Ordering::Relaxed)
    }

    /// A fresh cursor over the full tree bounds.
    pub fn roller(&self) -> Roller {
        Roller::new(self.bounds.clone(), self.structure.is3d())
    }

    /// Descend until the point lands in a cell it can claim. Returns
    /// false when the point falls off the bottom of the tree.
    pub fn add_point(
        &self,
        info: &PointInfo,
        roller: &mut Roller,
        clipper: &mut Clipper,
    ) -> Result<bool, RegistryError> {
        let depth_end = self
            .structure
            .cold_depth_end()
            .unwrap_or(self.structure.max_depth());

        loop {
            let depth = roller.depth();
            if depth >= depth_end {
                debug!(point = ?info.point, "point fell past the tree floor");
                return Ok(false);
            }

            let placed = if depth >= self.structure.base_depth_begin()
                && depth < self.structure.base_depth_end()
            {
                let tick = calc_tick(info.point, &self.bounds, depth);
                self.base.insert(roller.index(), tick, info)
            } else if depth >= self.structure.cold_depth_begin() {
                let chunk = self.cold_chunk(roller.index(), clipper)?;
                chunk.insert(roller.index(), info)
            } else {
                false
            };

            if placed {
                self.num_points.fetch_add(1, Ordering::Relaxed);
                return Ok(true);
            }

            roller.magnify(info.point);
        }
    }

    /// Find or create the cold chunk owning `index`. Chunks retired by a
    /// previous clip reload from their stored blob.
    fn cold_chunk(
        &self,
        index: u64,
        clipper: &mut Clipper,
    ) -> Result<Arc<Chunk>, RegistryError> {
        let chunk_id = self.structure.chunk_id(index);

        let mut cold = self.cold.lock();
        let slot = match cold.entry(chunk_id) {
            MapEntry::Occupied(slot) => slot.into_mut(),
            MapEntry::Vacant(vacant) => {
                let chunk_points = self.structure.get_info(chunk_id).chunk_points;
                let chunk = match self.source.get(&chunk_id.to_string()) {
                    Ok(bytes) => Chunk::from_stored(
                        self.schema.clone(),
                        chunk_id,
                        chunk_points,
                        bytes.to_vec(),
                    )?,
                    Err(e) if e.is_not_found() => {
                        Chunk::new(self.schema.clone(), chunk_id, chunk_points)
                    }
                    Err(e) => return Err(e.into()),
                };

                debug!(chunk_id, "instantiated cold chunk");
                vacant.insert(ColdSlot {
                    chunk: Arc::new(chunk),
                    refs: 0,
                })
            }
        };

        if clipper.remember(chunk_id) {
            slot.refs += 1;
        }
        Ok(slot.chunk.clone())
    }

    /// The caller no longer feeds the chunk containing `index`.
    pub fn clip(&self, index: u64, clipper: &mut Clipper) -> Result<(), RegistryError> {
        let chunk_id = self.structure.chunk_id(index);
        if clipper.forget(chunk_id) {
            self.release(chunk_id)?;
        }
        Ok(())
    }

    /// Release every chunk the clipper still holds.
    pub fn clip_all(&self, clipper: &mut Clipper) -> Result<(), RegistryError> {
        for chunk_id in clipper.drain() {
            self.release(chunk_id)?;
        }
        Ok(())
    }

    fn release(&self, chunk_id: u64) -> Result<(), RegistryError> {
        let mut cold = self.cold.lock();
        if let Some(slot) = cold.get_mut(&chunk_id) {
            slot.refs = slot.refs.saturating_sub(1);
            if slot.refs == 0 {
                slot.chunk.save(&*self.source)?;
                cold.remove(&chunk_id);
                self.retired.lock().push(chunk_id);
                debug!(chunk_id, "retired cold chunk");
            }
        }
        Ok(())
    }

    /// Persist the base and every live cold chunk, then emit the index
    /// document. Inserts must have quiesced.
    pub fn save(&self) -> Result<Metadata, RegistryError> {
        let ids = Mutex::new(Vec::new());
        let start = self.structure.cold_index_begin();

        self.base.finalize(&*self.source, &ids, start)?;

        {
            let cold = self.cold.lock();
            for slot in cold.values() {
                let chunk_points = self.structure.get_info(slot.chunk.data().id()).chunk_points;
                slot.chunk.finalize(&*self.source, &ids, start, chunk_points)?;
            }
        }

        let mut ids = ids.into_inner();
        ids.extend(self.retired.lock().iter().copied());
        ids.sort_unstable();
        ids.dedup();

        let metadata = Metadata {
            schema: self.schema.clone(),
            structure: self.structure.config().clone(),
            bounds: self.bounds.clone().into(),
            num_points: self.num_points(),
            ids,
        };
        metadata.store(&*self.source)?;

        info!(
            points = metadata.num_points,
            chunks = metadata.ids.len(),
            "saved index"
        );
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;
    use crate::tree::chunk::ChunkData;
    use crate::tree::structure::StructureConfig;

    fn structure(base_end: u64) -> Structure {
        Structure::new(StructureConfig {
            base_depth_begin: 0,
            base_depth_end: base_end,
            cold_depth_begin: base_end,
            cold_depth_end: Some(6),
            chunk_points: 8,
            is3d: true,
        })
        .unwrap()
    }

    fn registry(base_end: u64) -> (Arc<MemorySource>, Registry) {
        let source = Arc::new(MemorySource::new());
        let bounds = Bounds::new(DVec3::ZERO, DVec3::splat(8.0));
        let registry = Registry::new(
            source.clone(),
            Schema::xyz(),
            structure(base_end),
            &bounds,
        )
        .unwrap();
        (source, registry)
    }

    fn info(x: f64, y: f64, z: f64) -> PointInfo {
        let schema = Schema::xyz();
        let point = DVec3::new(x, y, z);
        PointInfo::new(point, schema.pack_position(point))
    }

    fn add(registry: &Registry, clipper: &mut Clipper, p: &PointInfo) -> bool {
        let mut roller = registry.roller();
        registry.add_point(p, &mut roller, clipper).unwrap()
    }

    #[test]
    fn distinct_points_all_place() {
        let (_, registry) = registry(2);
        let mut clipper = Clipper::new();

        let points = [
            info(0.5, 0.5, 0.5),
            info(1.5, 1.5, 1.5),
            info(6.5, 6.5, 6.5),
            // Same cell and tick as the first at shallow depths.
            info(0.6, 0.5, 0.5),
        ];
        for p in &points {
            assert!(add(&registry, &mut clipper, p));
        }

        assert_eq!(registry.num_points(), 4);
    }

    #[test]
    fn collisions_spill_into_cold_chunks() {
        let (source, registry) = registry(1);
        let mut clipper = Clipper::new();

        // Both land in the root cell at depth 0; the second descends into
        // the chunked region.
        assert!(add(&registry, &mut clipper, &info(0.5, 0.5, 0.5)));
        assert!(add(&registry, &mut clipper, &info(0.6, 0.5, 0.5)));
        assert_eq!(clipper.len(), 1);

        let metadata = registry.save().unwrap();
        assert_eq!(metadata.num_points, 2);
        // Base prefix blob plus one cold chunk.
        assert!(metadata.ids.contains(&0));
        assert_eq!(metadata.ids.len(), 2);
        for id in &metadata.ids {
            assert!(source.contains(&id.to_string()));
        }
    }

    #[test]
    fn clip_retires_and_reloads() {
        let (source, registry) = registry(1);
        let mut clipper = Clipper::new();

        let a = info(0.5, 0.5, 0.5);
        let b = info(0.6, 0.5, 0.5);
        // Lands in the same depth-1 chunk as `b`, in a free cell.
        let c = info(4.5, 0.5, 0.5);

        add(&registry, &mut clipper, &a);
        add(&registry, &mut clipper, &b);
        let chunk_id = registry.structure().chunk_id(1);
        registry.clip_all(&mut clipper).unwrap();

        // Retired: serialized and dropped from memory.
        assert!(source.contains(&chunk_id.to_string()));
        assert!(registry.cold.lock().is_empty());

        // A later insert reloads the stored chunk.
        add(&registry, &mut clipper, &c);
        registry.clip_all(&mut clipper).unwrap();

        let blob = source.get(&chunk_id.to_string()).unwrap().to_vec();
        let back = ChunkData::from_stored(Schema::xyz(), chunk_id, 8, blob).unwrap();
        match back {
            ChunkData::Sparse(chunk) => assert_eq!(chunk.num_points(), 2),
            _ => panic!("expected sparse cold chunk"),
        }
    }
}
