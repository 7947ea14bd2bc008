use crate::bounds::Bounds;
use crate::point::point_exists;
use crate::schema::Schema;
use crate::tree::chunk::{pop_num_points, pop_type, ChunkError, ChunkType};
use crate::tree::structure::Structure;
use crate::tree::tube::calc_tick;
use byteorder::{ByteOrder, LittleEndian};
use glam::DVec3;

/// One hydrated point: coordinates, where its record starts in the
/// reader's buffer, and its vertical tick.
#[derive(Clone, Copy, Debug)]
pub struct PointRecord {
    pub point: DVec3,
    pub tick: i64,
    offset: usize,
}

/// Read-only cold chunk, optimized for tick-range scans: a dense record
/// table sorted by tick over one owned buffer.
pub struct ChunkReader {
    schema: Schema,
    bounds: Bounds,
    id: u64,
    depth: u64,
    data: Vec<u8>,
    records: Vec<PointRecord>,
}

impl ChunkReader {
    pub fn new(
        schema: Schema,
        bounds: Bounds,
        id: u64,
        depth: u64,
        max_points: u64,
        mut bytes: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        let chunk_type = pop_type(&mut bytes)?;
        let ps = schema.point_size();

        let (data, mut records) = match chunk_type {
            ChunkType::Contiguous => {
                let data = crate::compression::decompress(&bytes, max_points as usize * ps)?;

                let mut records = Vec::new();
                for i in 0..max_points as usize {
                    let offset = i * ps;
                    let point = schema.position(&data[offset..offset + ps]);
                    if point_exists(point.x, point.y) {
                        records.push(PointRecord {
                            point,
                            tick: calc_tick(point, &bounds, depth),
                            offset,
                        });
                    }
                }
                (data, records)
            }
            ChunkType::Sparse => {
                let num_points = pop_num_points(&mut bytes)?;
                let cps = ps + 8;
                let data =
                    crate::compression::decompress(&bytes, num_points as usize * cps)?;

                let mut records = Vec::with_capacity(num_points as usize);
                for off in (0..data.len()).step_by(cps) {
                    let offset = off + 8;
                    let point = schema.position(&data[offset..offset + ps]);
                    records.push(PointRecord {
                        point,
                        tick: calc_tick(point, &bounds, depth),
                        offset,
                    });
                }
                (data, records)
            }
        };

        records.sort_by_key(|r| r.tick);

        Ok(Self {
            schema,
            bounds,
            id,
            depth,
            data,
            records,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> u64 {
        self.depth
    }

    pub fn num_points(&self) -> usize {
        self.records.len()
    }

    /// Records whose ticks fall inside the query bounds' vertical band.
    /// The slice stays tick-sorted; 3D containment is still the caller's
    /// filter.
    pub fn candidates(&self, query: &Bounds) -> &[PointRecord] {
        let lo = calc_tick(query.min, &self.bounds, self.depth);
        let hi = calc_tick(query.max, &self.bounds, self.depth);

        let begin = self.records.partition_point(|r| r.tick < lo);
        let end = self.records.partition_point(|r| r.tick <= hi);
        &self.records[begin..end]
    }

    pub fn point_data(&self, record: &PointRecord) -> &[u8] {
        &self.data[record.offset..record.offset + self.schema.point_size()]
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BasePointRecord {
    pub point: DVec3,
    offset: usize,
}

/// Read-only base subtree: celled records bucketed per tube index, kept
/// in stored order (primary first, then secondaries by tick).
pub struct BaseChunkReader {
    point_size: usize,
    index_begin: u64,
    data: Vec<u8>,
    tubes: Vec<Vec<BasePointRecord>>,
}

impl BaseChunkReader {
    pub fn new(
        schema: &Schema,
        structure: &Structure,
        mut bytes: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        if pop_type(&mut bytes)? != ChunkType::Sparse {
            return Err(ChunkError::Corrupt("base blob is not celled"));
        }

        let num_points = pop_num_points(&mut bytes)?;
        let ps = schema.point_size();
        let cps = ps + 8;
        let data = crate::compression::decompress(&bytes, num_points as usize * cps)?;

        let index_begin = structure.base_index_begin();
        let span = structure.base_index_span();
        let mut tubes = vec![Vec::new(); span as usize];

        for off in (0..data.len()).step_by(cps) {
            let key = LittleEndian::read_u64(&data[off..]);
            let tube = key
                .checked_sub(index_begin)
                .filter(|t| *t < span)
                .ok_or(ChunkError::Corrupt("tube id out of range"))?;

            let offset = off + 8;
            let point = schema.position(&data[offset..offset + ps]);
            tubes[tube as usize].push(BasePointRecord { point, offset });
        }

        Ok(Self {
            point_size: ps,
            index_begin,
            data,
            tubes,
        })
    }

    pub fn num_points(&self) -> usize {
        self.tubes.iter().map(Vec::len).sum()
    }

    pub fn tube(&self, index: u64) -> &[BasePointRecord] {
        index
            .checked_sub(self.index_begin)
            .and_then(|t| self.tubes.get(t as usize))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn point_data(&self, record: &BasePointRecord) -> &[u8] {
        &self.data[record.offset..record.offset + self.point_size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::PointInfo;
    use crate::source::memory::MemorySource;
    use crate::source::Source;
    use crate::tree::chunk::{BaseChunkData, SparseChunkData};
    use crate::tree::structure::StructureConfig;

    fn info(schema: &Schema, x: f64, y: f64, z: f64) -> PointInfo {
        let point = DVec3::new(x, y, z);
        PointInfo::new(point, schema.pack_position(point))
    }

    fn bounds() -> Bounds {
        Bounds::new(DVec3::ZERO, DVec3::splat(8.0))
    }

    #[test]
    fn sparse_reader_sorts_by_tick() {
        let schema = Schema::xyz();
        let source = MemorySource::new();

        let chunk = SparseChunkData::new(schema.clone(), 9, 8);
        // Insert with descending z so stored order is not tick order.
        for (i, z) in [7.0, 3.0, 5.0, 1.0].iter().enumerate() {
            assert!(chunk.insert(9 + i as u64, &info(&schema, i as f64, 0.5, *z)));
        }
        chunk.write(&source, 9, 17).unwrap();

        let blob = source.get("9").unwrap().to_vec();
        let reader = ChunkReader::new(schema, bounds(), 9, 2, 8, blob).unwrap();

        assert_eq!(reader.num_points(), 4);
        let ticks: Vec<i64> = reader.candidates(&bounds()).iter().map(|r| r.tick).collect();
        let mut sorted = ticks.clone();
        sorted.sort_unstable();
        assert_eq!(ticks, sorted);
    }

    #[test]
    fn candidates_bracket_the_query_band() {
        let schema = Schema::xyz();
        let source = MemorySource::new();

        let chunk = SparseChunkData::new(schema.clone(), 9, 8);
        for (i, z) in [0.5, 2.5, 4.5, 6.5].iter().enumerate() {
            chunk.insert(9 + i as u64, &info(&schema, i as f64, 0.5, *z));
        }
        chunk.write(&source, 9, 17).unwrap();

        let blob = source.get("9").unwrap().to_vec();
        let depth = 3;
        let reader = ChunkReader::new(schema, bounds(), 9, depth, 8, blob).unwrap();

        let query = Bounds::new(DVec3::new(0.0, 0.0, 2.0), DVec3::new(8.0, 8.0, 5.0));
        let picked = reader.candidates(&query);
        assert_eq!(picked.len(), 2);

        let lo = calc_tick(query.min, &bounds(), depth);
        let hi = calc_tick(query.max, &bounds(), depth);
        for record in picked {
            assert!(record.tick >= lo && record.tick <= hi);
        }
    }

    #[test]
    fn base_reader_buckets_by_tube() {
        let schema = Schema::xyz();
        let source = MemorySource::new();
        let structure = Structure::new(StructureConfig {
            base_depth_begin: 0,
            base_depth_end: 2,
            cold_depth_begin: 2,
            cold_depth_end: Some(4),
            chunk_points: 8,
            is3d: true,
        })
        .unwrap();

        let base = BaseChunkData::new(schema.clone(), &structure);
        // Tube 0 holds a stacked pair; tube 3 a single point.
        assert!(base.insert(0, 0, &info(&schema, 0.5, 0.5, 0.5)));
        assert!(base.insert(0, 5, &info(&schema, 0.5, 0.5, 5.5)));
        assert!(base.insert(3, 0, &info(&schema, 4.5, 4.5, 0.5)));
        base.write(&source, 0, 9).unwrap();

        let blob = source.get("0").unwrap().to_vec();
        let reader = BaseChunkReader::new(&schema, &structure, blob).unwrap();

        assert_eq!(reader.num_points(), 3);
        assert_eq!(reader.tube(0).len(), 2);
        assert_eq!(reader.tube(1).len(), 0);
        assert_eq!(reader.tube(3).len(), 1);

        let first = reader.tube(0)[0];
        assert_eq!(first.point, DVec3::new(0.5, 0.5, 0.5));
        assert_eq!(
            reader.point_data(&first),
            Schema::xyz().pack_position(first.point)
        );
    }
}
