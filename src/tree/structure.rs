use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Serialized tree shape: which depths live in the in-memory base, which
/// are chunked to cold storage, how many cells a cold chunk spans, and
/// whether the tree splits z.
///
/// A flat tree (`is3d = false`) is the hybrid layout: cells split in x
/// and y only, and the vertical axis is discretized by tube ticks
/// instead. A 3D tree splits all three axes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StructureConfig {
    pub base_depth_begin: u64,
    pub base_depth_end: u64,
    pub cold_depth_begin: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub cold_depth_end: Option<u64>,
    pub chunk_points: u64,
    pub is3d: bool,
}

#[derive(Error, Debug)]
pub enum StructureError {
    #[error("depth ranges must satisfy baseBegin <= baseEnd <= coldBegin <= coldEnd")]
    DepthOrder,

    #[error("depths beyond {0} are not addressable")]
    DepthLimit(u64),

    #[error("chunkPoints must be a power of the tree's branching factor, no larger than the first cold depth's span")]
    ChunkPoints,
}

#[derive(Clone, Copy, Debug)]
pub struct ChunkInfo {
    pub depth: u64,
    pub chunk_points: u64,
}

#[derive(Clone, Copy, Debug)]
struct DepthInfo {
    index_begin: u64,
    index_span: u64,
}

/// Tree configuration with the precomputed depth table every index query
/// runs against.
#[derive(Clone, Debug)]
pub struct Structure {
    config: StructureConfig,
    depths: Vec<DepthInfo>,
    /// Tree levels folded into one chunk: chunk_points = factor^chunk_shift.
    chunk_shift: u64,
}

impl Structure {
    pub fn new(config: StructureConfig) -> Result<Structure, StructureError> {
        let dims = if config.is3d { 3 } else { 2 };
        let max_depth = Self::max_depth_for(dims);

        let end = config.cold_depth_end.unwrap_or(max_depth);
        if config.base_depth_begin > config.base_depth_end
            || config.base_depth_end > config.cold_depth_begin
            || config.cold_depth_begin > end
        {
            return Err(StructureError::DepthOrder);
        }
        if end > max_depth {
            return Err(StructureError::DepthLimit(max_depth));
        }

        let cp = config.chunk_points;
        if cp == 0 || !cp.is_power_of_two() || cp.ilog2() as u64 % dims != 0 {
            return Err(StructureError::ChunkPoints);
        }

        let depths: Vec<DepthInfo> = (0..=max_depth)
            .map(|d| {
                let span = 1u64 << (dims * d);
                DepthInfo {
                    // (factor^d - 1) / (factor - 1) cells above depth d.
                    index_begin: (span - 1) / ((1u64 << dims) - 1),
                    index_span: span,
                }
            })
            .collect();

        if cp > depths[config.cold_depth_begin as usize].index_span {
            return Err(StructureError::ChunkPoints);
        }

        Ok(Structure {
            chunk_shift: cp.ilog2() as u64 / dims,
            config,
            depths,
        })
    }

    /// Index arithmetic is u64; deeper levels would overflow it.
    fn max_depth_for(dims: u64) -> u64 {
        match dims {
            2 => 31,
            _ => 21,
        }
    }

    pub fn config(&self) -> &StructureConfig {
        &self.config
    }

    pub fn is3d(&self) -> bool {
        self.config.is3d
    }

    /// Axes split per level: 2 for the hybrid layout, 3 for a full 3D
    /// tree.
    pub fn dims(&self) -> u64 {
        if self.config.is3d {
            3
        } else {
            2
        }
    }

    /// Children per node.
    pub fn factor(&self) -> u64 {
        1 << self.dims()
    }

    pub fn max_depth(&self) -> u64 {
        Self::max_depth_for(self.dims())
    }

    pub fn base_depth_begin(&self) -> u64 {
        self.config.base_depth_begin
    }

    pub fn base_depth_end(&self) -> u64 {
        self.config.base_depth_end
    }

    pub fn cold_depth_begin(&self) -> u64 {
        self.config.cold_depth_begin
    }

    pub fn cold_depth_end(&self) -> Option<u64> {
        self.config.cold_depth_end
    }

    pub fn chunk_points(&self) -> u64 {
        self.config.chunk_points
    }

    pub fn chunk_shift(&self) -> u64 {
        self.chunk_shift
    }

    pub fn index_begin(&self, depth: u64) -> u64 {
        self.depths[depth as usize].index_begin
    }

    pub fn index_span(&self, depth: u64) -> u64 {
        self.depths[depth as usize].index_span
    }

    /// First cell index included in the base subtree.
    pub fn base_index_begin(&self) -> u64 {
        self.index_begin(self.config.base_depth_begin)
    }

    /// One past the last base cell index.
    pub fn base_index_end(&self) -> u64 {
        self.index_begin(self.config.base_depth_end)
    }

    pub fn base_index_span(&self) -> u64 {
        self.base_index_end() - self.base_index_begin()
    }

    pub fn cold_index_begin(&self) -> u64 {
        self.index_begin(self.config.cold_depth_begin)
    }

    /// Depth owning a cell index, O(1): depth d spans
    /// [(f^d - 1)/(f - 1), (f^(d+1) - 1)/(f - 1)).
    pub fn depth_of(&self, index: u64) -> u64 {
        let spread = (self.factor() - 1) as u128;
        ((spread * index as u128 + 1).ilog2() as u64) / self.dims()
    }

    /// Begin id of the chunk owning a cold cell index.
    pub fn chunk_id(&self, index: u64) -> u64 {
        let depth = self.depth_of(index);
        debug_assert!(depth >= self.config.cold_depth_begin);

        let begin = self.index_begin(depth);
        let offset = index - begin;
        begin + offset - offset % self.config.chunk_points
    }

    pub fn get_info(&self, chunk_id: u64) -> ChunkInfo {
        ChunkInfo {
            depth: self.depth_of(chunk_id),
            chunk_points: self.config.chunk_points,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StructureConfig {
        StructureConfig {
            base_depth_begin: 0,
            base_depth_end: 2,
            cold_depth_begin: 2,
            cold_depth_end: Some(6),
            chunk_points: 8,
            is3d: true,
        }
    }

    #[test]
    fn index_table_3d() {
        let s = Structure::new(config()).unwrap();
        assert_eq!(s.factor(), 8);
        assert_eq!(s.index_begin(0), 0);
        assert_eq!(s.index_begin(1), 1);
        assert_eq!(s.index_begin(2), 9);
        assert_eq!(s.index_begin(3), 73);
        assert_eq!(s.index_span(2), 64);

        assert_eq!(s.base_index_begin(), 0);
        assert_eq!(s.base_index_end(), 9);
        assert_eq!(s.base_index_span(), 9);
        assert_eq!(s.cold_index_begin(), 9);
    }

    #[test]
    fn index_table_flat() {
        let mut c = config();
        c.is3d = false;
        c.chunk_points = 4;
        let s = Structure::new(c).unwrap();

        assert_eq!(s.factor(), 4);
        assert_eq!(s.index_begin(1), 1);
        assert_eq!(s.index_begin(2), 5);
        assert_eq!(s.index_begin(3), 21);
        assert_eq!(s.base_index_span(), 5);
    }

    #[test]
    fn depth_of_brackets() {
        let s = Structure::new(config()).unwrap();
        assert_eq!(s.depth_of(0), 0);
        assert_eq!(s.depth_of(1), 1);
        assert_eq!(s.depth_of(8), 1);
        assert_eq!(s.depth_of(9), 2);
        assert_eq!(s.depth_of(72), 2);
        assert_eq!(s.depth_of(73), 3);
    }

    #[test]
    fn chunk_alignment() {
        let s = Structure::new(config()).unwrap();
        assert_eq!(s.chunk_id(9), 9);
        assert_eq!(s.chunk_id(16), 9);
        assert_eq!(s.chunk_id(17), 17);
        assert_eq!(s.chunk_id(72), 65);

        let info = s.get_info(17);
        assert_eq!(info.depth, 2);
        assert_eq!(info.chunk_points, 8);
        assert_eq!(s.chunk_shift(), 1);
    }

    #[test]
    fn rejects_bad_configs() {
        let mut c = config();
        c.base_depth_end = 3;
        assert!(matches!(Structure::new(c), Err(StructureError::DepthOrder)));

        let mut c = config();
        c.chunk_points = 16;
        assert!(matches!(
            Structure::new(c),
            Err(StructureError::ChunkPoints)
        ));

        let mut c = config();
        c.chunk_points = 512;
        // 8^cold_depth_begin = 64 < 512.
        assert!(matches!(
            Structure::new(c),
            Err(StructureError::ChunkPoints)
        ));

        let mut c = config();
        c.cold_depth_end = Some(40);
        assert!(matches!(
            Structure::new(c),
            Err(StructureError::DepthLimit(_))
        ));
    }
}
