use glam::DVec3;

/// Sentinel coordinate marking an unoccupied cell slot.
pub const EMPTY_COORD: f64 = f64::MAX;

/// A slot holds a point iff its X and Y both differ from the sentinel.
pub fn point_exists(x: f64, y: f64) -> bool {
    x != EMPTY_COORD && y != EMPTY_COORD
}

/// A point queued for insertion: its coordinates plus the full attribute
/// record serialized under the index's native schema.
#[derive(Clone, Debug)]
pub struct PointInfo {
    pub point: DVec3,
    pub data: Vec<u8>,
}

impl PointInfo {
    pub fn new(point: DVec3, data: Vec<u8>) -> Self {
        Self { point, data }
    }
}
