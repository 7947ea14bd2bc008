use crate::bounds::Bounds;
use crate::point::PointInfo;
use glam::DVec3;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;

/// Tick owned by a tube whose primary has not been claimed yet.
const NO_TICK: i64 = i64::MIN;

/// Discretized vertical coordinate of a point within cubic bounds at a
/// given depth: the z extent splits into `2^depth` slices.
pub fn calc_tick(point: DVec3, bounds: &Bounds, depth: u64) -> i64 {
    let height = bounds.max.z - bounds.min.z;
    if height <= 0.0 {
        return 0;
    }

    (((point.z - bounds.min.z) / height) * 2f64.powi(depth as i32)).floor() as i64
}

/// Publish-once optional point. The winning writer installs the point
/// with a compare-and-swap; readers observe either nothing or the fully
/// initialized value, never a torn one.
#[derive(Debug, Default)]
pub struct PointSlot(AtomicPtr<DVec3>);

impl PointSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with(point: DVec3) -> Self {
        Self(AtomicPtr::new(Box::into_raw(Box::new(point))))
    }

    pub fn get(&self) -> Option<DVec3> {
        let p = self.0.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was published by `set_if_empty`
            // or construction and stays valid until drop.
            Some(unsafe { *p })
        }
    }

    /// Returns true iff this call installed the point.
    pub fn set_if_empty(&self, point: DVec3) -> bool {
        let fresh = Box::into_raw(Box::new(point));
        match self.0.compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(_) => {
                // SAFETY: `fresh` never left this thread.
                unsafe { drop(Box::from_raw(fresh)) };
                false
            }
        }
    }
}

impl Drop for PointSlot {
    fn drop(&mut self) {
        let p = *self.0.get_mut();
        if !p.is_null() {
            // SAFETY: drop has exclusive access; the pointer came from
            // Box::into_raw.
            unsafe { drop(Box::from_raw(p)) };
        }
    }
}

/// Build-side cell slot: the atomic point plus the lock serializing
/// writes to the cell's raw bytes.
#[derive(Debug, Default)]
pub struct Entry {
    point: PointSlot,
    lock: Mutex<()>,
}

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_point(point: DVec3) -> Self {
        Self {
            point: PointSlot::with(point),
            lock: Mutex::new(()),
        }
    }

    pub fn point(&self) -> Option<DVec3> {
        self.point.get()
    }

    pub fn set_point_if_empty(&self, point: DVec3) -> bool {
        self.point.set_if_empty(point)
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.lock.try_lock()
    }
}

/// A cell that owns its raw bytes: sparse chunk entries, tube cells.
#[derive(Debug)]
pub struct CellEntry {
    entry: Entry,
    data: UnsafeCell<Box<[u8]>>,
}

// Writes to `data` go through `write`, which holds the entry lock.
unsafe impl Sync for CellEntry {}

impl CellEntry {
    pub fn new(point_size: usize) -> Self {
        Self {
            entry: Entry::new(),
            data: UnsafeCell::new(vec![0u8; point_size].into_boxed_slice()),
        }
    }

    /// Rebuild a cell from stored bytes during chunk hydration.
    pub fn from_bytes(point: Option<DVec3>, bytes: &[u8]) -> Self {
        Self {
            entry: point.map(Entry::with_point).unwrap_or_default(),
            data: UnsafeCell::new(bytes.to_vec().into_boxed_slice()),
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Copy a point record into the cell under the entry lock.
    pub fn write(&self, bytes: &[u8]) {
        let _guard = self.entry.lock();
        // SAFETY: the entry lock serializes writers of this buffer.
        let data = unsafe { &mut *self.data.get() };
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
    }

    /// Raw bytes of the cell. Callers must not race `write`; inserts
    /// quiesce before serialization reads cells back.
    pub fn data(&self) -> &[u8] {
        // SAFETY: see above.
        unsafe { &*self.data.get() }
    }

    /// Claim this cell for `info`, or recognize a coincident duplicate.
    /// Returns false when the cell canonically belongs to a different
    /// point.
    pub fn store(&self, info: &PointInfo) -> bool {
        if self.entry.set_point_if_empty(info.point) {
            self.write(&info.data);
            return true;
        }

        if self.entry.point() == Some(info.point) {
            self.write(&info.data);
            return true;
        }

        false
    }
}

/// Vertical column of cells sharing an (x, y) cell at one depth: a
/// primary slot for the first tick claimed, and one secondary cell per
/// additional tick.
#[derive(Debug)]
pub struct Tube {
    point_size: usize,
    primary: CellEntry,
    primary_tick: AtomicI64,
    lock: Mutex<()>,
    secondaries: RwLock<BTreeMap<i64, Arc<CellEntry>>>,
}

impl Tube {
    pub fn new(point_size: usize) -> Self {
        Self {
            point_size,
            primary: CellEntry::new(point_size),
            primary_tick: AtomicI64::new(NO_TICK),
            lock: Mutex::new(()),
            secondaries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.primary.entry().point().is_none()
    }

    pub fn primary(&self) -> &CellEntry {
        &self.primary
    }

    pub fn primary_tick(&self) -> i64 {
        self.primary_tick.load(Ordering::Acquire)
    }

    pub fn num_cells(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            1 + self.secondaries.read().len()
        }
    }

    /// Place a point at its tick. Returns false when the tick's canonical
    /// slot already holds a different point, in which case the caller
    /// descends the tree.
    pub fn insert(&self, tick: i64, info: &PointInfo) -> bool {
        loop {
            if let Some(p) = self.primary.entry().point() {
                if self.primary_tick() == tick {
                    if p == info.point {
                        // The primary is canonical for its tick.
                        self.primary.write(&info.data);
                        return true;
                    }
                    return false;
                }
                return self.insert_secondary(tick, info);
            }

            // Install the primary under the tube lock so the tick
            // publishes before the point does.
            let _guard = self.lock.lock();
            if self.primary.entry().point().is_none() {
                self.primary_tick.store(tick, Ordering::Relaxed);
                let placed = self.primary.entry().set_point_if_empty(info.point);
                debug_assert!(placed);
                self.primary.write(&info.data);
                return true;
            }
            // Lost the race; retry against the published primary.
        }
    }

    fn insert_secondary(&self, tick: i64, info: &PointInfo) -> bool {
        let existing = self.secondaries.read().get(&tick).cloned();

        let cell = match existing {
            Some(cell) => cell,
            None => {
                let mut map = self.secondaries.write();
                map.entry(tick)
                    .or_insert_with(|| Arc::new(CellEntry::new(self.point_size)))
                    .clone()
            }
        };

        cell.store(info)
    }

    /// Visit the primary then every secondary in ascending tick order.
    pub fn for_each_cell(&self, mut f: impl FnMut(&CellEntry)) {
        if self.is_empty() {
            return;
        }

        f(&self.primary);
        for cell in self.secondaries.read().values() {
            f(cell);
        }
    }
}
