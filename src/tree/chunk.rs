use crate::compression::{compress, decompress, CompressionError};
use crate::point::{point_exists, PointInfo};
use crate::schema::Schema;
use crate::source::{Source, SourceError};
use crate::tree::structure::Structure;
use crate::tree::tube::{CellEntry, Entry, Tube};
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Trailing marker byte of every chunk blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkType {
    Sparse,
    Contiguous,
}

impl ChunkType {
    pub fn marker(self) -> u8 {
        match self {
            ChunkType::Sparse => 0x00,
            ChunkType::Contiguous => 0x01,
        }
    }

    pub fn from_marker(marker: u8) -> Result<ChunkType, ChunkError> {
        match marker {
            0x00 => Ok(ChunkType::Sparse),
            0x01 => Ok(ChunkType::Contiguous),
            other => Err(ChunkError::InvalidType(other)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("invalid chunk data")]
    InvalidData,

    #[error("invalid chunk type: {0:#04x}")]
    InvalidType(u8),

    #[error("truncated chunk payload")]
    Truncated,

    #[error("corrupt chunk: {0}")]
    Corrupt(&'static str),

    #[error(transparent)]
    Compression(#[from] CompressionError),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Pop the trailing type marker off a stored blob.
pub(crate) fn pop_type(data: &mut Vec<u8>) -> Result<ChunkType, ChunkError> {
    let marker = data.pop().ok_or(ChunkError::InvalidData)?;
    ChunkType::from_marker(marker)
}

/// Pop the little-endian point count trailing a sparse payload.
pub(crate) fn pop_num_points(data: &mut Vec<u8>) -> Result<u64, ChunkError> {
    if data.len() < 8 {
        return Err(ChunkError::Truncated);
    }

    let at = data.len() - 8;
    let n = LittleEndian::read_u64(&data[at..]);
    data.truncate(at);
    Ok(n)
}

pub(crate) fn push_num_points(data: &mut Vec<u8>, n: u64) {
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, n);
    data.extend_from_slice(&buf);
}

/// One owned byte arena for a contiguous chunk; per-slot access is
/// serialized by the slot's entry lock.
struct CellBuffer(UnsafeCell<Box<[u8]>>);

unsafe impl Sync for CellBuffer {}

impl CellBuffer {
    fn new(bytes: Box<[u8]>) -> Self {
        Self(UnsafeCell::new(bytes))
    }

    /// Whole-arena view. Callers must not race slot writers; serialization
    /// runs after inserts quiesce.
    fn slice(&self) -> &[u8] {
        // SAFETY: see above.
        unsafe { &*self.0.get() }
    }

    /// SAFETY: the caller must hold the entry lock of the slot at `slot`.
    unsafe fn slot_mut(&self, slot: usize, point_size: usize) -> &mut [u8] {
        &mut (&mut *self.0.get())[slot * point_size..(slot + 1) * point_size]
    }
}

/// Dense chunk: every cell in `[id, id + max_points)` has a slot in one
/// contiguous buffer, empty slots marked by the coordinate sentinel.
pub struct ContiguousChunkData {
    schema: Schema,
    id: u64,
    max_points: u64,
    entries: Box<[Entry]>,
    data: CellBuffer,
}

impl ContiguousChunkData {
    pub fn new(schema: Schema, id: u64, max_points: u64) -> Self {
        let ps = schema.point_size();

        // Stamp the sentinel into every slot's X and Y.
        let mut slot = vec![0u8; ps];
        if let Some(dim) = schema.find("X") {
            schema.write_f64(dim, &mut slot, crate::point::EMPTY_COORD);
        }
        if let Some(dim) = schema.find("Y") {
            schema.write_f64(dim, &mut slot, crate::point::EMPTY_COORD);
        }
        let data = slot.repeat(max_points as usize).into_boxed_slice();

        Self {
            entries: (0..max_points).map(|_| Entry::new()).collect(),
            data: CellBuffer::new(data),
            schema,
            id,
            max_points,
        }
    }

    /// Hydrate from a stored payload (marker already popped).
    pub fn from_compressed(
        schema: Schema,
        id: u64,
        max_points: u64,
        payload: &[u8],
    ) -> Result<Self, ChunkError> {
        let ps = schema.point_size();
        let data = decompress(payload, max_points as usize * ps)?;

        let entries: Box<[Entry]> = (0..max_points as usize)
            .map(|i| {
                let point = schema.position(&data[i * ps..(i + 1) * ps]);
                if point_exists(point.x, point.y) {
                    Entry::with_point(point)
                } else {
                    Entry::new()
                }
            })
            .collect();

        Ok(Self {
            entries,
            data: CellBuffer::new(data.into_boxed_slice()),
            schema,
            id,
            max_points,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_points(&self) -> u64 {
        self.max_points
    }

    pub fn end_id(&self) -> u64 {
        self.id + self.max_points
    }

    fn normalize(&self, raw_index: u64) -> usize {
        assert!(
            raw_index >= self.id && raw_index < self.end_id(),
            "raw index {} outside chunk [{}, {})",
            raw_index,
            self.id,
            self.end_id()
        );
        (raw_index - self.id) as usize
    }

    pub fn entry(&self, raw_index: u64) -> &Entry {
        &self.entries[self.normalize(raw_index)]
    }

    /// Claim the cell at `raw_index` for `info`; false when it already
    /// belongs to a different point.
    pub fn insert(&self, raw_index: u64, info: &PointInfo) -> bool {
        let slot = self.normalize(raw_index);
        let entry = &self.entries[slot];

        if entry.set_point_if_empty(info.point) || entry.point() == Some(info.point) {
            let guard = entry.lock();
            let ps = self.schema.point_size();
            // SAFETY: this slot's entry lock is held.
            let cell = unsafe { self.data.slot_mut(slot, ps) };
            let n = info.data.len().min(ps);
            cell[..n].copy_from_slice(&info.data[..n]);
            drop(guard);
            true
        } else {
            false
        }
    }

    pub fn write(&self, source: &dyn Source, begin: u64, end: u64) -> Result<(), ChunkError> {
        debug_assert!(begin >= self.id && end <= self.end_id() && begin <= end);
        let ps = self.schema.point_size();
        let lo = (begin - self.id) as usize * ps;
        let hi = (end - self.id) as usize * ps;

        let mut blob = compress(&self.data.slice()[lo..hi])?;
        blob.push(ChunkType::Contiguous.marker());
        source.put(&begin.to_string(), &blob)?;

        debug!(id = begin, cells = end - begin, bytes = blob.len(), "wrote contiguous chunk");
        Ok(())
    }
}

/// Sparse chunk: only populated cells, keyed by raw index. Each record
/// serializes as an 8-byte key followed by the native point bytes.
pub struct SparseChunkData {
    schema: Schema,
    celled: Schema,
    id: u64,
    max_points: u64,
    entries: Mutex<BTreeMap<u64, Arc<CellEntry>>>,
}

impl SparseChunkData {
    pub fn new(schema: Schema, id: u64, max_points: u64) -> Self {
        Self {
            celled: schema.celled(),
            schema,
            id,
            max_points,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Hydrate from a stored payload (marker already popped; the
    /// trailing count still present).
    pub fn from_compressed(
        schema: Schema,
        id: u64,
        max_points: u64,
        mut payload: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        let num_points = pop_num_points(&mut payload)?;

        let this = Self::new(schema, id, max_points);
        let cps = this.celled.point_size();
        let squashed = decompress(&payload, num_points as usize * cps)?;

        let mut entries = this.entries.lock();
        for record in squashed.chunks_exact(cps) {
            let key = LittleEndian::read_u64(record);
            if key < id || key >= id + max_points {
                return Err(ChunkError::Corrupt("cell key outside chunk range"));
            }

            let bytes = &record[8..];
            let point = this.schema.position(bytes);
            let point = point_exists(point.x, point.y).then_some(point);
            entries.insert(key, Arc::new(CellEntry::from_bytes(point, bytes)));
        }
        drop(entries);

        Ok(this)
    }

    /// Map occupancy above which promotion to contiguous pays for itself:
    /// the per-cell key overhead outweighs empty dense slots.
    pub fn threshold(schema: &Schema) -> f64 {
        let ps = schema.point_size() as f64;
        ps / (ps + std::mem::size_of::<usize>() as f64)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_points(&self) -> u64 {
        self.max_points
    }

    pub fn end_id(&self) -> u64 {
        self.id + self.max_points
    }

    pub fn num_points(&self) -> u64 {
        self.entries.lock().len() as u64
    }

    pub fn get_entry(&self, raw_index: u64) -> Arc<CellEntry> {
        debug_assert!(raw_index >= self.id && raw_index < self.end_id());

        self.entries
            .lock()
            .entry(raw_index)
            .or_insert_with(|| Arc::new(CellEntry::new(self.schema.point_size())))
            .clone()
    }

    pub fn insert(&self, raw_index: u64, info: &PointInfo) -> bool {
        self.get_entry(raw_index).store(info)
    }

    pub fn write(&self, source: &dyn Source, begin: u64, end: u64) -> Result<(), ChunkError> {
        let ps = self.schema.point_size();
        let cps = self.celled.point_size();

        let mut squashed = Vec::new();
        let mut num_points = 0u64;
        {
            let entries = self.entries.lock();
            for (&key, cell) in entries.range(begin..end) {
                if cell.entry().point().is_none() {
                    continue;
                }

                let at = squashed.len();
                squashed.resize(at + cps, 0);
                LittleEndian::write_u64(&mut squashed[at..], key);
                squashed[at + 8..at + cps].copy_from_slice(&cell.data()[..ps]);
                num_points += 1;
            }
        }

        let mut blob = compress(&squashed)?;
        push_num_points(&mut blob, num_points);
        blob.push(ChunkType::Sparse.marker());
        source.put(&begin.to_string(), &blob)?;

        debug!(id = begin, points = num_points, bytes = blob.len(), "wrote sparse chunk");
        Ok(())
    }
}

/// The in-memory base subtree: one tube per cell across the base depth
/// band, so the top of the tree can hold z-stacked points per cell.
/// Serializes like a sparse chunk under the celled schema.
pub struct BaseChunkData {
    schema: Schema,
    celled: Schema,
    index_begin: u64,
    tubes: Box<[Tube]>,
}

impl BaseChunkData {
    pub fn new(schema: Schema, structure: &Structure) -> Self {
        let ps = schema.point_size();

        Self {
            celled: schema.celled(),
            schema,
            index_begin: structure.base_index_begin(),
            tubes: (0..structure.base_index_span())
                .map(|_| Tube::new(ps))
                .collect(),
        }
    }

    pub fn index_begin(&self) -> u64 {
        self.index_begin
    }

    pub fn index_end(&self) -> u64 {
        self.index_begin + self.tubes.len() as u64
    }

    pub fn tube(&self, index: u64) -> &Tube {
        assert!(
            index >= self.index_begin && index < self.index_end(),
            "index {} outside base [{}, {})",
            index,
            self.index_begin,
            self.index_end()
        );
        &self.tubes[(index - self.index_begin) as usize]
    }

    pub fn insert(&self, index: u64, tick: i64, info: &PointInfo) -> bool {
        self.tube(index).insert(tick, info)
    }

    pub fn num_points(&self) -> u64 {
        self.tubes.iter().map(|t| t.num_cells() as u64).sum()
    }

    pub fn write(&self, source: &dyn Source, begin: u64, end: u64) -> Result<(), ChunkError> {
        let ps = self.schema.point_size();
        let cps = self.celled.point_size();

        let mut squashed = Vec::new();
        let mut num_points = 0u64;
        for index in begin..end {
            self.tube(index).for_each_cell(|cell| {
                let at = squashed.len();
                squashed.resize(at + cps, 0);
                LittleEndian::write_u64(&mut squashed[at..], index);
                squashed[at + 8..at + cps].copy_from_slice(&cell.data()[..ps]);
                num_points += 1;
            });
        }

        let mut blob = compress(&squashed)?;
        push_num_points(&mut blob, num_points);
        blob.push(ChunkType::Sparse.marker());
        source.put(&begin.to_string(), &blob)?;

        debug!(id = begin, points = num_points, bytes = blob.len(), "wrote base chunk");
        Ok(())
    }

    /// The base precedes the chunked region, so finalization reduces to
    /// the below-start prefix blob.
    pub fn finalize(
        &self,
        source: &dyn Source,
        ids: &Mutex<Vec<u64>>,
        start: u64,
    ) -> Result<(), ChunkError> {
        if self.tubes.is_empty() {
            return Ok(());
        }

        if start > self.index_begin {
            self.write(source, self.index_begin, start.min(self.index_end()))?;
            ids.lock().push(self.index_begin);
        }
        Ok(())
    }
}

/// The two cold-chunk layouts.
pub enum ChunkData {
    Sparse(SparseChunkData),
    Contiguous(ContiguousChunkData),
}

impl ChunkData {
    /// Dispatch on the trailing marker byte of a stored blob.
    pub fn from_stored(
        schema: Schema,
        id: u64,
        max_points: u64,
        mut data: Vec<u8>,
    ) -> Result<ChunkData, ChunkError> {
        match pop_type(&mut data)? {
            ChunkType::Sparse => Ok(ChunkData::Sparse(SparseChunkData::from_compressed(
                schema, id, max_points, data,
            )?)),
            ChunkType::Contiguous => Ok(ChunkData::Contiguous(
                ContiguousChunkData::from_compressed(schema, id, max_points, &data)?,
            )),
        }
    }

    pub fn chunk_type(&self) -> ChunkType {
        match self {
            ChunkData::Sparse(_) => ChunkType::Sparse,
            ChunkData::Contiguous(_) => ChunkType::Contiguous,
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            ChunkData::Sparse(c) => c.id(),
            ChunkData::Contiguous(c) => c.id(),
        }
    }

    pub fn max_points(&self) -> u64 {
        match self {
            ChunkData::Sparse(c) => c.max_points(),
            ChunkData::Contiguous(c) => c.max_points(),
        }
    }

    pub fn end_id(&self) -> u64 {
        self.id() + self.max_points()
    }

    pub fn insert(&self, raw_index: u64, info: &PointInfo) -> bool {
        match self {
            ChunkData::Sparse(c) => c.insert(raw_index, info),
            ChunkData::Contiguous(c) => c.insert(raw_index, info),
        }
    }

    pub fn write(&self, source: &dyn Source, begin: u64, end: u64) -> Result<(), ChunkError> {
        match self {
            ChunkData::Sparse(c) => c.write(source, begin, end),
            ChunkData::Contiguous(c) => c.write(source, begin, end),
        }
    }

    pub fn save(&self, source: &dyn Source) -> Result<(), ChunkError> {
        self.write(source, self.id(), self.end_id())
    }

    /// Persist in `chunk_points`-sized slices from `start` on, with a
    /// prefix blob when this chunk begins before the chunked region.
    pub fn finalize(
        &self,
        source: &dyn Source,
        ids: &Mutex<Vec<u64>>,
        start: u64,
        chunk_points: u64,
    ) -> Result<(), ChunkError> {
        if start > self.id() {
            self.write(source, self.id(), start)?;
            ids.lock().push(self.id());
        }

        let mut begin = start.max(self.id());
        while begin < self.end_id() {
            self.write(source, begin, begin + chunk_points)?;
            ids.lock().push(begin);
            begin += chunk_points;
        }

        Ok(())
    }
}

/// A cold chunk: a fixed range of raw cell indices stored as one blob.
/// Only the root chunk starts dense; everything else starts sparse.
pub struct Chunk {
    data: ChunkData,
}

impl Chunk {
    pub fn new(schema: Schema, id: u64, max_points: u64) -> Self {
        let data = if id == 0 {
            ChunkData::Contiguous(ContiguousChunkData::new(schema, id, max_points))
        } else {
            ChunkData::Sparse(SparseChunkData::new(schema, id, max_points))
        };
        Self { data }
    }

    pub fn from_stored(
        schema: Schema,
        id: u64,
        max_points: u64,
        data: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        Ok(Self {
            data: ChunkData::from_stored(schema, id, max_points, data)?,
        })
    }

    pub fn data(&self) -> &ChunkData {
        &self.data
    }

    pub fn insert(&self, raw_index: u64, info: &PointInfo) -> bool {
        self.data.insert(raw_index, info)
    }

    pub fn save(&self, source: &dyn Source) -> Result<(), ChunkError> {
        self.data.save(source)
    }

    pub fn finalize(
        &self,
        source: &dyn Source,
        ids: &Mutex<Vec<u64>>,
        start: u64,
        chunk_points: u64,
    ) -> Result<(), ChunkError> {
        self.data.finalize(source, ids, start, chunk_points)
    }
}
