use crate::reader::chunk_reader::ChunkReader;
use crate::reader::Reader;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Everything the cache needs to hydrate one chunk.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FetchInfo {
    pub id: u64,
    pub depth: u64,
    pub chunk_points: u64,
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("chunk {0} could not be hydrated")]
    Hydration(u64),
}

type ChunkKey = (String, u64);

struct CacheSlot {
    reader: Option<Arc<ChunkReader>>,
    /// Pins held by live ChunkBlocks.
    refs: usize,
    /// Acquires blocked on this slot's hydration.
    waiters: usize,
    hydrating: bool,
}

impl CacheSlot {
    fn evictable(&self) -> bool {
        self.reader.is_some() && self.refs == 0 && self.waiters == 0
    }
}

struct CacheState {
    slots: HashMap<ChunkKey, CacheSlot>,
    /// Evictable keys in recency order.
    idle: LruCache<ChunkKey, ()>,
}

enum Claim {
    Ready(Arc<ChunkReader>),
    Hydrating,
    Missing,
}

/// Process-wide pool of hydrated chunk readers keyed by (reader path,
/// chunk id). Concurrent demands for the same chunk coalesce into one
/// fetch; unpinned chunks evict in LRU order once over budget.
pub struct Cache {
    max_chunks: usize,
    state: Mutex<CacheState>,
    ready: Condvar,
}

impl Cache {
    pub fn new(max_chunks: usize) -> Arc<Cache> {
        Arc::new(Cache {
            max_chunks: max_chunks.max(1),
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                idle: LruCache::unbounded(),
            }),
            ready: Condvar::new(),
        })
    }

    pub fn max_chunks(&self) -> usize {
        self.max_chunks
    }

    pub fn num_chunks(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Hydrate and pin every requested chunk, blocking on fetches as
    /// needed. All-or-nothing: any failure unpins the rest and returns
    /// None.
    pub fn acquire(
        self: &Arc<Self>,
        reader: &Reader,
        fetches: &BTreeSet<FetchInfo>,
    ) -> Option<ChunkBlock> {
        if fetches.is_empty() {
            return None;
        }

        let path = reader.path().to_string();
        let mut pinned: BTreeMap<u64, Arc<ChunkReader>> = BTreeMap::new();
        let mut claimed: Vec<FetchInfo> = Vec::new();
        let mut waiting: Vec<u64> = Vec::new();

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            for fetch in fetches {
                let key = (path.clone(), fetch.id);
                match Self::try_pin(state, &key) {
                    Claim::Ready(chunk) => {
                        pinned.insert(fetch.id, chunk);
                    }
                    Claim::Hydrating => {
                        if let Some(slot) = state.slots.get_mut(&key) {
                            slot.waiters += 1;
                        }
                        waiting.push(fetch.id);
                    }
                    Claim::Missing => {
                        state.slots.insert(
                            key,
                            CacheSlot {
                                reader: None,
                                refs: 0,
                                waiters: 0,
                                hydrating: true,
                            },
                        );
                        claimed.push(fetch.clone());
                    }
                }
            }
        }

        // Hydrate our own claims outside the lock.
        let mut failed = false;
        for fetch in &claimed {
            let key = (path.clone(), fetch.id);
            match self.hydrate(reader, fetch) {
                Ok(hydrated) => {
                    let hydrated = Arc::new(hydrated);
                    let mut guard = self.state.lock();
                    if let Some(slot) = guard.slots.get_mut(&key) {
                        slot.reader = Some(hydrated.clone());
                        slot.hydrating = false;
                        slot.refs += 1;
                    }
                    pinned.insert(fetch.id, hydrated);
                }
                Err(e) => {
                    warn!(chunk_id = fetch.id, error = %e, "chunk hydration failed");
                    self.state.lock().slots.remove(&key);
                    failed = true;
                }
            }
            self.ready.notify_all();
        }

        // Wait out hydrations owned by other threads.
        let mut guard = self.state.lock();
        while let Some(&id) = waiting.last() {
            if failed {
                break;
            }
            let key = (path.clone(), id);
            match Self::try_pin(&mut guard, &key) {
                Claim::Ready(chunk) => {
                    Self::leave_wait(&mut guard, key);
                    pinned.insert(id, chunk);
                    waiting.pop();
                }
                Claim::Hydrating => self.ready.wait(&mut guard),
                Claim::Missing => {
                    // The hydrating thread failed and removed the slot.
                    waiting.pop();
                    failed = true;
                }
            }
        }

        // Drop any remaining waiter registrations.
        for id in waiting {
            Self::leave_wait(&mut guard, (path.clone(), id));
        }

        if failed {
            for id in pinned.keys() {
                Self::unpin(&mut guard, (path.clone(), *id));
            }
            Self::evict(&mut guard, self.max_chunks);
            return None;
        }

        Self::evict(&mut guard, self.max_chunks);
        drop(guard);

        Some(ChunkBlock {
            cache: self.clone(),
            path,
            chunks: pinned,
        })
    }

    fn try_pin(state: &mut CacheState, key: &ChunkKey) -> Claim {
        let newly_pinned = match state.slots.get_mut(key) {
            None => return Claim::Missing,
            Some(slot) => match slot.reader.clone() {
                None => return Claim::Hydrating,
                Some(chunk) => {
                    slot.refs += 1;
                    (chunk, slot.refs == 1)
                }
            },
        };

        if newly_pinned.1 {
            state.idle.pop(key);
        }
        Claim::Ready(newly_pinned.0)
    }

    fn hydrate(&self, reader: &Reader, fetch: &FetchInfo) -> Result<ChunkReader, CacheError> {
        debug!(chunk_id = fetch.id, depth = fetch.depth, "hydrating chunk");

        let bytes = reader
            .source()
            .get(&fetch.id.to_string())
            .map_err(|_| CacheError::Hydration(fetch.id))?;

        ChunkReader::new(
            reader.schema().clone(),
            reader.bounds().clone(),
            fetch.id,
            fetch.depth,
            fetch.chunk_points,
            bytes.to_vec(),
        )
        .map_err(|_| CacheError::Hydration(fetch.id))
    }

    /// Move a slot into the idle list once nothing pins or awaits it.
    fn note_idle(state: &mut CacheState, key: ChunkKey) {
        let evictable = state
            .slots
            .get(&key)
            .map(CacheSlot::evictable)
            .unwrap_or(false);
        if evictable {
            state.idle.put(key, ());
        }
    }

    fn unpin(state: &mut CacheState, key: ChunkKey) {
        if let Some(slot) = state.slots.get_mut(&key) {
            slot.refs = slot.refs.saturating_sub(1);
        }
        Self::note_idle(state, key);
    }

    fn leave_wait(state: &mut CacheState, key: ChunkKey) {
        if let Some(slot) = state.slots.get_mut(&key) {
            slot.waiters = slot.waiters.saturating_sub(1);
        }
        Self::note_idle(state, key);
    }

    fn evict(state: &mut CacheState, max_chunks: usize) {
        while state.slots.len() > max_chunks {
            match state.idle.pop_lru() {
                Some((key, ())) => {
                    debug!(chunk_id = key.1, "evicting chunk");
                    state.slots.remove(&key);
                }
                None => break,
            }
        }
    }

    fn release(&self, path: &str, ids: impl Iterator<Item = u64>) {
        let mut guard = self.state.lock();
        for id in ids {
            Self::unpin(&mut guard, (path.to_string(), id));
        }
        Self::evict(&mut guard, self.max_chunks);
    }
}

/// A query's reservation: the requested chunks, hydrated and pinned for
/// the block's lifetime. Dropping the block releases the pins.
pub struct ChunkBlock {
    cache: Arc<Cache>,
    path: String,
    chunks: BTreeMap<u64, Arc<ChunkReader>>,
}

impl ChunkBlock {
    /// Reserved chunks in ascending id order.
    pub fn chunks(&self) -> &BTreeMap<u64, Arc<ChunkReader>> {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Drop for ChunkBlock {
    fn drop(&mut self) {
        self.cache.release(&self.path, self.chunks.keys().copied());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::memory::MemorySource;
    use crate::source::{Source, SourceError};
    use crate::test_support::build_index;
    use crate::tree::structure::StructureConfig;
    use bytes::Bytes;
    use glam::DVec3;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts fetches of a single blob name.
    struct CountingSource {
        inner: Arc<MemorySource>,
        name: String,
        hits: AtomicUsize,
    }

    impl CountingSource {
        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl Source for CountingSource {
        fn get(&self, name: &str) -> Result<Bytes, SourceError> {
            if name == self.name {
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.get(name)
        }

        fn put(&self, name: &str, data: &[u8]) -> Result<(), SourceError> {
            self.inner.put(name, data)
        }
    }

    fn flat_config() -> StructureConfig {
        StructureConfig {
            base_depth_begin: 0,
            base_depth_end: 1,
            cold_depth_begin: 1,
            cold_depth_end: Some(6),
            // One cell per chunk: each quadrant below lands in its own blob.
            chunk_points: 1,
            is3d: false,
        }
    }

    /// One base point plus one point per depth-1 quadrant, yielding cold
    /// chunks 1 through 4.
    fn spread_points() -> Vec<DVec3> {
        vec![
            DVec3::new(0.5, 0.5, 0.5),
            DVec3::new(1.5, 1.5, 0.5),
            DVec3::new(5.5, 1.5, 0.5),
            DVec3::new(1.5, 5.5, 0.5),
            DVec3::new(5.5, 5.5, 0.5),
        ]
    }

    fn counted_reader(path: &str, watch: &str) -> (Arc<CountingSource>, Reader) {
        let memory = Arc::new(MemorySource::new());
        build_index(&memory, &spread_points(), flat_config());

        let counting = Arc::new(CountingSource {
            inner: memory,
            name: watch.to_string(),
            hits: AtomicUsize::new(0),
        });
        let reader = Reader::new(path, counting.clone() as Arc<dyn Source>).unwrap();
        (counting, reader)
    }

    fn fetch(id: u64) -> BTreeSet<FetchInfo> {
        BTreeSet::from([FetchInfo {
            id,
            depth: 1,
            chunk_points: 1,
        }])
    }

    #[test]
    fn concurrent_acquires_coalesce() {
        let (counting, reader) = counted_reader("coalesce", "1");
        let cache = Cache::new(8);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let cache = cache.clone();
                let reader = &reader;
                scope.spawn(move || {
                    let block = cache.acquire(reader, &fetch(1)).expect("reservation");
                    assert_eq!(block.len(), 1);
                    assert_eq!(block.chunks()[&1].num_points(), 1);
                });
            }
        });

        assert_eq!(counting.hits(), 1);
    }

    #[test]
    fn lru_eviction_and_rehydration() {
        let (counting, reader) = counted_reader("evict", "1");
        let cache = Cache::new(2);

        drop(cache.acquire(&reader, &fetch(1)).unwrap());
        assert_eq!(counting.hits(), 1);

        drop(cache.acquire(&reader, &fetch(2)).unwrap());
        // Still within budget: no refetch.
        drop(cache.acquire(&reader, &fetch(1)).unwrap());
        assert_eq!(counting.hits(), 1);

        // Chunk 2 is now least recently used; 3 then 4 push out 2 then 1.
        drop(cache.acquire(&reader, &fetch(3)).unwrap());
        drop(cache.acquire(&reader, &fetch(4)).unwrap());
        assert_eq!(cache.num_chunks(), 2);

        drop(cache.acquire(&reader, &fetch(1)).unwrap());
        assert_eq!(counting.hits(), 2);
    }

    #[test]
    fn pinned_chunks_survive_the_budget() {
        let (_, reader) = counted_reader("pinned", "1");
        let cache = Cache::new(1);

        let one = cache.acquire(&reader, &fetch(1)).unwrap();
        let two = cache.acquire(&reader, &fetch(2)).unwrap();

        // Both are pinned, so the pool runs over budget rather than
        // dropping either.
        assert_eq!(cache.num_chunks(), 2);
        drop(one);
        drop(two);
        assert_eq!(cache.num_chunks(), 1);
    }

    #[test]
    fn failed_hydration_is_all_or_nothing() {
        let (counting, reader) = counted_reader("fail", "1");
        let cache = Cache::new(8);

        let mut batch = fetch(1);
        batch.extend(fetch(999));
        assert!(cache.acquire(&reader, &batch).is_none());

        // The good chunk was unpinned, not leaked: it serves again.
        let block = cache.acquire(&reader, &fetch(1)).unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(counting.hits(), 1);
    }
}
