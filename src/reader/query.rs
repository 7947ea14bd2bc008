use crate::bounds::Bounds;
use crate::reader::cache::{Cache, ChunkBlock, FetchInfo};
use crate::reader::Reader;
use crate::schema::Schema;
use crate::tree::climber::SplitClimber;
use byteorder::{ByteOrder, LittleEndian};
use glam::DVec3;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Cold chunks reserved from the cache per `next` round.
pub const FETCHES_PER_ITERATION: usize = 4;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("next called after query completed")]
    Complete,

    #[error("query buffer not empty")]
    BufferNotEmpty,

    #[error("chunk reservation failure")]
    Reservation,

    #[error("query cancelled")]
    Cancelled,
}

/// Cooperative cancellation handle; checked between chunk batches and
/// between points.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Query state machine: drains the base subtree first, then consumes
/// cold chunks in cache-reserved batches, invoking a per-point callback
/// for every candidate.
pub struct BaseQuery<'a> {
    reader: &'a Reader,
    cache: Arc<Cache>,
    query_bounds: Bounds,
    depth_begin: u64,
    depth_end: u64,
    chunks: BTreeSet<FetchInfo>,
    block: Option<ChunkBlock>,
    block_pos: usize,
    num_points: u64,
    base_pass: bool,
    done: bool,
    cancel: CancelToken,
}

impl<'a> BaseQuery<'a> {
    pub fn new(
        reader: &'a Reader,
        cache: Arc<Cache>,
        query_bounds: Bounds,
        depth_begin: u64,
        depth_end: u64,
    ) -> Self {
        let structure = reader.structure();

        // Plan the cold chunks up front: walk chunk regions intersecting
        // the query; a missing chunk terminates descent into its subtree.
        let mut chunks = BTreeSet::new();
        if depth_end == 0 || depth_end > structure.cold_depth_begin() {
            let mut climber = SplitClimber::new(
                structure,
                reader.bounds().clone(),
                query_bounds.clone(),
                depth_begin,
                depth_end,
                true,
            );

            if !climber.done() {
                loop {
                    let chunk_id = climber.index();
                    let mut terminate = false;

                    if reader.exists(chunk_id) {
                        chunks.insert(FetchInfo {
                            id: chunk_id,
                            depth: climber.depth(),
                            chunk_points: structure.get_info(chunk_id).chunk_points,
                        });
                    } else {
                        terminate = true;
                    }

                    if !climber.next(terminate) {
                        break;
                    }
                }
            }
        }

        debug!(chunks = chunks.len(), "query planned");

        Self {
            reader,
            cache,
            query_bounds,
            depth_begin,
            depth_end,
            chunks,
            block: None,
            block_pos: 0,
            num_points: 0,
            base_pass: true,
            done: false,
            cancel: CancelToken::default(),
        }
    }

    pub fn num_points(&self) -> u64 {
        self.num_points
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drive the next round of work, feeding every emitted point through
    /// `process`. Returns false once the query completes.
    pub fn next_with<F>(&mut self, process: &mut F) -> Result<bool, QueryError>
    where
        F: FnMut(DVec3, &[u8]) -> bool,
    {
        if self.done {
            return Err(QueryError::Complete);
        }
        if self.cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }

        if self.base_pass {
            self.base_pass = false;
            let had_data = self.drain_base(process)?;

            if !had_data {
                if self.chunks.is_empty() {
                    self.done = true;
                } else {
                    self.next_chunked(process)?;
                }
            }
        } else {
            self.next_chunked(process)?;
        }

        Ok(!self.done)
    }

    /// Walk the base subtree cell by cell; an empty tube terminates
    /// descent, since deeper cells fill only after their ancestors.
    fn drain_base<F>(&mut self, process: &mut F) -> Result<bool, QueryError>
    where
        F: FnMut(DVec3, &[u8]) -> bool,
    {
        let structure = self.reader.structure();
        let Some(base) = self.reader.base() else {
            return Ok(false);
        };

        if self.depth_begin >= structure.base_depth_end() {
            return Ok(false);
        }
        if self.depth_end != 0 && self.depth_end <= structure.base_depth_begin() {
            return Ok(false);
        }

        let begin = self.depth_begin.max(structure.base_depth_begin());
        let end = if self.depth_end == 0 {
            structure.base_depth_end()
        } else {
            self.depth_end.min(structure.base_depth_end())
        };

        let mut climber = SplitClimber::new(
            structure,
            self.reader.bounds().clone(),
            self.query_bounds.clone(),
            begin,
            end,
            false,
        );
        if climber.done() {
            return Ok(false);
        }

        let mut had_data = false;
        loop {
            let tube = base.tube(climber.index());
            let terminate = tube.is_empty();

            for record in tube {
                if self.cancel.is_cancelled() {
                    return Err(QueryError::Cancelled);
                }
                if process(record.point, base.point_data(record)) {
                    self.num_points += 1;
                    had_data = true;
                }
            }

            if !climber.next(terminate) {
                break;
            }
        }

        Ok(had_data)
    }

    /// Consume one reserved chunk; acquire the next batch when the
    /// active block is spent.
    fn next_chunked<F>(&mut self, process: &mut F) -> Result<(), QueryError>
    where
        F: FnMut(DVec3, &[u8]) -> bool,
    {
        if self.block.is_none() && !self.chunks.is_empty() {
            let batch: BTreeSet<FetchInfo> = self
                .chunks
                .iter()
                .take(FETCHES_PER_ITERATION)
                .cloned()
                .collect();
            for fetch in &batch {
                self.chunks.remove(fetch);
            }

            debug!(batch = batch.len(), "reserving chunk block");
            match self.cache.acquire(self.reader, &batch) {
                Some(block) => {
                    self.block = Some(block);
                    self.block_pos = 0;
                }
                None => {
                    self.done = true;
                    return Err(QueryError::Reservation);
                }
            }
        }

        if let Some(block) = self.block.take() {
            if let Some((_, chunk)) = block.chunks().iter().nth(self.block_pos) {
                for record in chunk.candidates(&self.query_bounds) {
                    if self.cancel.is_cancelled() {
                        return Err(QueryError::Cancelled);
                    }
                    if process(record.point, chunk.point_data(record)) {
                        self.num_points += 1;
                    }
                }
            }

            self.block_pos += 1;
            if self.block_pos < block.len() {
                self.block = Some(block);
            } else {
                self.block_pos = 0;
            }
        }

        self.done = self.block.is_none() && self.chunks.is_empty();
        Ok(())
    }
}

/// A query emitting records under a caller-chosen output schema.
pub struct Query<'a> {
    base: BaseQuery<'a>,
    out_schema: Schema,
    normalize: bool,
}

impl<'a> Query<'a> {
    pub fn new(
        reader: &'a Reader,
        cache: Arc<Cache>,
        out_schema: Schema,
        query_bounds: Bounds,
        depth_begin: u64,
        depth_end: u64,
        normalize: bool,
    ) -> Query<'a> {
        Query {
            base: BaseQuery::new(reader, cache, query_bounds, depth_begin, depth_end),
            out_schema,
            normalize,
        }
    }

    pub fn num_points(&self) -> u64 {
        self.base.num_points()
    }

    pub fn done(&self) -> bool {
        self.base.done()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.base.cancel_token()
    }

    /// Drive one round, appending output records to `buffer`. The buffer
    /// must come in empty; misuse surfaces immediately.
    pub fn next(&mut self, buffer: &mut Vec<u8>) -> Result<bool, QueryError> {
        if !buffer.is_empty() {
            return Err(QueryError::BufferNotEmpty);
        }

        let Query {
            base,
            out_schema,
            normalize,
        } = self;

        let in_schema = base.reader.schema().clone();
        let mid = base.reader.bounds().mid();
        let query_bounds = base.query_bounds.clone();
        let normalize = *normalize;

        let mut process = |point: DVec3, data: &[u8]| -> bool {
            if !query_bounds.contains(point) {
                return false;
            }
            append_record(buffer, out_schema, &in_schema, data, normalize, mid);
            true
        };

        base.next_with(&mut process)
    }
}

/// Transcode one record from the index's schema into the output schema,
/// matching dimensions by name. Normalized 4-byte X/Y/Z emit as f32
/// centered on the index midpoint.
fn append_record(
    buffer: &mut Vec<u8>,
    out: &Schema,
    input: &Schema,
    data: &[u8],
    normalize: bool,
    mid: DVec3,
) {
    let start = buffer.len();
    buffer.resize(start + out.point_size(), 0);
    let record = &mut buffer[start..];

    for (i, dim) in out.dims().iter().enumerate() {
        let Some(j) = input.find(&dim.name) else {
            continue;
        };

        let normalized =
            normalize && dim.size() == 4 && matches!(dim.name.as_str(), "X" | "Y" | "Z");

        if normalized {
            let center = match dim.name.as_str() {
                "X" => mid.x,
                "Y" => mid.y,
                _ => mid.z,
            };
            let value = input.read_f64(j, data) - center;
            let off = out.offset(i);
            LittleEndian::write_f32(&mut record[off..], value as f32);
        } else if input.dims()[j].r#type == dim.r#type {
            let off = out.offset(i);
            let src = input.offset(j);
            record[off..off + dim.size()].copy_from_slice(&data[src..src + dim.size()]);
        } else {
            out.write_f64(i, record, input.read_f64(j, data));
        }
    }
}
