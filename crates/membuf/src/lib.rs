#![forbid(unsafe_code)]
//! Prebuffering in-memory stream cache.
//!
//! Wraps a seekable byte source and exposes blocking [`Membuf::read`],
//! [`Membuf::peek`], and [`Membuf::seek`] while a background worker pulls
//! bytes from the source into a block-addressed memory buffer, racing ahead
//! of the reader. Progress is observable through the cached-size query.
//!
//! # Concurrency model
//!
//! Exactly two logical threads interact: the reader (host pipeline) and the
//! prebuffer worker. They coordinate through one state mutex (the offset
//! lock, guarding the frontier cursor, the EOS latch, and the block array
//! shape) with two condition variables on it:
//!
//! - `fill`: waited by readers until the frontier passes their target, or
//!   EOS / a latched fault / close is observed;
//! - `rewind`: waited by the worker once the frontier reaches end of stream,
//!   signalled by seeks and by close.
//!
//! Lock order is `offset lock → source lock → block lock`, with no
//! back-edges: the worker acquires the source lock alone and releases it
//! before committing, so source I/O never runs under the offset lock or a
//! block lock on the worker side.

pub mod source;

pub use membuf_error::{MembufError, Result, Status};
pub use membuf_types::{BlockGeometry, BlockIndex, BLOCK_SIZE, READ_CHUNK, SHORT_SEEK_WINDOW};
pub use source::{FileSource, SourceStream};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::Mutex;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

// ── blocks ─────────────────────────────────────────────────────────────────

/// One cache block: a zero-filled buffer plus the contiguous valid range
/// `[begin, end)`. Bytes inside the range are immutable once committed; the
/// worker only appends at `end` (or narrows the range when reconciling a
/// seek).
#[derive(Debug)]
struct BlockData {
    buf: Vec<u8>,
    begin: usize,
    end: usize,
}

impl BlockData {
    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

type Block = Arc<Mutex<BlockData>>;
type BlockGuard = ArcMutexGuard<parking_lot::RawMutex, BlockData>;

fn alloc_block(capacity: usize) -> Result<Block> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity)
        .map_err(|_| MembufError::Alloc { bytes: capacity })?;
    buf.resize(capacity, 0);
    Ok(Arc::new(Mutex::new(BlockData {
        buf,
        begin: 0,
        end: 0,
    })))
}

// ── frontier state ─────────────────────────────────────────────────────────

/// State behind the offset lock. Everything here is mutated by the worker,
/// except that seeks reset the frontier and close latches the fault mirror.
#[derive(Debug)]
struct Frontier {
    /// First byte at or after the reader position not yet guaranteed
    /// buffered. Non-decreasing between seeks.
    prebuffer: u64,
    /// Latched once the frontier reaches the stream size; cleared only by a
    /// frontier-resetting seek.
    buffered_eos: bool,
    /// Sparse block array indexed by block index; slots are appended, never
    /// removed.
    blocks: Vec<Option<Block>>,
    /// Bumped by every frontier-resetting seek. Guards the worker's commit
    /// against a seek that restores the frontier to the exact value it is
    /// verifying (the source cursor would have regressed underneath it).
    seek_epoch: u64,
    /// First worker fault, latched for every later caller.
    fault: Option<Arc<MembufError>>,
    source_reads: u64,
    rewinds: u64,
    fill_waits: u64,
}

impl Frontier {
    fn new() -> Self {
        Self {
            prebuffer: 0,
            buffered_eos: false,
            blocks: Vec::new(),
            seek_epoch: 0,
            fault: None,
            source_reads: 0,
            rewinds: 0,
            fill_waits: 0,
        }
    }

    fn block(&self, index: BlockIndex) -> Option<Block> {
        index
            .slot()
            .and_then(|slot| self.blocks.get(slot))
            .and_then(Option::as_ref)
            .map(Arc::clone)
    }
}

struct Shared<S> {
    geometry: BlockGeometry,
    read_chunk: usize,
    short_seek_window: u64,
    can_seek: bool,
    can_fast_seek: bool,

    state: std::sync::Mutex<Frontier>,
    fill_cv: Condvar,
    rewind_cv: Condvar,

    /// Serializes source I/O so `tell` is meaningful between the seek path
    /// and the worker's read path.
    source: Mutex<S>,

    /// Reader position; written only by the reader thread.
    stream_offset: AtomicU64,
    /// Unlocked mirror of `Frontier::prebuffer` for best-effort queries.
    frontier_hint: AtomicU64,
    closing: AtomicBool,
}

impl<S> Shared<S> {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, Frontier> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The error a blocked caller must observe, if any.
    fn latched(&self, state: &Frontier) -> Option<MembufError> {
        if self.closing.load(Ordering::Acquire) {
            return Some(MembufError::Closed);
        }
        state
            .fault
            .as_ref()
            .map(|fault| MembufError::Faulted(Arc::clone(fault)))
    }

    fn latch_fault(&self, err: MembufError) {
        let mut state = self.lock_state();
        if state.fault.is_none() {
            state.fault = Some(Arc::new(err));
        }
        drop(state);
        self.fill_cv.notify_all();
    }

    /// Wait until `want` bytes past the reader position are buffered.
    ///
    /// Returns the number of bytes guaranteed readable, clamped at EOS;
    /// 0 means end of stream. A latched fault or close turns into an error.
    fn wait_ready(&self, want: usize) -> Result<usize> {
        let offset = self.stream_offset.load(Ordering::Relaxed);
        let mut want = want as u64;

        let mut state = self.lock_state();
        if state.buffered_eos {
            want = want.min(state.prebuffer.saturating_sub(offset));
        }
        if want == 0 {
            return Ok(0);
        }

        loop {
            // A request already covered by the frontier is served as-is; a
            // fault latched further into the stream does not taint data the
            // worker committed before it.
            if offset.saturating_add(want) <= state.prebuffer {
                return Ok(want as usize);
            }
            if let Some(err) = self.latched(&state) {
                return Err(err);
            }
            if state.buffered_eos {
                want = state.prebuffer.saturating_sub(offset);
                break;
            }
            state.fill_waits += 1;
            trace!(event = "fill_wait", offset, want);
            state = self
                .fill_cv
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        // The worker may have faulted between the last signal and this wake.
        if let Some(err) = self.latched(&state) {
            return Err(err);
        }
        Ok(want as usize)
    }

    /// Copy `out.len()` bytes starting at `pos` out of the block store.
    /// Callers must have established readiness via [`Self::wait_ready`].
    fn fetch_into(&self, mut pos: u64, out: &mut [u8]) {
        let mut copied = 0;
        while copied < out.len() {
            let (index, offset) = self.geometry.locate(pos);
            let Some(block) = self.lock_state().block(index) else {
                debug_assert!(false, "buffered range lost block {index}");
                break;
            };

            let data = block.lock();
            debug_assert!(offset >= data.begin && offset < data.end);
            let step = (data.end - offset).min(out.len() - copied);
            if step == 0 {
                break;
            }
            out[copied..copied + step].copy_from_slice(&data.buf[offset..offset + step]);
            drop(data);

            copied += step;
            pos += step as u64;
        }
    }
}

/// Furthest position reachable from `start` through contiguously buffered
/// blocks; `start` itself when nothing is buffered there.
fn find_contiguous_end(geometry: &BlockGeometry, state: &Frontier, start: u64) -> u64 {
    let (mut index, mut offset) = geometry.locate(start);
    let mut reachable = start;
    loop {
        let Some(block) = state.block(index) else {
            return reachable;
        };
        let data = block.lock();
        if offset < data.begin || offset >= data.end {
            return reachable;
        }
        reachable = geometry.block_base(index) + data.end as u64;
        if data.end < geometry.block_size() {
            return reachable;
        }
        drop(data);
        index = BlockIndex(index.0 + 1);
        offset = 0;
    }
}

// ── prebuffer worker ───────────────────────────────────────────────────────

fn prebuffer_worker<S: SourceStream>(shared: &Shared<S>) {
    let size = shared.geometry.stream_size();
    let mut scratch = vec![0_u8; shared.read_chunk];

    'outer: loop {
        // Phase a: park once the frontier reaches end of stream, waking any
        // reader polling for EOS first. Phase b (still under the offset
        // lock): grow the array, allocate the target block, reconcile its
        // valid range with the frontier.
        let (frontier, epoch, block, start) = {
            let mut state = shared.lock_state();
            loop {
                if shared.closing.load(Ordering::Acquire) || state.fault.is_some() {
                    break 'outer;
                }
                if state.prebuffer < size {
                    break;
                }
                if !state.buffered_eos {
                    state.buffered_eos = true;
                    debug!(event = "buffered_eos", frontier = state.prebuffer);
                }
                shared.fill_cv.notify_all();
                state = shared
                    .rewind_cv
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }

            let frontier = state.prebuffer;
            let epoch = state.seek_epoch;
            let (index, offset) = shared.geometry.locate(frontier);
            let capacity = shared.geometry.block_capacity(index);
            let Some(slot) = index.slot() else {
                state.fault = Some(Arc::new(MembufError::Alloc { bytes: capacity }));
                break 'outer;
            };
            while state.blocks.len() <= slot {
                state.blocks.push(None);
            }
            let block = match state.blocks[slot].clone() {
                Some(block) => block,
                None => match alloc_block(capacity) {
                    Ok(block) => {
                        trace!(event = "block_alloc", index = %index, capacity);
                        state.blocks[slot] = Some(Arc::clone(&block));
                        block
                    }
                    Err(err) => {
                        error!(event = "block_alloc_failed", index = %index, capacity);
                        state.fault = Some(Arc::new(err));
                        break 'outer;
                    }
                },
            };

            {
                let mut data = block.lock();
                if offset < data.begin || offset > data.end {
                    // Frontier outside the filled range (rewound below it or
                    // jumped past it): restart the range at the frontier.
                    data.begin = offset;
                    data.end = offset;
                } else if offset < data.end {
                    // Landed inside the range: keep the head, drop the tail.
                    data.end = offset;
                }
            }
            (frontier, epoch, block, offset)
        };

        // Phase c: fill from `start` to the block's capacity, one source
        // chunk at a time.
        let mut frontier = frontier;
        let mut offset = start;
        let capacity = block.lock().capacity();
        while offset < capacity {
            if shared.closing.load(Ordering::Acquire) {
                break 'outer;
            }
            let step = shared.read_chunk.min(capacity - offset);

            let read = {
                let mut source = shared.source.lock();
                let at = source.tell();
                if at == frontier {
                    Some(source.read(&mut scratch[..step]))
                } else {
                    // A seek moved the source under us; the frontier check
                    // at commit time would catch it, but there is nothing
                    // useful to read here.
                    warn!(event = "source_moved", expected = frontier, actual = at);
                    None
                }
            };
            let Some(read) = read else {
                shared.lock_state().rewinds += 1;
                continue 'outer;
            };
            let n = match read {
                Ok(0) => {
                    let err = MembufError::SourceRead {
                        offset: frontier,
                        detail: "premature end of stream".to_owned(),
                    };
                    error!(event = "source_read_failed", offset = frontier, error = %err);
                    shared.latch_fault(err);
                    break 'outer;
                }
                Err(err) => {
                    error!(event = "source_read_failed", offset = frontier, error = %err);
                    shared.latch_fault(MembufError::SourceRead {
                        offset: frontier,
                        detail: err.to_string(),
                    });
                    break 'outer;
                }
                Ok(n) => n,
            };

            // Commit: re-verify the frontier, append under the block lock,
            // advance the frontier, wake readers.
            let mut state = shared.lock_state();
            state.source_reads += 1;
            if shared.closing.load(Ordering::Acquire) || state.fault.is_some() {
                break 'outer;
            }
            if state.prebuffer != frontier || state.seek_epoch != epoch {
                state.rewinds += 1;
                debug!(event = "rewind", expected = frontier, actual = state.prebuffer);
                continue 'outer;
            }
            {
                let mut data = block.lock();
                debug_assert_eq!(data.end, offset);
                data.buf[offset..offset + n].copy_from_slice(&scratch[..n]);
                data.end = offset + n;
            }
            offset += n;
            frontier += n as u64;
            state.prebuffer = frontier;
            shared.frontier_hint.store(frontier, Ordering::Release);
            drop(state);
            shared.fill_cv.notify_all();
        }
    }

    // Wake anything still blocked so it observes the latched state.
    shared.fill_cv.notify_all();
    info!(event = "prebuffer_worker_exit");
}

// ── configuration ──────────────────────────────────────────────────────────

/// Runtime configuration for [`Membuf::open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembufConfig {
    /// Master switch; `open` fails while this is unset so the filter is
    /// bypassed by default.
    pub enabled: bool,
    /// Capacity of each cache block.
    pub block_size: usize,
    /// Maximum bytes pulled from the source per worker step.
    pub read_chunk: usize,
    /// Forward-seek distance still served by waiting for the producer
    /// instead of rewinding the source.
    pub short_seek_window: u64,
}

impl Default for MembufConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            block_size: BLOCK_SIZE,
            read_chunk: READ_CHUNK,
            short_seek_window: SHORT_SEEK_WINDOW,
        }
    }
}

impl MembufConfig {
    fn validate(self) -> Result<Self> {
        if self.block_size == 0 {
            return Err(MembufError::InvalidConfig {
                reason: "block_size must be > 0",
            });
        }
        if self.read_chunk == 0 {
            return Err(MembufError::InvalidConfig {
                reason: "read_chunk must be > 0",
            });
        }
        Ok(self)
    }
}

// ── reader API ─────────────────────────────────────────────────────────────

/// Host control queries recognised by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlQuery {
    CanSeek,
    CanFastSeek,
    GetSize,
    GetPosition,
    /// Best-effort frontier position, read without the offset lock.
    GetCachedSize,
    PrebufferFinished,
    SetPosition(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValue {
    Flag(bool),
    Length(u64),
    Position(u64),
    Done,
}

/// Borrowed view of peeked bytes.
///
/// The single-block fast path hands out a zero-copy reference into the
/// block's buffer, holding that block's lock for the life of the value; the
/// borrow of the filter prevents holding it across the next
/// `read`/`peek`/`seek`.
pub enum PeekRef<'a> {
    Direct(BlockPeek),
    Scratch(&'a [u8]),
}

pub struct BlockPeek {
    guard: BlockGuard,
    start: usize,
    len: usize,
}

impl Deref for PeekRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Direct(peek) => &peek.guard.buf[peek.start..peek.start + peek.len],
            Self::Scratch(bytes) => bytes,
        }
    }
}

impl PeekRef<'_> {
    /// True when the bytes are served straight out of a cache block.
    #[must_use]
    pub fn is_zero_copy(&self) -> bool {
        matches!(self, Self::Direct(_))
    }
}

impl std::fmt::Debug for PeekRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(_) => f.debug_tuple("Direct").finish(),
            Self::Scratch(bytes) => f.debug_tuple("Scratch").field(bytes).finish(),
        }
    }
}

/// Point-in-time cache statistics, taken with a single lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MembufMetrics {
    pub stream_size: u64,
    /// Frontier position: everything below it (down to the reader position)
    /// is buffered.
    pub cached_size: u64,
    pub buffered_eos: bool,
    pub blocks_allocated: usize,
    pub resident_bytes: usize,
    pub source_reads: u64,
    pub rewinds: u64,
    pub fill_waits: u64,
}

/// Prebuffering stream cache over a seekable source.
///
/// One logical reader; the background worker is spawned at open and joined
/// at close (or drop).
pub struct Membuf<S: SourceStream> {
    shared: Arc<Shared<S>>,
    peek_scratch: Vec<u8>,
    worker: Option<JoinHandle<()>>,
}

impl<S: SourceStream> std::fmt::Debug for Membuf<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Membuf").finish_non_exhaustive()
    }
}

impl<S: SourceStream> Membuf<S> {
    /// Layer the cache over `source` and start prebuffering.
    ///
    /// Fails when the config gate is unset, when `source` is already a
    /// prebuffer cache, or when the source size is unknown.
    pub fn open(source: S, config: MembufConfig) -> Result<Self>
    where
        S: 'static,
    {
        let config = config.validate()?;
        if !config.enabled {
            info!(event = "membuf_disabled");
            return Err(MembufError::Disabled);
        }
        if source.is_prebuffered() {
            return Err(MembufError::AlreadyLayered);
        }
        let size = source.size();
        if size == 0 {
            return Err(MembufError::UnknownSize);
        }
        let geometry = BlockGeometry::new(config.block_size, size).map_err(|_| {
            MembufError::InvalidConfig {
                reason: "block_size must be > 0",
            }
        })?;

        let can_seek = source.can_seek();
        let can_fast_seek = source.can_fast_seek();
        let shared = Arc::new(Shared {
            geometry,
            read_chunk: config.read_chunk,
            short_seek_window: config.short_seek_window,
            can_seek,
            can_fast_seek,
            state: std::sync::Mutex::new(Frontier::new()),
            fill_cv: Condvar::new(),
            rewind_cv: Condvar::new(),
            source: Mutex::new(source),
            stream_offset: AtomicU64::new(0),
            frontier_hint: AtomicU64::new(0),
            closing: AtomicBool::new(false),
        });

        let worker = thread::Builder::new()
            .name("membuf-prebuffer".to_owned())
            .spawn({
                let shared = Arc::clone(&shared);
                move || prebuffer_worker(&shared)
            })
            .map_err(MembufError::from)?;

        info!(
            event = "membuf_open",
            stream_size = size,
            can_seek,
            can_fast_seek,
            block_size = config.block_size
        );
        Ok(Self {
            shared,
            peek_scratch: Vec::new(),
            worker: Some(worker),
        })
    }

    /// Blocking read at the current position. `Ok(0)` means end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let ready = self.shared.wait_ready(buf.len())?;
        if ready == 0 {
            return Ok(0);
        }
        let pos = self.shared.stream_offset.load(Ordering::Relaxed);
        self.shared.fetch_into(pos, &mut buf[..ready]);
        self.shared
            .stream_offset
            .store(pos + ready as u64, Ordering::Release);
        Ok(ready)
    }

    /// Discard-read: advance the position by up to `len` buffered bytes
    /// without copying them out.
    pub fn skip(&mut self, len: usize) -> Result<usize> {
        let ready = self.shared.wait_ready(len)?;
        let pos = self.shared.stream_offset.load(Ordering::Relaxed);
        self.shared
            .stream_offset
            .store(pos + ready as u64, Ordering::Release);
        Ok(ready)
    }

    /// Blocking peek at the current position without advancing it.
    ///
    /// An EOS-clamped peek may return fewer bytes than requested; an empty
    /// view means end of stream.
    pub fn peek(&mut self, len: usize) -> Result<PeekRef<'_>> {
        let ready = self.shared.wait_ready(len)?;
        if ready == 0 {
            return Ok(PeekRef::Scratch(&[]));
        }
        let pos = self.shared.stream_offset.load(Ordering::Relaxed);
        let (index, offset) = self.shared.geometry.locate(pos);

        if offset + ready <= self.shared.geometry.block_size() {
            if let Some(block) = self.shared.lock_state().block(index) {
                let guard = block.lock_arc();
                debug_assert!(offset >= guard.begin && offset + ready <= guard.end);
                return Ok(PeekRef::Direct(BlockPeek {
                    guard,
                    start: offset,
                    len: ready,
                }));
            }
            debug_assert!(false, "buffered range lost block {index}");
        }

        if self.peek_scratch.len() < ready {
            let grow = ready - self.peek_scratch.len();
            self.peek_scratch
                .try_reserve_exact(grow)
                .map_err(|_| MembufError::Alloc { bytes: ready })?;
            self.peek_scratch.resize(ready, 0);
        }
        self.shared.fetch_into(pos, &mut self.peek_scratch[..ready]);
        Ok(PeekRef::Scratch(&self.peek_scratch[..ready]))
    }

    /// Seek to an absolute position.
    ///
    /// A short forward seek waits for the producer instead of rewinding the
    /// source; a seek into contiguously buffered data moves the position
    /// without touching the source at all.
    pub fn seek(&mut self, target: u64) -> Result<()> {
        if !self.shared.can_seek {
            return Err(MembufError::Unsupported);
        }

        {
            let frontier = self.shared.lock_state().prebuffer;
            if target > frontier
                && target < frontier.saturating_add(self.shared.short_seek_window)
            {
                debug!(event = "short_seek_wait", target, frontier);
                let offset = self.shared.stream_offset.load(Ordering::Relaxed);
                let want = usize::try_from(target - offset).unwrap_or(usize::MAX);
                let _ready = self.shared.wait_ready(want)?;
            }
        }

        let result = {
            let mut state = self.shared.lock_state();
            let offset = self.shared.stream_offset.load(Ordering::Relaxed);
            let rewind_target = find_contiguous_end(&self.shared.geometry, &state, target);

            // In-place when the run from the target reaches the frontier:
            // everything in [target, prebuffer) stays buffered, and a target
            // sitting exactly on the frontier needs no rewind at all (the
            // source cursor is already there).
            if target <= state.prebuffer && rewind_target >= state.prebuffer {
                debug!(event = "seek_in_buffer", target, rewind_target);
                self.shared.stream_offset.store(target, Ordering::Release);
                Ok(())
            } else {
                let actual = {
                    let mut source = self.shared.source.lock();
                    if let Err(err) = source.seek(rewind_target) {
                        warn!(event = "source_seek_failed", target = rewind_target, error = %err);
                    }
                    // Authoritative regardless of the seek result.
                    source.tell()
                };
                debug!(event = "seek_rewind", target, rewind_target, actual);
                state.buffered_eos = false;
                state.prebuffer = actual;
                state.seek_epoch += 1;
                self.shared.frontier_hint.store(actual, Ordering::Release);

                if target <= actual {
                    self.shared.stream_offset.store(target, Ordering::Release);
                    Ok(())
                } else {
                    if offset > actual {
                        self.shared.stream_offset.store(actual, Ordering::Release);
                    }
                    Err(MembufError::SourceSeek {
                        requested: target,
                        actual,
                    })
                }
            }
        };

        // Wake the worker to re-evaluate the frontier.
        self.shared.rewind_cv.notify_all();
        result
    }

    /// Host control dispatch.
    pub fn control(&mut self, query: ControlQuery) -> Result<ControlValue> {
        match query {
            ControlQuery::CanSeek => Ok(ControlValue::Flag(self.can_seek())),
            ControlQuery::CanFastSeek => Ok(ControlValue::Flag(self.can_fast_seek())),
            ControlQuery::GetSize => Ok(ControlValue::Length(self.size())),
            ControlQuery::GetPosition => Ok(ControlValue::Position(self.position())),
            ControlQuery::GetCachedSize => Ok(ControlValue::Length(self.cached_size())),
            ControlQuery::PrebufferFinished => Ok(ControlValue::Flag(self.prebuffer_finished())),
            ControlQuery::SetPosition(pos) => self.seek(pos).map(|()| ControlValue::Done),
        }
    }

    /// Stream size captured at open.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.shared.geometry.stream_size()
    }

    /// Current reader position.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.shared.stream_offset.load(Ordering::Relaxed)
    }

    /// Best-effort frontier position, read without the offset lock.
    #[must_use]
    pub fn cached_size(&self) -> u64 {
        self.shared.frontier_hint.load(Ordering::Relaxed)
    }

    /// Whether the worker has buffered through end of stream.
    #[must_use]
    pub fn prebuffer_finished(&self) -> bool {
        self.shared.lock_state().buffered_eos
    }

    #[must_use]
    pub fn can_seek(&self) -> bool {
        self.shared.can_seek
    }

    #[must_use]
    pub fn can_fast_seek(&self) -> bool {
        self.shared.can_fast_seek
    }

    /// Take a snapshot of current cache statistics.
    #[must_use]
    pub fn metrics(&self) -> MembufMetrics {
        let state = self.shared.lock_state();
        let blocks_allocated = state.blocks.iter().flatten().count();
        let resident_bytes = state
            .blocks
            .iter()
            .flatten()
            .map(|block| block.lock().capacity())
            .sum::<usize>();
        MembufMetrics {
            stream_size: self.shared.geometry.stream_size(),
            cached_size: state.prebuffer,
            buffered_eos: state.buffered_eos,
            blocks_allocated,
            resident_bytes,
            source_reads: state.source_reads,
            rewinds: state.rewinds,
            fill_waits: state.fill_waits,
        }
    }

    /// Shut down the worker and release the cache. Also runs on drop.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Latch under the offset lock so a worker about to wait on either
        // condition cannot miss the flag.
        {
            let _state = self.shared.lock_state();
            self.shared.closing.store(true, Ordering::Release);
        }
        self.shared.rewind_cv.notify_all();
        self.shared.fill_cv.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            info!(event = "membuf_close");
        }
    }
}

impl<S: SourceStream> Drop for Membuf<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The cache is itself a source, so further filters can stack above it;
/// `is_prebuffered` keeps a second cache layer from doing so.
impl<S: SourceStream> SourceStream for Membuf<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Membuf::read(self, buf)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        Membuf::seek(self, pos)
    }

    fn tell(&self) -> u64 {
        self.position()
    }

    fn size(&self) -> u64 {
        Membuf::size(self)
    }

    fn can_seek(&self) -> bool {
        Membuf::can_seek(self)
    }

    fn can_fast_seek(&self) -> bool {
        Membuf::can_fast_seek(self)
    }

    fn is_prebuffered(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn pattern(pos: u64) -> u8 {
        (pos % 251) as u8
    }

    fn assert_pattern(buf: &[u8], start: u64) {
        for (i, byte) in buf.iter().enumerate() {
            assert_eq!(*byte, pattern(start + i as u64), "byte at {}", start + i as u64);
        }
    }

    fn test_config() -> MembufConfig {
        MembufConfig {
            enabled: true,
            block_size: 8192,
            read_chunk: 1024,
            short_seek_window: 4096,
        }
    }

    /// Deterministic source: byte at `p` is `p % 251`. Seeks past `seek_cap`
    /// land there, modelling a source that cannot honor the full request.
    struct PatternSource {
        pos: u64,
        size: u64,
        seekable: bool,
        seek_cap: Option<u64>,
        fail_at: Option<u64>,
        stall_after: Option<u64>,
        seeks: Arc<AtomicUsize>,
    }

    impl PatternSource {
        fn new(size: u64) -> Self {
            Self {
                pos: 0,
                size,
                seekable: true,
                seek_cap: None,
                fail_at: None,
                stall_after: None,
                seeks: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn seek_counter(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.seeks)
        }
    }

    impl SourceStream for PatternSource {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            if let Some(limit) = self.stall_after {
                if self.pos >= limit {
                    thread::sleep(Duration::from_millis(30));
                }
            }
            if let Some(fail_at) = self.fail_at {
                if self.pos >= fail_at {
                    return Err(MembufError::Io(std::io::Error::other("injected failure")));
                }
            }
            let left = self.size.saturating_sub(self.pos);
            let n = usize::try_from((buf.len() as u64).min(left)).expect("chunk fits usize");
            for (i, byte) in buf[..n].iter_mut().enumerate() {
                *byte = pattern(self.pos + i as u64);
            }
            self.pos += n as u64;
            Ok(n)
        }

        fn seek(&mut self, pos: u64) -> Result<()> {
            self.seeks.fetch_add(1, Ordering::SeqCst);
            let cap = self.seek_cap.unwrap_or(self.size);
            self.pos = pos.min(cap);
            Ok(())
        }

        fn tell(&self) -> u64 {
            self.pos
        }

        fn size(&self) -> u64 {
            self.size
        }

        fn can_seek(&self) -> bool {
            self.seekable
        }

        fn can_fast_seek(&self) -> bool {
            true
        }
    }

    fn wait_prebuffer_finished<S: SourceStream>(cache: &Membuf<S>) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if cache.prebuffer_finished() {
                return;
            }
            thread::sleep(Duration::from_millis(2));
        }
        panic!("prebuffer did not finish in time");
    }

    // ── open gates ──────────────────────────────────────────────────────

    #[test]
    fn open_rejects_disabled_config() {
        let config = MembufConfig {
            enabled: false,
            ..test_config()
        };
        let err = Membuf::open(PatternSource::new(1024), config).expect_err("gate");
        assert!(matches!(err, MembufError::Disabled));
    }

    #[test]
    fn open_rejects_unknown_size() {
        let err = Membuf::open(PatternSource::new(0), test_config()).expect_err("gate");
        assert!(matches!(err, MembufError::UnknownSize));
    }

    #[test]
    fn open_rejects_second_layer() {
        let inner = Membuf::open(PatternSource::new(4096), test_config()).expect("inner");
        let err = Membuf::open(inner, test_config()).expect_err("gate");
        assert!(matches!(err, MembufError::AlreadyLayered));
    }

    #[test]
    fn open_rejects_invalid_config() {
        let config = MembufConfig {
            read_chunk: 0,
            ..test_config()
        };
        let err = Membuf::open(PatternSource::new(4096), config).expect_err("gate");
        assert!(matches!(err, MembufError::InvalidConfig { .. }));
    }

    // ── read / skip / peek ──────────────────────────────────────────────

    #[test]
    fn read_returns_source_bytes() {
        let size = 3 * 8192 + 100;
        let mut cache = Membuf::open(PatternSource::new(size), test_config()).expect("open");

        let mut buf = vec![0_u8; 5000];
        assert_eq!(cache.read(&mut buf).expect("read"), 5000);
        assert_pattern(&buf, 0);
        assert_eq!(cache.position(), 5000);
        assert!(cache.cached_size() >= 5000);
    }

    #[test]
    fn read_crosses_block_boundary() {
        let mut cache =
            Membuf::open(PatternSource::new(3 * 8192), test_config()).expect("open");
        cache.seek(8191).expect("seek");

        let mut buf = [0_u8; 2];
        assert_eq!(cache.read(&mut buf).expect("read"), 2);
        assert_pattern(&buf, 8191);
    }

    #[test]
    fn read_clamps_at_eos() {
        let size = 8192 + 10;
        let mut cache = Membuf::open(PatternSource::new(size), test_config()).expect("open");

        let mut buf = vec![0_u8; 20000];
        let got = cache.read(&mut buf).expect("read");
        assert_eq!(got as u64, size);
        assert_pattern(&buf[..got], 0);
        assert_eq!(cache.read(&mut buf).expect("read at eos"), 0);
    }

    #[test]
    fn read_empty_buffer_is_noop() {
        let mut cache = Membuf::open(PatternSource::new(4096), test_config()).expect("open");
        assert_eq!(cache.read(&mut []).expect("read"), 0);
        assert_eq!(cache.position(), 0);
    }

    #[test]
    fn skip_advances_without_copying() {
        let mut cache =
            Membuf::open(PatternSource::new(2 * 8192), test_config()).expect("open");
        let mut buf = [0_u8; 10];
        cache.read(&mut buf).expect("read");
        assert_eq!(cache.skip(20).expect("skip"), 20);

        cache.read(&mut buf).expect("read");
        assert_pattern(&buf, 30);
    }

    #[test]
    fn peek_then_read_returns_same_bytes() {
        let mut cache =
            Membuf::open(PatternSource::new(2 * 8192), test_config()).expect("open");

        let peeked = cache.peek(100).expect("peek").to_vec();
        assert_eq!(cache.position(), 0);

        let mut buf = [0_u8; 100];
        assert_eq!(cache.read(&mut buf).expect("read"), 100);
        assert_eq!(peeked, buf);
    }

    #[test]
    fn peek_within_block_is_zero_copy() {
        let mut cache =
            Membuf::open(PatternSource::new(2 * 8192), test_config()).expect("open");
        let peek = cache.peek(100).expect("peek");
        assert!(peek.is_zero_copy());
        assert_pattern(&peek, 0);
    }

    #[test]
    fn peek_across_blocks_uses_scratch() {
        let mut cache =
            Membuf::open(PatternSource::new(3 * 8192), test_config()).expect("open");
        cache.seek(8192 - 50).expect("seek");

        let peek = cache.peek(100).expect("peek");
        assert!(!peek.is_zero_copy());
        assert_eq!(peek.len(), 100);
        assert_pattern(&peek, 8192 - 50);
    }

    #[test]
    fn peek_at_eos_is_empty() {
        let mut cache = Membuf::open(PatternSource::new(4096), test_config()).expect("open");
        cache.seek(4096).expect("seek");
        let peek = cache.peek(16).expect("peek");
        assert!(peek.is_empty());
    }

    // ── seek ────────────────────────────────────────────────────────────

    #[test]
    fn seek_within_buffered_data_skips_source() {
        let source = PatternSource::new(2 * 8192);
        let seeks = source.seek_counter();
        let mut cache = Membuf::open(source, test_config()).expect("open");
        wait_prebuffer_finished(&cache);

        cache.seek(10).expect("seek");
        assert_eq!(cache.position(), 10);
        assert_eq!(seeks.load(Ordering::SeqCst), 0);
        assert!(cache.prebuffer_finished(), "in-buffer seek keeps the EOS latch");

        let mut buf = [0_u8; 8];
        cache.read(&mut buf).expect("read");
        assert_pattern(&buf, 10);
    }

    #[test]
    fn short_forward_seek_waits_instead_of_seeking() {
        let source = PatternSource::new(3 * 8192);
        let seeks = source.seek_counter();
        let mut cache = Membuf::open(source, test_config()).expect("open");

        cache.seek(2000).expect("seek");
        assert_eq!(seeks.load(Ordering::SeqCst), 0);

        let mut buf = [0_u8; 16];
        cache.read(&mut buf).expect("read");
        assert_pattern(&buf, 2000);
    }

    #[test]
    fn far_seek_rewinds_source_once() {
        let mut source = PatternSource::new(3 * 8192);
        source.stall_after = Some(2048);
        let seeks = source.seek_counter();
        let mut cache = Membuf::open(source, test_config()).expect("open");

        cache.seek(20000).expect("seek");
        assert_eq!(seeks.load(Ordering::SeqCst), 1);

        let mut buf = [0_u8; 16];
        cache.read(&mut buf).expect("read");
        assert_pattern(&buf, 20000);
    }

    #[test]
    fn seek_to_current_position_is_noop() {
        let source = PatternSource::new(2 * 8192);
        let seeks = source.seek_counter();
        let mut cache = Membuf::open(source, test_config()).expect("open");

        let mut buf = [0_u8; 100];
        cache.read(&mut buf).expect("read");
        cache.seek(cache.position()).expect("seek");
        assert_eq!(cache.position(), 100);
        assert_eq!(seeks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn seek_to_size_yields_eos() {
        let size = 2 * 8192;
        let mut cache = Membuf::open(PatternSource::new(size), test_config()).expect("open");
        cache.seek(size).expect("seek");

        let mut buf = [0_u8; 16];
        assert_eq!(cache.read(&mut buf).expect("read"), 0);
    }

    #[test]
    fn seek_rejected_without_capability() {
        let mut source = PatternSource::new(4096);
        source.seekable = false;
        let mut cache = Membuf::open(source, test_config()).expect("open");

        let err = cache.seek(10).expect_err("seek");
        assert!(matches!(err, MembufError::Unsupported));
        assert_eq!(err.status(), Status::Unsupported);
    }

    #[test]
    fn seek_landing_short_reports_truncation() {
        let mut source = PatternSource::new(3 * 8192);
        source.seek_cap = Some(1000);
        source.stall_after = Some(1024);
        let config = MembufConfig {
            short_seek_window: 0,
            ..test_config()
        };
        let mut cache = Membuf::open(source, config).expect("open");

        // Make sure [0, 1000) is buffered before forcing the short landing.
        let mut buf = vec![0_u8; 1024];
        cache.read(&mut buf).expect("read");

        let err = cache.seek(5000).expect_err("seek");
        assert!(matches!(
            err,
            MembufError::SourceSeek {
                requested: 5000,
                actual: 1000
            }
        ));
        assert_eq!(cache.position(), 1000);

        // The cache stays usable at the truncated position.
        let mut tail = [0_u8; 16];
        cache.read(&mut tail).expect("read after failed seek");
        assert_pattern(&tail, 1000);
    }

    // ── faults and shutdown ─────────────────────────────────────────────

    #[test]
    fn blocked_reader_observes_source_fault() {
        let mut source = PatternSource::new(3 * 8192);
        source.fail_at = Some(2048);
        let mut cache = Membuf::open(source, test_config()).expect("open");

        let mut buf = vec![0_u8; 4096];
        let err = cache.read(&mut buf).expect_err("fault");
        assert!(err.is_fatal());
        assert!(matches!(err, MembufError::Faulted(_)));

        // Latched: later calls fail immediately.
        let err = cache.read(&mut buf).expect_err("still faulted");
        assert!(matches!(err, MembufError::Faulted(_)));
    }

    #[test]
    fn buffered_data_below_fault_point_stays_readable() {
        let mut source = PatternSource::new(3 * 8192);
        source.fail_at = Some(8192 + 4096);
        let mut cache = Membuf::open(source, test_config()).expect("open");

        // Block until the worker has crossed the first block boundary, hit
        // the failure point, and latched it.
        let err = cache.peek(2 * 8192).expect_err("peek past the fault");
        assert!(matches!(err, MembufError::Faulted(_)));

        // Everything committed before the fault stays readable.
        let peek = cache.peek(2000).expect("peek below fault");
        assert_pattern(&peek, 0);
        drop(peek);

        let mut buf = vec![0_u8; 2000];
        assert_eq!(cache.read(&mut buf).expect("read below fault"), 2000);
        assert_pattern(&buf, 0);

        assert_eq!(cache.skip(4096).expect("skip below fault"), 4096);
        assert_eq!(cache.position(), 6096);
    }

    #[test]
    fn drop_while_worker_stalls_completes() {
        let mut source = PatternSource::new(3 * 8192);
        source.stall_after = Some(0);
        let cache = Membuf::open(source, test_config()).expect("open");
        drop(cache);
    }

    #[test]
    fn drop_while_worker_parked_completes() {
        let cache = Membuf::open(PatternSource::new(4096), test_config()).expect("open");
        wait_prebuffer_finished(&cache);
        cache.close();
    }

    // ── control and metrics ─────────────────────────────────────────────

    #[test]
    fn control_dispatch_covers_every_query() {
        let size = 2 * 8192;
        let mut cache = Membuf::open(PatternSource::new(size), test_config()).expect("open");
        wait_prebuffer_finished(&cache);

        assert_eq!(
            cache.control(ControlQuery::CanSeek).expect("query"),
            ControlValue::Flag(true)
        );
        assert_eq!(
            cache.control(ControlQuery::CanFastSeek).expect("query"),
            ControlValue::Flag(true)
        );
        assert_eq!(
            cache.control(ControlQuery::GetSize).expect("query"),
            ControlValue::Length(size)
        );
        assert_eq!(
            cache.control(ControlQuery::GetPosition).expect("query"),
            ControlValue::Position(0)
        );
        assert_eq!(
            cache.control(ControlQuery::GetCachedSize).expect("query"),
            ControlValue::Length(size)
        );
        assert_eq!(
            cache
                .control(ControlQuery::PrebufferFinished)
                .expect("query"),
            ControlValue::Flag(true)
        );
        assert_eq!(
            cache.control(ControlQuery::SetPosition(100)).expect("seek"),
            ControlValue::Done
        );
        assert_eq!(cache.position(), 100);
    }

    #[test]
    fn metrics_reflect_full_prebuffer() {
        let size = 3 * 8192 + 100;
        let cache = Membuf::open(PatternSource::new(size), test_config()).expect("open");
        wait_prebuffer_finished(&cache);

        let metrics = cache.metrics();
        assert_eq!(metrics.stream_size, size);
        assert_eq!(metrics.cached_size, size);
        assert!(metrics.buffered_eos);
        assert_eq!(metrics.blocks_allocated, 4);
        assert_eq!(metrics.resident_bytes as u64, size);
        assert!(metrics.source_reads > 0);
    }

    // ── internal walkers ────────────────────────────────────────────────

    #[test]
    fn find_contiguous_end_walks_full_blocks() {
        let geometry = BlockGeometry::new(100, 350).expect("geometry");
        let mut state = Frontier::new();

        let full = alloc_block(100).expect("block");
        full.lock().end = 100;
        let partial = alloc_block(100).expect("block");
        partial.lock().end = 50;
        state.blocks = vec![Some(full), Some(partial)];

        assert_eq!(find_contiguous_end(&geometry, &state, 0), 150);
        assert_eq!(find_contiguous_end(&geometry, &state, 120), 150);
        assert_eq!(find_contiguous_end(&geometry, &state, 150), 150);
        assert_eq!(find_contiguous_end(&geometry, &state, 250), 250);
    }

    #[test]
    fn find_contiguous_end_respects_narrowed_begin() {
        let geometry = BlockGeometry::new(100, 350).expect("geometry");
        let mut state = Frontier::new();

        let narrowed = alloc_block(100).expect("block");
        {
            let mut data = narrowed.lock();
            data.begin = 30;
            data.end = 80;
        }
        state.blocks = vec![None, None, Some(narrowed)];

        assert_eq!(find_contiguous_end(&geometry, &state, 230), 280);
        assert_eq!(find_contiguous_end(&geometry, &state, 210), 210);
    }
}
