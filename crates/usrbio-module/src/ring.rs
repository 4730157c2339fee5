//! `IoRing`: fixed-capacity submission/completion ring for one direction.
//!
//! # Slot lifecycle
//!
//! ```text
//!   free ──prepare()──▶ staged ──submit()──▶ submitted ──harvest──▶ free
//!                         │                                   ▲
//!                         └──────────cancel_staged()──────────┘
//! ```
//!
//! A slot is "in flight" from `prepare()` until its completion is
//! harvested. At most `capacity` slots are in flight; the next `prepare()`
//! fails with `RingFull`.
//!
//! # Memory layout
//!
//! No allocation on the hot path. All arrays are sized at creation:
//!
//! ```text
//! slots:   [Option<Descriptor>; capacity]   indexed by slot
//! free:    SlotQueue (capacity)             slots ready for prepare()
//! staged:  SlotQueue (capacity)             prepared, not yet submitted
//! port:    ArrayQueue<Completion>(capacity) posted by the backend
//! batch:   Vec<IoRequest> (capacity)        reused per submit()
//! ```
//!
//! Each `SlotQueue` is a circular array indexed by monotonically
//! increasing `head`/`tail` counters, modulo capacity.
//!
//! # Thread safety
//!
//! `prepare`, `submit` and `wait_for_completions` take `&mut self`: one
//! thread owns the submission side. To share a ring across threads, wrap
//! it in a `Mutex`. The completion side is written by backend threads
//! through the `CompletionPort`.

use usrbio_core::backend::{IoRequest, StorageBackend};
use usrbio_core::buffer::BufferRef;
use usrbio_core::completion::CompletionSink;
use usrbio_core::config::{IoDepth, RingOptions};
use usrbio_core::entry::{Cqe, Direction, SlotIndex, UserTag};
use usrbio_core::error::{Result, UsrbioError};

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::completion_port::CompletionPort;
use crate::fd_registry::{FdEntry, FdHandle, FdRegistry};
use crate::region::{Region, SpanKey};

/// Circular FIFO of slot indices over a fixed array.
///
/// head and tail are u64 monotonically increasing. Actual index = val % cap.
/// Empty when head == tail. Full when tail - head == cap.
pub(crate) struct SlotQueue {
    buf: Box<[u32]>,
    head: u64,
    tail: u64,
}

impl SlotQueue {
    pub(crate) fn with_capacity(cap: u32) -> Self {
        Self {
            buf: vec![0; cap as usize].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    /// A queue holding `0..cap` in order.
    pub(crate) fn filled(cap: u32) -> Self {
        let mut q = Self::with_capacity(cap);
        for i in 0..cap {
            q.push(i);
        }
        q
    }

    #[inline]
    fn cap(&self) -> u64 {
        self.buf.len() as u64
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.tail.wrapping_sub(self.head) as usize
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Returns false if full.
    pub(crate) fn push(&mut self, v: u32) -> bool {
        if self.len() as u64 >= self.cap() {
            return false;
        }
        let idx = (self.tail % self.cap()) as usize;
        self.buf[idx] = v;
        self.tail = self.tail.wrapping_add(1);
        true
    }

    pub(crate) fn pop(&mut self) -> Option<u32> {
        let v = self.peek(0)?;
        self.head = self.head.wrapping_add(1);
        Some(v)
    }

    /// The `i`-th element from the head.
    pub(crate) fn peek(&self, i: usize) -> Option<u32> {
        if i >= self.len() {
            return None;
        }
        let idx = (self.head.wrapping_add(i as u64) % self.cap()) as usize;
        Some(self.buf[idx])
    }
}

/// A staged or submitted request.
struct Descriptor {
    seq: u64,
    user_tag: UserTag,
    /// Keeps the mapping alive while the backend uses `buf`.
    region: Region,
    file: Arc<FdEntry>,
    file_offset: u64,
    buf: BufferRef,
    submitted: bool,
}

/// Why `wait_for_completions` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least `min_results` entries were harvested.
    Ready,
    /// Nothing more is outstanding; fewer than `min_results` were possible.
    Exhausted,
    /// The timeout elapsed first. The count may be 0.
    TimedOut,
}

/// Result of one `wait_for_completions` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Harvest {
    /// Entries written to the front of the caller's slice.
    pub count: usize,
    pub status: WaitStatus,
}

/// Returned by `IoRing::destroy` when requests are still in flight.
pub struct BusyRing {
    pub ring: IoRing,
    pub error: UsrbioError,
}

impl BusyRing {
    pub fn into_ring(self) -> IoRing {
        self.ring
    }
}

impl std::fmt::Debug for BusyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusyRing")
            .field("ring", &self.ring.id)
            .field("error", &self.error)
            .finish()
    }
}

impl std::fmt::Display for BusyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ring {}: {}", self.ring.id, self.error)
    }
}

impl std::error::Error for BusyRing {}

pub struct IoRing {
    id: u64,
    options: RingOptions,
    slots: Box<[Option<Descriptor>]>,
    free: SlotQueue,
    staged: SlotQueue,
    port: Arc<CompletionPort>,
    /// `port` as the trait object handed to the backend.
    sink: Arc<dyn CompletionSink>,
    backend: Arc<dyn StorageBackend>,
    registry: Arc<FdRegistry>,
    batch: Vec<IoRequest>,
    next_seq: u64,
    /// Handed to the backend, not yet harvested.
    submitted: usize,
    /// When the oldest currently staged request was prepared.
    staged_since: Option<Instant>,
}

impl std::fmt::Debug for IoRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRing")
            .field("id", &self.id)
            .field("direction", &self.options.direction)
            .field("capacity", &self.options.capacity)
            .field("staged", &self.staged.len())
            .field("submitted", &self.submitted)
            .finish()
    }
}

impl IoRing {
    pub(crate) fn new(
        id: u64,
        options: RingOptions,
        backend: Arc<dyn StorageBackend>,
        registry: Arc<FdRegistry>,
    ) -> Result<Self> {
        options.validate()?;
        let cap = options.capacity;
        let port = Arc::new(CompletionPort::new(cap as usize)?);
        let sink: Arc<dyn CompletionSink> = port.clone();
        let slots = (0..cap).map(|_| None).collect::<Vec<_>>().into_boxed_slice();

        Ok(Self {
            id,
            options,
            slots,
            free: SlotQueue::filled(cap),
            staged: SlotQueue::with_capacity(cap),
            port,
            sink,
            backend,
            registry,
            batch: Vec::with_capacity(cap as usize),
            next_seq: 0,
            submitted: 0,
            staged_since: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn options(&self) -> &RingOptions {
        &self.options
    }

    pub fn capacity(&self) -> u32 {
        self.options.capacity
    }

    pub fn direction(&self) -> Direction {
        self.options.direction
    }

    pub fn mount_point(&self) -> &Path {
        &self.options.mount_point
    }

    /// Requests prepared and not yet harvested.
    pub fn inflight(&self) -> usize {
        self.capacity() as usize - self.free.len()
    }

    /// Requests prepared and not yet submitted.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Requests handed to the backend and not yet harvested.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Eventfd signalled whenever a completion is posted.
    ///
    /// Poll it from an external event loop, then call
    /// `wait_for_completions` with a zero timeout.
    pub fn notify_fd(&self) -> RawFd {
        self.port.notify_fd()
    }

    /// Stage one request. Does not issue I/O.
    ///
    /// All checks run before anything changes, so a failed call leaves
    /// the ring, region and fd registry untouched.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare(
        &mut self,
        region: &Region,
        direction: Direction,
        buf_offset: u64,
        handle: FdHandle,
        file_offset: u64,
        len: u64,
        user_tag: UserTag,
    ) -> Result<SlotIndex> {
        if direction != self.options.direction {
            return Err(UsrbioError::DirectionMismatch {
                ring: self.options.direction,
                request: direction,
            });
        }
        if len == 0 {
            return Err(UsrbioError::InvalidLength);
        }
        if region.is_destroyed() {
            return Err(UsrbioError::RegionDestroyed);
        }
        region.check_range(buf_offset, len)?;
        match file_offset.checked_add(len) {
            Some(end) if end <= i64::MAX as u64 => {}
            _ => return Err(UsrbioError::Os(libc::EOVERFLOW)),
        }

        let file = self.registry.acquire(handle)?;
        let mismatch = if region.mount_point() != self.mount_point() {
            Some(region.mount_point())
        } else if file.mount_point() != self.mount_point() {
            Some(file.mount_point())
        } else {
            None
        };
        if let Some(other) = mismatch {
            let err = UsrbioError::MountMismatch {
                ring: self.options.mount_point.clone(),
                other: other.to_path_buf(),
            };
            file.release();
            return Err(err);
        }
        let Some(slot) = self.free.peek(0) else {
            file.release();
            return Err(UsrbioError::RingFull);
        };
        let key = SpanKey { ring: self.id, slot };
        let buf = match region.claim(key, buf_offset, len, direction) {
            Ok(buf) => buf,
            Err(e) => {
                file.release();
                return Err(e);
            }
        };

        // Committed from here on.
        self.free.pop();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots[slot as usize] = Some(Descriptor {
            seq,
            user_tag,
            region: region.clone(),
            file,
            file_offset,
            buf,
            submitted: false,
        });
        self.staged.push(slot);
        if self.staged_since.is_none() {
            self.staged_since = Some(Instant::now());
        }
        Ok(SlotIndex(slot))
    }

    /// Hand staged requests to the backend.
    ///
    /// Returns how many the backend accepted. Rejected requests show up
    /// as negative completions. Never waits for a transfer to finish.
    pub fn submit(&mut self) -> Result<usize> {
        self.dispatch()
    }

    fn dispatch(&mut self) -> Result<usize> {
        let mut accepted = 0;
        let mut dispatched = false;

        loop {
            let staged = self.staged.len();
            if staged == 0 {
                break;
            }
            let n = match self.options.io_depth {
                IoDepth::Unbounded => staged,
                IoDepth::AtMost(k) => staged.min(k as usize),
                IoDepth::Exactly(k) if staged >= k as usize => k as usize,
                IoDepth::Exactly(_) if self.linger_expired() => staged,
                IoDepth::Exactly(_) => break,
            };

            self.batch.clear();
            for i in 0..n {
                let Some(slot) = self.staged.peek(i) else { break };
                let Some(d) = self.slots[slot as usize].as_ref() else {
                    tracing::error!(ring = self.id, slot, "staged slot has no descriptor");
                    continue;
                };
                self.batch.push(IoRequest {
                    slot: SlotIndex(slot),
                    direction: self.options.direction,
                    fd: d.file.raw_fd(),
                    offset: d.file_offset,
                    buf: d.buf,
                    priority: self.options.priority,
                });
            }

            match self.backend.submit_batch(&self.batch, &self.sink) {
                Ok(receipt) => {
                    for _ in 0..n {
                        if let Some(slot) = self.staged.pop() {
                            if let Some(d) = self.slots[slot as usize].as_mut() {
                                d.submitted = true;
                                self.submitted += 1;
                            }
                        }
                    }
                    accepted += receipt.accepted;
                    if receipt.rejected > 0 {
                        tracing::debug!(ring = self.id, rejected = receipt.rejected, "backend rejected requests");
                    }
                    dispatched = true;
                }
                Err(e) if !dispatched => {
                    tracing::warn!(ring = self.id, backend = self.backend.name(), error = %e, "batch not accepted");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(ring = self.id, error = %e, "batch not accepted, rest stays staged");
                    break;
                }
            }
        }

        self.staged_since = match (self.staged.is_empty(), dispatched) {
            (true, _) => None,
            (false, true) => Some(Instant::now()),
            (false, false) => self.staged_since,
        };
        Ok(accepted)
    }

    fn linger_expired(&self) -> bool {
        self.staged_since
            .map_or(false, |t| t.elapsed() >= self.options.timeout.batch_linger)
    }

    /// Time until a partial `Exactly` batch must be flushed, if one waits.
    fn linger_left(&self) -> Option<Duration> {
        if self.staged.is_empty() || !matches!(self.options.io_depth, IoDepth::Exactly(_)) {
            return None;
        }
        let since = self.staged_since?;
        Some(self.options.timeout.batch_linger.saturating_sub(since.elapsed()))
    }

    /// Harvest completions into `cqes`.
    ///
    /// Returns when `min_results` are harvested (`Ready`), when nothing is
    /// outstanding (`Exhausted`), or when `timeout` elapses (`TimedOut`).
    /// Never writes more than `cqes.len()` entries. `timeout` of zero polls;
    /// `None` uses the ring's default (which may be unbounded).
    pub fn wait_for_completions(
        &mut self,
        cqes: &mut [Cqe],
        min_results: usize,
        timeout: Option<Duration>,
    ) -> Result<Harvest> {
        let timeout = timeout.or(self.options.timeout.default_wait);
        let deadline = timeout.map(|t| Instant::now() + t);
        let min = min_results.min(cqes.len());
        let mut count = 0;
        // Set once a linger flush is refused; the remainder then stays
        // staged and no longer counts as outstanding.
        let mut flush_failed: Option<UsrbioError> = None;

        loop {
            if flush_failed.is_none() && self.linger_left() == Some(Duration::ZERO) {
                if let Err(e) = self.dispatch() {
                    if count == 0 && self.submitted == 0 {
                        return Err(e);
                    }
                    flush_failed = Some(e);
                }
            }

            count += self.harvest(&mut cqes[count..]);
            if count >= min {
                return Ok(Harvest { count, status: WaitStatus::Ready });
            }
            if self.port.fatal_error().is_some() && self.port.is_empty() {
                if count == 0 {
                    return Err(UsrbioError::BackendUnavailable);
                }
                return Ok(Harvest { count, status: WaitStatus::Exhausted });
            }
            let linger = match flush_failed {
                Some(_) => None,
                None => self.linger_left(),
            };
            if self.submitted == 0 && linger.is_none() {
                return match flush_failed {
                    Some(e) if count == 0 => Err(e),
                    _ => Ok(Harvest { count, status: WaitStatus::Exhausted }),
                };
            }

            let mut sleep = match deadline {
                None => None,
                Some(d) => {
                    let left = d.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(Harvest { count, status: WaitStatus::TimedOut });
                    }
                    Some(left)
                }
            };
            if let Some(l) = linger {
                sleep = Some(sleep.map_or(l, |s| s.min(l)));
            }
            self.port.wait(sleep)?;
        }
    }

    /// Move posted completions into `out`, freeing their slots.
    fn harvest(&mut self, out: &mut [Cqe]) -> usize {
        let mut n = 0;
        while n < out.len() {
            let Some(c) = self.port.pop() else { break };
            let Some(entry) = self.slots.get_mut(c.slot.as_usize()) else {
                tracing::error!(ring = self.id, slot = c.slot.0, "completion for slot out of range");
                continue;
            };
            let d = match entry.take() {
                Some(d) if d.submitted => d,
                other => {
                    *entry = other;
                    tracing::error!(ring = self.id, slot = c.slot.0, "completion for slot not in flight");
                    continue;
                }
            };
            d.region.release(SpanKey { ring: self.id, slot: c.slot.0 });
            d.file.release();
            self.free.push(c.slot.0);
            self.submitted -= 1;
            out[n] = Cqe {
                user_tag: d.user_tag,
                result: c.result,
                seq: d.seq,
            };
            n += 1;
        }
        n
    }

    /// Release every staged-but-unsubmitted request.
    ///
    /// Those never reached the backend, so nothing is cancelled mid-flight.
    pub fn cancel_staged(&mut self) -> usize {
        let mut n = 0;
        while let Some(slot) = self.staged.pop() {
            if let Some(d) = self.slots[slot as usize].take() {
                d.region.release(SpanKey { ring: self.id, slot });
                d.file.release();
            }
            self.free.push(slot);
            n += 1;
        }
        self.staged_since = None;
        n
    }

    /// Destroy the ring. Fails with `RingBusy`, handing the ring back,
    /// while any request is in flight.
    pub fn destroy(self) -> std::result::Result<(), BusyRing> {
        let inflight = self.inflight();
        if inflight > 0 {
            return Err(BusyRing {
                ring: self,
                error: UsrbioError::RingBusy(inflight),
            });
        }
        tracing::debug!(ring = self.id, "ring destroyed");
        Ok(())
    }
}

impl Drop for IoRing {
    fn drop(&mut self) {
        self.cancel_staged();
        let mut scratch = [Cqe::EMPTY; 16];
        while self.harvest(&mut scratch) > 0 {}

        if self.submitted > 0 {
            // The backend may still write into these buffers. Leak the
            // descriptors so their regions and fds are never released.
            tracing::warn!(
                ring = self.id,
                abandoned = self.submitted,
                "ring dropped with requests in flight; their regions and fds stay busy"
            );
            for entry in self.slots.iter_mut() {
                if let Some(d) = entry.take() {
                    std::mem::forget(d);
                }
            }
        }
    }
}
