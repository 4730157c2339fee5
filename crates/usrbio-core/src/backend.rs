//! Storage backend abstraction (the Dispatch collaborator).
//!
//! A `StorageBackend` executes batches of file transfers and reports one
//! outcome per accepted request through a `CompletionSink`.
//!
//! # Implementors
//!
//! - `ThreadPoolBackend` (default): N OS threads running positional
//!   `pread`/`pwrite` against the registered file. Works everywhere.
//!
//! - `UringBackend` (Linux): a driver thread feeding an io_uring instance.
//!   No per-request thread hop; the kernel's io-wq absorbs blocking.
//!
//! - A remote replicated store implements the same contract: accept a
//!   batch, report `{slot, result}` later, out of order.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use crate::buffer::BufferRef;
use crate::completion::CompletionSink;
use crate::config::Priority;
use crate::entry::{Direction, SlotIndex};
use crate::error::Result;

/// One transfer handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct IoRequest {
    /// Ring slot to report the outcome against.
    pub slot: SlotIndex,
    pub direction: Direction,
    /// The engine's private duplicate of the registered file.
    pub fd: RawFd,
    /// Byte offset in the file.
    pub offset: u64,
    /// Source (write) or destination (read) bytes; `buf.len()` is the length.
    pub buf: BufferRef,
    pub priority: Priority,
}

impl IoRequest {
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// What the backend did with a batch.
///
/// `accepted + rejected == batch.len()`. Rejected requests have already
/// been completed on the sink with a negative result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReceipt {
    pub accepted: usize,
    pub rejected: usize,
}

/// Description of a region the backend may need to map or pin.
#[derive(Debug, Clone, Copy)]
pub struct RegionInfo<'a> {
    pub id: u64,
    pub mount_point: &'a Path,
    pub base: *const u8,
    pub len: usize,
    /// memfd backing the region, if any (for out-of-process transports).
    pub shm_fd: Option<RawFd>,
    pub affinity: i32,
}

/// Executes transfers asynchronously.
///
/// **Contract:**
/// - `submit_batch()` must NEVER block on transfer completion, only on
///   acceptance of the batch.
/// - Every accepted request produces exactly one `complete()` call on the
///   sink, from any thread, in any order.
/// - Requests rejected outright are completed immediately with `-errno`.
/// - `Err(BackendUnavailable)` means nothing in the batch was accepted.
/// - The backend owns retry policy (e.g. resuming short transfers).
pub trait StorageBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Register a region for zero-copy transfer. Must be all-or-nothing.
    fn register_region(&self, _region: &RegionInfo<'_>) -> Result<()> {
        Ok(())
    }

    /// Undo `register_region`. Called only when no request references it.
    fn deregister_region(&self, _region: &RegionInfo<'_>) {}

    /// Accept a batch of requests.
    fn submit_batch(
        &self,
        batch: &[IoRequest],
        sink: &Arc<dyn CompletionSink>,
    ) -> Result<BatchReceipt>;

    /// Whether new batches can still be accepted.
    fn is_available(&self) -> bool;

    /// Stop accepting work and drain what is in flight.
    fn shutdown(&self);
}
