//! Completion delivery abstraction.
//!
//! A `CompletionSink` is the message-passing boundary between a storage
//! backend and a ring: the backend posts `{slot, result}` tuples, the
//! ring's owner harvests them.
//!
//! # Implementors
//!
//! - `CompletionPort` (default): fixed-capacity lock-free queue sized to
//!   the ring, plus an eventfd wake signal for blocked waiters.

use crate::entry::{Completion, SlotIndex};

/// Receives outcomes from a storage backend.
///
/// **Contract:**
/// - `complete()` must NEVER block. It is called from backend threads.
/// - Each accepted request is completed exactly once.
/// - `fail()` marks the backend as unusable; waiters stop waiting.
pub trait CompletionSink: Send + Sync {
    /// Post the outcome of one request.
    fn complete(&self, slot: SlotIndex, result: i64);

    /// Post a batch of outcomes. Default: calls complete() in a loop.
    fn complete_batch(&self, entries: &[Completion]) {
        for c in entries {
            self.complete(c.slot, c.result);
        }
    }

    /// Report that the backend can no longer make progress.
    ///
    /// `errno` is positive. In-flight requests may never complete.
    fn fail(&self, errno: i32);
}
