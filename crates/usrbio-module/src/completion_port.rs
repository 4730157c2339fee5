//! `CompletionPort`: default `CompletionSink` implementation.
//!
//! The completion side of an `IoRing`. Backend threads push `{slot, result}`
//! tuples into a fixed-capacity lock-free queue and signal an eventfd.
//! The ring owner pops them in `wait_for_completions`.
//!
//! Capacity equals the ring capacity. A slot has at most one outstanding
//! request, so a well-behaved backend can never overflow the queue; an
//! overflow is a backend contract violation and is logged and dropped.

use usrbio_core::completion::CompletionSink;
use usrbio_core::entry::{Completion, SlotIndex};
use usrbio_core::error::Result;
use usrbio_core::notifier::Notifier;

use crossbeam_queue::ArrayQueue;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::eventfd_notifier::EventFdNotifier;

pub struct CompletionPort {
    queue: ArrayQueue<Completion>,
    notifier: EventFdNotifier,
    /// Positive errno once the backend has failed, 0 while healthy.
    fatal: AtomicI32,
}

impl CompletionPort {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            queue: ArrayQueue::new(capacity.max(1)),
            notifier: EventFdNotifier::create()?,
            fatal: AtomicI32::new(0),
        })
    }

    /// Pop one posted completion (consumer side, non-blocking).
    #[inline]
    pub fn pop(&self) -> Option<Completion> {
        self.queue.pop()
    }

    /// Number of posted but unharvested completions.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Block until something is posted or `timeout` elapses.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        self.notifier.wait(timeout)
    }

    /// The backend's failure errno, if it declared itself failed.
    pub fn fatal_error(&self) -> Option<i32> {
        match self.fatal.load(Ordering::Acquire) {
            0 => None,
            e => Some(e),
        }
    }

    /// Eventfd signalled on every post.
    pub fn notify_fd(&self) -> RawFd {
        self.notifier.fd()
    }
}

impl CompletionSink for CompletionPort {
    fn complete(&self, slot: SlotIndex, result: i64) {
        if let Err(c) = self.queue.push(Completion { slot, result }) {
            tracing::error!(slot = c.slot.0, result = c.result, "completion queue overflow, outcome dropped");
            return;
        }
        if let Err(e) = self.notifier.notify() {
            tracing::warn!(error = %e, "completion notify failed");
        }
    }

    fn complete_batch(&self, entries: &[Completion]) {
        for c in entries {
            if self.queue.push(*c).is_err() {
                tracing::error!(slot = c.slot.0, result = c.result, "completion queue overflow, outcome dropped");
            }
        }
        if !entries.is_empty() {
            if let Err(e) = self.notifier.notify() {
                tracing::warn!(error = %e, "completion notify failed");
            }
        }
    }

    fn fail(&self, errno: i32) {
        let errno = if errno > 0 { errno } else { libc::EIO };
        if self.fatal.swap(errno, Ordering::AcqRel) == 0 {
            tracing::error!(errno, "storage backend failed");
        }
        let _ = self.notifier.notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_pop() {
        let port = CompletionPort::new(4).unwrap();
        port.complete(SlotIndex(2), 4096);
        port.complete(SlotIndex(0), -(libc::EIO as i64));
        assert_eq!(port.len(), 2);
        assert!(port.wait(Some(Duration::ZERO)).unwrap());
        assert_eq!(port.pop(), Some(Completion { slot: SlotIndex(2), result: 4096 }));
        assert_eq!(port.pop().map(|c| c.slot), Some(SlotIndex(0)));
        assert!(port.pop().is_none());
    }

    #[test]
    fn test_overflow_is_dropped() {
        let port = CompletionPort::new(1).unwrap();
        port.complete(SlotIndex(0), 1);
        port.complete(SlotIndex(0), 2);
        assert_eq!(port.len(), 1);
        assert_eq!(port.pop().map(|c| c.result), Some(1));
    }

    #[test]
    fn test_fail_wakes_waiter() {
        let port = Arc::new(CompletionPort::new(2).unwrap());
        let p = Arc::clone(&port);
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            p.fail(libc::ECONNRESET);
        });
        assert!(port.wait(Some(Duration::from_secs(5))).unwrap());
        assert_eq!(port.fatal_error(), Some(libc::ECONNRESET));
        h.join().unwrap();
    }

    #[test]
    fn test_concurrent_producers() {
        let port = Arc::new(CompletionPort::new(64).unwrap());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let p = Arc::clone(&port);
                std::thread::spawn(move || {
                    for i in 0..16u32 {
                        p.complete(SlotIndex(t * 16 + i), 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        while let Some(c) = port.pop() {
            assert!(seen.insert(c.slot), "duplicate slot {:?}", c.slot);
        }
        assert_eq!(seen.len(), 64);
    }
}
