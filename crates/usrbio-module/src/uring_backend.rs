//! `UringBackend`: io_uring `StorageBackend` implementation.
//!
//! A single driver thread owns the `io_uring` instance. Submitters push
//! requests into a lock-free inbox and poke an eventfd; the driver moves
//! them into the SQ, calls `io_uring_enter()`, and posts each CQE to the
//! request's completion sink.
//!
//! No SQPOLL, no fixed files, no fixed buffers. Works on any kernel with
//! io_uring (5.6+ for `IORING_OP_READ`/`WRITE`).
//!
//! ```text
//!  submit_batch ──push──▶ inbox ──┐            ┌──▶ sink.complete()
//!               ──notify─▶ eventfd ─PollAdd─▶ driver ─▶ SQ ─▶ kernel ─▶ CQ
//! ```

use usrbio_core::backend::{BatchReceipt, IoRequest, StorageBackend};
use usrbio_core::completion::CompletionSink;
use usrbio_core::entry::Direction;
use usrbio_core::error::{Result, UsrbioError};
use usrbio_core::notifier::Notifier;

use crossbeam_queue::ArrayQueue;
use io_uring::{opcode, squeue, types, IoUring};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::eventfd_notifier::EventFdNotifier;

/// user_data of the eventfd poll. Request tokens are slab indices.
const WAKE_TOKEN: u64 = u64::MAX;

/// Configuration for UringBackend.
#[derive(Debug, Clone)]
pub struct UringConfig {
    /// Number of SQ entries. Rounded up to a power of 2 by the kernel.
    pub entries: u32,
    /// Max requests queued for the driver before new ones get `-EAGAIN`.
    pub inbox_depth: usize,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            entries: 256,
            inbox_depth: 4096,
        }
    }
}

/// A request and its progress.
struct Op {
    req: IoRequest,
    sink: Arc<dyn CompletionSink>,
    /// Bytes already transferred by earlier (short) attempts.
    done: usize,
}

impl Op {
    fn finish(self, result: i64) {
        self.sink.complete(self.req.slot, result);
    }

    /// Never handed (back) to the kernel. Bytes already moved are reported.
    fn cancel(self) {
        let result = match self.done {
            0 => -(libc::ECANCELED as i64),
            n => n as i64,
        };
        self.finish(result);
    }

    fn sqe(&self, token: u64) -> squeue::Entry {
        let buf = self.req.buf.advance(self.done);
        let fd = types::Fd(self.req.fd);
        let len = buf.len().min(u32::MAX as usize) as u32;
        let offset = self.req.offset + self.done as u64;
        let sqe = match self.req.direction {
            Direction::Read => opcode::Read::new(fd, buf.as_ptr(), len).offset(offset).build(),
            Direction::Write => opcode::Write::new(fd, buf.as_ptr() as *const u8, len)
                .offset(offset)
                .build(),
        };
        sqe.user_data(token)
    }
}

struct Shared {
    inbox: ArrayQueue<Op>,
    wake: EventFdNotifier,
    shutdown: AtomicBool,
    /// Set by the driver when the ring became unusable.
    failed: AtomicBool,
    fail_errno: AtomicI32,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) || self.failed.load(Ordering::SeqCst)
    }

    fn mark_failed(&self, errno: i32) {
        self.fail_errno.store(errno, Ordering::SeqCst);
        self.failed.store(true, Ordering::SeqCst);
    }

    /// Settle ops that no driver will pick up.
    fn drain_inbox(&self) {
        let failed = self.failed.load(Ordering::SeqCst);
        let errno = self.fail_errno.load(Ordering::SeqCst);
        while let Some(op) = self.inbox.pop() {
            if failed {
                op.sink.fail(errno);
            } else {
                op.cancel();
            }
        }
    }
}

/// io_uring storage backend.
pub struct UringBackend {
    shared: Arc<Shared>,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
    entries: u32,
}

impl UringBackend {
    pub fn new(config: UringConfig) -> Result<Self> {
        let ring = IoUring::new(config.entries)?;
        let entries = ring.params().sq_entries();
        let shared = Arc::new(Shared {
            inbox: ArrayQueue::new(config.inbox_depth.max(1)),
            wake: EventFdNotifier::create()?,
            shutdown: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            fail_errno: AtomicI32::new(0),
        });

        let driver_shared = Arc::clone(&shared);
        let driver = thread::Builder::new()
            .name("usrbio-uring".into())
            .spawn(move || Driver::new(ring, driver_shared).run())?;
        tracing::debug!(entries, "io_uring backend started");

        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
            entries,
        })
    }

    /// Actual SQ size granted by the kernel.
    pub fn entries(&self) -> u32 {
        self.entries
    }
}

impl StorageBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io-uring"
    }

    fn submit_batch(
        &self,
        batch: &[IoRequest],
        sink: &Arc<dyn CompletionSink>,
    ) -> Result<BatchReceipt> {
        if !self.is_available() {
            return Err(UsrbioError::BackendUnavailable);
        }
        let mut receipt = BatchReceipt::default();
        for req in batch {
            let op = Op { req: *req, sink: Arc::clone(sink), done: 0 };
            match self.shared.inbox.push(op) {
                Ok(()) => receipt.accepted += 1,
                Err(op) => {
                    op.finish(-(libc::EAGAIN as i64));
                    receipt.rejected += 1;
                }
            }
        }
        // The driver may have stopped between the check above and the
        // pushes; nobody else would complete what we just queued.
        if self.shared.is_closed() {
            self.shared.drain_inbox();
            return Ok(receipt);
        }
        if receipt.accepted > 0 {
            self.shared.wake.notify()?;
        }
        Ok(receipt)
    }

    fn is_available(&self) -> bool {
        !self.shared.is_closed()
    }

    fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.shared.wake.notify() {
            tracing::warn!(error = %e, "failed to wake io_uring driver");
        }
        let driver = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(h) = driver {
            if h.join().is_err() {
                tracing::error!("io_uring driver panicked");
            }
        }
        tracing::debug!("io_uring backend stopped");
    }
}

impl Drop for UringBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// State owned by the driver thread.
struct Driver {
    ring: IoUring,
    shared: Arc<Shared>,
    /// In-flight ops indexed by token.
    slab: Vec<Option<Op>>,
    free: Vec<usize>,
    inflight: usize,
    /// Accepted ops waiting for SQ space.
    backlog: VecDeque<Op>,
    wake_armed: bool,
    /// Reused CQE scratch: (user_data, result).
    reaped: Vec<(u64, i32)>,
}

impl Driver {
    fn new(ring: IoUring, shared: Arc<Shared>) -> Self {
        let cap = ring.params().cq_entries() as usize;
        Self {
            ring,
            shared,
            slab: Vec::with_capacity(cap),
            free: Vec::new(),
            inflight: 0,
            backlog: VecDeque::new(),
            wake_armed: false,
            reaped: Vec::with_capacity(cap),
        }
    }

    fn run(mut self) {
        loop {
            while let Some(op) = self.shared.inbox.pop() {
                self.backlog.push_back(op);
            }
            let stopping = self.shared.shutdown.load(Ordering::Acquire);
            if stopping {
                // Not (or no longer) with the kernel.
                for op in self.backlog.drain(..) {
                    op.cancel();
                }
                if self.inflight == 0 {
                    self.shared.drain_inbox();
                    break;
                }
            } else {
                self.fill_sq();
            }

            if let Err(errno) = self.enter() {
                self.fail(errno);
                return;
            }
            self.reap();
        }
    }

    /// Move backlog into the SQ while it has room.
    fn fill_sq(&mut self) {
        if !self.wake_armed {
            let poll = opcode::PollAdd::new(types::Fd(self.wake_fd()), libc::POLLIN as u32)
                .build()
                .user_data(WAKE_TOKEN);
            // Safety: the eventfd outlives the ring (both live as long as the driver).
            if unsafe { self.ring.submission().push(&poll) }.is_ok() {
                self.wake_armed = true;
            }
        }

        while let Some(op) = self.backlog.pop_front() {
            if self.ring.submission().is_full() {
                self.backlog.push_front(op);
                break;
            }
            let token = match self.free.pop() {
                Some(t) => t,
                None => {
                    self.slab.push(None);
                    self.slab.len() - 1
                }
            };
            let sqe = op.sqe(token as u64);
            // Safety: the buffer and fd stay valid until the op's completion
            // is posted; the engine holds the region and fd for that long.
            if unsafe { self.ring.submission().push(&sqe) }.is_err() {
                self.free.push(token);
                self.backlog.push_front(op);
                break;
            }
            self.slab[token] = Some(op);
            self.inflight += 1;
        }
    }

    fn wake_fd(&self) -> RawFd {
        self.shared.wake.fd()
    }

    /// Submit pending SQEs and wait for at least one CQE.
    fn enter(&mut self) -> std::result::Result<(), i32> {
        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => return Ok(()),
                Err(e) => match e.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    // CQ overflow pressure: reap first, then try again.
                    Some(libc::EBUSY) | Some(libc::EAGAIN) => return Ok(()),
                    Some(errno) => return Err(errno),
                    None => return Err(libc::EIO),
                },
            }
        }
    }

    fn reap(&mut self) {
        self.reaped.clear();
        for cqe in self.ring.completion() {
            self.reaped.push((cqe.user_data(), cqe.result()));
        }
        let reaped = std::mem::take(&mut self.reaped);
        for &(token, res) in &reaped {
            if token == WAKE_TOKEN {
                self.shared.wake.drain();
                self.wake_armed = false;
                continue;
            }
            self.on_complete(token as usize, res);
        }
        self.reaped = reaped;
    }

    fn on_complete(&mut self, token: usize, res: i32) {
        let Some(mut op) = self.slab.get_mut(token).and_then(Option::take) else {
            tracing::error!(token, "io_uring completion for unknown token");
            return;
        };
        self.free.push(token);
        self.inflight -= 1;

        match res {
            r if r == -libc::EINTR || r == -libc::EAGAIN => self.backlog.push_front(op),
            r if r < 0 && op.done > 0 => {
                let done = op.done as i64;
                op.finish(done);
            }
            r if r < 0 => op.finish(r as i64),
            0 => {
                // End of file.
                let done = op.done as i64;
                op.finish(done);
            }
            r => {
                op.done += r as usize;
                if op.done < op.req.len() {
                    self.backlog.push_front(op);
                } else {
                    let done = op.done as i64;
                    op.finish(done);
                }
            }
        }
    }

    /// The ring is unusable: report to every sink we still owe a result.
    fn fail(&mut self, errno: i32) {
        tracing::error!(errno, inflight = self.inflight, "io_uring driver failed");
        self.shared.mark_failed(errno);
        let pending = self
            .slab
            .drain(..)
            .flatten()
            .chain(self.backlog.drain(..))
            .collect::<Vec<_>>();
        for op in pending {
            op.sink.fail(errno);
        }
        self.shared.drain_inbox();
    }
}
