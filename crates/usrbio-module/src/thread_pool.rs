//! `ThreadPoolBackend`: default `StorageBackend` implementation.
//!
//! Spawns N OS threads at creation. Workers dequeue from per-priority
//! lock-free MPMC queues (high first), run positional `pread`/`pwrite`
//! against the registered file, and post the outcome to the request's
//! completion sink.
//!
//! No dynamic scaling. Simple, predictable, works on any filesystem.

use usrbio_core::backend::{BatchReceipt, IoRequest, StorageBackend};
use usrbio_core::completion::CompletionSink;
use usrbio_core::config::Priority;
use usrbio_core::entry::{Completion, Direction};
use usrbio_core::error::{Result, UsrbioError};

use crossbeam_queue::ArrayQueue;
use nix::errno::Errno;
use std::os::unix::io::BorrowedFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A request plus where to report it.
struct WorkItem {
    req: IoRequest,
    sink: Arc<dyn CompletionSink>,
}

/// Shared state between submitters and workers.
struct PoolInner {
    /// One queue per priority, indexed by `Priority::index()`.
    queues: [ArrayQueue<WorkItem>; Priority::COUNT],
    /// Number of workers currently inside a transfer.
    active: AtomicUsize,
    shutdown: AtomicBool,
}

impl PoolInner {
    fn new(queue_depth: usize) -> Self {
        let depth = queue_depth.max(1);
        Self {
            queues: std::array::from_fn(|_| ArrayQueue::new(depth)),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Highest priority first.
    fn pop(&self) -> Option<WorkItem> {
        self.queues.iter().find_map(|q| q.pop())
    }

    fn queued(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}

pub struct ThreadPoolBackend {
    inner: Arc<PoolInner>,
    threads: Vec<thread::Thread>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPoolBackend {
    /// Create a pool with `n` workers.
    ///
    /// `queue_depth`: max pending requests per priority before new ones
    /// are rejected with `-EAGAIN`.
    pub fn new(n: usize, queue_depth: usize) -> Result<Self> {
        let n = n.clamp(1, 64);
        let inner = Arc::new(PoolInner::new(queue_depth));

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let worker_inner = Arc::clone(&inner);
            let spawned = thread::Builder::new()
                .name(format!("usrbio-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_inner, worker_id));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    inner.shutdown.store(true, Ordering::SeqCst);
                    for h in handles {
                        h.thread().unpark();
                        let _ = h.join();
                    }
                    return Err(e.into());
                }
            }
        }
        let threads = handles.iter().map(|h| h.thread().clone()).collect();
        tracing::debug!(workers = n, queue_depth, "thread pool backend started");

        Ok(Self {
            inner,
            threads,
            handles: Mutex::new(handles),
        })
    }

    /// Default pool sizing: min(16, nproc), at least 2.
    pub fn auto_sized(queue_depth: usize) -> Result<Self> {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new(cpus.clamp(2, 16), queue_depth)
    }

    pub fn total_workers(&self) -> usize {
        self.threads.len()
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    /// Requests accepted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.inner.queued()
    }

    fn wake_all(&self) {
        for t in &self.threads {
            t.unpark();
        }
    }
}

impl StorageBackend for ThreadPoolBackend {
    fn name(&self) -> &'static str {
        "thread-pool"
    }

    fn submit_batch(
        &self,
        batch: &[IoRequest],
        sink: &Arc<dyn CompletionSink>,
    ) -> Result<BatchReceipt> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(UsrbioError::BackendUnavailable);
        }

        let mut receipt = BatchReceipt::default();
        let mut rejected = Vec::new();
        for req in batch {
            if !fd_is_open(req.fd) {
                rejected.push(Completion { slot: req.slot, result: -(libc::EBADF as i64) });
                continue;
            }
            let item = WorkItem { req: *req, sink: Arc::clone(sink) };
            match self.inner.queues[req.priority.index()].push(item) {
                Ok(()) => receipt.accepted += 1,
                Err(item) => {
                    rejected.push(Completion { slot: item.req.slot, result: -(libc::EAGAIN as i64) });
                }
            }
        }
        receipt.rejected = rejected.len();
        if !rejected.is_empty() {
            sink.complete_batch(&rejected);
        }
        if receipt.accepted > 0 {
            self.wake_all();
        }
        // Lost a race with shutdown(): nobody else will drain these.
        if self.inner.shutdown.load(Ordering::Acquire) {
            while let Some(item) = self.inner.pop() {
                item.sink.complete(item.req.slot, -(libc::ECANCELED as i64));
            }
        }
        Ok(receipt)
    }

    fn is_available(&self) -> bool {
        !self.inner.shutdown.load(Ordering::Acquire)
    }

    fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.wake_all();
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for h in handles {
            if h.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }

        // Whatever no worker picked up never started.
        let mut cancelled = 0usize;
        while let Some(item) = self.inner.pop() {
            item.sink.complete(item.req.slot, -(libc::ECANCELED as i64));
            cancelled += 1;
        }
        tracing::debug!(cancelled, "thread pool backend stopped");
    }
}

impl Drop for ThreadPoolBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fd_is_open(fd: i32) -> bool {
    fd >= 0 && unsafe { libc::fcntl(fd, libc::F_GETFD) } >= 0
}

/// Worker thread main loop.
fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    tracing::trace!(worker_id, "worker started");
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        match inner.pop() {
            Some(item) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                let result = transfer(&item.req);
                inner.active.fetch_sub(1, Ordering::Relaxed);
                item.sink.complete(item.req.slot, result);
            }
            None => {
                // Unparked by submit_batch(); the timeout covers a lost wakeup.
                thread::park_timeout(Duration::from_millis(10));
            }
        }
    }
}

/// Run one request to completion on the calling thread.
///
/// Retries EINTR and resumes short transfers. Returns bytes moved, which
/// is less than requested only at end of file, or `-errno`.
fn transfer(req: &IoRequest) -> i64 {
    // Safety: the registry keeps the duplicated fd open while the
    // request is in flight.
    let fd = unsafe { BorrowedFd::borrow_raw(req.fd) };
    let mut done = 0usize;

    while done < req.len() {
        let buf = req.buf.advance(done);
        let offset = (req.offset + done as u64) as libc::off_t;
        // Safety: the region's span table gives this request exclusive
        // use of the range for its direction.
        let ret = match req.direction {
            Direction::Read => nix::sys::uio::pread(fd, unsafe { buf.as_mut_slice() }, offset),
            Direction::Write => nix::sys::uio::pwrite(fd, unsafe { buf.as_slice() }, offset),
        };
        match ret {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(_) if done > 0 => break,
            Err(e) => return -(e as i32 as i64),
        }
    }
    done as i64
}
