//! Test backends and a ring fixture.

use usrbio_core::backend::{BatchReceipt, IoRequest, RegionInfo, StorageBackend};
use usrbio_core::completion::CompletionSink;
use usrbio_core::config::RingOptions;
use usrbio_core::entry::Direction;
use usrbio_core::error::{Result, UsrbioError};

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsFd, BorrowedFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::fd_registry::{FdHandle, FdRegistry};
use crate::region::{page_size, Region};
use crate::ring::IoRing;

/// Runs every request synchronously inside `submit_batch`.
#[derive(Default)]
pub(crate) struct InlineBackend {
    /// (requests left to reject, errno)
    reject: Mutex<(usize, i32)>,
}

impl InlineBackend {
    pub(crate) fn reject_next(&self, n: usize, errno: i32) {
        *self.reject.lock().unwrap() = (n, errno);
    }
}

fn run_now(req: &IoRequest) -> i64 {
    let fd = unsafe { BorrowedFd::borrow_raw(req.fd) };
    let off = req.offset as libc::off_t;
    let ret = match req.direction {
        Direction::Read => nix::sys::uio::pread(fd, unsafe { req.buf.as_mut_slice() }, off),
        Direction::Write => nix::sys::uio::pwrite(fd, unsafe { req.buf.as_slice() }, off),
    };
    match ret {
        Ok(n) => n as i64,
        Err(e) => -(e as i32 as i64),
    }
}

impl StorageBackend for InlineBackend {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn submit_batch(
        &self,
        batch: &[IoRequest],
        sink: &Arc<dyn CompletionSink>,
    ) -> Result<BatchReceipt> {
        let mut receipt = BatchReceipt::default();
        let mut reject = self.reject.lock().unwrap();
        for req in batch {
            if reject.0 > 0 {
                reject.0 -= 1;
                sink.complete(req.slot, -(reject.1 as i64));
                receipt.rejected += 1;
            } else {
                sink.complete(req.slot, run_now(req));
                receipt.accepted += 1;
            }
        }
        Ok(receipt)
    }

    fn is_available(&self) -> bool {
        true
    }

    fn shutdown(&self) {}
}

#[derive(Default)]
struct ManualState {
    pending: Vec<(IoRequest, Arc<dyn CompletionSink>)>,
    sinks: Vec<Arc<dyn CompletionSink>>,
    batches: Vec<usize>,
    unavailable: bool,
    auto: bool,
}

/// Holds requests until the test completes or fails them.
#[derive(Default)]
pub(crate) struct ManualBackend {
    state: Mutex<ManualState>,
}

impl ManualBackend {
    pub(crate) fn set_available(&self, available: bool) {
        self.state.lock().unwrap().unavailable = !available;
    }

    /// Complete requests as soon as they are submitted.
    pub(crate) fn auto_complete(&self, on: bool) {
        self.state.lock().unwrap().auto = on;
    }

    /// Sizes of the batches seen so far.
    pub(crate) fn batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().batches.clone()
    }

    /// Complete every held request as a full transfer.
    pub(crate) fn complete_all(&self) {
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending);
        for (req, sink) in pending {
            sink.complete(req.slot, req.len() as i64);
        }
    }

    pub(crate) fn fail_all(&self, errno: i32) {
        let sinks = self.state.lock().unwrap().sinks.clone();
        for sink in sinks {
            sink.fail(errno);
        }
    }
}

impl StorageBackend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn submit_batch(
        &self,
        batch: &[IoRequest],
        sink: &Arc<dyn CompletionSink>,
    ) -> Result<BatchReceipt> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable {
            return Err(UsrbioError::BackendUnavailable);
        }
        state.batches.push(batch.len());
        state.sinks.push(Arc::clone(sink));
        for req in batch {
            if state.auto {
                sink.complete(req.slot, req.len() as i64);
            } else {
                state.pending.push((*req, Arc::clone(sink)));
            }
        }
        Ok(BatchReceipt { accepted: batch.len(), rejected: 0 })
    }

    fn is_available(&self) -> bool {
        !self.state.lock().unwrap().unavailable
    }

    fn shutdown(&self) {}
}

/// Refuses every region.
pub(crate) struct FailingRegistrationBackend;

impl StorageBackend for FailingRegistrationBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn register_region(&self, _region: &RegionInfo<'_>) -> Result<()> {
        Err(UsrbioError::Os(libc::ENOMEM))
    }

    fn submit_batch(
        &self,
        _batch: &[IoRequest],
        _sink: &Arc<dyn CompletionSink>,
    ) -> Result<BatchReceipt> {
        Err(UsrbioError::BackendUnavailable)
    }

    fn is_available(&self) -> bool {
        false
    }

    fn shutdown(&self) {}
}

/// A managed mount (temp dir), a 4-page region on it, a registry and
/// one of the test backends.
pub(crate) struct Fixture {
    pub mount: PathBuf,
    pub registry: Arc<FdRegistry>,
    pub region: Region,
    backend: Arc<dyn StorageBackend>,
    inline: Option<Arc<InlineBackend>>,
    manual: Option<Arc<ManualBackend>>,
    files: Mutex<Vec<File>>,
    next_id: AtomicU64,
    _dir: tempfile::TempDir,
}

impl Fixture {
    fn new(
        backend: Arc<dyn StorageBackend>,
        inline: Option<Arc<InlineBackend>>,
        manual: Option<Arc<ManualBackend>>,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mount = std::fs::canonicalize(dir.path()).unwrap();
        let region = Region::allocate(1, &mount, 4 * page_size(), 0, -1, false).unwrap();
        Self {
            registry: Arc::new(FdRegistry::new(vec![mount.clone()])),
            mount,
            region,
            backend,
            inline,
            manual,
            files: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            _dir: dir,
        }
    }

    pub(crate) fn inline() -> Self {
        let b = Arc::new(InlineBackend::default());
        Self::new(b.clone(), Some(b), None)
    }

    pub(crate) fn manual() -> Self {
        let b = Arc::new(ManualBackend::default());
        Self::new(b.clone(), None, Some(b))
    }

    pub(crate) fn inline_backend(&self) -> &InlineBackend {
        self.inline.as_deref().unwrap()
    }

    pub(crate) fn manual_backend(&self) -> &ManualBackend {
        self.manual.as_deref().unwrap()
    }

    pub(crate) fn ring(&self, capacity: u32, for_read: bool) -> IoRing {
        self.ring_with(RingOptions::new(self.mount.clone(), capacity, for_read))
    }

    pub(crate) fn ring_with(&self, options: RingOptions) -> IoRing {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        IoRing::new(id, options, Arc::clone(&self.backend), Arc::clone(&self.registry)).unwrap()
    }

    /// Create a file under the mount holding `data` and register it.
    pub(crate) fn file_with(&self, data: &[u8]) -> FdHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = self.mount.join(format!("file-{id}.bin"));
        std::fs::write(&path, data).unwrap();
        let f = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let h = self.registry.register(f.as_fd(), 0).unwrap();
        self.files.lock().unwrap().push(f);
        h
    }
}
