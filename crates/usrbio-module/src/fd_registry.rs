//! `FdRegistry`: fast registration of caller file descriptors.
//!
//! Registering an fd resolves its path once, checks that it lives under a
//! mount point this engine manages, and duplicates it. Later requests carry
//! only the returned `FdHandle`; no path or permission lookup happens on the
//! I/O path.
//!
//! Handles are `(index, generation)` pairs. Deregistering bumps the slot's
//! generation, so a recycled index never revives an old handle.

use usrbio_core::error::{Result, UsrbioError};

use std::collections::HashMap;
use std::os::unix::io::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Opaque handle for a registered fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdHandle {
    index: u32,
    generation: u32,
}

/// A registered file.
#[derive(Debug)]
pub struct FdEntry {
    external_fd: RawFd,
    /// Private duplicate; survives a caller close().
    file: OwnedFd,
    path: PathBuf,
    mount_point: PathBuf,
    flags: u64,
    /// Requests prepared against this file and not yet harvested.
    refs: AtomicUsize,
}

impl FdEntry {
    /// The fd the backend transfers through.
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// The caller's fd at registration time.
    pub fn external_fd(&self) -> RawFd {
        self.external_fd
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn inflight(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn release(&self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Slot {
    generation: u32,
    entry: Option<Arc<FdEntry>>,
}

#[derive(Default)]
struct Table {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_external: HashMap<RawFd, u32>,
}

impl Table {
    fn get(&self, h: FdHandle) -> Option<&Arc<FdEntry>> {
        self.slots
            .get(h.index as usize)
            .filter(|s| s.generation == h.generation)
            .and_then(|s| s.entry.as_ref())
    }
}

pub struct FdRegistry {
    /// Managed mount points, canonical form.
    mounts: Vec<PathBuf>,
    table: Mutex<Table>,
}

impl FdRegistry {
    pub fn new(mounts: Vec<PathBuf>) -> Self {
        Self {
            mounts,
            table: Mutex::new(Table::default()),
        }
    }

    pub fn mounts(&self) -> &[PathBuf] {
        &self.mounts
    }

    /// The managed mount containing `path` (longest match wins).
    pub fn mount_for(&self, path: &Path) -> Option<&Path> {
        self.mounts
            .iter()
            .filter(|m| path.starts_with(m))
            .max_by_key(|m| m.components().count())
            .map(|m| m.as_path())
    }

    /// Register `fd`. Fails with `NotOnManagedMount` if its file is not
    /// under a managed mount point.
    pub fn register(&self, fd: BorrowedFd<'_>, flags: u64) -> Result<FdHandle> {
        let external_fd = fd.as_raw_fd();
        let path = resolve_fd_path(external_fd)?;
        let mount_point = self
            .mount_for(&path)
            .ok_or_else(|| UsrbioError::NotOnManagedMount(path.clone()))?
            .to_path_buf();

        let mut table = self.lock();
        if table.by_external.contains_key(&external_fd) {
            return Err(UsrbioError::AlreadyRegistered(external_fd));
        }
        let file = fd.try_clone_to_owned()?;

        let entry = Arc::new(FdEntry {
            external_fd,
            file,
            path,
            mount_point,
            flags,
            refs: AtomicUsize::new(0),
        });

        let index = match table.free.pop() {
            Some(i) => {
                table.slots[i as usize].entry = Some(entry);
                i
            }
            None => {
                let i = table.slots.len() as u32;
                table.slots.push(Slot { generation: 0, entry: Some(entry) });
                i
            }
        };
        table.by_external.insert(external_fd, index);
        let handle = FdHandle {
            index,
            generation: table.slots[index as usize].generation,
        };
        tracing::debug!(fd = external_fd, index, "fd registered");
        Ok(handle)
    }

    /// Invalidate `handle`. Fails with `HandleBusy` while requests use it.
    pub fn deregister(&self, handle: FdHandle) -> Result<()> {
        let mut table = self.lock();
        let entry = table.get(handle).ok_or(UsrbioError::StaleHandle)?;
        let refs = entry.inflight();
        if refs > 0 {
            return Err(UsrbioError::HandleBusy(refs));
        }
        let external_fd = entry.external_fd;

        let slot = &mut table.slots[handle.index as usize];
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        table.free.push(handle.index);
        table.by_external.remove(&external_fd);
        tracing::debug!(fd = external_fd, index = handle.index, "fd deregistered");
        Ok(())
    }

    /// Look up a handle without taking a reference.
    pub fn resolve(&self, handle: FdHandle) -> Result<Arc<FdEntry>> {
        self.lock().get(handle).cloned().ok_or(UsrbioError::StaleHandle)
    }

    /// Look up a handle and count one in-flight reference on it.
    ///
    /// Done under the table lock so a concurrent `deregister` either sees
    /// the reference or wins and makes this call fail with `StaleHandle`.
    pub(crate) fn acquire(&self, handle: FdHandle) -> Result<Arc<FdEntry>> {
        let table = self.lock();
        let entry = table.get(handle).ok_or(UsrbioError::StaleHandle)?;
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::clone(entry))
    }

    /// Number of registered fds.
    pub fn len(&self) -> usize {
        self.lock().by_external.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        fn resolve_fd_path(fd: RawFd) -> Result<PathBuf> {
            Ok(std::fs::read_link(format!("/proc/self/fd/{fd}"))?)
        }
    } else {
        fn resolve_fd_path(_fd: RawFd) -> Result<PathBuf> {
            Err(UsrbioError::Os(libc::ENOTSUP))
        }
    }
}
