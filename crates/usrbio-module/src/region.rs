//! `Region`: a shared buffer region for zero-copy transfers.
//!
//! The region is an anonymous shared-memory file (`memfd` on Linux) mapped
//! `MAP_SHARED` into the caller's address space. Every request buffer is a
//! sub-range of it. A backend in another process could map the same pages
//! through `shm_fd()`; the local backends use the mapping directly.
//!
//! # In-flight spans
//!
//! Each prepared request claims its byte range in the region's span table
//! until its completion is harvested. A new claim, or a `write_at`/`read_at`
//! copy, that would race with a claimed range is rejected with
//! `BufferOverlap` instead of corrupting memory. Overlap on the same ring
//! is always rejected. Across rings:
//!
//! ```text
//!               claimed by read   claimed by write
//! new read         reject             reject
//! new write        reject             allow
//! write_at         reject             reject
//! read_at          reject             allow
//! ```
//!
//! Two writes on different rings sourcing the same bytes are left to the
//! caller: both only load from the buffer.
//!
//! The mapping lives as long as any clone of the `Region`; in-flight
//! requests hold one, so memory never disappears under a backend.

use usrbio_core::backend::RegionInfo;
use usrbio_core::buffer::BufferRef;
use usrbio_core::entry::Direction;
use usrbio_core::error::{Result, UsrbioError};

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifies the request that claimed a span: `(ring id, slot)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SpanKey {
    pub ring: u64,
    pub slot: u32,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    key: SpanKey,
    start: u64,
    end: u64,
    direction: Direction,
}

impl Span {
    #[inline]
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

struct RegionInner {
    id: u64,
    base: NonNull<u8>,
    len: usize,
    mount_point: PathBuf,
    block_size: u32,
    affinity: i32,
    shm: Option<OwnedFd>,
    pinned: bool,
    /// Requests prepared against this region and not yet harvested.
    inflight: AtomicUsize,
    spans: Mutex<Vec<Span>>,
    destroyed: AtomicBool,
}

// Safety: the mapping is process-wide memory. Concurrent access to its
// bytes is arbitrated by the span table; the metadata is immutable or atomic.
unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}

/// Handle to a shared buffer region. Cheap to clone.
#[derive(Clone)]
pub struct Region {
    inner: Arc<RegionInner>,
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.inner.id)
            .field("len", &self.inner.len)
            .field("mount_point", &self.inner.mount_point)
            .field("inflight", &self.inflight())
            .finish()
    }
}

/// System page size.
pub fn page_size() -> u64 {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as u64 } else { 4096 }
}

/// Size granularity for a region with the given block size hint.
pub(crate) fn granularity(block_size: u32) -> Result<u64> {
    if block_size != 0 && !block_size.is_power_of_two() {
        return Err(UsrbioError::InvalidBlockSize(block_size));
    }
    Ok(page_size().max(block_size as u64))
}

impl Region {
    /// Map a new region. Backend registration is the caller's job.
    ///
    /// On any failure everything mapped or pinned so far is released.
    pub(crate) fn allocate(
        id: u64,
        mount_point: &Path,
        size: u64,
        block_size: u32,
        affinity: i32,
        pin: bool,
    ) -> Result<Self> {
        let gran = granularity(block_size)?;
        if size == 0 || size % gran != 0 || size > isize::MAX as u64 {
            return Err(UsrbioError::InvalidSize { size, granularity: gran });
        }
        let len = size as usize;

        let shm = create_shm(id, len)?;
        let base = map_shared(shm.as_ref(), len)?;

        let mut inner = RegionInner {
            id,
            base,
            len,
            mount_point: mount_point.to_path_buf(),
            block_size,
            affinity,
            shm,
            pinned: false,
            inflight: AtomicUsize::new(0),
            spans: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        };

        if pin {
            let ret = unsafe { libc::mlock(base.as_ptr() as *const libc::c_void, len) };
            if ret != 0 {
                let err = UsrbioError::last_os_error();
                // Dropping `inner` unmaps and closes the memfd.
                drop(inner);
                return Err(err);
            }
            inner.pinned = true;
        }

        Ok(Self { inner: Arc::new(inner) })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn len(&self) -> u64 {
        self.inner.len as u64
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn mount_point(&self) -> &Path {
        &self.inner.mount_point
    }

    pub fn block_size(&self) -> u32 {
        self.inner.block_size
    }

    pub fn affinity(&self) -> i32 {
        self.inner.affinity
    }

    pub fn is_pinned(&self) -> bool {
        self.inner.pinned
    }

    /// Base address of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.inner.base.as_ptr()
    }

    /// The memfd backing the region, if the platform has one.
    pub fn shm_fd(&self) -> Option<BorrowedFd<'_>> {
        self.inner.shm.as_ref().map(|fd| fd.as_fd())
    }

    /// Requests currently referencing the region.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Copy `data` into the region at `offset`.
    ///
    /// Fails with `BufferOverlap` if any in-flight request covers the range.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        self.check_range(offset, len)?;
        let spans = self.lock_spans();
        let end = offset + len;
        if spans.iter().any(|s| s.overlaps(offset, end)) {
            return Err(UsrbioError::BufferOverlap { offset, len });
        }
        // Safety: range checked; the span lock keeps new claims out while we copy.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.as_ptr().add(offset as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Copy bytes out of the region at `offset` into `buf`.
    ///
    /// Fails with `BufferOverlap` if an in-flight read targets the range.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len() as u64;
        self.check_range(offset, len)?;
        let spans = self.lock_spans();
        let end = offset + len;
        if spans
            .iter()
            .any(|s| s.direction.is_read() && s.overlaps(offset, end))
        {
            return Err(UsrbioError::BufferOverlap { offset, len });
        }
        // Safety: range checked; no in-flight request stores into it.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.as_ptr().add(offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Validate that `[offset, offset+len)` lies inside the region.
    pub fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let region_len = self.len();
        match offset.checked_add(len) {
            Some(end) if end <= region_len => Ok(()),
            _ => Err(UsrbioError::BufferOutOfRange { offset, len, region_len }),
        }
    }

    /// Claim a range for an in-flight request.
    ///
    /// The caller has already range-checked. Nothing changes on error.
    pub(crate) fn claim(
        &self,
        key: SpanKey,
        offset: u64,
        len: u64,
        direction: Direction,
    ) -> Result<BufferRef> {
        let mut spans = self.lock_spans();
        if self.is_destroyed() {
            return Err(UsrbioError::RegionDestroyed);
        }
        let end = offset + len;
        if spans.iter().any(|s| {
            s.overlaps(offset, end)
                && (s.key.ring == key.ring || s.direction.conflicts_with(direction))
        }) {
            return Err(UsrbioError::BufferOverlap { offset, len });
        }
        spans.push(Span { key, start: offset, end, direction });
        self.inner.inflight.fetch_add(1, Ordering::AcqRel);

        // Safety: offset+len <= region len (checked by caller) and the
        // mapping outlives the request, which holds a Region clone.
        let ptr = unsafe { NonNull::new_unchecked(self.as_ptr().add(offset as usize)) };
        Ok(unsafe { BufferRef::new(ptr, len as usize) })
    }

    /// Release the span claimed under `key`.
    pub(crate) fn release(&self, key: SpanKey) {
        let mut spans = self.lock_spans();
        if let Some(pos) = spans.iter().position(|s| s.key == key) {
            spans.swap_remove(pos);
            self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
        } else {
            tracing::error!(region = self.inner.id, ring = key.ring, slot = key.slot, "release of unknown span");
        }
    }

    /// Mark the region destroyed if nothing references it.
    pub(crate) fn mark_destroyed(&self) -> Result<()> {
        // Holding the span lock keeps a concurrent claim() out.
        let _spans = self.lock_spans();
        let inflight = self.inflight();
        if inflight > 0 {
            return Err(UsrbioError::RegionBusy(inflight));
        }
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Err(UsrbioError::RegionDestroyed);
        }
        Ok(())
    }

    pub(crate) fn info(&self) -> RegionInfo<'_> {
        RegionInfo {
            id: self.inner.id,
            mount_point: &self.inner.mount_point,
            base: self.inner.base.as_ptr(),
            len: self.inner.len,
            shm_fd: self.inner.shm.as_ref().map(|fd| fd.as_raw_fd()),
            affinity: self.inner.affinity,
        }
    }

    fn lock_spans(&self) -> MutexGuard<'_, Vec<Span>> {
        // A panic while holding the lock leaves the table consistent
        // (every mutation is a single push/remove), so recover it.
        self.inner.spans.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        unsafe {
            if self.pinned {
                libc::munlock(self.base.as_ptr() as *const libc::c_void, self.len);
            }
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len);
        }
        tracing::debug!(region = self.id, len = self.len, "region unmapped");
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn create_shm(id: u64, len: usize) -> Result<Option<OwnedFd>> {
            let name = std::ffi::CString::new(format!("usrbio-region-{id}"))
                .map_err(|_| UsrbioError::Os(libc::EINVAL))?;
            let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
            if fd < 0 {
                return Err(UsrbioError::last_os_error());
            }
            // Safety: memfd_create returned a fresh fd we now own.
            let fd = unsafe { OwnedFd::from_raw_fd(fd) };
            if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
                return Err(UsrbioError::last_os_error());
            }
            Ok(Some(fd))
        }
    } else {
        fn create_shm(_id: u64, _len: usize) -> Result<Option<OwnedFd>> {
            Ok(None)
        }
    }
}

fn map_shared(shm: Option<&OwnedFd>, len: usize) -> Result<NonNull<u8>> {
    let (flags, fd) = match shm {
        Some(fd) => (libc::MAP_SHARED, fd.as_raw_fd()),
        None => (libc::MAP_SHARED | libc::MAP_ANONYMOUS, -1),
    };
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(UsrbioError::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or(UsrbioError::Os(libc::ENOMEM))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(pages: u64) -> Region {
        Region::allocate(1, Path::new("/mnt/test"), pages * page_size(), 0, -1, false).unwrap()
    }

    const KEY: SpanKey = SpanKey { ring: 1, slot: 0 };

    #[test]
    fn test_invalid_size() {
        let p = page_size();
        let m = Path::new("/mnt/test");
        assert!(matches!(
            Region::allocate(1, m, 0, 0, -1, false),
            Err(UsrbioError::InvalidSize { .. })
        ));
        assert!(matches!(
            Region::allocate(1, m, p + 1, 0, -1, false),
            Err(UsrbioError::InvalidSize { .. })
        ));
        assert_eq!(
            Region::allocate(1, m, p, 3, -1, false).unwrap_err(),
            UsrbioError::InvalidBlockSize(3)
        );
        // Block size larger than a page raises the granularity.
        let block = (p * 4) as u32;
        assert!(matches!(
            Region::allocate(1, m, p * 2, block, -1, false),
            Err(UsrbioError::InvalidSize { .. })
        ));
        assert!(Region::allocate(1, m, p * 8, block, -1, false).is_ok());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let r = region(2);
        r.write_at(100, b"hello region").unwrap();
        let mut out = [0u8; 12];
        r.read_at(100, &mut out).unwrap();
        assert_eq!(&out, b"hello region");
        // Fresh memfd pages are zeroed.
        let mut z = [1u8; 4];
        r.read_at(0, &mut z).unwrap();
        assert_eq!(z, [0; 4]);
    }

    #[test]
    fn test_out_of_range() {
        let r = region(1);
        let len = r.len();
        assert!(r.check_range(0, len).is_ok());
        assert!(matches!(r.check_range(1, len), Err(UsrbioError::BufferOutOfRange { .. })));
        assert!(matches!(r.check_range(u64::MAX, 2), Err(UsrbioError::BufferOutOfRange { .. })));
        assert!(r.write_at(len - 1, &[0, 0]).is_err());
    }

    #[test]
    fn test_claim_conflicts() {
        let r = region(1);
        r.claim(KEY, 0, 100, Direction::Write).unwrap();

        // write/write on the same ring is rejected.
        let k2 = SpanKey { ring: 1, slot: 1 };
        assert_eq!(
            r.claim(k2, 50, 100, Direction::Write).unwrap_err(),
            UsrbioError::BufferOverlap { offset: 50, len: 100 }
        );
        // From another ring both only load from the bytes.
        let k2 = SpanKey { ring: 3, slot: 1 };
        r.claim(k2, 50, 100, Direction::Write).unwrap();

        // A read into those bytes would race.
        let k3 = SpanKey { ring: 2, slot: 0 };
        assert_eq!(
            r.claim(k3, 90, 20, Direction::Read).unwrap_err(),
            UsrbioError::BufferOverlap { offset: 90, len: 20 }
        );
        // Disjoint read is fine.
        r.claim(k3, 200, 20, Direction::Read).unwrap();
        assert_eq!(r.inflight(), 3);

        // Copies respect the table.
        assert!(r.write_at(60, &[1]).is_err());
        let mut b = [0u8; 1];
        assert!(r.read_at(60, &mut b).is_ok());
        assert!(r.read_at(205, &mut b).is_err());

        r.release(KEY);
        r.release(k2);
        r.release(k3);
        assert_eq!(r.inflight(), 0);
        assert!(r.write_at(60, &[1]).is_ok());
    }

    #[test]
    fn test_destroy_busy_then_ok() {
        let r = region(1);
        r.claim(KEY, 0, 10, Direction::Read).unwrap();
        assert_eq!(r.mark_destroyed(), Err(UsrbioError::RegionBusy(1)));
        r.release(KEY);
        assert!(r.mark_destroyed().is_ok());
        assert!(r.is_destroyed());
        assert_eq!(r.mark_destroyed(), Err(UsrbioError::RegionDestroyed));
        assert_eq!(r.claim(KEY, 0, 10, Direction::Read).unwrap_err(), UsrbioError::RegionDestroyed);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_shm_fd_sees_same_bytes() {
        let r = region(1);
        r.write_at(0, b"shared").unwrap();
        let fd = r.shm_fd().expect("memfd backing");
        let mut buf = [0u8; 6];
        let n = nix::sys::uio::pread(fd, &mut buf, 0).unwrap();
        assert_eq!(n, 6);
        assert_eq!(&buf, b"shared");
    }
}
