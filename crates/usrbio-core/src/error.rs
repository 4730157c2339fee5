//! USRBIO error types.
//!
//! Every variant maps to a POSIX-style negative errno via [`UsrbioError::errno`],
//! which is what a C-facing shim would hand back to its caller.

use std::path::PathBuf;

use crate::entry::Direction;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsrbioError {
    /// Region size is zero or not a multiple of the required granularity.
    #[error("invalid region size {size}: must be a non-zero multiple of {granularity}")]
    InvalidSize { size: u64, granularity: u64 },
    /// Block size hint is not a power of two.
    #[error("invalid block size {0}: must be a power of two")]
    InvalidBlockSize(u32),
    /// Ring capacity must be at least one.
    #[error("invalid ring capacity {0}")]
    InvalidCapacity(u32),
    /// Zero-length request.
    #[error("request length must be greater than zero")]
    InvalidLength,
    /// Request direction differs from the ring's.
    #[error("direction mismatch: ring is {ring:?}, request is {request:?}")]
    DirectionMismatch { ring: Direction, request: Direction },
    /// Every slot of the ring is prepared or in flight.
    #[error("ring full")]
    RingFull,
    /// Buffer range is not inside the region.
    #[error("buffer [{offset}, +{len}) outside region of {region_len} bytes")]
    BufferOutOfRange { offset: u64, len: u64, region_len: u64 },
    /// Buffer range overlaps a conflicting in-flight request.
    #[error("buffer [{offset}, +{len}) overlaps an in-flight request")]
    BufferOverlap { offset: u64, len: u64 },
    /// Fd handle was never issued or has been deregistered.
    #[error("stale fd handle")]
    StaleHandle,
    /// Region was destroyed.
    #[error("region destroyed")]
    RegionDestroyed,
    /// Path is not under any mount point managed by this engine.
    #[error("{0} is not on a managed mount point")]
    NotOnManagedMount(PathBuf),
    /// Region, ring and file belong to different mount points.
    #[error("mount point mismatch: ring on {ring}, resource on {other}")]
    MountMismatch { ring: PathBuf, other: PathBuf },
    /// External fd is already registered on this engine.
    #[error("fd {0} already registered")]
    AlreadyRegistered(i32),
    /// Region still referenced by in-flight requests.
    #[error("region busy: {0} requests in flight")]
    RegionBusy(usize),
    /// Ring still has requests in flight.
    #[error("ring busy: {0} requests in flight")]
    RingBusy(usize),
    /// Fd handle still referenced by in-flight requests.
    #[error("fd handle busy: {0} requests in flight")]
    HandleBusy(usize),
    /// The storage backend is gone. Abandon the ring instead of polling it.
    #[error("storage backend unavailable")]
    BackendUnavailable,
    /// Invalid engine/ring configuration.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    /// OS error with errno.
    #[error("OS error: errno {0}")]
    Os(i32),
}

impl UsrbioError {
    /// Negative errno for this error (0 is never returned).
    pub fn errno(&self) -> i32 {
        let e = match self {
            Self::InvalidSize { .. }
            | Self::InvalidBlockSize(_)
            | Self::InvalidCapacity(_)
            | Self::InvalidLength
            | Self::DirectionMismatch { .. }
            | Self::Config(_) => libc::EINVAL,
            Self::RingFull => libc::EAGAIN,
            Self::BufferOutOfRange { .. } => libc::EFAULT,
            Self::BufferOverlap { .. }
            | Self::RegionBusy(_)
            | Self::RingBusy(_)
            | Self::HandleBusy(_) => libc::EBUSY,
            Self::StaleHandle | Self::RegionDestroyed => libc::EBADF,
            Self::NotOnManagedMount(_) | Self::MountMismatch { .. } => libc::EXDEV,
            Self::AlreadyRegistered(_) => libc::EEXIST,
            Self::BackendUnavailable => libc::ESHUTDOWN,
            Self::Os(e) => (*e).max(1),
        };
        -e
    }

    /// Configuration errors are detected synchronously and never retried.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidSize { .. }
                | Self::InvalidBlockSize(_)
                | Self::InvalidCapacity(_)
                | Self::InvalidLength
                | Self::DirectionMismatch { .. }
                | Self::BufferOutOfRange { .. }
                | Self::Config(_)
        )
    }

    /// Resource-busy errors: drain in-flight requests, then retry.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::RegionBusy(_) | Self::RingBusy(_) | Self::HandleBusy(_) | Self::BufferOverlap { .. }
        )
    }

    /// Capture `errno` after a failed libc call.
    pub fn last_os_error() -> Self {
        Self::Os(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<std::io::Error> for UsrbioError {
    fn from(e: std::io::Error) -> Self {
        Self::Os(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type Result<T> = std::result::Result<T, UsrbioError>;
