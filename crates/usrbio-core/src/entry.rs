//! Submission and completion entry types.
//!
//! These are the *lingua franca* between the ring, the completion port
//! and the storage backend.

/// Caller-supplied correlation value, echoed back in the completion entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct UserTag(pub u64);

impl UserTag {
    /// No tag supplied. Correlate by `Cqe::seq` instead.
    pub const NONE: Self = Self(u64::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl Default for UserTag {
    fn default() -> Self {
        Self::NONE
    }
}

impl From<u64> for UserTag {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Index of a slot in a ring's submission array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SlotIndex(pub u32);

impl SlotIndex {
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Transfer direction of a ring and of every request on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Storage → region. The backend writes into the buffer.
    Read,
    /// Region → storage. The backend only reads the buffer.
    Write,
}

impl Direction {
    #[inline]
    pub fn from_read_flag(for_read: bool) -> Self {
        if for_read { Self::Read } else { Self::Write }
    }

    #[inline]
    pub fn is_read(self) -> bool {
        matches!(self, Self::Read)
    }

    /// Whether two in-flight requests from different rings over
    /// overlapping buffer bytes race.
    ///
    /// A read stores into the buffer, so any pair containing a read
    /// conflicts. Two writes only load from it. Overlap within one ring
    /// is rejected regardless of direction.
    #[inline]
    pub fn conflicts_with(self, other: Direction) -> bool {
        self.is_read() || other.is_read()
    }
}

/// A completion entry, read exactly once by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Cqe {
    /// The tag passed to `prepare`, or `UserTag::NONE`.
    pub user_tag: UserTag,
    /// Bytes transferred, or negative errno.
    pub result: i64,
    /// Ring-local submission sequence number (FIFO correlation).
    pub seq: u64,
}

impl Cqe {
    pub const EMPTY: Self = Self {
        user_tag: UserTag::NONE,
        result: 0,
        seq: 0,
    };

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.result >= 0
    }

    /// The positive errno of a failed transfer.
    #[inline]
    pub fn errno(&self) -> Option<i32> {
        if self.result < 0 {
            Some((-self.result) as i32)
        } else {
            None
        }
    }
}

impl Default for Cqe {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A raw outcome posted by the backend: `{slot, result}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub slot: SlotIndex,
    pub result: i64,
}
