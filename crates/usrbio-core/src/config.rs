//! Ring configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::entry::Direction;
use crate::error::{Result, UsrbioError};

/// Scheduling priority hint passed to the backend with every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum Priority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub const COUNT: usize = 3;

    /// 3FS-style integer priority: 0 = high, 1 = normal, 2 = low.
    pub fn from_level(level: i32) -> Self {
        match level {
            i32::MIN..=0 => Self::High,
            1 => Self::Normal,
            _ => Self::Low,
        }
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// How `submit` splits staged requests into backend batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoDepth {
    /// Everything staged goes out as one batch.
    #[default]
    Unbounded,
    /// Batches of exactly `n`. A short remainder waits for more requests
    /// or for `TimeoutPolicy::batch_linger`.
    Exactly(u32),
    /// Batches of at most `n`.
    AtMost(u32),
}

impl IoDepth {
    /// Signed hint: `0` unbounded, `n > 0` exactly `n`, `n < 0` at most `-n`.
    pub fn from_hint(hint: i32) -> Self {
        match hint {
            0 => Self::Unbounded,
            n if n > 0 => Self::Exactly(n as u32),
            n => Self::AtMost(n.unsigned_abs()),
        }
    }
}

/// Timeouts owned by a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    /// Used by `wait_for_completions` when the caller passes no timeout.
    /// `None` waits without bound.
    pub default_wait: Option<Duration>,
    /// Longest time a partial `IoDepth::Exactly` batch stays staged.
    pub batch_linger: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            default_wait: None,
            batch_linger: Duration::from_millis(1),
        }
    }
}

impl TimeoutPolicy {
    /// 3FS-style millisecond timeout: `0` means "no linger, wait forever".
    pub fn from_millis(ms: u64) -> Self {
        if ms == 0 {
            Self {
                default_wait: None,
                batch_linger: Duration::ZERO,
            }
        } else {
            Self {
                default_wait: Some(Duration::from_millis(ms)),
                batch_linger: Duration::from_millis(ms),
            }
        }
    }
}

/// Everything needed to create an I/O ring.
#[derive(Debug, Clone)]
pub struct RingOptions {
    /// Mount point the ring serves.
    pub mount_point: PathBuf,
    /// Maximum requests in flight (prepared but not harvested).
    pub capacity: u32,
    /// Read or write ring.
    pub direction: Direction,
    pub priority: Priority,
    pub io_depth: IoDepth,
    /// NUMA node hint, `-1` for none. Advisory.
    pub affinity: i32,
    pub timeout: TimeoutPolicy,
}

impl RingOptions {
    pub fn new(mount_point: impl Into<PathBuf>, capacity: u32, for_read: bool) -> Self {
        Self {
            mount_point: mount_point.into(),
            capacity,
            direction: Direction::from_read_flag(for_read),
            priority: Priority::default(),
            io_depth: IoDepth::default(),
            affinity: -1,
            timeout: TimeoutPolicy::default(),
        }
    }

    pub fn priority(mut self, p: Priority) -> Self {
        self.priority = p;
        self
    }

    pub fn io_depth(mut self, d: IoDepth) -> Self {
        self.io_depth = d;
        self
    }

    pub fn affinity(mut self, node: i32) -> Self {
        self.affinity = node;
        self
    }

    pub fn timeout(mut self, t: TimeoutPolicy) -> Self {
        self.timeout = t;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(UsrbioError::InvalidCapacity(self.capacity));
        }
        match self.io_depth {
            IoDepth::Exactly(0) | IoDepth::AtMost(0) => {
                Err(UsrbioError::Config("io_depth batch size must be at least 1"))
            }
            IoDepth::Exactly(n) if n > self.capacity => {
                Err(UsrbioError::Config("io_depth exceeds ring capacity"))
            }
            _ => Ok(()),
        }
    }
}
