//! # usrbio - User-space Batched I/O Rings
//!
//! Zero-copy, batched block I/O against files on a distributed file
//! system mount. Callers place data in a shared memory region, queue many
//! reads or writes on a ring, submit them in one call, and harvest
//! completions in bulk. No per-request kernel round trip, no copy between
//! the caller's buffer and the storage path.
//!
//! ## Quick Start
//!
//! ```ignore
//! use usrbio::{Cqe, Direction, EngineBuilder, RingOptions, UserTag};
//!
//! let engine = EngineBuilder::new().mount("/3fs/stage").build()?;
//! let region = engine.create_region("/3fs/stage".as_ref(), 4 << 20, 0, -1)?;
//! let mut ring = engine.create_ring(RingOptions::new("/3fs/stage", 4, true))?;
//!
//! let file = std::fs::File::open("/3fs/stage/data.bin")?;
//! let fd = engine.register_fd(&file, 0)?;
//!
//! for i in 0..4u64 {
//!     let off = i << 20;
//!     ring.prepare(&region, Direction::Read, off, fd, off, 1 << 20, UserTag(i))?;
//! }
//! ring.submit()?;
//!
//! let mut cqes = [Cqe::EMPTY; 4];
//! let done = ring.wait_for_completions(&mut cqes, 4, None)?;
//! for cqe in &cqes[..done.count] {
//!     assert_eq!(cqe.result, 1 << 20);
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │        prepare(), submit(), wait_for_completions()          │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                      ▲
//!            ▼                                      │
//! ┌──────────────────────┐              ┌──────────────────────┐
//! │   IoRing (staged)    │              │  CompletionPort      │
//! │  fixed slot arena    │              │  ArrayQueue+eventfd  │
//! └──────────────────────┘              └──────────────────────┘
//!            │ submit_batch                         ▲ {slot, result}
//!            ▼                                      │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    StorageBackend                           │
//! │        ThreadPoolBackend | UringBackend | remote            │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                      │
//!            ▼                                      │
//!    ┌─────────────────────────────────────────────────────────┐
//!    │        Region (memfd, MAP_SHARED)  +  FdRegistry        │
//!    └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration
//!
//! `EngineBuilder::from_env()` reads:
//!
//! | Variable               | Meaning                           | Default       |
//! |------------------------|-----------------------------------|---------------|
//! | `USRBIO_MOUNTS`        | `:`-separated managed mounts      | (none)        |
//! | `USRBIO_BACKEND`       | `thread-pool` or `uring`          | `thread-pool` |
//! | `USRBIO_WORKERS`       | worker threads, 0 = auto          | 0             |
//! | `USRBIO_QUEUE_DEPTH`   | backend queue depth               | 1024          |
//! | `USRBIO_URING_ENTRIES` | io_uring SQ entries               | 256           |
//! | `USRBIO_PIN_REGIONS`   | `mlock` regions                   | false         |
//!
//! Every error converts to a negative errno with `UsrbioError::errno()`.

pub use usrbio_core::backend::{BatchReceipt, IoRequest, RegionInfo, StorageBackend};
pub use usrbio_core::buffer::BufferRef;
pub use usrbio_core::completion::CompletionSink;
pub use usrbio_core::config::{IoDepth, Priority, RingOptions, TimeoutPolicy};
pub use usrbio_core::entry::{Completion, Cqe, Direction, SlotIndex, UserTag};
pub use usrbio_core::error::{Result, UsrbioError};
pub use usrbio_core::notifier::Notifier;

pub use usrbio_module::completion_port::CompletionPort;
pub use usrbio_module::engine::{BackendKind, Engine, EngineBuilder, EngineConfig};
pub use usrbio_module::eventfd_notifier::EventFdNotifier;
pub use usrbio_module::fd_registry::{FdEntry, FdHandle, FdRegistry};
pub use usrbio_module::region::{page_size, Region};
pub use usrbio_module::ring::{BusyRing, Harvest, IoRing, WaitStatus};
pub use usrbio_module::thread_pool::ThreadPoolBackend;

#[cfg(all(target_os = "linux", feature = "uring"))]
pub use usrbio_module::uring_backend::{UringBackend, UringConfig};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        Cqe, Direction, Engine, EngineBuilder, FdHandle, Harvest, IoRing, Region, RingOptions,
        UserTag, UsrbioError, WaitStatus,
    };
}
