//! # usrbio-module: Default implementations
//!
//! This crate provides the engine and a default implementation for every
//! `usrbio-core` trait.
//!
//! ## Default stack
//!
//! | Trait / role     | Default Impl        | Alternative                  |
//! |------------------|---------------------|------------------------------|
//! | StorageBackend   | ThreadPoolBackend   | UringBackend (`uring`)       |
//! | CompletionSink   | CompletionPort      | caller-provided              |
//! | Notifier         | EventFdNotifier     |                              |
//! | Buffer memory    | Region (memfd+mmap) |                              |
//! | fd lookup        | FdRegistry          |                              |
//!
//! `Engine` wires them together; `IoRing` is the per-caller
//! submission/completion ring.

pub mod completion_port;
pub mod engine;
pub mod eventfd_notifier;
pub mod fd_registry;
pub mod region;
pub mod ring;
pub mod thread_pool;
#[cfg(all(target_os = "linux", feature = "uring"))]
pub mod uring_backend;

#[cfg(test)]
mod testing;
