//! # usrbio-core — Trait definitions for USRBIO
//!
//! This crate defines the types and trait boundaries shared by every
//! USRBIO component: the ring entries, the storage backend contract,
//! the completion sink the backend reports into, and the error type.
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."
//!
//! The ring engine in `usrbio-module` depends only on the traits here.
//! A storage backend (local thread pool, io_uring, or a remote
//! replicated store) plugs in by implementing `StorageBackend`.

pub mod entry;
pub mod completion;
pub mod backend;
pub mod notifier;
pub mod buffer;
pub mod config;
pub mod env;
pub mod error;
