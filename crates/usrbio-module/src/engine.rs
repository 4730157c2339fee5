//! `Engine`: the compositor that wires registries and a backend together.
//!
//! This is the "dependency injection" point. The storage backend is a
//! trait object; pick one of the shipped backends through `EngineConfig`
//! or hand in your own with `EngineBuilder::backend`.
//!
//! ```text
//! Engine
//!   ├── FdRegistry          (managed mounts, fd handles)
//!   ├── StorageBackend      ThreadPoolBackend | UringBackend | custom
//!   └── id counters         regions, rings
//! ```
//!
//! Every ring and region created here holds what it needs (`Arc` clones),
//! so an `Engine` can be dropped while they are still in use. Several
//! engines can live in one process.

use usrbio_core::backend::StorageBackend;
use usrbio_core::config::RingOptions;
use usrbio_core::env::{env_get, env_get_bool, env_get_paths};
use usrbio_core::error::{Result, UsrbioError};

use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::fd_registry::{FdEntry, FdHandle, FdRegistry};
use crate::region::Region;
use crate::ring::IoRing;
use crate::thread_pool::ThreadPoolBackend;

/// Which shipped backend to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BackendKind {
    /// OS worker threads running `pread`/`pwrite`.
    #[default]
    ThreadPool,
    /// io_uring driver thread (Linux, `uring` feature).
    Uring,
}

impl FromStr for BackendKind {
    type Err = UsrbioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "thread-pool" | "threadpool" | "threads" | "pool" => Ok(Self::ThreadPool),
            "uring" | "io-uring" | "io_uring" => Ok(Self::Uring),
            _ => Err(UsrbioError::Config("unknown backend kind")),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Mount points this engine serves. Canonicalized at build time.
    pub mounts: Vec<PathBuf>,
    pub backend: BackendKind,
    /// Thread-pool workers (0 = auto).
    pub workers: usize,
    /// Per-priority queue depth of the backend.
    pub queue_depth: usize,
    /// io_uring SQ entries.
    pub uring_entries: u32,
    /// mlock() regions at creation.
    pub pin_regions: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mounts: Vec::new(),
            backend: BackendKind::ThreadPool,
            workers: 0,
            queue_depth: 1024,
            uring_entries: 256,
            pin_regions: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `USRBIO_*` environment variables.
    ///
    /// An unparsable `USRBIO_BACKEND` falls back to the default backend.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            mounts: env_get_paths("USRBIO_MOUNTS"),
            backend: env_get("USRBIO_BACKEND", defaults.backend),
            workers: env_get("USRBIO_WORKERS", defaults.workers),
            queue_depth: env_get("USRBIO_QUEUE_DEPTH", defaults.queue_depth),
            uring_entries: env_get("USRBIO_URING_ENTRIES", defaults.uring_entries),
            pin_regions: env_get_bool("USRBIO_PIN_REGIONS", defaults.pin_regions),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.mounts.is_empty() {
            return Err(UsrbioError::Config("at least one mount point is required"));
        }
        if self.queue_depth == 0 {
            return Err(UsrbioError::Config("queue_depth must be > 0"));
        }
        if self.backend == BackendKind::Uring && self.uring_entries == 0 {
            return Err(UsrbioError::Config("uring_entries must be > 0"));
        }
        Ok(())
    }
}

/// Builder for an `Engine`.
///
/// Starts from `EngineConfig::default()`; call `from_env()` to start from
/// the environment instead.
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Self {
        Self {
            config: EngineConfig::from_env(),
            backend: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a managed mount point.
    pub fn mount(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.mounts.push(path.into());
        self
    }

    pub fn backend_kind(mut self, kind: BackendKind) -> Self {
        self.config.backend = kind;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n;
        self
    }

    pub fn queue_depth(mut self, n: usize) -> Self {
        self.config.queue_depth = n;
        self
    }

    pub fn uring_entries(mut self, n: u32) -> Self {
        self.config.uring_entries = n;
        self
    }

    pub fn pin_regions(mut self, pin: bool) -> Self {
        self.config.pin_regions = pin;
        self
    }

    /// Use a caller-provided backend instead of building one.
    pub fn backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build the engine.
    ///
    /// 1. Validates configuration
    /// 2. Canonicalizes mount points
    /// 3. Builds (or adopts) the storage backend
    pub fn build(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;

        let mut mounts = config
            .mounts
            .iter()
            .map(std::fs::canonicalize)
            .collect::<std::io::Result<Vec<_>>>()?;
        mounts.sort();
        mounts.dedup();

        let backend = match self.backend {
            Some(b) => b,
            None => build_backend(&config)?,
        };
        tracing::info!(
            backend = backend.name(),
            mounts = ?mounts,
            pin_regions = config.pin_regions,
            "usrbio engine ready"
        );

        Ok(Engine {
            registry: Arc::new(FdRegistry::new(mounts)),
            backend,
            pin_regions: config.pin_regions,
            next_region: AtomicU64::new(1),
            next_ring: AtomicU64::new(1),
        })
    }
}

fn build_backend(config: &EngineConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.backend {
        BackendKind::ThreadPool => {
            let pool = if config.workers == 0 {
                ThreadPoolBackend::auto_sized(config.queue_depth)?
            } else {
                ThreadPoolBackend::new(config.workers, config.queue_depth)?
            };
            Ok(Arc::new(pool))
        }
        BackendKind::Uring => build_uring(config),
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", feature = "uring"))] {
        fn build_uring(config: &EngineConfig) -> Result<Arc<dyn StorageBackend>> {
            use crate::uring_backend::{UringBackend, UringConfig};
            let uring = UringBackend::new(UringConfig {
                entries: config.uring_entries,
                inbox_depth: config.queue_depth,
            })?;
            Ok(Arc::new(uring))
        }
    } else {
        fn build_uring(_config: &EngineConfig) -> Result<Arc<dyn StorageBackend>> {
            Err(UsrbioError::Config("io_uring backend not available in this build"))
        }
    }
}

/// A USRBIO engine: regions, rings and fd handles for a set of mounts.
pub struct Engine {
    registry: Arc<FdRegistry>,
    backend: Arc<dyn StorageBackend>,
    pin_regions: bool,
    next_region: AtomicU64,
    next_ring: AtomicU64,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn mounts(&self) -> &[PathBuf] {
        self.registry.mounts()
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn registry(&self) -> &Arc<FdRegistry> {
        &self.registry
    }

    /// The managed mount `path` names, in canonical form.
    fn managed_mount(&self, path: &Path) -> Result<PathBuf> {
        let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.mounts()
            .iter()
            .find(|m| **m == canonical)
            .cloned()
            .ok_or(UsrbioError::NotOnManagedMount(canonical))
    }

    /// Allocate a shared buffer region for `mount_point`.
    ///
    /// `size` must be a positive multiple of the page size (and of
    /// `block_size`, when given; 0 means no hint). `affinity` is a NUMA
    /// node hint, `-1` for none. Either the region is mapped and
    /// registered with the backend, or nothing is.
    pub fn create_region(
        &self,
        mount_point: &Path,
        size: u64,
        block_size: u32,
        affinity: i32,
    ) -> Result<Region> {
        let mount = self.managed_mount(mount_point)?;
        let id = self.next_region.fetch_add(1, Ordering::Relaxed);
        let region = Region::allocate(id, &mount, size, block_size, affinity, self.pin_regions)?;

        if let Err(e) = self.backend.register_region(&region.info()) {
            tracing::warn!(region = id, error = %e, "backend refused region");
            // Dropping the only handle unmaps it.
            return Err(e);
        }
        tracing::debug!(region = id, size, mount = %mount.display(), "region created");
        Ok(region)
    }

    /// Destroy a region. Fails with `RegionBusy` while any request
    /// references it. The memory is unmapped once the last `Region`
    /// handle is dropped.
    pub fn destroy_region(&self, region: &Region) -> Result<()> {
        region.mark_destroyed()?;
        self.backend.deregister_region(&region.info());
        tracing::debug!(region = region.id(), "region destroyed");
        Ok(())
    }

    /// Create a ring for one managed mount and one direction.
    pub fn create_ring(&self, mut options: RingOptions) -> Result<IoRing> {
        options.validate()?;
        options.mount_point = self.managed_mount(&options.mount_point)?;
        let id = self.next_ring.fetch_add(1, Ordering::Relaxed);
        let ring = IoRing::new(id, options, Arc::clone(&self.backend), Arc::clone(&self.registry))?;
        tracing::debug!(
            ring = id,
            capacity = ring.capacity(),
            direction = ?ring.direction(),
            "ring created"
        );
        Ok(ring)
    }

    /// Register an open file that lives under a managed mount.
    pub fn register_fd(&self, fd: impl AsFd, flags: u64) -> Result<FdHandle> {
        self.registry.register(fd.as_fd(), flags)
    }

    /// Deregister. Fails with `HandleBusy` while requests use the handle.
    pub fn deregister_fd(&self, handle: FdHandle) -> Result<()> {
        self.registry.deregister(handle)
    }

    pub fn resolve_fd(&self, handle: FdHandle) -> Result<Arc<FdEntry>> {
        self.registry.resolve(handle)
    }

    /// Stop the backend. Outstanding requests are drained or cancelled
    /// by the backend; rings see `BackendUnavailable` on the next submit.
    pub fn shutdown(&self) {
        self.backend.shutdown();
        tracing::info!(backend = self.backend.name(), "usrbio engine shut down");
    }
}
