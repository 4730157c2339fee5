//! USRBIO benchmark
//!
//! Two modes:
//!   read       — register an existing file, read N blocks in one batch
//!   readwrite  — write N blocks of a pattern on a write ring, read them
//!                back on a read ring, verify, print timings
//!
//! Run:
//!   usrbio-bench read <mount> <file> [blocks=1] [block_size=16777216] [ring]
//!   usrbio-bench readwrite <mount> [file] [blocks=1024] [block_size=1048576] [ring]
//!
//! `ring` is `io_depth timeout_ms priority` in 3FS integer form, default
//! `0 0 1`: one batch per submit, wait forever, normal priority.
//!
//! Backend and pool sizing come from USRBIO_* (see the usrbio crate docs).
//! Log level from RUST_LOG (default: info).

use std::error::Error;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use usrbio::prelude::*;
use usrbio::{IoDepth, Priority, TimeoutPolicy};

type BenchResult<T> = std::result::Result<T, Box<dyn Error>>;

const LINE: &str = "────────────────────────────────────────────────────────────";

fn init_logging() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    // RUST_LOG wins over the built-in default.
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_names(true))
        .init();
}

fn usage() -> ! {
    eprintln!("usage:");
    eprintln!("  usrbio-bench read <mount> <file> [blocks] [block_size] [io_depth timeout_ms priority]");
    eprintln!("  usrbio-bench readwrite <mount> [file] [blocks] [block_size] [io_depth timeout_ms priority]");
    std::process::exit(2);
}

struct Params {
    mount: PathBuf,
    file: PathBuf,
    blocks: u64,
    block_size: u64,
    io_depth: i32,
    timeout_ms: u64,
    priority: i32,
}

impl Params {
    fn parse(args: &[String], file_required: bool, blocks: u64, block_size: u64) -> Self {
        let Some(mount) = args.get(2).map(PathBuf::from) else { usage() };
        let file = match args.get(3) {
            Some(f) => PathBuf::from(f),
            None if file_required => usage(),
            None => mount.join("usrbio-bench").join("kvcache.bin"),
        };
        Self {
            mount,
            file,
            blocks: args.get(4).and_then(|s| s.parse().ok()).unwrap_or(blocks),
            block_size: args.get(5).and_then(|s| s.parse().ok()).unwrap_or(block_size),
            io_depth: args.get(6).and_then(|s| s.parse().ok()).unwrap_or(0),
            timeout_ms: args.get(7).and_then(|s| s.parse().ok()).unwrap_or(0),
            priority: args.get(8).and_then(|s| s.parse().ok()).unwrap_or(1),
        }
    }

    fn ring_options(&self, for_read: bool) -> BenchResult<RingOptions> {
        Ok(RingOptions::new(&self.mount, self.capacity()?, for_read)
            .io_depth(IoDepth::from_hint(self.io_depth))
            .timeout(TimeoutPolicy::from_millis(self.timeout_ms))
            .priority(Priority::from_level(self.priority)))
    }

    fn total(&self) -> u64 {
        self.blocks * self.block_size
    }

    fn capacity(&self) -> BenchResult<u32> {
        Ok(u32::try_from(self.blocks).map_err(|_| "too many blocks")?)
    }
}

fn main() {
    init_logging();
    let args: Vec<String> = std::env::args().collect();

    let outcome = match args.get(1).map(String::as_str) {
        Some("read") => run_read(&Params::parse(&args, true, 1, 16 << 20)),
        Some("readwrite") => run_readwrite(&Params::parse(&args, false, 1024, 1 << 20)),
        _ => usage(),
    };
    if let Err(e) = outcome {
        tracing::error!(error = %e, "benchmark failed");
        std::process::exit(1);
    }
}

fn build_engine(mount: &Path) -> BenchResult<Engine> {
    Ok(EngineBuilder::from_env().mount(mount).build()?)
}

/// Submit everything staged and wait for `n` completions.
///
/// Returns total bytes moved; a failed or short completion is an error.
fn drain(ring: &mut IoRing, n: usize, block_size: u64) -> BenchResult<u64> {
    ring.submit()?;
    let mut cqes = vec![Cqe::EMPTY; n];
    let mut seen = 0;
    let mut bytes = 0u64;
    while seen < n {
        let got = ring.wait_for_completions(&mut cqes[seen..], n - seen, None)?;
        for cqe in &cqes[seen..seen + got.count] {
            if cqe.result != block_size as i64 {
                return Err(format!(
                    "request tag={} seq={} returned {}",
                    cqe.user_tag.0, cqe.seq, cqe.result
                )
                .into());
            }
            bytes += cqe.result as u64;
        }
        seen += got.count;
        if got.status == WaitStatus::Exhausted && seen < n {
            return Err(format!("only {seen} of {n} requests completed").into());
        }
    }
    Ok(bytes)
}

fn run_read(p: &Params) -> BenchResult<()> {
    let engine = build_engine(&p.mount)?;
    let region = engine.create_region(&p.mount, p.total(), 0, -1)?;
    let mut ring = engine.create_ring(p.ring_options(true)?)?;

    let file = OpenOptions::new().read(true).open(&p.file)?;
    let fd = engine.register_fd(&file, 0)?;
    tracing::info!(file = %p.file.display(), blocks = p.blocks, block_size = p.block_size, "read");

    let t1 = Instant::now();
    for i in 0..p.blocks {
        let off = i * p.block_size;
        ring.prepare(&region, Direction::Read, off, fd, off, p.block_size, UserTag(i))?;
    }
    let bytes = drain(&mut ring, p.blocks as usize, p.block_size)?;
    let cost = t1.elapsed();

    println!("{LINE}");
    println!("  read: {} bytes in {} us ({})", bytes, cost.as_micros(), rate(bytes, cost));
    println!("{LINE}");

    ring.destroy().map_err(|busy| busy.error)?;
    engine.deregister_fd(fd)?;
    engine.destroy_region(&region)?;
    Ok(())
}

fn run_readwrite(p: &Params) -> BenchResult<()> {
    let engine = build_engine(&p.mount)?;
    let region = engine.create_region(&p.mount, p.total(), 0, -1)?;

    if let Some(dir) = p.file.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&p.file)?;
    let fd = engine.register_fd(&file, 0)?;
    tracing::info!(file = %p.file.display(), blocks = p.blocks, block_size = p.block_size, "readwrite");

    let block: Vec<u8> = vec![b'a'; p.block_size as usize];

    // Write.
    let mut writes = engine.create_ring(p.ring_options(false)?)?;
    let t1 = Instant::now();
    for i in 0..p.blocks {
        let off = i * p.block_size;
        region.write_at(off, &block)?;
        writes.prepare(&region, Direction::Write, off, fd, off, p.block_size, UserTag(i))?;
    }
    let written = drain(&mut writes, p.blocks as usize, p.block_size)?;
    let write_cost = t1.elapsed();

    // Clobber the region so the read-back proves something.
    let zeros = vec![0u8; p.block_size as usize];
    for i in 0..p.blocks {
        region.write_at(i * p.block_size, &zeros)?;
    }

    // Read.
    let mut reads = engine.create_ring(p.ring_options(true)?)?;
    let t3 = Instant::now();
    for i in 0..p.blocks {
        let off = i * p.block_size;
        reads.prepare(&region, Direction::Read, off, fd, off, p.block_size, UserTag(i))?;
    }
    let read = drain(&mut reads, p.blocks as usize, p.block_size)?;
    let read_cost = t3.elapsed();
    let total_cost = t1.elapsed();

    // Verify.
    let mut out = vec![0u8; p.block_size as usize];
    let mut bad = 0u64;
    for i in 0..p.blocks {
        region.read_at(i * p.block_size, &mut out)?;
        if out != block {
            tracing::warn!(block = i, "read data is incorrect");
            bad += 1;
        }
    }

    println!("{LINE}");
    println!("  write: {} bytes in {} us ({})", written, write_cost.as_micros(), rate(written, write_cost));
    println!("  read:  {} bytes in {} us ({})", read, read_cost.as_micros(), rate(read, read_cost));
    println!("  total: {} us, {} of {} blocks verified", total_cost.as_micros(), p.blocks - bad, p.blocks);
    println!("{LINE}");

    writes.destroy().map_err(|busy| busy.error)?;
    reads.destroy().map_err(|busy| busy.error)?;
    engine.deregister_fd(fd)?;
    engine.destroy_region(&region)?;

    if bad > 0 {
        return Err(format!("{bad} blocks failed verification").into());
    }
    Ok(())
}

fn rate(bytes: u64, cost: Duration) -> String {
    let secs = cost.as_secs_f64();
    if secs == 0.0 {
        return "-".into();
    }
    format!("{:.1} MiB/s", bytes as f64 / secs / (1u64 << 20) as f64)
}
