//! End-to-end scenarios through the public API, on a temp dir acting as
//! the managed mount.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use usrbio::prelude::*;
use usrbio::BackendKind;

const MIB: u64 = 1 << 20;

fn engine(dir: &Path, kind: BackendKind) -> Option<Engine> {
    match EngineBuilder::new().mount(dir).backend_kind(kind).workers(4).build() {
        Ok(e) => Some(e),
        Err(e) if kind == BackendKind::Uring => {
            eprintln!("skipping: io_uring backend unavailable ({e})");
            None
        }
        Err(e) => panic!("engine build failed: {e}"),
    }
}

fn pattern(block: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i as u64 * 31 + block * 7) % 251) as u8).collect()
}

fn open_rw(path: &Path) -> File {
    OpenOptions::new().read(true).write(true).create(true).open(path).unwrap()
}

fn read_four_blocks(kind: BackendKind) {
    let dir = tempfile::tempdir().unwrap();
    let Some(engine) = engine(dir.path(), kind) else { return };

    let path = dir.path().join("kvcache.bin");
    let data: Vec<u8> = (0..4).flat_map(|b| pattern(b, MIB as usize)).collect();
    std::fs::write(&path, &data).unwrap();
    let file = File::open(&path).unwrap();
    let fd = engine.register_fd(&file, 0).unwrap();

    let region = engine.create_region(dir.path(), 4 * MIB, 0, -1).unwrap();
    let mut ring = engine.create_ring(RingOptions::new(dir.path(), 4, true)).unwrap();

    for i in 0..4u64 {
        ring.prepare(&region, Direction::Read, i * MIB, fd, i * MIB, MIB, UserTag(i)).unwrap();
    }
    assert_eq!(ring.submit().unwrap(), 4);

    let mut cqes = [Cqe::EMPTY; 4];
    let got = ring.wait_for_completions(&mut cqes, 4, None).unwrap();
    assert_eq!(got, Harvest { count: 4, status: WaitStatus::Ready });

    let mut tags: Vec<u64> = cqes.iter().map(|c| c.user_tag.0).collect();
    tags.sort_unstable();
    assert_eq!(tags, vec![0, 1, 2, 3]);
    assert!(cqes.iter().all(|c| c.result == MIB as i64));

    let mut out = vec![0u8; (4 * MIB) as usize];
    region.read_at(0, &mut out).unwrap();
    assert!(out == data, "region contents differ from file");

    ring.destroy().unwrap();
    engine.deregister_fd(fd).unwrap();
    engine.destroy_region(&region).unwrap();
}

#[test]
fn test_read_four_blocks_thread_pool() {
    read_four_blocks(BackendKind::ThreadPool);
}

#[test]
fn test_read_four_blocks_uring() {
    read_four_blocks(BackendKind::Uring);
}

#[test]
fn test_write_then_read_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), BackendKind::ThreadPool).unwrap();
    const BLOCKS: u64 = 8;
    let block = 64 * 1024u64;

    let file = open_rw(&dir.path().join("pattern.bin"));
    let fd = engine.register_fd(&file, 0).unwrap();
    let src = engine.create_region(dir.path(), BLOCKS * block, 0, -1).unwrap();
    let dst = engine.create_region(dir.path(), BLOCKS * block, 0, -1).unwrap();

    let mut writes = engine.create_ring(RingOptions::new(dir.path(), BLOCKS as u32, false)).unwrap();
    for i in 0..BLOCKS {
        src.write_at(i * block, &pattern(i, block as usize)).unwrap();
        writes.prepare(&src, Direction::Write, i * block, fd, i * block, block, UserTag(i)).unwrap();
    }
    writes.submit().unwrap();
    let mut cqes = vec![Cqe::EMPTY; BLOCKS as usize];
    let got = writes.wait_for_completions(&mut cqes, BLOCKS as usize, None).unwrap();
    assert_eq!(got.count, BLOCKS as usize);
    assert!(cqes.iter().all(|c| c.result == block as i64));

    let mut reads = engine.create_ring(RingOptions::new(dir.path(), BLOCKS as u32, true)).unwrap();
    for i in 0..BLOCKS {
        reads.prepare(&dst, Direction::Read, i * block, fd, i * block, block, UserTag(100 + i)).unwrap();
    }
    reads.submit().unwrap();
    let got = reads.wait_for_completions(&mut cqes, BLOCKS as usize, None).unwrap();
    assert_eq!(got.count, BLOCKS as usize);

    for i in 0..BLOCKS {
        let mut out = vec![0u8; block as usize];
        dst.read_at(i * block, &mut out).unwrap();
        assert!(out == pattern(i, block as usize), "block {i} differs");
    }
}

#[test]
fn test_region_busy_until_harvest() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), BackendKind::ThreadPool).unwrap();
    let file = open_rw(&dir.path().join("busy.bin"));
    file.set_len(MIB).unwrap();
    let fd = engine.register_fd(&file, 0).unwrap();
    let region = engine.create_region(dir.path(), MIB, 0, -1).unwrap();
    let mut ring = engine.create_ring(RingOptions::new(dir.path(), 2, true)).unwrap();

    ring.prepare(&region, Direction::Read, 0, fd, 0, 4096, UserTag(1)).unwrap();
    let err = engine.destroy_region(&region).unwrap_err();
    assert_eq!(err, UsrbioError::RegionBusy(1));
    assert_eq!(err.errno(), -libc::EBUSY);
    assert_eq!(engine.deregister_fd(fd).unwrap_err(), UsrbioError::HandleBusy(1));

    ring.submit().unwrap();
    let mut cqes = [Cqe::EMPTY; 1];
    ring.wait_for_completions(&mut cqes, 1, None).unwrap();
    assert_eq!(cqes[0].result, 4096);

    engine.destroy_region(&region).unwrap();
    engine.deregister_fd(fd).unwrap();
}

#[test]
fn test_ring_full_and_direction_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), BackendKind::ThreadPool).unwrap();
    let file = open_rw(&dir.path().join("full.bin"));
    let fd = engine.register_fd(&file, 0).unwrap();
    let region = engine.create_region(dir.path(), MIB, 0, -1).unwrap();
    let mut ring = engine.create_ring(RingOptions::new(dir.path(), 2, false)).unwrap();

    let err = ring
        .prepare(&region, Direction::Read, 0, fd, 0, 512, UserTag(0))
        .unwrap_err();
    assert!(matches!(err, UsrbioError::DirectionMismatch { .. }));
    assert_eq!(err.errno(), -libc::EINVAL);
    assert_eq!(ring.inflight(), 0);

    ring.prepare(&region, Direction::Write, 0, fd, 0, 512, UserTag(1)).unwrap();
    ring.prepare(&region, Direction::Write, 512, fd, 512, 512, UserTag(2)).unwrap();
    let err = ring
        .prepare(&region, Direction::Write, 1024, fd, 1024, 512, UserTag(3))
        .unwrap_err();
    assert_eq!(err, UsrbioError::RingFull);
    assert_eq!(err.errno(), -libc::EAGAIN);
}

#[test]
fn test_zero_timeout_poll() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), BackendKind::ThreadPool).unwrap();
    let mut ring = engine.create_ring(RingOptions::new(dir.path(), 8, true)).unwrap();

    let mut cqes = [Cqe::EMPTY; 8];
    let got = ring.wait_for_completions(&mut cqes, 1, Some(Duration::ZERO)).unwrap();
    assert_eq!(got.count, 0);
    assert_ne!(got.status, WaitStatus::Ready);
}

#[test]
fn test_registered_fd_survives_caller_close() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), BackendKind::ThreadPool).unwrap();
    let path = dir.path().join("closed.bin");
    std::fs::write(&path, pattern(9, 4096)).unwrap();

    let file = File::open(&path).unwrap();
    let fd = engine.register_fd(&file, 0).unwrap();
    drop(file);

    let region = engine.create_region(dir.path(), MIB, 0, -1).unwrap();
    let mut ring = engine.create_ring(RingOptions::new(dir.path(), 1, true)).unwrap();
    ring.prepare(&region, Direction::Read, 0, fd, 0, 4096, UserTag::NONE).unwrap();
    ring.submit().unwrap();
    let mut cqes = [Cqe::EMPTY; 1];
    ring.wait_for_completions(&mut cqes, 1, None).unwrap();
    assert_eq!(cqes[0].result, 4096);
    assert!(cqes[0].user_tag.is_none());
}

#[test]
fn test_file_outside_mount_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), BackendKind::ThreadPool).unwrap();
    let outside = tempfile::NamedTempFile::new().unwrap();
    let err = engine.register_fd(outside.as_file(), 0).unwrap_err();
    assert!(matches!(err, UsrbioError::NotOnManagedMount(_)));
}

#[test]
fn test_rings_on_threads_share_a_region() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine(dir.path(), BackendKind::ThreadPool).unwrap());
    let path = dir.path().join("shared.bin");
    let data: Vec<u8> = (0..4).flat_map(|b| pattern(b, 256 * 1024)).collect();
    std::fs::write(&path, &data).unwrap();
    let file = File::open(&path).unwrap();
    let fd = engine.register_fd(&file, 0).unwrap();
    let region = engine.create_region(dir.path(), MIB, 0, -1).unwrap();

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let region = region.clone();
            let mount = dir.path().to_path_buf();
            std::thread::spawn(move || {
                let mut ring = engine.create_ring(RingOptions::new(mount, 4, true)).unwrap();
                let base = t * 256 * 1024;
                for i in 0..4u64 {
                    let off = base + i * 64 * 1024;
                    ring.prepare(&region, Direction::Read, off, fd, off, 64 * 1024, UserTag(i)).unwrap();
                }
                ring.submit().unwrap();
                let mut cqes = [Cqe::EMPTY; 4];
                let got = ring.wait_for_completions(&mut cqes, 4, None).unwrap();
                assert_eq!(got.count, 4);
                assert!(cqes.iter().all(|c| c.result == 64 * 1024));
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let mut out = vec![0u8; MIB as usize];
    region.read_at(0, &mut out).unwrap();
    assert!(out == data);
}

#[test]
fn test_errors_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path(), BackendKind::ThreadPool).unwrap();
    let file = open_rw(&dir.path().join("down.bin"));
    let fd = engine.register_fd(&file, 0).unwrap();
    let region = engine.create_region(dir.path(), MIB, 0, -1).unwrap();
    let mut ring = engine.create_ring(RingOptions::new(dir.path(), 2, true)).unwrap();

    engine.shutdown();
    ring.prepare(&region, Direction::Read, 0, fd, 0, 512, UserTag(1)).unwrap();
    let err = ring.submit().unwrap_err();
    assert_eq!(err, UsrbioError::BackendUnavailable);
    assert_eq!(err.errno(), -libc::ESHUTDOWN);

    assert_eq!(ring.cancel_staged(), 1);
    ring.destroy().unwrap();
}
