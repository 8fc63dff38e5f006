//! Ring integration tests against real files.

use ringio::{RingInstance, DEFAULT_BLOCK_SIZE, DEFAULT_QUEUE_DEPTH};
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

fn scratch_file(content: &[u8]) -> (tempfile::TempDir, std::fs::File) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ring.dat");
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .unwrap();
    file.write_all(content).unwrap();
    file.seek(SeekFrom::Start(0)).unwrap();
    (dir, file)
}

#[test]
fn write_then_read_with_defaults() {
    let (_dir, file) = scratch_file(&[]);

    let mut ring = RingInstance::new();
    assert_eq!(ring.queue_depth(), DEFAULT_QUEUE_DEPTH);
    assert_eq!(ring.block_size(), DEFAULT_BLOCK_SIZE);
    assert!(!ring.available());

    ring.setup(file.try_clone().unwrap()).unwrap();
    assert!(ring.available());

    let mut buf = ring.alloc_buffer().unwrap();
    let payload = vec![0xabu8; buf.capacity() as usize];
    buf.fill(&payload);

    ring.write(&file, &buf, 0).unwrap();
    let written = ring.handle_current_io(&mut buf).unwrap();
    assert_eq!(written as u64, buf.capacity());

    let mut back = ring.alloc_buffer().unwrap();
    ring.read(&file, &mut back, 0).unwrap();
    let read = ring.handle_current_io(&mut back).unwrap();
    assert_eq!(read as u64, back.capacity());
    assert_eq!(back.drain(), payload);

    ring.exit();
    assert!(!ring.available());
}

#[test]
fn single_byte_geometry_still_completes() {
    // Queue depth 1, block size 1: the smallest legal ring.
    let (_dir, file) = scratch_file(b"");

    let mut ring = RingInstance::with_params(1, 1);
    ring.setup(file.try_clone().unwrap()).unwrap();

    let mut buf = ring.alloc_buffer().unwrap();
    assert_eq!(buf.capacity(), 1);
    buf.fill(b"z");

    ring.write(&file, &buf, 0).unwrap();
    assert_eq!(ring.handle_current_io(&mut buf).unwrap(), 1);

    let mut back = ring.alloc_buffer().unwrap();
    ring.read(&file, &mut back, 0).unwrap();
    assert_eq!(ring.handle_current_io(&mut back).unwrap(), 1);
    assert_eq!(back.drain(), b"z");
}

#[test]
fn short_read_lowers_effective_size() {
    let (_dir, file) = scratch_file(b"abc");

    let mut ring = RingInstance::with_params(2, 4);
    ring.setup(file.try_clone().unwrap()).unwrap();

    let mut buf = ring.alloc_buffer().unwrap();
    ring.read(&file, &mut buf, 0).unwrap();
    let n = ring.handle_current_io(&mut buf).unwrap();
    assert_eq!(n, 3);
    assert_eq!(buf.effective_size(), 3);
    assert_eq!(buf.drain(), b"abc");
}

#[test]
fn geometry_mismatch_is_rejected() {
    let (_dir, file) = scratch_file(b"");

    let mut ring = RingInstance::with_params(2, 8);
    ring.setup(file.try_clone().unwrap()).unwrap();

    let mut odd = ringio::VectoredBuffer::new(16, 2).unwrap();
    assert!(ring.read(&file, &mut odd, 0).is_err());
}

#[test]
fn params_frozen_after_setup() {
    let (_dir, file) = scratch_file(b"");

    let mut ring = RingInstance::new();
    ring.set_queue_depth(4).unwrap();
    ring.set_block_size(512).unwrap();
    ring.setup(file).unwrap();

    assert!(ring.set_queue_depth(2).is_err());
    assert!(ring.set_block_size(1024).is_err());
}
