mod common;

use std::fs;
use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use common::*;
use flate2::Compression;
use flate2::write::GzEncoder;
use imagr_core::backend::ScanOptions;
use imagr_core::catalog::DeviceCatalog;
use imagr_core::error::{AcquireError, FlashError};
use imagr_core::write::{self, WriteOptions};
use tempfile::TempDir;

fn catalog_for(backend: &mut MockBackend) -> DeviceCatalog {
    let mut catalog = DeviceCatalog::new();
    catalog
        .refresh(backend, &ScanOptions::default())
        .expect("mock scan cannot fail");
    catalog
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn gzip_image(dir: &TempDir, data: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join("image.img.gz");
    let mut enc = GzEncoder::new(fs::File::create(&path).unwrap(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap();
    path
}

fn running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

#[test]
fn gzip_image_lands_on_the_device_verified() {
    let dir = TempDir::new().unwrap();
    let data = pattern(100_000);
    let image = gzip_image(&dir, &data);

    let mut backend = MockBackend::new(vec![block_entry("sdb", 1 << 30, false)]);
    let target_buf = Arc::clone(&backend.target_buf);
    let catalog = catalog_for(&mut backend);

    let mut reports: Vec<(u8, String)> = Vec::new();
    write::run(
        &image,
        &mut backend,
        &catalog,
        0,
        &WriteOptions::default(),
        running(),
        |p, m| reports.push((p, m.to_string())),
    )
    .unwrap();

    let written = target_buf.lock().unwrap();
    assert_eq!(&written[..data.len()], &data[..]);
    // The tail of the last sector is zero padding.
    assert_eq!(written.len() % 512, 0);
    assert!(written[data.len()..].iter().all(|&b| b == 0));

    let (percent, message) = reports.last().unwrap();
    assert_eq!(*percent, 100);
    assert!(message.starts_with("Done."), "{message}");
}

#[test]
fn verify_catches_a_corrupted_byte() {
    let dir = TempDir::new().unwrap();
    let image = gzip_image(&dir, &pattern(10_000));

    let mut backend = MockBackend::new(vec![block_entry("sdb", 1 << 30, false)]);
    backend.flip_read_at = Some(10);
    let catalog = catalog_for(&mut backend);

    let err = write::run(
        &image,
        &mut backend,
        &catalog,
        0,
        &WriteOptions::default(),
        running(),
        |_, _| {},
    )
    .unwrap_err();
    match err {
        FlashError::VerifyMismatch { offset } => assert_eq!(offset, 10),
        other => panic!("expected VerifyMismatch, got {other:?}"),
    }
}

#[test]
fn cleared_flag_cancels_before_the_first_chunk() {
    let dir = TempDir::new().unwrap();
    let image = gzip_image(&dir, &pattern(10_000));

    let mut backend = MockBackend::new(vec![block_entry("sdb", 1 << 30, false)]);
    let target_buf = Arc::clone(&backend.target_buf);
    let catalog = catalog_for(&mut backend);

    let err = write::run(
        &image,
        &mut backend,
        &catalog,
        0,
        &WriteOptions::default(),
        Arc::new(AtomicBool::new(false)),
        |_, _| {},
    )
    .unwrap_err();
    assert!(matches!(err, FlashError::Cancelled));
    assert!(target_buf.lock().unwrap().is_empty());
}

#[test]
fn undersized_target_surfaces_as_acquire_error() {
    let dir = TempDir::new().unwrap();
    let image = gzip_image(&dir, &pattern(100_000));

    let mut backend = MockBackend::new(vec![block_entry("sdb", 512, false)]);
    let catalog = catalog_for(&mut backend);

    let err = write::run(
        &image,
        &mut backend,
        &catalog,
        0,
        &WriteOptions::default(),
        running(),
        |_, _| {},
    )
    .unwrap_err();
    assert!(matches!(
        err,
        FlashError::Acquire(AcquireError::TargetTooSmall { .. })
    ));
}

#[test]
fn serial_target_gets_handshake_then_padded_image() {
    let dir = TempDir::new().unwrap();
    let data = pattern(1000);
    let path = dir.path().join("kernel.img");
    fs::write(&path, &data).unwrap();

    let mut backend = MockBackend::new(vec![serial_entry("ttyUSB0")]);
    {
        let mut script = backend.serial.lock().unwrap();
        script.feed.extend([0x03, 0x03, 0x03]);
        script.ack.extend(*b"OK");
    }
    let serial = Arc::clone(&backend.serial);
    let catalog = catalog_for(&mut backend);

    write::run(
        &path,
        &mut backend,
        &catalog,
        0,
        &WriteOptions::default(),
        running(),
        |_, _| {},
    )
    .unwrap();

    let written = serial.lock().unwrap().written.clone();
    // LE32 size word first, then the image padded to a full sector.
    assert_eq!(&written[..4], &(1000u32).to_le_bytes());
    assert_eq!(written.len(), 4 + 1024);
    assert_eq!(&written[4..4 + 1000], &data[..]);
    assert!(written[4 + 1000..].iter().all(|&b| b == 0));
}
