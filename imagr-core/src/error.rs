//! Error taxonomy for the imaging core.
//!
//! Every failure a caller might want to render differently is a distinct
//! variant rather than a boolean or a stringly error. Nothing in the core
//! retries; each of these is a terminal event for one transfer attempt.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Problems detected while classifying the source archive header.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("encrypted zip archives are not supported")]
    EncryptedZip,

    #[error("unsupported compression method {0} in zip entry")]
    UnsupportedZipMethod(u16),

    #[error("7z archives are deliberately not supported, repack as .xz")]
    Unsupported7z,

    #[error("corrupt archive header (bad or missing zip64 record)")]
    CorruptArchive,

    #[error("decompressor failed to initialize: {0}")]
    DecoderInit(String),
}

/// Problems with the source image: opening it, classifying it, or decoding it.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read source image: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("source image is empty")]
    Empty,

    #[error("corrupt {codec} stream: {detail}")]
    Decode {
        codec: &'static str,
        detail: String,
    },
}

/// Problems acquiring exclusive access to the selected target.
///
/// The variants map one-to-one onto the stages of [`crate::session::DeviceSession::open`],
/// so a front end can tell the user exactly which stage refused.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("target index {0} is not in the device list")]
    InvalidTarget(usize),

    #[error("refusing to write to the system disk (pass the all-disks override to allow it)")]
    SystemDisk,

    #[error("target holds {capacity} bytes but the image needs {needed}")]
    TargetTooSmall { capacity: u64, needed: u64 },

    #[error("{0} is the root or boot filesystem and cannot be unmounted")]
    RootMount(PathBuf),

    #[error("failed to unmount {path}: {source}")]
    Unmount { path: PathBuf, source: io::Error },

    #[error("failed to lock the device: {0}")]
    Lock(io::Error),

    #[error("failed to open the raw device: {0}")]
    Open(io::Error),

    #[error("serial handshake failed: {0}")]
    Handshake(String),

    #[error("serial communication error: {0}")]
    Comm(io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

/// Top-level error for one transfer attempt, in either direction.
#[derive(Debug, Error)]
pub enum FlashError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("write to target failed: {0}")]
    Write(io::Error),

    #[error("read from target failed: {0}")]
    Read(io::Error),

    #[error("verification mismatch at byte offset {offset}")]
    VerifyMismatch { offset: u64 },

    #[error("operation cancelled")]
    Cancelled,
}
