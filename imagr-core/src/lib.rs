//! The core, UI-agnostic library for the `imagr` disk imaging utility.
//!
//! `imagr-core` is designed to be used as a library by any front-end,
//! whether a command-line interface (like `imagr`) or a graphical one.
//! It handles compressed-image decoding, device discovery, exclusive
//! device acquisition, raw I/O with read-back verification, and
//! progress estimation.
//!
//! The library is structured into several key modules:
//! - [`sniff`]: Detects the image's compression format from its magic
//!   bytes and extracts size metadata.
//! - [`stream`]: A pull-based decoder that yields sector-padded
//!   plaintext chunks from any supported image format.
//! - [`device`] and [`catalog`]: The cross-platform target descriptor
//!   and the ordered list of discovered targets.
//! - [`backend`] and [`platform`]: The OS seam and its per-platform
//!   implementations.
//! - [`session`]: Staged exclusive acquisition of a target, with
//!   symmetric release on every failure path.
//! - [`mod@write`] and [`mod@read`]: The image-to-device and
//!   device-to-image transfer loops.
//! - [`progress`]: Running-average throughput and ETA estimation.
//!
//! The primary entry points are [`write::run`] and [`read::run`]. Both
//! report progress through callbacks so the calling application can
//! render it however it likes.
//!
//! ## Example: writing an image with progress reporting
//!
//! ```rust,no_run
//! use imagr_core::backend::{DeviceBackend, ScanOptions};
//! use imagr_core::catalog::DeviceCatalog;
//! use imagr_core::{platform, write};
//! use std::path::Path;
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//!
//! fn main() -> Result<(), imagr_core::error::FlashError> {
//!     let mut backend = platform::native_backend();
//!     let mut catalog = DeviceCatalog::new();
//!     catalog
//!         .refresh(&mut backend, &ScanOptions::default())
//!         .map_err(imagr_core::error::FlashError::Read)?;
//!
//!     // A shared flag to allow for graceful cancellation.
//!     let running = Arc::new(AtomicBool::new(true));
//!
//!     write::run(
//!         Path::new("path/to/image.img.xz"),
//!         &mut backend,
//!         &catalog,
//!         0,
//!         &write::WriteOptions::default(),
//!         running,
//!         |percent, message| println!("{percent:3}% {message}"),
//!     )?;
//!
//!     println!("Write complete!");
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod catalog;
pub mod device;
pub mod error;
pub mod platform;
pub mod progress;
pub mod read;
pub mod session;
pub mod sniff;
pub mod stream;
pub mod write;
