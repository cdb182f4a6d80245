//! The image-to-device transfer loop.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::backend::DeviceBackend;
use crate::catalog::DeviceCatalog;
use crate::device::TargetKind;
use crate::error::FlashError;
use crate::progress::ProgressEstimator;
use crate::session::{DeviceSession, SessionOptions};
use crate::stream::{DEFAULT_BLOCK_SIZE, Source};

/// Knobs for [`run`].
#[derive(Clone)]
pub struct WriteOptions {
    /// Read every chunk back and compare it against what was written.
    pub verify: bool,
    /// Bytes pulled per iteration. Must be a non-zero multiple of 512.
    pub block_size: usize,
    pub allow_system_disk: bool,
    /// Serial line speed, for serial targets.
    pub baud: u32,
    /// Run the bootloader handshake on serial targets.
    pub handshake: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            verify: true,
            block_size: DEFAULT_BLOCK_SIZE,
            allow_system_disk: false,
            baud: 115_200,
            handshake: true,
        }
    }
}

/// Writes the image at `image` to the catalog entry at `target`.
///
/// Pulls decoded, sector-padded chunks from the source, writes each to
/// the acquired target, optionally reads it back for comparison, and
/// reports `(percent, message)` after every chunk plus once more after
/// the loop ends. Clearing `running` stops the transfer at the next
/// chunk boundary.
pub fn run<F>(
    image: &Path,
    backend: &mut dyn DeviceBackend,
    catalog: &DeviceCatalog,
    target: usize,
    opts: &WriteOptions,
    running: Arc<AtomicBool>,
    mut on_progress: F,
) -> Result<(), FlashError>
where
    F: FnMut(u8, &str),
{
    let mut source = Source::open(image, opts.block_size)?;
    info!(
        image = %image.display(),
        format = source.format().name(),
        size = source.declared_size(),
        "starting write"
    );

    let session_opts = SessionOptions {
        allow_system_disk: opts.allow_system_disk,
        baud: opts.baud,
        handshake: opts.handshake,
        running: Arc::clone(&running),
    };
    let mut session = DeviceSession::open(
        backend,
        catalog,
        target,
        source.declared_size(),
        &session_opts,
    )?;
    let verify = opts.verify && session.kind() == TargetKind::BlockDevice;

    let mut estimator = ProgressEstimator::new();
    let mut buf = vec![0u8; opts.block_size];
    let mut check = if verify {
        vec![0u8; opts.block_size]
    } else {
        Vec::new()
    };
    let mut written: u64 = 0;

    loop {
        if !running.load(Ordering::SeqCst) {
            return Err(FlashError::Cancelled);
        }
        let n = source.pull(&mut buf)?;
        if n == 0 {
            break;
        }
        session.write(&buf[..n]).map_err(FlashError::Write)?;
        if verify {
            session
                .read_back(&mut check[..n])
                .map_err(FlashError::Read)?;
            if let Some(i) = (0..n).find(|&i| check[i] != buf[i]) {
                return Err(FlashError::VerifyMismatch {
                    offset: written + i as u64,
                });
            }
        }
        written += n as u64;

        let (percent, message) = estimator.status(&source.snapshot(), false);
        on_progress(percent, &message);
    }

    session.close();
    debug!(written, "write loop finished");

    let (percent, message) = estimator.status(&source.snapshot(), true);
    on_progress(percent, &message);
    Ok(())
}
