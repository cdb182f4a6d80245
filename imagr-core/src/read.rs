//! The device-to-image direction: back up a whole device into an image
//! file, optionally bzip2-compressed.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bzip2::Compression;
use bzip2::write::BzEncoder;
use tracing::info;

use crate::backend::DeviceBackend;
use crate::catalog::DeviceCatalog;
use crate::device::TargetKind;
use crate::error::{FlashError, SourceError};
use crate::session::{DeviceSession, SessionOptions};
use crate::stream::DEFAULT_BLOCK_SIZE;

/// Knobs for [`run`].
#[derive(Clone)]
pub struct ReadOptions {
    /// Compress the output with bzip2 instead of writing it raw.
    pub compress: bool,
    /// Bytes read per iteration. Must be a non-zero multiple of 512.
    pub block_size: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            compress: false,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

enum ImageWriter {
    Plain(BufWriter<File>),
    Bzip2(BzEncoder<BufWriter<File>>),
}

impl ImageWriter {
    fn create(path: &Path, compress: bool) -> io::Result<ImageWriter> {
        let file = BufWriter::new(File::create(path)?);
        Ok(if compress {
            ImageWriter::Bzip2(BzEncoder::new(file, Compression::best()))
        } else {
            ImageWriter::Plain(file)
        })
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            ImageWriter::Plain(w) => w.write_all(buf),
            ImageWriter::Bzip2(w) => w.write_all(buf),
        }
    }

    fn finish(self) -> io::Result<()> {
        match self {
            ImageWriter::Plain(mut w) => w.flush(),
            ImageWriter::Bzip2(w) => w.finish()?.flush(),
        }
    }
}

/// Reads the whole device at catalog index `target` into a new image
/// file at `image`.
///
/// `on_start` receives the total byte count once the device is acquired;
/// `on_progress` receives the running byte count after every chunk.
pub fn run<F>(
    backend: &mut dyn DeviceBackend,
    catalog: &DeviceCatalog,
    target: usize,
    image: &Path,
    opts: &ReadOptions,
    running: Arc<AtomicBool>,
    on_start: impl FnOnce(u64),
    mut on_progress: F,
) -> Result<(), FlashError>
where
    F: FnMut(u64),
{
    let entry = catalog.get(target).ok_or(FlashError::Acquire(
        crate::error::AcquireError::InvalidTarget(target),
    ))?;
    if entry.kind == TargetKind::SerialPort {
        return Err(FlashError::Source(SourceError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "cannot back up a serial port",
        ))));
    }
    let capacity = entry.capacity;
    if capacity == 0 {
        return Err(FlashError::Read(io::Error::new(
            io::ErrorKind::InvalidData,
            "device reports zero capacity",
        )));
    }

    let session_opts = SessionOptions {
        running: Arc::clone(&running),
        ..SessionOptions::default()
    };
    let mut session = DeviceSession::open(backend, catalog, target, 0, &session_opts)?;
    info!(image = %image.display(), capacity, compress = opts.compress, "starting backup");
    on_start(capacity);

    let mut writer =
        ImageWriter::create(image, opts.compress).map_err(FlashError::Write)?;
    let mut buf = vec![0u8; opts.block_size];
    let mut read_total: u64 = 0;

    while read_total < capacity {
        if !running.load(Ordering::SeqCst) {
            return Err(FlashError::Cancelled);
        }
        let want = ((capacity - read_total) as usize).min(opts.block_size);
        session
            .read_chunk(&mut buf[..want])
            .map_err(FlashError::Read)?;
        writer.write_all(&buf[..want]).map_err(FlashError::Write)?;
        read_total += want as u64;
        on_progress(read_total);
    }

    session.close();
    writer.finish().map_err(FlashError::Write)?;
    Ok(())
}
