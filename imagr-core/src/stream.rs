//! Pull-based streaming decoder over a source image.
//!
//! A [`Source`] owns the open file and the decompressor state for whatever
//! format the sniffer detected, and hands out plaintext in caller-sized
//! chunks. Output is always zero-padded to the next 512-byte boundary
//! because the consumer writes it straight to a block device.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use tracing::trace;

use crate::error::{FormatError, SourceError};
use crate::sniff::{self, ImageFormat, Sniffed};

/// Sector granularity every produced chunk is padded to.
pub const SECTOR_SIZE: usize = 512;

/// Default pull granularity, and the size of the compressed staging buffer.
pub const DEFAULT_BLOCK_SIZE: usize = 1024 * 1024;

/// Decompressor state, one variant per supported stream format.
enum Codec {
    Plain,
    Deflate(flate2::Decompress),
    Bzip2(bzip2::Decompress),
    Xz(xz2::stream::Stream),
}

impl Codec {
    fn new(format: ImageFormat) -> Result<Self, FormatError> {
        Ok(match format {
            ImageFormat::Plain => Codec::Plain,
            // Raw deflate: the gzip/zip header has already been consumed.
            ImageFormat::Deflate => Codec::Deflate(flate2::Decompress::new(false)),
            ImageFormat::Bzip2 => Codec::Bzip2(bzip2::Decompress::new(false)),
            ImageFormat::Xz => Codec::Xz(
                xz2::stream::Stream::new_stream_decoder(1 << 26, 0)
                    .map_err(|e| FormatError::DecoderInit(e.to_string()))?,
            ),
        })
    }
}

/// Progress counters published by a [`Source`], consumed by
/// [`crate::progress::ProgressEstimator`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    /// Plaintext bytes produced so far, padding included.
    pub read_size: u64,
    /// Uncompressed size, once known.
    pub file_size: Option<u64>,
    /// Compressed input bytes consumed so far.
    pub cmrd_size: u64,
    /// Total compressed payload size (0 for uncompressed sources).
    pub comp_size: u64,
}

/// An open, classified source image.
///
/// Created by [`Source::open`], drained by repeated [`Source::pull`]
/// calls, torn down (file handle and decoder state) on drop.
pub struct Source {
    file: File,
    codec: Codec,
    format: ImageFormat,

    file_size: Option<u64>,
    comp_size: u64,
    read_size: u64,
    cmrd_size: u64,

    comp_buf: Vec<u8>,
    comp_pos: usize,
    comp_len: usize,

    finished: bool,
}

impl Source {
    /// Opens `path`, sniffs its format and prepares the decoder.
    ///
    /// `block_size` bounds single compressed reads and must be a non-zero
    /// multiple of [`SECTOR_SIZE`].
    pub fn open(path: &Path, block_size: usize) -> Result<Source, SourceError> {
        if block_size == 0 || block_size % SECTOR_SIZE != 0 {
            return Err(SourceError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "block size must be a non-zero multiple of 512",
            )));
        }

        let file = File::open(path)?;
        let file_len = file.metadata()?.len();

        let mut file = file;
        let Sniffed {
            format,
            file_size,
            comp_size,
            ..
        } = sniff::sniff(&mut file, file_len)?;

        let codec = Codec::new(format)?;

        Ok(Source {
            file,
            codec,
            format,
            file_size,
            comp_size,
            read_size: 0,
            cmrd_size: 0,
            comp_buf: vec![0u8; block_size],
            comp_pos: 0,
            comp_len: 0,
            finished: false,
        })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Uncompressed size, if known yet. For bzip2/xz this becomes `Some`
    /// exactly when [`Source::pull`] first returns 0.
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    /// Size the target must hold, for the pre-write capacity check and the
    /// serial handshake. 0 when unknown up front.
    pub fn declared_size(&self) -> u64 {
        self.file_size.unwrap_or(0)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            read_size: self.read_size,
            file_size: self.file_size,
            cmrd_size: self.cmrd_size,
            comp_size: self.comp_size,
        }
    }

    /// Produces up to `out.len()` bytes of plaintext, zero-padded to the
    /// next 512-byte boundary. Returns the padded length, or 0 at end of
    /// stream. `out.len()` must be a non-zero multiple of 512.
    pub fn pull(&mut self, out: &mut [u8]) -> Result<usize, SourceError> {
        debug_assert!(!out.is_empty() && out.len() % SECTOR_SIZE == 0);

        if let Some(fs) = self.file_size {
            if self.read_size >= fs {
                return Ok(0);
            }
        }
        if self.finished {
            // First zero-length pull after the decoder hit end of stream:
            // this is the moment an unknown uncompressed size becomes known.
            if self.file_size.is_none() {
                self.file_size = Some(self.read_size);
            }
            return Ok(0);
        }

        let want = match self.file_size {
            Some(fs) => out.len().min((fs - self.read_size) as usize),
            None => out.len(),
        };

        let produced = match &mut self.codec {
            Codec::Plain => {
                let mut filled = 0;
                while filled < want {
                    let n = self.file.read(&mut out[filled..want])?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                if filled == 0 {
                    // A plain image shorter than its metadata claimed.
                    return Err(SourceError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "source image truncated",
                    )));
                }
                filled
            }

            Codec::Deflate(z) => {
                let mut filled = 0;
                loop {
                    if self.comp_pos == self.comp_len {
                        let insiz = (self.comp_size - self.cmrd_size)
                            .min(self.comp_buf.len() as u64)
                            as usize;
                        if insiz == 0 {
                            self.finished = true;
                            break;
                        }
                        self.file.read_exact(&mut self.comp_buf[..insiz])?;
                        self.comp_pos = 0;
                        self.comp_len = insiz;
                        self.cmrd_size += insiz as u64;
                        trace!(cmrd_size = self.cmrd_size, insiz, "deflate refill");
                    }
                    let before_in = z.total_in();
                    let before_out = z.total_out();
                    let status = z
                        .decompress(
                            &self.comp_buf[self.comp_pos..self.comp_len],
                            &mut out[filled..want],
                            flate2::FlushDecompress::None,
                        )
                        .map_err(|e| SourceError::Decode {
                            codec: "deflate",
                            detail: e.to_string(),
                        })?;
                    self.comp_pos += (z.total_in() - before_in) as usize;
                    filled += (z.total_out() - before_out) as usize;
                    if status == flate2::Status::StreamEnd {
                        self.finished = true;
                        break;
                    }
                    if filled == want {
                        break;
                    }
                }
                filled
            }

            Codec::Bzip2(bz) => {
                let mut filled = 0;
                loop {
                    if self.comp_pos == self.comp_len {
                        let insiz = (self.comp_size - self.cmrd_size)
                            .min(self.comp_buf.len() as u64)
                            as usize;
                        if insiz == 0 {
                            self.finished = true;
                            break;
                        }
                        self.file.read_exact(&mut self.comp_buf[..insiz])?;
                        self.comp_pos = 0;
                        self.comp_len = insiz;
                        self.cmrd_size += insiz as u64;
                        trace!(cmrd_size = self.cmrd_size, insiz, "bzip2 refill");
                    }
                    let before_in = bz.total_in();
                    let before_out = bz.total_out();
                    let status = bz
                        .decompress(
                            &self.comp_buf[self.comp_pos..self.comp_len],
                            &mut out[filled..want],
                        )
                        .map_err(|e| SourceError::Decode {
                            codec: "bzip2",
                            detail: e.to_string(),
                        })?;
                    self.comp_pos += (bz.total_in() - before_in) as usize;
                    filled += (bz.total_out() - before_out) as usize;
                    if status == bzip2::Status::StreamEnd {
                        self.finished = true;
                        break;
                    }
                    if filled == want {
                        break;
                    }
                }
                filled
            }

            Codec::Xz(xz) => {
                let mut filled = 0;
                loop {
                    if self.comp_pos == self.comp_len {
                        let insiz = (self.comp_size - self.cmrd_size)
                            .min(self.comp_buf.len() as u64)
                            as usize;
                        if insiz == 0 {
                            self.finished = true;
                            break;
                        }
                        self.file.read_exact(&mut self.comp_buf[..insiz])?;
                        self.comp_pos = 0;
                        self.comp_len = insiz;
                        self.cmrd_size += insiz as u64;
                        trace!(cmrd_size = self.cmrd_size, insiz, "xz refill");
                    }
                    let before_in = xz.total_in();
                    let before_out = xz.total_out();
                    let status = xz
                        .process(
                            &self.comp_buf[self.comp_pos..self.comp_len],
                            &mut out[filled..want],
                            xz2::stream::Action::Run,
                        )
                        .map_err(|e| SourceError::Decode {
                            codec: "xz",
                            detail: e.to_string(),
                        })?;
                    self.comp_pos += (xz.total_in() - before_in) as usize;
                    filled += (xz.total_out() - before_out) as usize;
                    if status == xz2::stream::Status::StreamEnd {
                        self.finished = true;
                        break;
                    }
                    if filled == want {
                        break;
                    }
                }
                filled
            }
        };

        if produced == 0 {
            if self.file_size.is_none() {
                self.file_size = Some(self.read_size);
            }
            return Ok(0);
        }

        // Pad to the next sector boundary; the consumer writes whole
        // sectors to the device, and read_size counts what gets written.
        let padded = (produced + SECTOR_SIZE - 1) & !(SECTOR_SIZE - 1);
        out[produced..padded].fill(0);
        self.read_size += padded as u64;
        trace!(
            produced,
            padded,
            read_size = self.read_size,
            "pull complete"
        );
        Ok(padded)
    }
}
