//! Source format detection.
//!
//! Inspects the first 64 KiB of an image file, classifies the compression
//! format from magic bytes, computes compressed/uncompressed sizes where
//! the container declares them, and leaves the reader positioned at the
//! first payload byte. Single-entry zip archives are honored as a
//! container for one compressed stream; everything fancier is rejected.

use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use crate::error::{FormatError, SourceError};

/// How many header bytes the sniffer looks at.
const HEADER_LEN: usize = 65536;

/// Fixed part of a zip local file header.
const ZIP_LOCAL_HEADER_LEN: usize = 30;

/// Compression algorithm of the payload stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// Raw image, or a zip entry stored without compression.
    Plain,
    /// Raw deflate stream (gzip body, or zip method 8).
    Deflate,
    /// bzip2 stream (bare, or zip method 12).
    Bzip2,
    /// xz stream.
    Xz,
}

impl ImageFormat {
    pub fn name(self) -> &'static str {
        match self {
            ImageFormat::Plain => "plain",
            ImageFormat::Deflate => "deflate",
            ImageFormat::Bzip2 => "bzip2",
            ImageFormat::Xz => "xz",
        }
    }
}

/// Result of sniffing a source: the detected format and what is known
/// about its sizes. The reader is positioned at `data_offset` on return.
#[derive(Clone, Debug)]
pub struct Sniffed {
    pub format: ImageFormat,
    /// Uncompressed size when the container declares it. `None` for
    /// bzip2/xz, where it is only learned at end of stream.
    pub file_size: Option<u64>,
    /// Compressed payload size. `0` for uncompressed images.
    pub comp_size: u64,
    /// Offset of the first payload byte.
    pub data_offset: u64,
}

/// Classifies `reader` (whose total length is `file_len`) and seeks it to
/// the start of the payload.
pub fn sniff<R: Read + Seek>(reader: &mut R, file_len: u64) -> Result<Sniffed, SourceError> {
    let mut hdr = vec![0u8; HEADER_LEN];
    let hdr_len = read_up_to(reader, &mut hdr)?;
    let hdr = &hdr[..]; // stays zero-padded past hdr_len, like a zeroed C buffer

    let sniffed = if hdr_len >= 2 && hdr[0] == 0x1f && hdr[1] == 0x8b {
        sniff_gzip(reader, hdr, hdr_len, file_len)?
    } else if hdr_len >= 3 && &hdr[0..3] == b"BZh" {
        Sniffed {
            format: ImageFormat::Bzip2,
            file_size: None,
            comp_size: file_len,
            data_offset: 0,
        }
    } else if hdr_len >= 5 && &hdr[0..5] == b"\xfd7zXZ" {
        Sniffed {
            format: ImageFormat::Xz,
            file_size: None,
            comp_size: file_len,
            data_offset: 0,
        }
    } else if hdr_len >= 4 && &hdr[0..4] == b"PK\x03\x04" {
        sniff_zip(hdr, hdr_len)?
    } else if hdr_len >= 4 && &hdr[0..4] == b"7z\xbc\xaf" {
        // No safe, portable decoder for this one; xz covers the use case.
        return Err(FormatError::Unsupported7z.into());
    } else {
        Sniffed {
            format: ImageFormat::Plain,
            file_size: Some(file_len),
            comp_size: 0,
            data_offset: 0,
        }
    };

    if sniffed.comp_size == 0 && sniffed.file_size.unwrap_or(0) == 0 {
        return Err(SourceError::Empty);
    }

    debug!(
        format = sniffed.format.name(),
        file_size = ?sniffed.file_size,
        comp_size = sniffed.comp_size,
        data_offset = sniffed.data_offset,
        "source format detected"
    );

    reader.seek(SeekFrom::Start(sniffed.data_offset))?;
    Ok(sniffed)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, SourceError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// gzip: uncompressed size is the LE32 in the last 4 bytes, the payload
/// starts after the variable-length header (FLG bits FEXTRA, FNAME,
/// FCOMMENT, FHCRC) and runs up to the 8-byte trailer.
fn sniff_gzip<R: Read + Seek>(
    reader: &mut R,
    hdr: &[u8],
    hdr_len: usize,
    file_len: u64,
) -> Result<Sniffed, SourceError> {
    if file_len < 18 {
        return Err(FormatError::CorruptArchive.into());
    }

    reader.seek(SeekFrom::Start(file_len - 4))?;
    let mut trailer = [0u8; 4];
    reader.read_exact(&mut trailer)?;
    let declared = u32::from_le_bytes(trailer) as u64;

    let flg = hdr[3];
    let mut pos = 10usize;
    if flg & 0x04 != 0 {
        // FEXTRA
        if pos + 2 > hdr_len {
            return Err(FormatError::CorruptArchive.into());
        }
        let xlen = u16::from_le_bytes([hdr[pos], hdr[pos + 1]]) as usize;
        pos += 2 + xlen;
    }
    if flg & 0x08 != 0 {
        // FNAME, NUL-terminated
        pos = skip_cstr(hdr, hdr_len, pos)?;
    }
    if flg & 0x10 != 0 {
        // FCOMMENT
        pos = skip_cstr(hdr, hdr_len, pos)?;
    }
    if flg & 0x02 != 0 {
        // FHCRC
        pos += 2;
    }
    if pos as u64 + 8 > file_len {
        return Err(FormatError::CorruptArchive.into());
    }

    Ok(Sniffed {
        format: ImageFormat::Deflate,
        // An ISIZE of zero is indistinguishable from "unknown" (it wraps
        // at 4 GiB anyway), so treat it like the size-free formats.
        file_size: (declared != 0).then_some(declared),
        comp_size: file_len - 8 - pos as u64,
        data_offset: pos as u64,
    })
}

fn skip_cstr(hdr: &[u8], hdr_len: usize, mut pos: usize) -> Result<usize, FormatError> {
    while pos < hdr_len {
        pos += 1;
        if hdr[pos - 1] == 0 {
            return Ok(pos);
        }
    }
    Err(FormatError::CorruptArchive)
}

/// zip, single local file header. Fixed offsets: flags at +6, method at
/// +8, compressed size LE32 at +18, uncompressed LE32 at +22, name
/// length at +26, extra length at +28. Data begins after name + extra.
fn sniff_zip(hdr: &[u8], hdr_len: usize) -> Result<Sniffed, SourceError> {
    if hdr_len < ZIP_LOCAL_HEADER_LEN {
        return Err(FormatError::CorruptArchive.into());
    }

    let flags = u16::from_le_bytes([hdr[6], hdr[7]]);
    // Bit 0: entry encrypted. Bit 6: strong encryption.
    if flags & 0x0001 != 0 || flags & 0x0040 != 0 {
        return Err(FormatError::EncryptedZip.into());
    }

    let method = u16::from_le_bytes([hdr[8], hdr[9]]);
    let format = match method {
        0 => ImageFormat::Plain,
        8 => ImageFormat::Deflate,
        12 => ImageFormat::Bzip2,
        other => return Err(FormatError::UnsupportedZipMethod(other).into()),
    };

    let name_len = u16::from_le_bytes([hdr[26], hdr[27]]) as usize;
    let extra_len = u16::from_le_bytes([hdr[28], hdr[29]]) as usize;
    let data_offset = (ZIP_LOCAL_HEADER_LEN + name_len + extra_len) as u64;

    let (comp_size, file_size) = if hdr[18..26] != [0xff; 8] {
        (
            u32::from_le_bytes(hdr[18..22].try_into().unwrap()) as u64,
            u32::from_le_bytes(hdr[22..26].try_into().unwrap()) as u64,
        )
    } else {
        debug!("zip64 size fields, scanning extra records");
        scan_zip64_extra(hdr, hdr_len, name_len, extra_len)?
    };

    Ok(Sniffed {
        format,
        file_size: Some(file_size),
        comp_size,
        data_offset,
    })
}

/// Walks the extra-field records after the file name looking for the
/// zip64 extended-information tag (0x0001): uncompressed size first,
/// then compressed size, each LE64. Record lengths come from the file,
/// so every step is bounds-checked.
fn scan_zip64_extra(
    hdr: &[u8],
    hdr_len: usize,
    name_len: usize,
    extra_len: usize,
) -> Result<(u64, u64), FormatError> {
    let start = ZIP_LOCAL_HEADER_LEN + name_len;
    let end = start
        .checked_add(extra_len)
        .filter(|&e| e <= hdr_len)
        .ok_or(FormatError::CorruptArchive)?;

    let mut pos = start;
    while pos + 4 <= end {
        let tag = u16::from_le_bytes([hdr[pos], hdr[pos + 1]]);
        let size = u16::from_le_bytes([hdr[pos + 2], hdr[pos + 3]]) as usize;
        let body = pos + 4;
        if body + size > end {
            return Err(FormatError::CorruptArchive);
        }
        if tag == 0x0001 {
            if size < 16 {
                return Err(FormatError::CorruptArchive);
            }
            let file_size = u64::from_le_bytes(hdr[body..body + 8].try_into().unwrap());
            let comp_size = u64::from_le_bytes(hdr[body + 8..body + 16].try_into().unwrap());
            if file_size == 0 || comp_size == 0 {
                return Err(FormatError::CorruptArchive);
            }
            return Ok((comp_size, file_size));
        }
        pos = body + size;
    }
    Err(FormatError::CorruptArchive)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    fn sniff_bytes(data: &[u8]) -> Result<(Sniffed, u64), SourceError> {
        let mut cur = Cursor::new(data.to_vec());
        let sniffed = sniff(&mut cur, data.len() as u64)?;
        Ok((sniffed, cur.position()))
    }

    fn zip_local_header(
        flags: u16,
        method: u16,
        comp_size: u32,
        file_size: u32,
        name: &[u8],
        extra: &[u8],
    ) -> Vec<u8> {
        let mut v = Vec::new();
        v.extend_from_slice(b"PK\x03\x04");
        v.extend_from_slice(&20u16.to_le_bytes()); // version needed
        v.extend_from_slice(&flags.to_le_bytes());
        v.extend_from_slice(&method.to_le_bytes());
        v.extend_from_slice(&[0u8; 4]); // time + date
        v.extend_from_slice(&[0u8; 4]); // crc32
        v.extend_from_slice(&comp_size.to_le_bytes());
        v.extend_from_slice(&file_size.to_le_bytes());
        v.extend_from_slice(&(name.len() as u16).to_le_bytes());
        v.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        v.extend_from_slice(name);
        v.extend_from_slice(extra);
        v
    }

    #[test]
    fn detects_gzip_and_reads_trailer_size() {
        let payload = vec![0xabu8; 5000];
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&payload).unwrap();
        let data = enc.finish().unwrap();

        let (s, pos) = sniff_bytes(&data).unwrap();
        assert_eq!(s.format, ImageFormat::Deflate);
        assert_eq!(s.file_size, Some(5000));
        assert_eq!(s.data_offset, pos);
        assert_eq!(s.comp_size, data.len() as u64 - 8 - s.data_offset);
    }

    #[test]
    fn gzip_header_with_fname_is_skipped() {
        // Minimal gzip with FNAME set: deflate of empty input, hand-built.
        let mut data = vec![0x1f, 0x8b, 0x08, 0x08, 0, 0, 0, 0, 0, 0xff];
        data.extend_from_slice(b"disk.img\0");
        let body_start = data.len() as u64;
        data.extend_from_slice(&[0x03, 0x00]); // empty deflate stream
        data.extend_from_slice(&[0u8; 4]); // crc
        data.extend_from_slice(&1024u32.to_le_bytes()); // isize

        let (s, pos) = sniff_bytes(&data).unwrap();
        assert_eq!(s.data_offset, body_start);
        assert_eq!(pos, body_start);
        assert_eq!(s.file_size, Some(1024));
    }

    #[test]
    fn detects_bzip2_and_xz_with_unknown_size() {
        let bz = b"BZh91AY&SYtrailing-junk".to_vec();
        let (s, pos) = sniff_bytes(&bz).unwrap();
        assert_eq!(s.format, ImageFormat::Bzip2);
        assert_eq!(s.file_size, None);
        assert_eq!(s.comp_size, bz.len() as u64);
        assert_eq!(pos, 0);

        let mut xz = b"\xfd7zXZ\x00".to_vec();
        xz.extend_from_slice(&[0u8; 20]);
        let (s, pos) = sniff_bytes(&xz).unwrap();
        assert_eq!(s.format, ImageFormat::Xz);
        assert_eq!(s.file_size, None);
        assert_eq!(pos, 0);
    }

    #[test]
    fn zip_stored_entry_uses_fixed_offsets() {
        let mut data = zip_local_header(0, 0, 600, 600, b"img", &[]);
        data.extend_from_slice(&vec![7u8; 600]);

        let (s, pos) = sniff_bytes(&data).unwrap();
        assert_eq!(s.format, ImageFormat::Plain);
        assert_eq!(s.comp_size, 600);
        assert_eq!(s.file_size, Some(600));
        assert_eq!(pos, 33);
    }

    #[test]
    fn zip_method_maps_to_formats() {
        let deflated = zip_local_header(0, 8, 10, 20, b"a", &[]);
        assert_eq!(
            sniff_bytes(&deflated).unwrap().0.format,
            ImageFormat::Deflate
        );

        let bzipped = zip_local_header(0, 12, 10, 20, b"a", &[]);
        assert_eq!(sniff_bytes(&bzipped).unwrap().0.format, ImageFormat::Bzip2);
    }

    #[test]
    fn encrypted_zip_is_rejected() {
        let data = zip_local_header(0x0001, 8, 10, 20, b"a", &[]);
        assert!(matches!(
            sniff_bytes(&data),
            Err(SourceError::Format(FormatError::EncryptedZip))
        ));

        let strong = zip_local_header(0x0040, 8, 10, 20, b"a", &[]);
        assert!(matches!(
            sniff_bytes(&strong),
            Err(SourceError::Format(FormatError::EncryptedZip))
        ));
    }

    #[test]
    fn unsupported_zip_method_is_rejected() {
        let data = zip_local_header(0, 99, 10, 20, b"a", &[]);
        assert!(matches!(
            sniff_bytes(&data),
            Err(SourceError::Format(FormatError::UnsupportedZipMethod(99)))
        ));
    }

    #[test]
    fn zip64_sizes_come_from_the_extra_record() {
        let mut extra = Vec::new();
        // An unrelated record first, to exercise the walk.
        extra.extend_from_slice(&0x7875u16.to_le_bytes());
        extra.extend_from_slice(&2u16.to_le_bytes());
        extra.extend_from_slice(&[1, 2]);
        // zip64 extended information: uncompressed then compressed, LE64.
        extra.extend_from_slice(&0x0001u16.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&0x1_0000_0000u64.to_le_bytes());
        extra.extend_from_slice(&0x0_8000_0000u64.to_le_bytes());

        let data = zip_local_header(0, 8, 0xffff_ffff, 0xffff_ffff, b"big", &extra);
        let (s, pos) = sniff_bytes(&data).unwrap();
        assert_eq!(s.file_size, Some(0x1_0000_0000));
        assert_eq!(s.comp_size, 0x0_8000_0000);
        assert_eq!(pos, (30 + 3 + extra.len()) as u64);
    }

    #[test]
    fn missing_or_malformed_zip64_record_is_corrupt() {
        // Both 32-bit fields saturated but no zip64 record at all.
        let data = zip_local_header(0, 8, 0xffff_ffff, 0xffff_ffff, b"big", &[]);
        assert!(matches!(
            sniff_bytes(&data),
            Err(SourceError::Format(FormatError::CorruptArchive))
        ));

        // A record whose declared length overruns the extra area.
        let mut extra = Vec::new();
        extra.extend_from_slice(&0x0001u16.to_le_bytes());
        extra.extend_from_slice(&200u16.to_le_bytes());
        extra.extend_from_slice(&[0u8; 4]);
        let data = zip_local_header(0, 8, 0xffff_ffff, 0xffff_ffff, b"big", &extra);
        assert!(matches!(
            sniff_bytes(&data),
            Err(SourceError::Format(FormatError::CorruptArchive))
        ));
    }

    #[test]
    fn seven_zip_fails_fast() {
        let data = b"7z\xbc\xaf\x27\x1c junk".to_vec();
        assert!(matches!(
            sniff_bytes(&data),
            Err(SourceError::Format(FormatError::Unsupported7z))
        ));
    }

    #[test]
    fn anything_else_is_a_plain_image() {
        let data = vec![0x42u8; 4096];
        let (s, pos) = sniff_bytes(&data).unwrap();
        assert_eq!(s.format, ImageFormat::Plain);
        assert_eq!(s.file_size, Some(4096));
        assert_eq!(s.comp_size, 0);
        assert_eq!(pos, 0);
    }

    #[test]
    fn empty_source_is_refused() {
        assert!(matches!(sniff_bytes(&[]), Err(SourceError::Empty)));
    }
}
