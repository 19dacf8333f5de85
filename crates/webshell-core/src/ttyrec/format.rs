//! On-disk layout of a recording.
//!
//! ```text
//! offset  size  field
//! 0       4     magic (0xDC3443CD, little-endian)
//! 4       1     version
//! 5       1     audit compression (0 none, 1 gzip)
//! 6       1     timing compression (0)
//! 7       1     flags (reserved)
//! 8       8     audit offset
//! 16      8     audit length (stored bytes)
//! 24      8     timing offset
//! 32      8     timing length (bytes)
//! 40      ..    audit bytes, then timing records of (time i64, offset i64)
//! ```

use crate::error::{WebshellError, WebshellResult};
use flate2::read::GzDecoder;
use serde::Serialize;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

pub const MAGIC: u32 = 0xDC34_43CD;
pub const VERSION: u8 = 0x01;

/// Encoded header size in bytes.
pub const HEADER_SIZE: i64 = 40;

/// Encoded size of one timing record in bytes.
pub const TIMING_SIZE: i64 = 16;

/// Upper bound on the decoded size of a gzip audit stream (1 GiB).
pub const MAX_DECODED_AUDIT: u64 = 1 << 30;

/// Compression applied to a stream inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

impl Compression {
    pub fn flag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
        }
    }

    pub fn from_flag(flag: u8) -> WebshellResult<Self> {
        match flag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(WebshellError::UnsupportedCompression(other)),
        }
    }
}

/// Fixed-size container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub magic: u32,
    pub version: u8,
    pub audit_compression: Compression,
    pub timing_compression: Compression,
    pub flags: u8,
    pub audit_offset: i64,
    pub audit_length: i64,
    pub timing_offset: i64,
    pub timing_length: i64,
}

impl Header {
    /// A header for the current format version with empty streams.
    pub fn new(audit_compression: Compression) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            audit_compression,
            timing_compression: Compression::None,
            flags: 0,
            audit_offset: 0,
            audit_length: 0,
            timing_offset: 0,
            timing_length: 0,
        }
    }

    /// The zeroed block reserved at the start of a new recording.
    pub fn placeholder() -> [u8; HEADER_SIZE as usize] {
        [0u8; HEADER_SIZE as usize]
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4] = self.version;
        buf[5] = self.audit_compression.flag();
        buf[6] = self.timing_compression.flag();
        buf[7] = self.flags;
        buf[8..16].copy_from_slice(&self.audit_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.audit_length.to_le_bytes());
        buf[24..32].copy_from_slice(&self.timing_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.timing_length.to_le_bytes());
        buf
    }

    /// Read and validate a header. A bad magic or version is a hard error.
    pub fn read_from<R: Read>(r: &mut R) -> WebshellResult<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        r.read_exact(&mut buf)?;

        let magic = u32::from_le_bytes(le_array(&buf[0..4]));
        if magic != MAGIC {
            return Err(WebshellError::InvalidMagic(magic));
        }
        if buf[4] != VERSION {
            return Err(WebshellError::UnsupportedVersion(buf[4]));
        }

        Ok(Self {
            magic,
            version: buf[4],
            audit_compression: Compression::from_flag(buf[5])?,
            timing_compression: Compression::from_flag(buf[6])?,
            flags: buf[7],
            audit_offset: i64::from_le_bytes(le_array(&buf[8..16])),
            audit_length: i64::from_le_bytes(le_array(&buf[16..24])),
            timing_offset: i64::from_le_bytes(le_array(&buf[24..32])),
            timing_length: i64::from_le_bytes(le_array(&buf[32..40])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// A point in the output stream: `offset` bytes had been written at `time`
/// (unix milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Timing {
    pub time: i64,
    pub offset: i64,
}

/// Encode timing records as a flat little-endian array.
pub fn encode_timings(timings: &[Timing]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(timings.len() * TIMING_SIZE as usize);
    for t in timings {
        buf.extend_from_slice(&t.time.to_le_bytes());
        buf.extend_from_slice(&t.offset.to_le_bytes());
    }
    buf
}

/// Decode a flat timing array. The length must be a whole number of records.
pub fn decode_timings(bytes: &[u8]) -> WebshellResult<Vec<Timing>> {
    if bytes.len() % TIMING_SIZE as usize != 0 {
        return Err(WebshellError::CorruptTimings(format!(
            "timing span of {} bytes is not a multiple of {TIMING_SIZE}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(TIMING_SIZE as usize)
        .map(|rec| Timing {
            time: i64::from_le_bytes(le_array(&rec[0..8])),
            offset: i64::from_le_bytes(le_array(&rec[8..16])),
        })
        .collect())
}

/// Read/seek view over a byte range of an underlying reader.
#[derive(Debug)]
pub struct SectionReader<R> {
    inner: R,
    start: u64,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> SectionReader<R> {
    pub fn new(inner: R, start: u64, len: u64) -> Self {
        Self {
            inner,
            start,
            len,
            pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<R: Read + Seek> Read for SectionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let want = (self.len - self.pos).min(buf.len() as u64) as usize;
        self.inner.seek(SeekFrom::Start(self.start + self.pos))?;
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SectionReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(d) => self.len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match target {
            Some(n) => {
                self.pos = n;
                Ok(n)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of section",
            )),
        }
    }
}

/// The decoded output stream of a recording.
///
/// Uncompressed recordings are read in place; gzip streams are decoded into
/// memory once at load time so timing offsets can be seeked directly.
#[derive(Debug)]
pub enum AuditReader<R> {
    Raw(SectionReader<R>),
    Decoded(Cursor<Vec<u8>>),
}

impl<R: Read + Seek> AuditReader<R> {
    /// Length of the decoded output stream.
    pub fn len(&self) -> u64 {
        match self {
            AuditReader::Raw(section) => section.len(),
            AuditReader::Decoded(cursor) => cursor.get_ref().len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R: Read + Seek> Read for AuditReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            AuditReader::Raw(section) => section.read(buf),
            AuditReader::Decoded(cursor) => cursor.read(buf),
        }
    }
}

impl<R: Read + Seek> Seek for AuditReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            AuditReader::Raw(section) => section.seek(pos),
            AuditReader::Decoded(cursor) => cursor.seek(pos),
        }
    }
}

/// A loaded recording.
#[derive(Debug)]
pub struct Recording<R> {
    pub header: Header,
    pub audit: AuditReader<R>,
    /// Recorded samples plus a trailing sentinel at the end of the stream.
    pub timings: Vec<Timing>,
}

impl<R: Read + Seek> Recording<R> {
    /// Length of the decoded output stream.
    pub fn audit_len(&self) -> u64 {
        self.audit.len()
    }

    /// Milliseconds between the first and last timing entries.
    pub fn duration_ms(&self) -> i64 {
        match (self.timings.first(), self.timings.last()) {
            (Some(first), Some(last)) => last.time - first.time,
            _ => 0,
        }
    }
}

/// Load a recording, validating the header and the timing index.
pub fn load<R: Read + Seek>(mut r: R) -> WebshellResult<Recording<R>> {
    let file_len = r.seek(SeekFrom::End(0))?;
    r.seek(SeekFrom::Start(0))?;
    let header = Header::read_from(&mut r)?;

    let mut timings = if header.timing_offset > 0 && header.timing_length > 0 {
        let (start, len) = span(header.timing_offset, header.timing_length, file_len)
            .map_err(WebshellError::CorruptTimings)?;
        let mut raw = vec![0u8; len as usize];
        r.seek(SeekFrom::Start(start))?;
        r.read_exact(&mut raw)?;
        decode_timings(&raw)?
    } else {
        Vec::new()
    };

    let has_audit = header.audit_offset > 0 && header.audit_length > 0;
    let audit = if has_audit {
        let (start, len) = span(header.audit_offset, header.audit_length, file_len)
            .map_err(WebshellError::CorruptAudit)?;
        match header.audit_compression {
            Compression::None => AuditReader::Raw(SectionReader::new(r, start, len)),
            Compression::Gzip => {
                r.seek(SeekFrom::Start(start))?;
                let mut decoded = Vec::new();
                GzDecoder::new((&mut r).take(len))
                    .take(MAX_DECODED_AUDIT + 1)
                    .read_to_end(&mut decoded)?;
                if decoded.len() as u64 > MAX_DECODED_AUDIT {
                    return Err(WebshellError::CorruptAudit(format!(
                        "decoded stream exceeds {MAX_DECODED_AUDIT} bytes"
                    )));
                }
                AuditReader::Decoded(Cursor::new(decoded))
            }
        }
    } else {
        AuditReader::Decoded(Cursor::new(Vec::new()))
    };

    let audit_len = audit.len() as i64;
    validate_timings(&timings, audit_len)?;

    // Sentinel so every byte span has a bounding timing pair.
    let last_time = timings.last().map_or(0, |t| t.time);
    timings.push(Timing {
        time: last_time,
        offset: audit_len,
    });

    Ok(Recording {
        header,
        audit,
        timings,
    })
}

/// Check that `offset..offset + len` lies inside a file of `file_len` bytes.
fn span(offset: i64, len: i64, file_len: u64) -> Result<(u64, u64), String> {
    let (Ok(start), Ok(len)) = (u64::try_from(offset), u64::try_from(len)) else {
        return Err(format!("negative span {offset}+{len}"));
    };
    match start.checked_add(len) {
        Some(end) if end <= file_len => Ok((start, len)),
        _ => Err(format!("span {start}+{len} runs past end of file ({file_len} bytes)")),
    }
}

fn validate_timings(timings: &[Timing], audit_len: i64) -> WebshellResult<()> {
    for pair in timings.windows(2) {
        if pair[1].offset < pair[0].offset || pair[1].time < pair[0].time {
            return Err(WebshellError::CorruptTimings(format!(
                "timing entries out of order: {:?} then {:?}",
                pair[0], pair[1]
            )));
        }
    }
    if let Some(t) = timings.iter().find(|t| t.offset < 0 || t.offset > audit_len) {
        return Err(WebshellError::CorruptTimings(format!(
            "offset {} outside audit stream of {audit_len} bytes",
            t.offset
        )));
    }
    Ok(())
}

/// Write a complete uncompressed container from an audit stream and a timing
/// index. Returns the final header.
pub fn save<W, A>(dest: &mut W, audit: &mut A, timings: &[Timing]) -> WebshellResult<Header>
where
    W: Write + Seek,
    A: Read,
{
    dest.seek(SeekFrom::Start(0))?;
    dest.write_all(&Header::placeholder())?;

    let mut header = Header::new(Compression::None);
    header.audit_offset = HEADER_SIZE;
    header.audit_length = io::copy(audit, dest)? as i64;

    let encoded = encode_timings(timings);
    dest.write_all(&encoded)?;
    header.timing_offset = header.audit_offset + header.audit_length;
    header.timing_length = encoded.len() as i64;

    dest.seek(SeekFrom::Start(0))?;
    dest.write_all(&header.encode())?;
    dest.seek(SeekFrom::End(0))?;
    dest.flush()?;

    Ok(header)
}
