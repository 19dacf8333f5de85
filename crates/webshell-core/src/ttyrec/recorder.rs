//! Streaming recorder.
//!
//! Appends terminal output to the audit stream of a container file and keeps
//! a sparse timing index in memory. `save` finalizes the stream, appends the
//! index and rewrites the header.

use super::format::{encode_timings, Compression, Header, Timing, HEADER_SIZE};
use crate::error::{WebshellError, WebshellResult};
use flate2::write::GzEncoder;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Default minimum interval between timing samples.
pub const DEFAULT_PRECISION_MS: i64 = 100;

/// Recorder settings.
#[derive(Debug, Clone, Copy)]
pub struct RecorderOptions {
    /// Gzip the audit stream.
    pub compress: bool,
    /// Minimum milliseconds between timing samples. Negative samples every write.
    pub precision_ms: i64,
}

impl Default for RecorderOptions {
    fn default() -> Self {
        Self {
            compress: true,
            precision_ms: DEFAULT_PRECISION_MS,
        }
    }
}

/// Counts bytes as they reach the file, after any compression.
struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum AuditWriter {
    Plain(CountingWriter<BufWriter<File>>),
    Gzip(GzEncoder<CountingWriter<BufWriter<File>>>),
}

impl AuditWriter {
    fn new(file: File, compression: Compression) -> Self {
        let counting = CountingWriter {
            inner: BufWriter::new(file),
            count: 0,
        };
        match compression {
            Compression::None => AuditWriter::Plain(counting),
            Compression::Gzip => {
                AuditWriter::Gzip(GzEncoder::new(counting, flate2::Compression::default()))
            }
        }
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            AuditWriter::Plain(w) => w.write_all(buf),
            AuditWriter::Gzip(w) => w.write_all(buf),
        }
    }

    /// Flush the stream and return the file plus the stored audit length.
    fn finish(self) -> io::Result<(File, u64)> {
        let counting = match self {
            AuditWriter::Plain(w) => w,
            AuditWriter::Gzip(w) => w.finish()?,
        };
        let stored = counting.count;
        let file = counting.inner.into_inner().map_err(|e| e.into_error())?;
        Ok((file, stored))
    }
}

struct RecorderState {
    writer: Option<AuditWriter>,
    timings: Vec<Timing>,
    last_sample: Option<i64>,
    audit_size: i64,
}

/// Records terminal output into a ttyrec container.
pub struct Recorder {
    path: PathBuf,
    compression: Compression,
    precision_ms: i64,
    /// Cleared before finalization starts; checked by every write.
    enabled: AtomicBool,
    state: Mutex<RecorderState>,
}

impl Recorder {
    /// Create the container file and reserve its header. Fails if `path`
    /// already exists so an earlier recording is never truncated.
    pub fn create(path: impl AsRef<Path>, options: RecorderOptions) -> WebshellResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&Header::placeholder())?;

        let compression = if options.compress {
            Compression::Gzip
        } else {
            Compression::None
        };

        debug!(path = %path.display(), ?compression, "recorder created");

        Ok(Self {
            path,
            compression,
            precision_ms: options.precision_ms,
            enabled: AtomicBool::new(true),
            state: Mutex::new(RecorderState {
                writer: Some(AuditWriter::new(file, compression)),
                timings: Vec::new(),
                last_sample: None,
                audit_size: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total uncompressed bytes recorded so far.
    pub fn bytes_recorded(&self) -> u64 {
        self.state
            .lock()
            .map(|s| s.audit_size as u64)
            .unwrap_or_default()
    }

    /// Append output to the audit stream. Returns `Ok(0)` once saving has begun.
    pub fn write(&self, buf: &[u8]) -> WebshellResult<usize> {
        self.record_at(buf, now_millis())
    }

    fn record_at(&self, buf: &[u8], now: i64) -> WebshellResult<usize> {
        if !self.enabled.load(Ordering::Acquire) {
            return Ok(0);
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| WebshellError::Other("recorder lock poisoned".into()))?;
        let state = &mut *state;
        let Some(writer) = state.writer.as_mut() else {
            return Ok(0);
        };
        writer.write_all(buf)?;

        // Timings must stay monotonic even if the wall clock steps back.
        let now = state.timings.last().map_or(now, |t| now.max(t.time));
        let last = *state.last_sample.get_or_insert(now);
        if now - last >= self.precision_ms {
            state.last_sample = Some(now);
            state.timings.push(Timing {
                time: now,
                offset: state.audit_size,
            });
        }

        state.audit_size += buf.len() as i64;
        Ok(buf.len())
    }

    /// Finalize the container. Safe to call from any thread and more than once;
    /// only the first call does any work.
    pub fn save(&self) -> WebshellResult<()> {
        self.enabled.store(false, Ordering::Release);

        let mut state = self
            .state
            .lock()
            .map_err(|_| WebshellError::Other("recorder lock poisoned".into()))?;
        let Some(writer) = state.writer.take() else {
            return Ok(());
        };

        let (mut file, stored) = writer.finish()?;

        let encoded = encode_timings(&state.timings);
        file.seek(SeekFrom::End(0))?;
        file.write_all(&encoded)?;

        let mut header = Header::new(self.compression);
        header.audit_offset = HEADER_SIZE;
        header.audit_length = stored as i64;
        header.timing_offset = HEADER_SIZE + stored as i64;
        header.timing_length = encoded.len() as i64;

        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode())?;
        file.sync_all()?;

        info!(
            path = %self.path.display(),
            bytes = state.audit_size,
            stored,
            timings = state.timings.len(),
            "recording saved"
        );
        Ok(())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// The recorder attached to a session: a working recorder or the null object.
#[derive(Clone, Default)]
pub enum RecorderHandle {
    Active(Arc<Recorder>),
    #[default]
    Disabled,
}

impl RecorderHandle {
    pub fn new(recorder: Recorder) -> Self {
        RecorderHandle::Active(Arc::new(recorder))
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RecorderHandle::Active(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            RecorderHandle::Active(r) => Some(r.path()),
            RecorderHandle::Disabled => None,
        }
    }

    /// Uncompressed bytes recorded so far; zero when disabled.
    pub fn bytes_recorded(&self) -> u64 {
        match self {
            RecorderHandle::Active(r) => r.bytes_recorded(),
            RecorderHandle::Disabled => 0,
        }
    }

    pub fn write(&self, buf: &[u8]) -> WebshellResult<usize> {
        match self {
            RecorderHandle::Active(r) => r.write(buf),
            RecorderHandle::Disabled => Ok(buf.len()),
        }
    }

    pub fn save(&self) -> WebshellResult<()> {
        match self {
            RecorderHandle::Active(r) => r.save(),
            RecorderHandle::Disabled => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttyrec::format::load;
    use std::io::Read;

    const TEST_DATA: &[u8] = b"test data 111 2222 4444 11111111111111111111111111111111111111111111111111111111111111111111111111111111111";

    fn record(options: RecorderOptions) -> (tempfile::TempDir, PathBuf, Recorder) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.ttyrec");
        let recorder = Recorder::create(&path, options).unwrap();
        (dir, path, recorder)
    }

    #[test]
    fn every_write_sampled_with_negative_precision() {
        let (_dir, path, rec) = record(RecorderOptions {
            compress: true,
            precision_ms: -1,
        });
        rec.write(&TEST_DATA[..25]).unwrap();
        rec.write(&TEST_DATA[25..]).unwrap();
        rec.save().unwrap();

        let mut loaded = load(File::open(&path).unwrap()).unwrap();
        assert_eq!(loaded.header.audit_offset, HEADER_SIZE);
        assert_eq!(loaded.header.audit_compression, Compression::Gzip);

        let mut audit = Vec::new();
        loaded.audit.read_to_end(&mut audit).unwrap();
        assert_eq!(audit, TEST_DATA);

        // One timing per write plus the end-of-stream sentinel.
        assert_eq!(loaded.timings.len(), 3);
        assert_eq!(loaded.timings[0].offset, 0);
        assert_eq!(loaded.timings[1].offset, 25);
        assert_eq!(loaded.timings[2].offset, TEST_DATA.len() as i64);
    }

    #[test]
    fn uncompressed_round_trip() {
        let (_dir, path, rec) = record(RecorderOptions {
            compress: false,
            precision_ms: -1,
        });
        rec.write(b"hello ").unwrap();
        rec.write(b"world").unwrap();
        rec.save().unwrap();

        let mut loaded = load(File::open(&path).unwrap()).unwrap();
        assert_eq!(loaded.header.audit_length, 11);
        assert_eq!(loaded.header.timing_offset, HEADER_SIZE + 11);

        let mut audit = Vec::new();
        loaded.audit.read_to_end(&mut audit).unwrap();
        assert_eq!(audit, b"hello world");
    }

    #[test]
    fn sparse_sampling_with_default_precision() {
        let (_dir, path, rec) = record(RecorderOptions::default());
        for _ in 0..50 {
            rec.write(b"x").unwrap();
        }
        rec.save().unwrap();

        let loaded = load(File::open(&path).unwrap()).unwrap();
        // Back-to-back writes fall inside one sampling interval.
        assert!(loaded.timings.len() < 50);
        assert_eq!(loaded.timings.last().unwrap().offset, 50);
        for pair in loaded.timings.windows(2) {
            assert!(pair[0].offset <= pair[1].offset);
            assert!(pair[0].time <= pair[1].time);
        }
    }

    #[test]
    fn writes_after_save_are_dropped() {
        let (_dir, path, rec) = record(RecorderOptions {
            compress: false,
            precision_ms: -1,
        });
        rec.write(b"kept").unwrap();
        rec.save().unwrap();
        assert_eq!(rec.write(b"dropped").unwrap(), 0);
        rec.save().unwrap();

        let mut loaded = load(File::open(&path).unwrap()).unwrap();
        let mut audit = Vec::new();
        loaded.audit.read_to_end(&mut audit).unwrap();
        assert_eq!(audit, b"kept");
        assert_eq!(rec.bytes_recorded(), 4);
    }

    #[test]
    fn save_from_another_thread() {
        let (_dir, path, rec) = record(RecorderOptions {
            compress: true,
            precision_ms: -1,
        });
        let rec = Arc::new(rec);
        rec.write(b"abc").unwrap();

        let saver = {
            let rec = rec.clone();
            std::thread::spawn(move || rec.save())
        };
        saver.join().unwrap().unwrap();

        let loaded = load(File::open(&path).unwrap()).unwrap();
        assert_eq!(loaded.audit_len(), 3);
    }

    #[test]
    fn disabled_handle_swallows_writes() {
        let handle = RecorderHandle::default();
        assert!(!handle.is_active());
        assert_eq!(handle.write(b"abc").unwrap(), 3);
        assert!(handle.save().is_ok());
        assert!(handle.path().is_none());
        assert_eq!(handle.bytes_recorded(), 0);
    }

    #[test]
    fn create_refuses_to_truncate_existing_recording() {
        let (_dir, path, rec) = record(RecorderOptions {
            compress: false,
            precision_ms: -1,
        });
        rec.write(b"first").unwrap();
        rec.save().unwrap();

        assert!(Recorder::create(&path, RecorderOptions::default()).is_err());
        assert_eq!(load(File::open(&path).unwrap()).unwrap().audit_len(), 5);
    }

    #[test]
    fn clock_stepping_backwards_keeps_timings_ordered() {
        let (_dir, path, rec) = record(RecorderOptions {
            compress: false,
            precision_ms: -1,
        });
        rec.record_at(b"one", 5_000).unwrap();
        rec.record_at(b"two", 4_000).unwrap();
        rec.record_at(b"three", 4_500).unwrap();
        rec.save().unwrap();

        let loaded = load(File::open(&path).unwrap()).unwrap();
        let times: Vec<i64> = loaded.timings.iter().map(|t| t.time).collect();
        assert_eq!(times, vec![5_000, 5_000, 5_000, 5_000]);
        assert_eq!(loaded.audit_len(), 11);
    }
}
