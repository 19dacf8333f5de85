//! ttyrec recording container.
//!
//! A recording is one file: a fixed 40-byte header, the (optionally gzipped)
//! terminal output, then a flat array of `(time, offset)` timing records.
//! The header is written twice, a zeroed placeholder at creation and the
//! final offsets once both streams are complete, so the file is seekable
//! without a trailing index.

pub mod format;
pub mod recorder;
pub mod replayer;

pub use format::{
    load, save, AuditReader, Compression, Header, Recording, SectionReader, Timing, HEADER_SIZE,
    MAGIC, TIMING_SIZE, VERSION,
};
pub use recorder::{Recorder, RecorderHandle, RecorderOptions, DEFAULT_PRECISION_MS};
pub use replayer::{Frame, Replayer, DEFAULT_SPEED};
