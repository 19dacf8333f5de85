//! Playback of recordings.
//!
//! Frame `i` is the span of output between timing entries `i - 1` and `i`
//! (frame 0 starts at offset 0), paired with the recorded pause between those
//! entries scaled by the playback speed.

use super::format::{load, Recording, Timing};
use crate::error::{WebshellError, WebshellResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Default playback speed (twice real time).
pub const DEFAULT_SPEED: i64 = 2;

/// One span of recorded output and the pause that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub delay: Duration,
}

/// Plays a loaded recording.
pub struct Replayer<R = File> {
    recording: Recording<R>,
    speed: i64,
}

impl Replayer<File> {
    /// Open and load a recording file.
    pub fn open(path: impl AsRef<Path>) -> WebshellResult<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(load(file)?))
    }
}

impl<R: Read + Seek> Replayer<R> {
    pub fn new(recording: Recording<R>) -> Self {
        Self {
            recording,
            speed: DEFAULT_SPEED,
        }
    }

    pub fn recording(&self) -> &Recording<R> {
        &self.recording
    }

    pub fn speed(&self) -> i64 {
        self.speed
    }

    /// Positive values speed playback up, negative values slow it down by
    /// that factor, zero removes all pauses.
    pub fn set_speed(&mut self, speed: i64) {
        self.speed = speed;
    }

    /// Number of frames, including the final span up to the end of the stream.
    pub fn frame_count(&self) -> usize {
        self.recording.timings.len()
    }

    /// Scale a recorded pause by the playback speed.
    pub fn scale(&self, delta_ms: i64) -> Duration {
        if delta_ms <= 0 {
            return Duration::ZERO;
        }
        let ms = match self.speed {
            0 => 0,
            s if s > 0 => delta_ms / s,
            s => delta_ms.saturating_mul(s.saturating_abs()),
        };
        Duration::from_millis(ms as u64)
    }

    /// Read frame `index` without replaying anything before it.
    pub fn frame(&mut self, index: usize) -> WebshellResult<Frame> {
        let count = self.frame_count();
        let end = *self
            .recording
            .timings
            .get(index)
            .ok_or(WebshellError::InvalidFrame { index, count })?;
        let start = match index {
            0 => Timing {
                time: end.time,
                offset: 0,
            },
            i => self.recording.timings[i - 1],
        };

        let size = (end.offset - start.offset).max(0) as usize;
        let mut data = vec![0u8; size];
        self.recording
            .audit
            .seek(SeekFrom::Start(start.offset as u64))?;
        self.recording.audit.read_exact(&mut data)?;

        Ok(Frame {
            data,
            delay: self.scale(end.time - start.time),
        })
    }

    /// Play the whole recording into `w`, pausing between frames.
    pub fn play<W: Write>(&mut self, w: &mut W) -> WebshellResult<()> {
        debug!(frames = self.frame_count(), speed = self.speed, "starting replay");
        for index in 0..self.frame_count() {
            self.play_frame(w, index, true)?;
        }
        debug!("end of replay");
        Ok(())
    }

    /// Write a single frame into `w`, optionally followed by its pause.
    pub fn play_frame<W: Write>(&mut self, w: &mut W, index: usize, with_delay: bool) -> WebshellResult<()> {
        let frame = self.frame(index)?;
        w.write_all(&frame.data)?;
        w.flush()?;
        if with_delay && !frame.delay.is_zero() {
            std::thread::sleep(frame.delay);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttyrec::format::save;
    use std::io::Cursor;

    fn replayer(audit: &[u8], timings: &[Timing]) -> Replayer<Cursor<Vec<u8>>> {
        let mut out = Cursor::new(Vec::new());
        save(&mut out, &mut &audit[..], timings).unwrap();
        Replayer::new(load(out).unwrap())
    }

    fn sample() -> Replayer<Cursor<Vec<u8>>> {
        replayer(
            b"$ ls\r\nfoo bar\r\n$ ",
            &[
                Timing { time: 1_000, offset: 0 },
                Timing { time: 1_040, offset: 6 },
                Timing { time: 1_100, offset: 15 },
            ],
        )
    }

    #[test]
    fn play_writes_everything_in_order() {
        let mut r = sample();
        r.set_speed(0);
        let mut out = Vec::new();
        r.play(&mut out).unwrap();
        assert_eq!(out, b"$ ls\r\nfoo bar\r\n$ ");
    }

    #[test]
    fn frames_are_random_access() {
        let mut r = sample();
        r.set_speed(1);
        assert_eq!(r.frame_count(), 4);

        let f = r.frame(2).unwrap();
        assert_eq!(f.data, b"foo bar\r\n");
        assert_eq!(f.delay, Duration::from_millis(60));

        let f = r.frame(0).unwrap();
        assert!(f.data.is_empty());
        assert_eq!(f.delay, Duration::ZERO);

        // The sentinel frame carries the tail of the stream.
        let f = r.frame(3).unwrap();
        assert_eq!(f.data, b"$ ");
        assert_eq!(f.delay, Duration::ZERO);
    }

    #[test]
    fn play_frame_without_delay() {
        let mut r = sample();
        r.set_speed(-1000);
        let mut out = Vec::new();
        r.play_frame(&mut out, 1, false).unwrap();
        assert_eq!(out, b"$ ls\r\n");
    }

    #[test]
    fn invalid_frame_index() {
        let mut r = sample();
        let mut out = Vec::new();
        match r.play_frame(&mut out, 9, false) {
            Err(WebshellError::InvalidFrame { index: 9, count: 4 }) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn speed_scaling() {
        let mut r = sample();
        r.set_speed(2);
        assert_eq!(r.scale(100), Duration::from_millis(50));
        r.set_speed(-3);
        assert_eq!(r.scale(100), Duration::from_millis(300));
        r.set_speed(0);
        assert_eq!(r.scale(100), Duration::ZERO);
        r.set_speed(1);
        assert_eq!(r.scale(-5), Duration::ZERO);
    }

    #[test]
    fn write_failure_aborts_playback() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let mut r = sample();
        r.set_speed(0);
        assert!(matches!(r.play(&mut Broken), Err(WebshellError::Io(_))));
    }
}
