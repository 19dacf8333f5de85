//! Replay endpoint: streams a recording to the browser.
//!
//! Playback starts as soon as the socket opens. `PLAY` restarts it from the
//! first frame, `FRAME <n>` stops playback and renders frame `n` alone.

use crate::app::AppContext;
use crate::transport::{recv_frame, WsTransport};
use futures_util::StreamExt;
use std::io::{Read, Seek};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use webshell_core::protocol::{decode, Control, Inbound};
use webshell_core::ttyrec::{Frame, Replayer};
use webshell_core::{OutboundTransport, WebshellError, WebshellResult};

/// Status line for an out-of-range `FRAME` request.
pub const INVALID_FRAME: &str = "Invalid frame";

/// Sequential playback position over a replayer.
pub struct Playback<R> {
    replayer: Replayer<R>,
    next: Option<usize>,
}

impl<R: Read + Seek> Playback<R> {
    /// A playback positioned at the first frame.
    pub fn new(replayer: Replayer<R>) -> Self {
        Self {
            replayer,
            next: Some(0),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.next.is_some()
    }

    pub fn restart(&mut self) {
        self.next = Some(0);
    }

    pub fn stop(&mut self) {
        self.next = None;
    }

    /// Read the next frame and advance. `None` once playback has finished.
    pub fn step(&mut self) -> WebshellResult<Option<Frame>> {
        let Some(index) = self.next else {
            return Ok(None);
        };
        if index >= self.replayer.frame_count() {
            self.next = None;
            return Ok(None);
        }
        let frame = self.replayer.frame(index);
        self.next = frame.is_ok().then_some(index + 1);
        frame.map(Some)
    }

    /// Stop playback and read a single frame.
    pub fn seek(&mut self, index: usize) -> WebshellResult<Frame> {
        self.stop();
        self.replayer.frame(index)
    }
}

pub async fn serve_replay(app: Arc<AppContext>, ws: WebSocketStream<TcpStream>) {
    let (sink, mut stream) = ws.split();
    let mut transport = WsTransport::new(sink, app.activity.clone());

    let Some(path) = app.config.replay_file.clone() else {
        let _ = transport.close_with(CloseCode::Error, "replay not configured").await;
        return;
    };

    info!(path = %path.display(), "replaying session");
    let opened = tokio::task::spawn_blocking(move || Replayer::open(path))
        .await
        .map_err(|e| WebshellError::Other(format!("join error: {e}")))
        .and_then(|r| r);
    let mut replayer = match opened {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to load recording");
            let _ = transport.close_with(CloseCode::Error, "failed to load recording").await;
            return;
        }
    };
    replayer.set_speed(app.config.replay_speed);
    let mut playback = Playback::new(replayer);

    let wake = sleep_until(Instant::now());
    tokio::pin!(wake);

    loop {
        tokio::select! {
            _ = app.shutdown.cancelled() => break,
            _ = &mut wake, if playback.is_playing() => match playback.step() {
                Ok(Some(frame)) => {
                    if transport.send_data(frame.data).await.is_err() {
                        break;
                    }
                    wake.as_mut().reset(Instant::now() + frame.delay);
                }
                Ok(None) => debug!("end of replay"),
                Err(e) => {
                    error!(error = %e, "replay failed");
                    playback.stop();
                }
            },
            msg = recv_frame(&mut stream) => match msg {
                Ok(Some(msg)) => {
                    app.activity.ping();
                    match decode(&msg) {
                        Inbound::Control(Control::Play) => {
                            info!("restarting replay");
                            playback.restart();
                            wake.as_mut().reset(Instant::now());
                        }
                        Inbound::Control(Control::Frame(index)) => {
                            let sent = match playback.seek(index) {
                                Ok(frame) => transport.send_data(frame.data).await,
                                Err(e) => {
                                    warn!(index, error = %e, "frame request rejected");
                                    transport.send_status(INVALID_FRAME).await
                                }
                            };
                            if sent.is_err() {
                                break;
                            }
                        }
                        Inbound::Control(Control::Ping) | Inbound::Empty | Inbound::Data(_) => {}
                        Inbound::Control(other) => info!(payload = ?other, "unknown control payload"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "websocket closed");
                    break;
                }
            },
        }
    }

    let _ = transport.close().await;
    info!("stopping replay");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use webshell_core::ttyrec::{load, save, Timing};

    fn playback() -> Playback<Cursor<Vec<u8>>> {
        let mut out = Cursor::new(Vec::new());
        save(
            &mut out,
            &mut &b"one two three"[..],
            &[
                Timing { time: 0, offset: 0 },
                Timing { time: 100, offset: 4 },
                Timing { time: 300, offset: 8 },
            ],
        )
        .unwrap();
        let mut replayer = Replayer::new(load(out).unwrap());
        replayer.set_speed(1);
        Playback::new(replayer)
    }

    #[test]
    fn steps_through_every_frame() {
        let mut p = playback();
        let mut data = Vec::new();
        let mut delays = Vec::new();
        while let Some(frame) = p.step().unwrap() {
            data.extend(frame.data);
            delays.push(frame.delay);
        }
        assert_eq!(data, b"one two three");
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::ZERO
            ]
        );
        assert!(!p.is_playing());
    }

    #[test]
    fn restart_after_finish() {
        let mut p = playback();
        while p.step().unwrap().is_some() {}
        p.restart();
        assert!(p.is_playing());
        assert_eq!(p.step().unwrap().unwrap().data, b"");
        assert_eq!(p.step().unwrap().unwrap().data, b"one ");
    }

    #[test]
    fn seek_stops_playback() {
        let mut p = playback();
        assert_eq!(p.seek(2).unwrap().data, b"two ");
        assert!(!p.is_playing());
        assert!(p.step().unwrap().is_none());
        assert!(matches!(p.seek(10), Err(WebshellError::InvalidFrame { .. })));
    }
}
