//! Listener, WebSocket upgrade and the shell connection handler.

use crate::app::AppContext;
use crate::replay;
use crate::session::Session;
use crate::transport::websocket::EXPIRED;
use crate::transport::{recv_frame, WsTransport};
use futures_util::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};
use webshell_core::protocol::{decode, Control, Inbound, SESSION_FAILED};
use webshell_core::{WebshellError, WebshellResult};

/// Endpoints served over WebSocket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Shell,
    Replay,
}

/// Match a request path against `<prefix>/shell` and `<prefix>/replay`.
pub fn route(prefix: &str, replay_enabled: bool, path: &str) -> Option<Route> {
    match path.strip_prefix(prefix)? {
        "/shell" => Some(Route::Shell),
        "/replay" if replay_enabled => Some(Route::Replay),
        _ => None,
    }
}

/// Session key for a request: hex of its URI.
pub fn session_key(uri: &str) -> String {
    hex::encode(uri.as_bytes())
}

/// What a shell endpoint needs from its session.
pub trait Terminal {
    fn write_input(&self, data: &[u8]) -> io::Result<usize>;
    fn resize(&self, rows: u16, cols: u16) -> io::Result<()>;
}

impl Terminal for Session {
    fn write_input(&self, data: &[u8]) -> io::Result<usize> {
        self.write_to_tty(data)
    }

    fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
        Session::resize(self, rows, cols)
    }
}

/// Apply one inbound shell message. Malformed or unknown control payloads
/// are logged and ignored.
pub fn handle_input<T: Terminal + ?Sized>(term: &T, msg: &[u8]) {
    match decode(msg) {
        Inbound::Empty => {}
        Inbound::Data(data) => {
            if let Err(e) = term.write_input(data) {
                error!(error = %e, "failed to write to TTY");
            }
        }
        Inbound::Control(Control::Ping) => trace!("ping"),
        Inbound::Control(Control::Resize { cols, rows }) => {
            debug!(cols, rows, "resizing TTY");
            if let Err(e) = term.resize(rows, cols) {
                warn!(cols, rows, error = %e, "failed to resize TTY");
            }
        }
        Inbound::Control(Control::Invalid { payload, reason }) => {
            error!(%payload, %reason, "invalid control payload");
        }
        Inbound::Control(other) => info!(payload = ?other, "unknown control payload"),
    }
}

pub struct WebshellServer {
    app: Arc<AppContext>,
}

impl WebshellServer {
    pub fn new(app: Arc<AppContext>) -> Self {
        Self { app }
    }

    pub async fn bind(&self) -> WebshellResult<TcpListener> {
        let addr = self.app.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| WebshellError::Transport(format!("bind {addr} failed: {e}")))?;
        info!(addr = %addr, "listening");
        Ok(listener)
    }

    /// Accept connections until the shutdown token fires.
    pub async fn run(&self, listener: TcpListener) {
        let shutdown = self.app.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let app = self.app.clone();
                        tokio::spawn(async move {
                            handle_connection(app, stream, remote).await;
                        });
                    }
                    Err(e) => error!(error = %e, "TCP accept failed"),
                },
            }
        }
        info!("listener stopped");
    }
}

async fn handle_connection(app: Arc<AppContext>, stream: TcpStream, remote: SocketAddr) {
    let _guard = app.connection_opened();
    let prefix = app.config.route_prefix();
    let mut target = None;

    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        info!(remote = %remote, path = %req.uri().path(), "upgrade request");
        match route(&prefix, app.config.replay, req.uri().path()) {
            Some(r) => {
                target = Some((r, req.uri().to_string()));
                Ok(resp)
            }
            None => {
                let mut not_found = ErrorResponse::new(Some("not found".into()));
                *not_found.status_mut() = StatusCode::NOT_FOUND;
                Err(not_found)
            }
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(remote = %remote, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    match target {
        Some((Route::Shell, uri)) => serve_shell(app, ws, session_key(&uri)).await,
        Some((Route::Replay, _)) => replay::serve_replay(app, ws).await,
        None => {}
    }
}

async fn serve_shell(app: Arc<AppContext>, ws: WebSocketStream<TcpStream>, key: String) {
    let (sink, mut stream) = ws.split();
    let mut transport = WsTransport::new(sink, app.activity.clone());

    if !app.once.admit(&key) {
        info!(session_id = %key, "once mode: rejecting second session");
        let _ = transport.close_with(CloseCode::Policy, EXPIRED).await;
        return;
    }

    info!(session_id = %key, "getting session");
    let session = match app.sessions.get_session(&key, || app.spawn_shell(&key)).await {
        Ok(s) => s,
        Err(e) => {
            error!(session_id = %key, error = %e, "failed to start session");
            let _ = transport.close_with(CloseCode::Error, SESSION_FAILED).await;
            return;
        }
    };

    if app.once.is_enabled() {
        let (done, shutdown) = (session.done().clone(), app.shutdown.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = done.cancelled() => {
                    info!("once mode: session ended, shutting down");
                    shutdown.cancel();
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    let handle = session.attach(&app.shutdown, transport);
    info!(session_id = %key, client = handle.id(), "attached websocket to session");

    loop {
        tokio::select! {
            _ = handle.token().cancelled() => break,
            frame = recv_frame(&mut stream) => match frame {
                Ok(Some(msg)) => {
                    app.activity.ping();
                    session.touch();
                    handle_input(session.as_ref(), &msg);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session_id = %key, error = %e, "websocket closed");
                    break;
                }
            },
        }
    }

    session.release(&handle);
    debug!(session_id = %key, client = handle.id(), "connection finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingTerminal {
        writes: RefCell<Vec<Vec<u8>>>,
        resizes: RefCell<Vec<(u16, u16)>>,
    }

    impl Terminal for RecordingTerminal {
        fn write_input(&self, data: &[u8]) -> io::Result<usize> {
            self.writes.borrow_mut().push(data.to_vec());
            Ok(data.len())
        }

        fn resize(&self, rows: u16, cols: u16) -> io::Result<()> {
            self.resizes.borrow_mut().push((rows, cols));
            Ok(())
        }
    }

    #[test]
    fn size_payload_resizes() {
        let term = RecordingTerminal::default();
        handle_input(&term, &[1, b'S', b'I', b'Z', b'E', b' ', b'8', b'0', b' ', b'2', b'4']);
        assert_eq!(*term.resizes.borrow(), vec![(24, 80)]);
        assert!(term.writes.borrow().is_empty());
    }

    #[test]
    fn ping_has_no_effect() {
        let term = RecordingTerminal::default();
        handle_input(&term, &[1, b'P', b'I', b'N', b'G']);
        assert!(term.writes.borrow().is_empty());
        assert!(term.resizes.borrow().is_empty());
    }

    #[test]
    fn malformed_size_is_ignored() {
        let term = RecordingTerminal::default();
        handle_input(&term, &[1, b'S', b'I', b'Z', b'E', b' ', b'x', b'y']);
        handle_input(&term, b"\x01SIZE 80 99999");
        assert!(term.writes.borrow().is_empty());
        assert!(term.resizes.borrow().is_empty());
    }

    #[test]
    fn unknown_control_and_padding_are_not_written() {
        let term = RecordingTerminal::default();
        handle_input(&term, b"\x01FROBNICATE\x00\x00");
        handle_input(&term, b"\x00\x00");
        handle_input(&term, b"\x01PLAY");
        assert!(term.writes.borrow().is_empty());
    }

    #[test]
    fn data_is_written_verbatim() {
        let term = RecordingTerminal::default();
        handle_input(&term, b"ls -la\r\x00");
        handle_input(&term, b"\x1b[A");
        assert_eq!(*term.writes.borrow(), vec![b"ls -la\r".to_vec(), b"\x1b[A".to_vec()]);
    }

    #[test]
    fn routes() {
        assert_eq!(route("/abc", false, "/abc/shell"), Some(Route::Shell));
        assert_eq!(route("/abc", false, "/abc/replay"), None);
        assert_eq!(route("/abc", true, "/abc/replay"), Some(Route::Replay));
        assert_eq!(route("/abc", true, "/shell"), None);
        assert_eq!(route("/abc", true, "/abcd/shell"), None);
        assert_eq!(route("", false, "/shell"), Some(Route::Shell));
    }

    #[test]
    fn session_key_is_hex_of_uri() {
        assert_eq!(session_key("/t/shell"), "2f742f7368656c6c");
        assert_ne!(session_key("/t/shell?tab=1"), session_key("/t/shell?tab=2"));
    }

    mod end_to_end {
        use super::*;
        use crate::app::tests::test_config;
        use crate::config::{Overrides, ServerConfig};
        use futures_util::SinkExt;
        use std::time::Duration;
        use tokio::time::timeout;
        use tokio_tungstenite::tungstenite::{Error as WsError, Message};
        use tokio_tungstenite::{connect_async, MaybeTlsStream};
        use tokio_util::sync::CancellationToken;
        use webshell_core::protocol::SESSION_ENDED;

        type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

        const WAIT: Duration = Duration::from_secs(5);

        /// Start a server on an ephemeral port; returns the app and the shell
        /// route base URL.
        async fn start(tweak: impl FnOnce(&mut ServerConfig)) -> (Arc<AppContext>, String) {
            let mut cfg = test_config(Overrides::default());
            cfg.bind = "127.0.0.1".into();
            cfg.port = 0;
            cfg.grace = Duration::from_secs(60);
            tweak(&mut cfg);

            let app = AppContext::new(cfg, CancellationToken::new());
            let server = WebshellServer::new(app.clone());
            let listener = server.bind().await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move { server.run(listener).await });

            let base = format!("ws://{addr}{}", app.config.route_prefix());
            (app, base)
        }

        async fn next_close(client: &mut Client) -> (CloseCode, String) {
            timeout(WAIT, async {
                loop {
                    match client.next().await {
                        Some(Ok(Message::Close(Some(frame)))) => {
                            return (frame.code, frame.reason.to_string());
                        }
                        Some(Ok(_)) => continue,
                        other => panic!("expected close frame, got {other:?}"),
                    }
                }
            })
            .await
            .unwrap()
        }

        async fn wait_until<F, Fut>(mut check: F)
        where
            F: FnMut() -> Fut,
            Fut: std::future::Future<Output = bool>,
        {
            timeout(WAIT, async {
                while !check().await {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            })
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn unknown_path_is_not_found() {
            let (app, base) = start(|_| {}).await;
            match connect_async(format!("{base}/nope")).await {
                Err(WsError::Http(resp)) => assert_eq!(resp.status(), StatusCode::NOT_FOUND),
                Err(e) => panic!("unexpected error {e}"),
                Ok(_) => panic!("upgrade should be refused"),
            }
            app.shutdown.cancel();
        }

        #[tokio::test]
        async fn factory_error_closes_with_failure_reason() {
            let (app, base) = start(|cfg| cfg.shell = "/definitely/not/a/shell".into()).await;
            let (mut client, _) = connect_async(format!("{base}/shell")).await.unwrap();

            let (code, reason) = next_close(&mut client).await;
            assert_eq!(code, CloseCode::Error);
            assert_eq!(reason, SESSION_FAILED);
            assert_eq!(app.sessions.count().await, 0);
            app.shutdown.cancel();
        }

        #[tokio::test]
        async fn socket_close_releases_client() {
            let (app, base) = start(|_| {}).await;
            let (mut client, _) = connect_async(format!("{base}/shell")).await.unwrap();

            let sessions = app.sessions.clone();
            wait_until(|| {
                let sessions = sessions.clone();
                async move { sessions.list().await.iter().any(|s| s.attached) }
            })
            .await;

            client.close(None).await.unwrap();
            wait_until(|| {
                let sessions = sessions.clone();
                async move { sessions.list().await.iter().all(|s| !s.attached) }
            })
            .await;

            // The shell outlives its client.
            assert_eq!(app.sessions.count().await, 1);
            app.sessions.shutdown_all().await;
            app.shutdown.cancel();
        }

        #[tokio::test]
        async fn once_mode_serves_one_session_then_shuts_down() {
            let (app, base) = start(|cfg| cfg.once = true).await;
            let (mut first, _) = connect_async(format!("{base}/shell?tab=1")).await.unwrap();

            let sessions = app.sessions.clone();
            wait_until(|| {
                let sessions = sessions.clone();
                async move { sessions.count().await == 1 }
            })
            .await;

            let (mut second, _) = connect_async(format!("{base}/shell?tab=2")).await.unwrap();
            let (code, reason) = next_close(&mut second).await;
            assert_eq!(code, CloseCode::Policy);
            assert_eq!(reason, EXPIRED);
            assert!(!app.shutdown.is_cancelled());

            first
                .send(Message::Binary(b"exit\r".to_vec().into()))
                .await
                .unwrap();
            let ended = timeout(WAIT, async {
                while let Some(Ok(msg)) = first.next().await {
                    if let Message::Text(text) = msg {
                        if text.as_str() == SESSION_ENDED {
                            return true;
                        }
                    }
                }
                false
            })
            .await
            .unwrap();
            assert!(ended);

            timeout(WAIT, app.shutdown.cancelled()).await.unwrap();
            app.sessions.shutdown_all().await;
        }
    }
}
