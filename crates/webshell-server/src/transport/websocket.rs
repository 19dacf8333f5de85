//! WebSocket transport using tokio-tungstenite.
//!
//! The write half of an accepted socket becomes a session's
//! [`OutboundTransport`]; the read half is polled by the connection handler
//! through [`recv_frame`].

use crate::timeout::Activity;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;
use webshell_core::transport::TransportFuture;
use webshell_core::{OutboundTransport, WebshellError, WebshellResult};

/// Maximum inbound frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Close reason for a client turned away in once mode.
pub const EXPIRED: &str = "expired";

/// Outbound half of a WebSocket connection.
pub struct WsTransport<S> {
    sink: S,
    activity: Activity,
    closed: bool,
}

impl<S> WsTransport<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    pub fn new(sink: S, activity: Activity) -> Self {
        Self {
            sink,
            activity,
            closed: false,
        }
    }

    async fn send(&mut self, msg: Message) -> WebshellResult<()> {
        if self.closed {
            return Err(WebshellError::Transport("WS already closed".into()));
        }
        self.activity.ping();
        self.sink
            .send(msg)
            .await
            .map_err(|e| WebshellError::Transport(format!("WS send failed: {e}")))
    }

    /// Send a close frame with `code` and `reason`, then close the sink.
    pub async fn close_with(&mut self, code: CloseCode, reason: &str) -> WebshellResult<()> {
        if self.closed {
            return Ok(());
        }
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let result = self.send(Message::Close(Some(frame))).await;
        self.closed = true;
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "WS sink close failed");
        }
        if let Err(e) = result {
            // The peer may already be gone.
            debug!(error = %e, "WS close frame not sent");
        }
        Ok(())
    }
}

impl<S> OutboundTransport for WsTransport<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    fn send_data(&mut self, data: Vec<u8>) -> TransportFuture<'_> {
        Box::pin(self.send(Message::Binary(data.into())))
    }

    fn send_status<'a>(&'a mut self, text: &'a str) -> TransportFuture<'a> {
        Box::pin(self.send(Message::Text(text.to_string().into())))
    }

    fn close(&mut self) -> TransportFuture<'_> {
        Box::pin(self.close_with(CloseCode::Normal, ""))
    }
}

/// Receive the next data-bearing frame. Binary and text frames are both
/// returned as bytes; `None` means the peer closed.
pub async fn recv_frame<St>(stream: &mut St) -> WebshellResult<Option<Vec<u8>>>
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => return check_size(data.to_vec()).map(Some),
            Some(Ok(Message::Text(text))) => return check_size(text.as_bytes().to_vec()).map(Some),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            // Pings are answered by tungstenite itself.
            Some(Ok(_)) => continue,
            Some(Err(WsError::ConnectionClosed)) => return Ok(None),
            Some(Err(e)) => return Err(WebshellError::Transport(format!("WS recv failed: {e}"))),
        }
    }
}

fn check_size(data: Vec<u8>) -> WebshellResult<Vec<u8>> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(WebshellError::Transport(format!(
            "WS frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            data.len()
        )));
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    async fn pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, Role::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;
        (server, client)
    }

    #[tokio::test]
    async fn data_status_and_close_reach_peer() {
        let (server, mut client) = pair().await;
        let (sink, _stream) = server.split();
        let mut transport = WsTransport::new(sink, Activity::Noop);

        transport.send_data(b"\x1b[31mred".to_vec()).await.unwrap();
        transport.send_status("session ended").await.unwrap();
        transport.close().await.unwrap();
        transport.close().await.unwrap();

        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Binary(b"\x1b[31mred".to_vec().into())
        );
        assert_eq!(
            client.next().await.unwrap().unwrap(),
            Message::Text("session ended".to_string().into())
        );
        assert!(matches!(client.next().await, Some(Ok(Message::Close(_)))));
        assert!(transport.send_data(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn recv_frame_returns_payloads_until_close() {
        let (server, mut client) = pair().await;
        let (_sink, mut stream) = server.split();

        client.send(Message::Binary(b"\x01PING".to_vec().into())).await.unwrap();
        client.send(Message::Text("ls\n".to_string().into())).await.unwrap();
        client.send(Message::Close(None)).await.unwrap();

        assert_eq!(recv_frame(&mut stream).await.unwrap(), Some(b"\x01PING".to_vec()));
        assert_eq!(recv_frame(&mut stream).await.unwrap(), Some(b"ls\n".to_vec()));
        assert_eq!(recv_frame(&mut stream).await.unwrap(), None);
    }

    #[test]
    fn oversized_frame_rejected() {
        assert!(check_size(vec![0; MAX_FRAME_SIZE]).is_ok());
        assert!(matches!(
            check_size(vec![0; MAX_FRAME_SIZE + 1]),
            Err(WebshellError::Transport(_))
        ));
    }
}
