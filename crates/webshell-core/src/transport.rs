//! Abstract outbound transport for an attached client.
//!
//! A session forwards PTY output through this trait without knowing whether
//! the peer is a WebSocket, a test channel, or something else.

use crate::error::WebshellResult;
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by transport operations.
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = WebshellResult<()>> + Send + 'a>>;

/// The write half of a client connection.
pub trait OutboundTransport: Send + 'static {
    /// Send a chunk of terminal output.
    fn send_data(&mut self, data: Vec<u8>) -> TransportFuture<'_>;

    /// Send a plain-text status line (no envelope).
    fn send_status<'a>(&'a mut self, text: &'a str) -> TransportFuture<'a>;

    /// Close the connection. Must be safe to call on an already-closed peer.
    fn close(&mut self) -> TransportFuture<'_>;
}
