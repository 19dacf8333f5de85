//! Client transports.

pub mod websocket;

pub use websocket::{recv_frame, WsTransport};
