//! webshell-core: shared library for the browser shell.
//!
//! Provides the inbound control-byte framing, the outbound transport trait
//! used by sessions, and the ttyrec recording container (format, recorder,
//! replayer).

pub mod error;
pub mod protocol;
pub mod transport;
pub mod ttyrec;

// Re-export commonly used items at crate root.
pub use error::{WebshellError, WebshellResult};
pub use protocol::{decode, Control, Inbound, CONTROL_MARKER, SESSION_ENDED};
pub use transport::OutboundTransport;
