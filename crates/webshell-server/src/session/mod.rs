//! Session management: PTY processes, sessions, and the registry.

pub mod env;
pub mod manager;
pub mod pty;
#[allow(clippy::module_inception)]
pub mod session;

pub use manager::SessionManager;
pub use pty::{PtyProcess, RunAs, SpawnOptions};
pub use session::{ClientHandle, Delivery, Session, SessionInfo};
