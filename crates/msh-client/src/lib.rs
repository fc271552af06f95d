//! msh-client: the connecting side of meshsh
//!
//! A client links to a listener destination, asks it to start its
//! program, and attaches the local terminal to that program until it
//! exits. The process exit code reports how the session ended.

pub mod error;
pub mod exit;
pub mod retry;
pub mod session;
pub mod terminal;

pub use error::ClientError;
pub use retry::ExponentialBackoff;
pub use session::{ClientSession, LocalEnds, LocalIo, LocalSignal, SessionEnd};
pub use terminal::{LocalTerminal, RawModeGuard};
