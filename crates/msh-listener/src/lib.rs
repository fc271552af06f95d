//! msh-listener: the serving side of meshsh
//!
//! A listener binds a destination on a transport, admits peers by their
//! proven identity, and runs one program per session on a pseudo-terminal,
//! relaying its terminal I/O, signals, window size and exit status over
//! the link.

pub mod auth;
pub mod pty;
pub mod server;
pub mod session;
pub mod state;

pub use auth::{AllowList, Authenticator};
pub use server::ListenerServer;
pub use session::{ListenerSession, SessionOutcome};
pub use state::ListenerContext;
