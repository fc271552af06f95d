//! Session multiplexing over a link
//!
//! The multiplexer is pure frame bookkeeping; the driver owns the tasks
//! and channels that run it against a live link.

pub mod driver;
mod liveness;
pub mod multiplexer;
mod reorder;

pub use driver::{CloseReason, Incoming, LinkDriver, Outgoing, SessionEvent, SessionIo};
pub use liveness::{Liveness, MalformedCounter};
pub use multiplexer::{Inbound, InboundEvent, Outbound};
pub use reorder::{LostRange, ReorderBuffer};
