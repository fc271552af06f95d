//! Pseudo-terminal process supervision

mod supervisor;

pub use supervisor::{ProcessExit, ProcessHandle, ProcessIo, ProcessSpec, SupervisorError};
