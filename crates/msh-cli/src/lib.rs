//! meshsh: command-line front end
//!
//! Provides the `meshsh` binary, which runs either side of a session:
//! `listen` serves a program to authenticated peers, `connect` attaches
//! the local terminal to a listener, and `identity` prints addressing
//! information.

pub mod commands;
pub mod output;
