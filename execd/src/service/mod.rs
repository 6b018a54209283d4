//! Daemon service implementations.
//!
//! - `exec`: exec session lifecycle and attach streams
//! - `server`: the control socket server

pub mod exec;
pub mod server;
