//! execd - exec sessions for running containers
//!
//! Launches additional processes inside already-running containers and
//! streams their stdio to clients over a local socket.
//!
//! - [`service`]: session registry, launcher, attach multiplexer and the
//!   control server
//! - [`container`]: container lookup and identity resolution
//! - [`client`]: client for the control socket
//! - [`config`]: daemon settings

#[cfg(not(target_os = "linux"))]
compile_error!("execd is Linux-only; build with a Linux target");

pub mod client;
pub mod config;
pub mod container;
pub mod net;
pub mod service;

pub use client::{AttachedExec, CapturedOutput, ExecClient};
pub use config::{DaemonArgs, DaemonConfig};
pub use service::exec::{Attachment, ExecService};
pub use service::server::ExecServer;
