//! execd shared - code common to the exec daemon and its clients
//!
//! This crate contains the error taxonomy, the control protocol, transport
//! URIs and the stdout/stderr multiplexing codec used on both sides of an
//! attach connection.

pub mod constants;
pub mod errors;
pub mod protocol;
pub mod stdcopy;
pub mod transport;

pub use errors::{ErrorKind, ExecdError, ExecdResult};
pub use protocol::{ConsoleSize, ExecConfig, ExecInspect, ProcessConfig, Request, Response};
pub use stdcopy::{StdCopyCodec, StdFrame, StreamKind};
pub use transport::Transport;
