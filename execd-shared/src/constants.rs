//! Shared constants between daemon and clients
//!
//! These constants must be identical on both sides of the control socket.

/// Daemon defaults
pub mod daemon {
    /// Default listen URI for the control socket
    pub const DEFAULT_LISTEN: &str = "unix:///run/execd/execd.sock";

    /// Default OCI runtime state root (one `<id>/state.json` per container)
    pub const DEFAULT_STATE_ROOT: &str = "/run/execd/containers";

    /// How long output is still forwarded after the process exited, in ms
    pub const DEFAULT_DRAIN_GRACE_MS: u64 = 1000;

    /// Default log level when RUST_LOG is unset
    pub const DEFAULT_LOG_LEVEL: &str = "info";
}

/// Control protocol limits
pub mod protocol {
    /// Longest accepted JSON control line, in bytes
    pub const MAX_LINE_LENGTH: usize = 64 * 1024;
}

/// Attach stream constants
pub mod attach {
    /// Size of a multiplexed frame header:
    /// `[kind:u8][0,0,0][len:u32 BE]`
    pub const FRAME_HEADER_LEN: usize = 8;

    /// Largest chunk read from a process output stream at once
    pub const OUTPUT_CHUNK_SIZE: usize = 32 * 1024;

    /// Largest frame payload a decoder accepts
    pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

    /// Terminal EOF character written to a pty when the client closes input
    pub const TTY_EOF: u8 = 0x04;

    /// Default pty window size (rows, cols)
    pub const DEFAULT_TTY_ROWS: u16 = 24;
    pub const DEFAULT_TTY_COLS: u16 = 80;
}

/// Exit codes recorded for sessions whose process never ran
pub mod exit_codes {
    /// The command could not be found in the container
    pub const COMMAND_NOT_FOUND: i32 = 127;

    /// The command was found but could not be launched
    pub const CANNOT_EXECUTE: i32 = 126;

    /// Offset added to a signal number for signal-terminated processes
    pub const SIGNAL_OFFSET: i32 = 128;
}

/// Environment variables read by the daemon
pub mod envs {
    pub const LISTEN: &str = "EXECD_LISTEN";
    pub const STATE_ROOT: &str = "EXECD_STATE_ROOT";
    pub const DRAIN_GRACE_MS: &str = "EXECD_DRAIN_GRACE_MS";
    pub const CONFIG: &str = "EXECD_CONFIG";
    pub const LOG: &str = "EXECD_LOG";
}
