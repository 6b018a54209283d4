//! Daemon configuration.
//!
//! Settings come from an optional JSON file, then command-line flags and
//! `EXECD_*` environment variables, later sources winning.

use clap::Parser;
use execd_shared::constants::{daemon, envs};
use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::Transport;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// execd - exec sessions for running containers
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "execd - exec sessions for running containers")]
pub struct DaemonArgs {
    /// Listen URI for clients
    ///
    /// Examples:
    ///   --listen unix:///run/execd/execd.sock
    ///   --listen tcp://127.0.0.1:7070
    #[arg(short, long, env = envs::LISTEN)]
    pub listen: Option<String>,

    /// Directory holding `<container-id>/state.json` runtime state
    #[arg(long, env = envs::STATE_ROOT)]
    pub state_root: Option<PathBuf>,

    /// How long attached output keeps draining after the process exits
    #[arg(long, env = envs::DRAIN_GRACE_MS)]
    pub drain_grace_ms: Option<u64>,

    /// JSON configuration file
    #[arg(short, long, env = envs::CONFIG)]
    pub config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = envs::LOG)]
    pub log_level: Option<String>,
}

/// Resolved daemon settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,

    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen() -> String {
    daemon::DEFAULT_LISTEN.to_string()
}

fn default_state_root() -> PathBuf {
    PathBuf::from(daemon::DEFAULT_STATE_ROOT)
}

fn default_drain_grace_ms() -> u64 {
    daemon::DEFAULT_DRAIN_GRACE_MS
}

fn default_log_level() -> String {
    daemon::DEFAULT_LOG_LEVEL.to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            state_root: default_state_root(),
            drain_grace_ms: default_drain_grace_ms(),
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> ExecdResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ExecdError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw)
            .map_err(|e| ExecdError::Config(format!("invalid {}: {}", path.display(), e)))
    }

    /// Layer command-line and environment settings over the config file.
    pub fn resolve(args: &DaemonArgs) -> ExecdResult<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(listen) = &args.listen {
            config.listen = listen.clone();
        }
        if let Some(state_root) = &args.state_root {
            config.state_root = state_root.clone();
        }
        if let Some(grace) = args.drain_grace_ms {
            config.drain_grace_ms = grace;
        }
        if let Some(level) = &args.log_level {
            config.log_level = level.clone();
        }

        config.transport()?;
        Ok(config)
    }

    pub fn transport(&self) -> ExecdResult<Transport> {
        Transport::from_uri(&self.listen).map_err(ExecdError::Config)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::resolve(&DaemonArgs::default()).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(
            config.transport().unwrap(),
            Transport::unix("/run/execd/execd.sock")
        );
        assert_eq!(config.drain_grace(), Duration::from_millis(1000));
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execd.json");
        std::fs::write(
            &path,
            r#"{"listen": "tcp://127.0.0.1:7070", "drain_grace_ms": 250}"#,
        )
        .unwrap();

        let args = DaemonArgs {
            config: Some(path),
            drain_grace_ms: Some(10),
            ..Default::default()
        };
        let config = DaemonConfig::resolve(&args).unwrap();

        assert_eq!(config.listen, "tcp://127.0.0.1:7070");
        assert_eq!(config.drain_grace_ms, 10);
        assert_eq!(config.state_root, PathBuf::from(daemon::DEFAULT_STATE_ROOT));
    }

    #[test]
    fn test_invalid_listen_uri() {
        let args = DaemonArgs {
            listen: Some("vsock://2695".to_string()),
            ..Default::default()
        };
        let err = DaemonConfig::resolve(&args).unwrap_err();
        assert!(matches!(err, ExecdError::Config(_)));
    }

    #[test]
    fn test_unknown_file_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("execd.json");
        std::fs::write(&path, r#"{"listen_uri": "tcp://127.0.0.1:1"}"#).unwrap();

        let err = DaemonConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ExecdError::Config(_)));
    }

    #[test]
    fn test_parse_flags() {
        let args = DaemonArgs::try_parse_from([
            "execd",
            "--listen",
            "tcp://0.0.0.0:7070",
            "--drain-grace-ms",
            "500",
        ])
        .unwrap();
        assert_eq!(args.listen.as_deref(), Some("tcp://0.0.0.0:7070"));
        assert_eq!(args.drain_grace_ms, Some(500));
    }
}
