//! Launch parameters of an exec process.
//!
//! Combines a session's [`ExecConfig`] with its container's defaults into
//! everything the executor needs: argv, final environment, native working
//! directory and resolved identity.

use crate::container::{ContainerRecord, Identity, Platform, UserDb};
use execd_shared::constants::attach::{DEFAULT_TTY_COLS, DEFAULT_TTY_ROWS};
use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::{ConsoleSize, ExecConfig};

/// Fully resolved launch parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    /// Final `KEY=VALUE` environment; nothing else is inherited.
    pub env: Vec<String>,
    /// Working directory in the container platform's native form.
    pub working_dir: String,
    pub identity: Identity,
    pub tty: bool,
    pub console_size: ConsoleSize,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

impl LaunchSpec {
    pub fn resolve(
        config: &ExecConfig,
        container: &ContainerRecord,
        users: &UserDb,
    ) -> ExecdResult<Self> {
        validate(config, container.platform)?;

        let identity = users.resolve(&config.user, &container.user)?;

        let mut env = merge_env(&container.env, &config.env);
        if let Some(home) = identity.home.as_deref() {
            if !env.iter().any(|e| env_key(e) == "HOME") {
                env.push(format!("HOME={}", home));
            }
        }

        let working_dir = if config.working_dir.is_empty() {
            &container.working_dir
        } else {
            &config.working_dir
        };

        Ok(Self {
            argv: config.cmd.clone(),
            env,
            working_dir: container.platform.render_path(working_dir),
            identity,
            tty: config.tty,
            console_size: config.console_size.unwrap_or(ConsoleSize {
                rows: DEFAULT_TTY_ROWS,
                cols: DEFAULT_TTY_COLS,
            }),
            stdin: config.attach_stdin,
            stdout: config.attach_stdout,
            stderr: config.attach_stderr,
        })
    }

    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }
}

/// Reject configs that can never launch.
pub fn validate(config: &ExecConfig, platform: Platform) -> ExecdResult<()> {
    if config.cmd.is_empty() || config.cmd[0].is_empty() {
        return Err(ExecdError::InvalidArgument(
            "no exec command specified".to_string(),
        ));
    }

    if !config.working_dir.is_empty() && !platform.is_absolute(&config.working_dir) {
        return Err(ExecdError::InvalidArgument(format!(
            "working directory must be an absolute path: {}",
            config.working_dir
        )));
    }

    if let Some(entry) = config.env.iter().find(|e| env_key(e).is_empty()) {
        return Err(ExecdError::InvalidArgument(format!(
            "invalid environment entry: {:?}",
            entry
        )));
    }

    Ok(())
}

/// Merge `overrides` over `base`.
///
/// Later entries win per key and keep the position of the first
/// occurrence. A bare `KEY` without `=` removes the key.
pub fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + overrides.len());

    for entry in base.iter().chain(overrides) {
        let key = env_key(entry);
        let existing = merged.iter().position(|e| env_key(e) == key);

        match (entry.contains('='), existing) {
            (true, Some(i)) => merged[i] = entry.clone(),
            (true, None) => merged.push(entry.clone()),
            (false, Some(i)) => {
                merged.remove(i);
            }
            (false, None) => {}
        }
    }

    merged
}

fn env_key(entry: &str) -> &str {
    entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
}
