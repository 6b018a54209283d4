//! Control protocol spoken on the execd socket.
//!
//! One JSON document per line in each direction. A `start` without `detach`
//! or an `attach` that succeeds is answered with [`Response::Attached`], after
//! which the same connection carries the session's raw attach stream instead
//! of JSON.

use crate::errors::{ErrorKind, ExecdError};
use serde::{Deserialize, Serialize};

/// Pseudo-terminal window size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSize {
    pub rows: u16,
    pub cols: u16,
}

/// Exec session configuration supplied at create time.
///
/// # Examples
///
/// ```
/// use execd_shared::ExecConfig;
///
/// let config = ExecConfig::new(["sh", "-c", "env"])
///     .env("FOO=BAR")
///     .working_dir("/tmp")
///     .tty(true)
///     .attach_stdout(true);
/// assert_eq!(config.cmd[0], "sh");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// argv of the process; must not be empty.
    pub cmd: Vec<String>,

    /// `KEY=VALUE` entries merged over the container environment.
    /// A bare `KEY` removes that key.
    #[serde(default)]
    pub env: Vec<String>,

    /// Empty means the container's working directory.
    #[serde(default)]
    pub working_dir: String,

    /// `uid[:gid]` or `name[:group]`; empty means the container's user.
    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub tty: bool,

    #[serde(default)]
    pub attach_stdin: bool,

    #[serde(default)]
    pub attach_stdout: bool,

    #[serde(default)]
    pub attach_stderr: bool,

    /// Initial window size for tty sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_size: Option<ConsoleSize>,
}

impl ExecConfig {
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn env(mut self, entry: impl Into<String>) -> Self {
        self.env.push(entry.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    pub fn attach_stdin(mut self, attach: bool) -> Self {
        self.attach_stdin = attach;
        self
    }

    pub fn attach_stdout(mut self, attach: bool) -> Self {
        self.attach_stdout = attach;
        self
    }

    pub fn attach_stderr(mut self, attach: bool) -> Self {
        self.attach_stderr = attach;
        self
    }

    pub fn console_size(mut self, rows: u16, cols: u16) -> Self {
        self.console_size = Some(ConsoleSize { rows, cols });
        self
    }
}

/// Process configuration echoed back by inspect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub entrypoint: String,
    pub arguments: Vec<String>,
    pub tty: bool,
    pub user: String,
    pub working_dir: String,
}

/// Read-only snapshot of an exec session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecInspect {
    pub id: String,
    pub container_id: String,
    pub running: bool,
    /// Present exactly when the session has exited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub open_stdin: bool,
    pub open_stdout: bool,
    pub open_stderr: bool,
    pub process_config: ProcessConfig,
}

/// Client request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Create { container: String, config: ExecConfig },
    Inspect { id: String },
    Start {
        id: String,
        #[serde(default)]
        detach: bool,
    },
    Attach { id: String },
    Resize { id: String, rows: u16, cols: u16 },
}

/// Daemon response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Created { id: String },
    Inspected(ExecInspect),
    Started,
    /// The connection switches to the attach stream after this line.
    Attached { tty: bool },
    Resized,
    Error { kind: ErrorKind, message: String },
}

impl From<&ExecdError> for Response {
    fn from(err: &ExecdError) -> Self {
        Response::Error {
            kind: err.kind(),
            message: err.message(),
        }
    }
}

impl Response {
    /// Turn an error response back into an [`ExecdError`].
    pub fn into_result(self) -> Result<Response, ExecdError> {
        match self {
            Response::Error { kind, message } => Err(ExecdError::from_wire(kind, message)),
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_request_wire_shape() {
        let req = Request::Create {
            container: "web".into(),
            config: ExecConfig::new(["sh", "-c", "cat && echo closeIO"])
                .attach_stdin(true)
                .attach_stdout(true),
        };
        let json: serde_json::Value = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "create");
        assert_eq!(json["container"], "web");
        assert_eq!(json["config"]["cmd"][2], "cat && echo closeIO");
        assert_eq!(json["config"]["attach_stdin"], true);
        assert!(json["config"].get("console_size").is_none());
    }

    #[test]
    fn test_start_detach_defaults_false() {
        let req: Request = serde_json::from_str(r#"{"op":"start","id":"abc"}"#).unwrap();
        assert_eq!(
            req,
            Request::Start {
                id: "abc".into(),
                detach: false
            }
        );
    }

    #[test]
    fn test_config_fields_default() {
        let config: ExecConfig = serde_json::from_str(r#"{"cmd":["id"]}"#).unwrap();
        assert_eq!(config, ExecConfig::new(["id"]));
    }

    #[test]
    fn test_inspected_response_is_flat() {
        let resp = Response::Inspected(ExecInspect {
            id: "abc".into(),
            container_id: "web".into(),
            running: false,
            exit_code: Some(0),
            pid: Some(42),
            open_stdin: false,
            open_stdout: true,
            open_stderr: false,
            process_config: ProcessConfig {
                entrypoint: "env".into(),
                arguments: vec![],
                tty: true,
                user: String::new(),
                working_dir: "/tmp".into(),
            },
        });
        let json: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["status"], "inspected");
        assert_eq!(json["id"], "abc");
        assert_eq!(json["exit_code"], 0);

        let back: Response = serde_json::from_value(json).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn test_error_response_into_result() {
        let resp = Response::from(&ExecdError::NotFound("exec nope".into()));
        let line = serde_json::to_string(&resp).unwrap();
        assert_eq!(
            line,
            r#"{"status":"error","kind":"not_found","message":"exec nope"}"#
        );
        let err = serde_json::from_str::<Response>(&line)
            .unwrap()
            .into_result()
            .unwrap_err();
        assert!(matches!(err, ExecdError::NotFound(_)));
    }
}
