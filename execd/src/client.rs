//! Client for the execd control socket.
//!
//! Every call opens its own connection. Attaching calls keep theirs and
//! return an [`AttachedExec`] owning the attach stream.

use crate::net::{self, BoxedIo};
use bytes::BytesMut;
use execd_shared::constants::protocol::MAX_LINE_LENGTH;
use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::stdcopy::demux;
use execd_shared::{ExecConfig, ExecInspect, Request, Response, Transport};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Framed, LinesCodec};

type Control = Framed<BoxedIo, LinesCodec>;

/// Handle to an execd daemon.
#[derive(Clone, Debug)]
pub struct ExecClient {
    transport: Transport,
}

impl ExecClient {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }

    /// Register an exec session in `container`; returns its id.
    pub async fn create(&self, container: &str, config: ExecConfig) -> ExecdResult<String> {
        let request = Request::Create {
            container: container.to_string(),
            config,
        };
        match self.call(&request).await? {
            Response::Created { id } => Ok(id),
            other => Err(unexpected("created", &other)),
        }
    }

    pub async fn inspect(&self, id: &str) -> ExecdResult<ExecInspect> {
        match self.call(&Request::Inspect { id: id.to_string() }).await? {
            Response::Inspected(view) => Ok(view),
            other => Err(unexpected("inspected", &other)),
        }
    }

    /// Start detached. Use [`attach`](Self::attach) to reach the stdio later.
    pub async fn start(&self, id: &str) -> ExecdResult<()> {
        let request = Request::Start {
            id: id.to_string(),
            detach: true,
        };
        match self.call(&request).await? {
            Response::Started => Ok(()),
            other => Err(unexpected("started", &other)),
        }
    }

    /// Start and attach on the same connection.
    pub async fn start_attach(&self, id: &str) -> ExecdResult<AttachedExec> {
        self.open_attach(&Request::Start {
            id: id.to_string(),
            detach: false,
        })
        .await
    }

    /// Attach to a session started detached.
    pub async fn attach(&self, id: &str) -> ExecdResult<AttachedExec> {
        self.open_attach(&Request::Attach { id: id.to_string() })
            .await
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> ExecdResult<()> {
        let request = Request::Resize {
            id: id.to_string(),
            rows,
            cols,
        };
        match self.call(&request).await? {
            Response::Resized => Ok(()),
            other => Err(unexpected("resized", &other)),
        }
    }

    async fn connect(&self) -> ExecdResult<Control> {
        let io = net::connect(&self.transport).await?;
        Ok(Framed::new(
            io,
            LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
        ))
    }

    async fn call(&self, request: &Request) -> ExecdResult<Response> {
        let mut control = self.connect().await?;
        roundtrip(&mut control, request).await
    }

    async fn open_attach(&self, request: &Request) -> ExecdResult<AttachedExec> {
        let mut control = self.connect().await?;
        match roundtrip(&mut control, request).await? {
            Response::Attached { tty } => {
                // Output may already sit behind the response line.
                let parts = control.into_parts();
                let (reader, writer) = tokio::io::split(parts.io);
                Ok(AttachedExec {
                    tty,
                    reader,
                    writer,
                    pending: parts.read_buf,
                })
            }
            other => Err(unexpected("attached", &other)),
        }
    }
}

async fn roundtrip(control: &mut Control, request: &Request) -> ExecdResult<Response> {
    let line = serde_json::to_string(request)?;
    control
        .send(line)
        .await
        .map_err(|e| ExecdError::Protocol(format!("failed to send request: {}", e)))?;

    let line = control
        .next()
        .await
        .ok_or_else(|| ExecdError::Protocol("connection closed before response".into()))?
        .map_err(|e| ExecdError::Protocol(format!("failed to read response: {}", e)))?;

    serde_json::from_str::<Response>(&line)?.into_result()
}

fn unexpected(expected: &str, got: &Response) -> ExecdError {
    ExecdError::Protocol(format!("expected {} response, got {:?}", expected, got))
}

/// Output captured from an attach stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Client side of an attach stream.
pub struct AttachedExec {
    tty: bool,
    reader: ReadHalf<BoxedIo>,
    writer: WriteHalf<BoxedIo>,
    pending: BytesMut,
}

impl AttachedExec {
    /// Whether output arrives raw (tty) rather than stdcopy framed.
    pub fn tty(&self) -> bool {
        self.tty
    }

    pub async fn write_stdin(&mut self, data: &[u8]) -> ExecdResult<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Half-close: the process sees end of input, output keeps flowing.
    pub async fn close_write(&mut self) -> ExecdResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Everything the daemon sends until it closes the stream.
    pub async fn read_to_end(mut self) -> ExecdResult<Vec<u8>> {
        let mut data = self.pending.to_vec();
        self.reader.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// [`read_to_end`](Self::read_to_end) bounded by `limit`.
    ///
    /// Giving up only drops this connection; the session keeps running.
    pub async fn read_to_end_timeout(self, limit: Duration) -> ExecdResult<Vec<u8>> {
        tokio::time::timeout(limit, self.read_to_end())
            .await
            .map_err(|_| {
                ExecdError::Timeout(format!("attach stream still open after {:?}", limit))
            })?
    }

    /// Read to the end and split the output per stream.
    ///
    /// A tty stream carries only stdout.
    pub async fn output(self) -> ExecdResult<CapturedOutput> {
        let tty = self.tty;
        let data = self.read_to_end().await?;
        split_output(tty, data)
    }

    pub async fn output_timeout(self, limit: Duration) -> ExecdResult<CapturedOutput> {
        let tty = self.tty;
        let data = self.read_to_end_timeout(limit).await?;
        split_output(tty, data)
    }
}

fn split_output(tty: bool, data: Vec<u8>) -> ExecdResult<CapturedOutput> {
    if tty {
        return Ok(CapturedOutput {
            stdout: data,
            stderr: Vec::new(),
        });
    }
    let (stdout, stderr) = demux(&data)?;
    Ok(CapturedOutput { stdout, stderr })
}
