//! Attach multiplexer.
//!
//! Joins one client connection to a session's stdio. Input bytes from the
//! client go to the process stdin; process output goes back either raw (tty)
//! or stdcopy framed. A client half-close ends process input, the process
//! exit ends the output side, and the connection closes once output has
//! drained.

use crate::service::exec::exec_handle::{InputSink, OutputStream, ProcessStdio};
use crate::service::exec::state::SessionState;
use bytes::{Bytes, BytesMut};
use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::{StdCopyCodec, StdFrame, StreamKind};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{Encoder, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Output chunks buffered between the stream readers and the connection.
const OUTPUT_QUEUE_DEPTH: usize = 64;

/// How process output is written to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachMode {
    /// Bytes exactly as the terminal produced them.
    Raw,
    /// stdcopy frames tagged with the source stream.
    Framed,
}

impl AttachMode {
    pub fn for_tty(tty: bool) -> Self {
        if tty {
            AttachMode::Raw
        } else {
            AttachMode::Framed
        }
    }
}

impl Encoder<StdFrame> for AttachMode {
    type Error = ExecdError;

    fn encode(&mut self, frame: StdFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            AttachMode::Raw => {
                dst.extend_from_slice(&frame.payload);
                Ok(())
            }
            AttachMode::Framed => StdCopyCodec.encode(frame, dst),
        }
    }
}

/// The stdio of a running session, bound for one connection.
pub struct Attachment {
    exec_id: String,
    mode: AttachMode,
    stdio: ProcessStdio,
    state: watch::Receiver<SessionState>,
    drain_grace: Duration,
}

impl Attachment {
    pub fn new(
        exec_id: impl Into<String>,
        tty: bool,
        stdio: ProcessStdio,
        state: watch::Receiver<SessionState>,
        drain_grace: Duration,
    ) -> Self {
        Self {
            exec_id: exec_id.into(),
            mode: AttachMode::for_tty(tty),
            stdio,
            state,
            drain_grace,
        }
    }

    pub fn exec_id(&self) -> &str {
        &self.exec_id
    }

    pub fn tty(&self) -> bool {
        self.mode == AttachMode::Raw
    }

    /// Run the attach stream over `conn` until it is done.
    ///
    /// `pending_input` holds client bytes that arrived before the switch to
    /// the attach stream; they reach stdin ahead of anything read from
    /// `conn`. Returns once output is finished and the connection is shut
    /// down.
    pub async fn serve<C>(self, conn: C, pending_input: Bytes) -> ExecdResult<()>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Attachment {
            exec_id,
            mode,
            stdio,
            state,
            drain_grace,
        } = self;

        info!(exec_id = %exec_id, ?mode, "attach stream opened");

        let (reader, writer) = tokio::io::split(conn);
        let output_done = CancellationToken::new();

        let input = tokio::spawn(pump_input(
            exec_id.clone(),
            reader,
            pending_input,
            stdio.stdin,
            output_done.clone(),
        ));

        let result = pump_output(
            &exec_id,
            FramedWrite::new(writer, mode),
            stdio.stdout,
            stdio.stderr,
            state,
            drain_grace,
        )
        .await;

        output_done.cancel();
        if let Err(e) = input.await {
            debug!(exec_id = %exec_id, error = %e, "input task failed");
        }

        info!(exec_id = %exec_id, "attach stream closed");
        result
    }
}

/// Copy client input to the process until the client half-closes or the
/// output side finishes.
async fn pump_input<R>(
    exec_id: String,
    mut reader: R,
    pending: Bytes,
    stdin: Option<InputSink>,
    output_done: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let Some(mut sink) = stdin else {
        // Input not attached: swallow anything the client sends.
        let mut discard = tokio::io::sink();
        tokio::select! {
            _ = output_done.cancelled() => {}
            _ = tokio::io::copy(&mut reader, &mut discard) => {}
        }
        return;
    };

    let forwarded = tokio::select! {
        _ = output_done.cancelled() => None,
        res = forward_input(&mut reader, &pending, &mut sink) => Some(res),
    };

    match forwarded {
        Some(Ok(bytes)) => debug!(exec_id = %exec_id, bytes, "client closed input"),
        Some(Err(e)) => debug!(exec_id = %exec_id, error = %e, "stdin forwarding stopped"),
        None => debug!(exec_id = %exec_id, "output finished before client closed input"),
    }

    if let Err(e) = sink.close().await {
        debug!(exec_id = %exec_id, error = %e, "failed to close process input");
    }
}

async fn forward_input<R>(
    reader: &mut R,
    pending: &[u8],
    sink: &mut InputSink,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    if !pending.is_empty() {
        sink.write_all(pending).await?;
    }
    let copied = tokio::io::copy(reader, sink.writer_mut()).await?;
    Ok(copied + pending.len() as u64)
}

/// Forward process output to the client.
///
/// Ends when every output stream hit EOF and the process has exited, or
/// when `drain_grace` elapses after the exit (descendants may keep the
/// streams open), or when the client stops accepting data.
async fn pump_output<W>(
    exec_id: &str,
    mut sink: FramedWrite<W, AttachMode>,
    stdout: Option<OutputStream>,
    stderr: Option<OutputStream>,
    mut state: watch::Receiver<SessionState>,
    drain_grace: Duration,
) -> ExecdResult<()>
where
    W: AsyncWrite + Unpin,
{
    let (tx, mut rx) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
    let mut readers = Vec::new();
    if let Some(stream) = stdout {
        readers.push(forward_stream(StreamKind::Stdout, stream, tx.clone()));
    }
    if let Some(stream) = stderr {
        readers.push(forward_stream(StreamKind::Stderr, stream, tx.clone()));
    }
    drop(tx);

    let grace = tokio::time::sleep(far_future());
    tokio::pin!(grace);

    let mut outputs_done = false;
    let mut exited = false;
    let mut client_gone = false;

    while !(outputs_done && exited) {
        tokio::select! {
            biased;

            frame = rx.recv(), if !outputs_done => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        debug!(exec_id = %exec_id, error = %e, "client stopped reading output");
                        client_gone = true;
                        break;
                    }
                }
                None => outputs_done = true,
            },
            _ = wait_exited(&mut state), if !exited => {
                exited = true;
                grace.as_mut().reset(Instant::now() + drain_grace);
            }
            _ = &mut grace, if exited => {
                debug!(exec_id = %exec_id, "drain grace elapsed with output still open");
                break;
            }
        }
    }

    for reader in &readers {
        reader.abort();
    }

    if !client_gone {
        if let Err(e) = sink.close().await {
            debug!(exec_id = %exec_id, error = %e, "failed to shut down attach stream");
        }
    }

    Ok(())
}

fn forward_stream(
    kind: StreamKind,
    mut stream: OutputStream,
    tx: mpsc::Sender<StdFrame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = stream.next().await {
            if tx.send(StdFrame::new(kind, chunk)).await.is_err() {
                break;
            }
        }
    })
}

async fn wait_exited(state: &mut watch::Receiver<SessionState>) {
    // A closed channel means the session is gone; treat it as exited.
    let _ = state.wait_for(SessionState::is_exited).await;
}

fn far_future() -> Duration {
    Duration::from_secs(86_400 * 365)
}
