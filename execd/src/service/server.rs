//! Control socket server.
//!
//! Accepts connections and speaks the line-delimited JSON control protocol.
//! A successful attaching `start` or `attach` hands the connection over to
//! the attach multiplexer for the rest of its life.

use crate::net::Listener;
use crate::service::exec::{Attachment, ExecService};
use execd_shared::constants::protocol::MAX_LINE_LENGTH;
use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::{Request, Response};
use futures::stream::{Stream, StreamExt};
use futures::SinkExt;
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

type ControlStream<IO> = Framed<IO, LinesCodec>;

/// execd control server.
pub struct ExecServer {
    service: Arc<ExecService>,
}

/// Outcome of one control request.
enum Dispatch {
    Reply(Response),
    Attach(Attachment),
}

impl ExecServer {
    pub fn new(service: Arc<ExecService>) -> Self {
        Self { service }
    }

    /// Serve connections on `listener` until `shutdown` resolves.
    ///
    /// Connections already accepted keep running; only the accept loop
    /// stops.
    pub async fn serve<F>(self, listener: Listener, shutdown: F) -> ExecdResult<()>
    where
        F: Future<Output = ()>,
    {
        match listener {
            Listener::Unix { listener, guard } => {
                use tokio_stream::wrappers::UnixListenerStream;

                let result = self
                    .serve_incoming(UnixListenerStream::new(listener), shutdown)
                    .await;
                drop(guard);
                result
            }
            Listener::Tcp(listener) => {
                use tokio_stream::wrappers::TcpListenerStream;

                self.serve_incoming(TcpListenerStream::new(listener), shutdown)
                    .await
            }
        }
    }

    async fn serve_incoming<S, IO, F>(&self, incoming: S, shutdown: F) -> ExecdResult<()>
    where
        S: Stream<Item = std::io::Result<IO>>,
        IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        F: Future<Output = ()>,
    {
        tokio::pin!(incoming);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                conn = incoming.next() => match conn {
                    Some(Ok(io)) => {
                        debug!("connection accepted");
                        let service = self.service.clone();
                        tokio::spawn(async move {
                            match handle_connection(service, io).await {
                                Ok(()) => debug!("connection closed"),
                                Err(e) => debug!(error = %e, "connection ended with error"),
                            }
                        });
                    }
                    Some(Err(e)) => warn!(error = %e, "failed to accept connection"),
                    None => break,
                },
            }
        }

        Ok(())
    }
}

/// Serve one connection: control requests until EOF or an attach.
pub async fn handle_connection<IO>(service: Arc<ExecService>, io: IO) -> ExecdResult<()>
where
    IO: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut control = Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

    while let Some(line) = control.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                // The stream cannot be resynchronized after an oversized or
                // unreadable line.
                let err = ExecdError::Protocol(format!("unreadable request: {}", e));
                reply(&mut control, &Response::from(&err)).await?;
                return Err(err);
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                reply(&mut control, &Response::from(&ExecdError::from(e))).await?;
                continue;
            }
        };

        debug!(?request, "control request");

        match dispatch(&service, request).await {
            Ok(Dispatch::Reply(response)) => reply(&mut control, &response).await?,
            Ok(Dispatch::Attach(attachment)) => {
                debug!(exec_id = %attachment.exec_id(), "upgrading connection to attach stream");
                reply(
                    &mut control,
                    &Response::Attached {
                        tty: attachment.tty(),
                    },
                )
                .await?;

                // Bytes the client pipelined behind the request line belong
                // to the attach stream.
                let parts = control.into_parts();
                return attachment.serve(parts.io, parts.read_buf.freeze()).await;
            }
            Err(e) => {
                debug!(error = %e, "control request failed");
                reply(&mut control, &Response::from(&e)).await?;
            }
        }
    }

    Ok(())
}

async fn dispatch(service: &ExecService, request: Request) -> ExecdResult<Dispatch> {
    match request {
        Request::Create { container, config } => {
            let id = service.create(&container, config).await?;
            Ok(Dispatch::Reply(Response::Created { id }))
        }
        Request::Inspect { id } => Ok(Dispatch::Reply(Response::Inspected(
            service.inspect(&id).await?,
        ))),
        Request::Start { id, detach: true } => {
            service.start(&id, false).await?;
            Ok(Dispatch::Reply(Response::Started))
        }
        Request::Start { id, detach: false } => match service.start(&id, true).await? {
            Some(attachment) => Ok(Dispatch::Attach(attachment)),
            None => Err(ExecdError::Internal(format!(
                "exec {} started without its stdio",
                id
            ))),
        },
        Request::Attach { id } => Ok(Dispatch::Attach(service.attach(&id).await?)),
        Request::Resize { id, rows, cols } => {
            service.resize(&id, rows, cols).await?;
            Ok(Dispatch::Reply(Response::Resized))
        }
    }
}

async fn reply<IO>(control: &mut ControlStream<IO>, response: &Response) -> ExecdResult<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let line = serde_json::to_string(response)?;
    control
        .send(line)
        .await
        .map_err(|e| ExecdError::Protocol(format!("failed to send response: {}", e)))
}
