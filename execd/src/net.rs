//! Socket plumbing shared by the daemon and the client.

use execd_shared::errors::{ExecdError, ExecdResult};
use execd_shared::Transport;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, info};

/// A bidirectional byte stream usable on either side of the socket.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedIo = Box<dyn AsyncIo>;

/// Connect to a daemon listening on `transport`.
pub async fn connect(transport: &Transport) -> ExecdResult<BoxedIo> {
    let io: BoxedIo = match transport {
        Transport::Unix { socket_path } => Box::new(
            UnixStream::connect(socket_path)
                .await
                .map_err(|e| unreachable(transport, e))?,
        ),
        Transport::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(|e| unreachable(transport, e))?;
            stream.set_nodelay(true)?;
            Box::new(stream)
        }
    };
    debug!(transport = %transport, "connected to execd");
    Ok(io)
}

/// Removes a unix socket file when dropped.
#[derive(Debug)]
pub struct SocketGuard(PathBuf);

impl SocketGuard {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// A bound daemon socket.
#[derive(Debug)]
pub enum Listener {
    Unix {
        listener: UnixListener,
        guard: SocketGuard,
    },
    Tcp(TcpListener),
}

impl Listener {
    /// Bind `transport`. A stale unix socket file is replaced.
    pub async fn bind(transport: &Transport) -> ExecdResult<Self> {
        match transport {
            Transport::Unix { socket_path } => {
                if socket_path.exists() {
                    std::fs::remove_file(socket_path)?;
                }
                if let Some(parent) = socket_path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let listener = UnixListener::bind(socket_path)?;
                info!("Listening on unix://{}", socket_path.display());
                Ok(Listener::Unix {
                    listener,
                    guard: SocketGuard(socket_path.clone()),
                })
            }
            Transport::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                info!("Listening on tcp://{}", listener.local_addr()?);
                Ok(Listener::Tcp(listener))
            }
        }
    }

    /// Where clients reach this listener (resolves port 0).
    pub fn local_transport(&self) -> ExecdResult<Transport> {
        match self {
            Listener::Unix { guard, .. } => Ok(Transport::unix(guard.path())),
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Transport::tcp(addr.ip().to_string(), addr.port()))
            }
        }
    }
}

/// Map a failed connect into something a caller can act on.
fn unreachable(transport: &Transport, err: std::io::Error) -> ExecdError {
    ExecdError::Io(std::io::Error::new(
        err.kind(),
        format!("execd unreachable at {}: {}", transport, err),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unix_listener_removes_socket_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/execd.sock");
        let transport = Transport::unix(&path);

        let listener = Listener::bind(&transport).await.unwrap();
        assert!(path.exists());
        assert_eq!(listener.local_transport().unwrap(), transport);

        connect(&transport).await.unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_tcp_listener_reports_bound_port() {
        let listener = Listener::bind(&Transport::tcp("127.0.0.1", 0)).await.unwrap();
        match listener.local_transport().unwrap() {
            Transport::Tcp { port, .. } => assert_ne!(port, 0),
            other => panic!("unexpected transport {:?}", other),
        }
    }
}
