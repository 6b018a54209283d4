//! Process execution handle
//!
//! Provides types for managing a launched exec process: its stdin sink, its
//! output streams, its pty controller and its exit status.

use bytes::Bytes;
use execd_shared::constants::attach::{OUTPUT_CHUNK_SIZE, TTY_EOF};
use execd_shared::constants::exit_codes::SIGNAL_OFFSET;
use execd_shared::errors::{ExecdError, ExecdResult};
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;

/// What closing the input means for the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EofAction {
    /// Close the stdin pipe.
    ClosePipe,
    /// Write the terminal EOF character to the pty.
    TerminalEof,
}

/// Stdin writer for an exec process
///
/// Either the write end of a stdin pipe or the pty master.
pub struct InputSink {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    eof: EofAction,
}

impl InputSink {
    /// Wrap the write end of a stdin pipe.
    pub fn pipe<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
            eof: EofAction::ClosePipe,
        }
    }

    /// Wrap a pty master opened for writing.
    pub fn pty<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
            eof: EofAction::TerminalEof,
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await
    }

    pub(crate) fn writer_mut(&mut self) -> &mut (dyn AsyncWrite + Send + Unpin) {
        &mut *self.writer
    }

    /// Signal end of input to the process.
    ///
    /// The underlying descriptor is closed when the sink is dropped.
    pub async fn close(mut self) -> std::io::Result<()> {
        match self.eof {
            EofAction::ClosePipe => self.writer.shutdown().await,
            EofAction::TerminalEof => {
                self.writer.write_all(&[TTY_EOF]).await?;
                self.writer.flush().await
            }
        }
    }
}

/// Output of one process stream as a sequence of chunks.
///
/// Yields chunks as they arrive (works for both pty and pipes) and ends at
/// EOF. A read error also ends the stream: a pty master reports `EIO` once
/// the last slave descriptor is closed.
pub struct OutputStream {
    inner: Pin<Box<dyn Stream<Item = Bytes> + Send>>,
}

impl OutputStream {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        use async_stream::stream;
        use tokio::io::AsyncReadExt;

        let mut reader = reader;
        let stream = stream! {
            let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => yield Bytes::copy_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
        };

        Self {
            inner: Box::pin(stream),
        }
    }

    /// Read and drop everything until EOF.
    pub async fn discard(mut self) {
        while self.next().await.is_some() {}
    }
}

impl Stream for OutputStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Stdio of an exec process, as handed to the attach multiplexer.
#[derive(Default)]
pub struct ProcessStdio {
    pub stdin: Option<InputSink>,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

/// Process exit status
///
/// Either normal exit with code or termination by signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
}

impl ExitStatus {
    /// Exit code as recorded on the session: signals map to 128 + signo.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitStatus::Code(c) => *c,
            ExitStatus::Signal(s) => SIGNAL_OFFSET + s,
        }
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        match (status.code(), status.signal()) {
            (Some(code), _) => ExitStatus::Code(code),
            (None, Some(signal)) => ExitStatus::Signal(signal),
            (None, None) => ExitStatus::Code(-1),
        }
    }
}

/// PTY master kept for window size changes.
pub struct PtyController {
    master: std::fs::File,
}

impl PtyController {
    pub fn new(master: std::fs::File) -> Self {
        Self { master }
    }

    /// Set the terminal window size (TIOCSWINSZ).
    pub fn resize(&self, rows: u16, cols: u16) -> ExecdResult<()> {
        use nix::libc::TIOCSWINSZ;
        use nix::pty::Winsize;
        use std::os::fd::AsRawFd;

        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        // SAFETY: the fd is owned by `self.master` and winsize outlives the call.
        unsafe {
            if nix::libc::ioctl(self.master.as_raw_fd(), TIOCSWINSZ, &winsize as *const _) == -1 {
                return Err(ExecdError::Internal(format!(
                    "ioctl TIOCSWINSZ ({}x{}) failed: {}",
                    rows,
                    cols,
                    std::io::Error::last_os_error()
                )));
            }
        }

        Ok(())
    }
}

/// Handle to a launched exec process
///
/// Owns the child, its stdio and (in tty mode) the pty controller. The stdio
/// and controller are taken out once; the child itself goes to the exit
/// watcher.
pub struct ExecHandle {
    pid: u32,
    child: Child,
    stdio: ProcessStdio,
    pty: Option<PtyController>,
}

impl ExecHandle {
    pub fn new(pid: u32, child: Child, stdio: ProcessStdio) -> Self {
        Self {
            pid,
            child,
            stdio,
            pty: None,
        }
    }

    pub fn with_pty(mut self, controller: PtyController) -> Self {
        self.pty = Some(controller);
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take stdin/stdout/stderr. Later calls return empty stdio.
    pub fn take_stdio(&mut self) -> ProcessStdio {
        std::mem::take(&mut self.stdio)
    }

    pub fn take_pty(&mut self) -> Option<PtyController> {
        self.pty.take()
    }

    pub fn into_child(self) -> Child {
        self.child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_signal_exit_code() {
        assert_eq!(ExitStatus::Code(3).exit_code(), 3);
        assert_eq!(ExitStatus::Signal(9).exit_code(), 137);
    }

    #[tokio::test]
    async fn test_output_stream_yields_until_eof() {
        let stream = OutputStream::new(std::io::Cursor::new(b"hello world".to_vec()));
        let chunks: Vec<Bytes> = stream.collect().await;
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(joined, b"hello world");
    }

    #[tokio::test]
    async fn test_pipe_sink_close_sends_eof() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let mut sink = InputSink::pipe(writer);
        sink.write_all(b"abc").await.unwrap();
        sink.close().await.unwrap();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"abc");
    }

    #[tokio::test]
    async fn test_pty_sink_close_writes_terminal_eof() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let sink = InputSink::pty(writer);
        sink.close().await.unwrap();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![TTY_EOF]);
    }
}
