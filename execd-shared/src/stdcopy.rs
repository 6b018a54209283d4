//! Multiplexed stdout/stderr framing.
//!
//! A non-tty attach connection carries both output streams of a process on a
//! single channel. Each chunk is prefixed by an 8 byte header:
//!
//! ```text
//! [kind:u8][0][0][0][len:u32 big-endian][payload; len bytes]
//! ```

use crate::constants::attach::{FRAME_HEADER_LEN, MAX_FRAME_LEN};
use crate::errors::ExecdError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Source stream of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StreamKind {
    Stdin = 0,
    Stdout = 1,
    Stderr = 2,
}

impl StreamKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(StreamKind::Stdin),
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

/// One chunk of process output tagged with its stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StdFrame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

impl StdFrame {
    pub fn new(kind: StreamKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Codec for the multiplexed attach stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct StdCopyCodec;

impl Encoder<StdFrame> for StdCopyCodec {
    type Error = ExecdError;

    fn encode(&mut self, frame: StdFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(frame.payload.len()).map_err(|_| {
            ExecdError::Protocol(format!(
                "frame payload of {} bytes exceeds u32",
                frame.payload.len()
            ))
        })?;
        dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
        dst.put_u8(frame.kind as u8);
        dst.put_slice(&[0, 0, 0]);
        dst.put_u32(len);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for StdCopyCodec {
    type Item = StdFrame;
    type Error = ExecdError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let kind = StreamKind::from_byte(src[0])
            .ok_or_else(|| ExecdError::Protocol(format!("unknown stream type {}", src[0])))?;
        if src[1..4] != [0, 0, 0] {
            return Err(ExecdError::Protocol(
                "non-zero reserved bytes in frame header".to_string(),
            ));
        }
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ExecdError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(StdFrame { kind, payload }))
    }
}

/// Split a complete multiplexed capture into (stdout, stderr).
///
/// Fails if the capture ends in the middle of a frame.
pub fn demux(data: &[u8]) -> Result<(Vec<u8>, Vec<u8>), ExecdError> {
    let mut codec = StdCopyCodec;
    let mut buf = BytesMut::from(data);
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    while let Some(frame) = codec.decode(&mut buf)? {
        match frame.kind {
            StreamKind::Stdout => stdout.extend_from_slice(&frame.payload),
            StreamKind::Stderr => stderr.extend_from_slice(&frame.payload),
            StreamKind::Stdin => {}
        }
    }

    if !buf.is_empty() {
        return Err(ExecdError::Protocol(format!(
            "truncated frame: {} trailing bytes",
            buf.len()
        )));
    }

    Ok((stdout, stderr))
}
