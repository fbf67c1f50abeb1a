//! Wire frame codec.
//!
//! Every message on a termlink connection is one frame:
//! `[1 byte type][4 bytes big-endian payload length][payload]`.
//!
//! The codec enforces no intrinsic payload bound; [`read_frame`] takes the
//! cap from its caller so memory policy stays above this layer.
//! [`DEFAULT_MAX_PAYLOAD`] is the cap both the daemon and the client use.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::handshake::HandshakeRequest;

/// Header: 1 type byte + 4 length bytes.
pub const HEADER_LEN: usize = 5;

/// Payload cap passed to [`read_frame`] by both halves of termlink.
///
/// Interactive traffic is tiny; anything near this size is a broken or
/// hostile peer, and rejecting the frame beats allocating for it.
pub const DEFAULT_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Frame type tags on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Raw bytes to or from the PTY.
    Data = 0x00,
    /// Window size change: rows (u32 BE) then cols (u32 BE).
    Resize = 0x01,
    /// Session over; empty payload.
    Exit = 0x02,
    /// First frame on a connection; JSON handshake payload.
    Handshake = 0x10,
    /// UTF-8 error text.
    Error = 0xFF,
}

impl FrameType {
    /// Map a wire byte to a known frame type.
    ///
    /// Unknown bytes return `None`; handlers skip those frames rather than
    /// erroring, so new frame types can be introduced without breaking old
    /// peers.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Data),
            0x01 => Some(Self::Resize),
            0x02 => Some(Self::Exit),
            0x10 => Some(Self::Handshake),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }
}

/// One decoded wire frame.
///
/// `kind` keeps the raw wire byte so frames of unknown type survive
/// decoding and can be ignored downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(kind: FrameType, payload: Vec<u8>) -> Self {
        Self {
            kind: kind as u8,
            payload,
        }
    }

    /// A `Data` frame carrying raw PTY bytes.
    pub fn data(bytes: &[u8]) -> Self {
        Self::new(FrameType::Data, bytes.to_vec())
    }

    /// A `Resize` frame: rows then cols, each u32 big-endian.
    pub fn resize(rows: u32, cols: u32) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&rows.to_be_bytes());
        payload.extend_from_slice(&cols.to_be_bytes());
        Self::new(FrameType::Resize, payload)
    }

    /// An empty `Exit` frame.
    pub fn exit() -> Self {
        Self::new(FrameType::Exit, Vec::new())
    }

    /// A `Handshake` frame with the request serialized as JSON.
    pub fn handshake(request: &HandshakeRequest) -> Result<Self, serde_json::Error> {
        Ok(Self::new(FrameType::Handshake, serde_json::to_vec(request)?))
    }

    /// An `Error` frame carrying UTF-8 text.
    pub fn error(text: &str) -> Self {
        Self::new(FrameType::Error, text.as_bytes().to_vec())
    }

    /// The known frame type, or `None` for a type byte this version does
    /// not understand.
    pub fn frame_type(&self) -> Option<FrameType> {
        FrameType::from_byte(self.kind)
    }

    /// Encode to the wire form: exactly `HEADER_LEN + payload.len()` bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.kind);
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Unpack a `Resize` payload.
///
/// Returns `None` unless the payload is exactly 8 bytes; handlers ignore
/// malformed resize frames instead of killing the connection.
pub fn decode_resize(payload: &[u8]) -> Option<(u32, u32)> {
    let bytes: &[u8; 8] = payload.try_into().ok()?;
    let rows = u32::from_be_bytes(bytes[0..4].try_into().expect("4-byte slice"));
    let cols = u32::from_be_bytes(bytes[4..8].try_into().expect("4-byte slice"));
    Some((rows, cols))
}

/// Read exactly one frame from the stream.
///
/// Reads the 5-byte header, then exactly the declared payload length.
/// Fails with [`ProtocolError::Truncated`] if the stream ends inside
/// either, and with [`ProtocolError::Oversized`] before allocating when
/// the declared length exceeds `max_payload`.
pub async fn read_frame<R>(reader: &mut R, max_payload: usize) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_truncated(reader, &mut header).await?;

    let kind = header[0];
    let len = u32::from_be_bytes(header[1..5].try_into().expect("4-byte slice")) as usize;
    if len > max_payload {
        return Err(ProtocolError::Oversized {
            len,
            max: max_payload,
        });
    }

    let mut payload = vec![0u8; len];
    if len > 0 {
        read_exact_or_truncated(reader, &mut payload).await?;
    }

    Ok(Frame { kind, payload })
}

/// Write one frame and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await
}

async fn read_exact_or_truncated<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtocolError::Truncated),
        Err(e) => Err(ProtocolError::Io(e)),
    }
}
