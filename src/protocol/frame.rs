//! WebSocket frame codec
//!
//! Decodes client frames and encodes server frames using the RFC 6455 base
//! framing layout:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               | Masking-key, if MASK set      |
//! +-------------------------------+-------------------------------+
//! |                         Payload Data                          |
//! +---------------------------------------------------------------+
//! ```
//!
//! Only unfragmented text frames and control frames are accepted. Binary and
//! continuation frames are rejected rather than dropped.

use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// FIN bit in the first header byte
pub const FIN: u8 = 0x80;
/// Opcode bits in the first header byte
pub const OPCODE: u8 = 0x0f;
/// MASK bit in the second header byte
pub const MASKED: u8 = 0x80;
/// Payload length indicator bits in the second header byte
pub const PAYLOAD_LEN: u8 = 0x7f;
/// Length indicator announcing a 16-bit extended length
pub const PAYLOAD_LEN_EXT16: u8 = 126;
/// Length indicator announcing a 64-bit extended length
pub const PAYLOAD_LEN_EXT64: u8 = 127;

/// Largest payload a control frame may carry
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Default upper bound for an inbound payload (16 MiB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Close status codes sent by the server
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const INVALID_PAYLOAD: u16 = 1007;
}

/// Errors produced while decoding or encoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported frame: {0}")]
    UnsupportedFrame(String),

    #[error("Text payload is not valid UTF-8: {0}")]
    Encoding(#[from] std::str::Utf8Error),

    #[error("Payload of {0} bytes cannot be represented in a frame")]
    OversizedPayload(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// True when the peer closed the socket before a full frame arrived
    pub fn is_connection_closed(&self) -> bool {
        match self {
            FrameError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }

    /// Close status code to report to the peer for a decode failure
    pub fn close_code(&self) -> u16 {
        match self {
            FrameError::UnsupportedFrame(_) => close_code::UNSUPPORTED_DATA,
            _ => close_code::PROTOCOL_ERROR,
        }
    }
}

/// Result type for frame operations
pub type FrameResult<T> = Result<T, FrameError>;

/// Frame opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    /// Wire value of the opcode
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    /// Close, ping and pong are control frames
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }

    /// Binary and continuation frames are never accepted or produced
    pub fn is_supported(self) -> bool {
        !matches!(self, Opcode::Continuation | Opcode::Binary)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::Protocol(format!("unknown opcode {:#x}", other))),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Continuation => "continuation",
            Opcode::Text => "text",
            Opcode::Binary => "binary",
            Opcode::Close => "close",
            Opcode::Ping => "ping",
            Opcode::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// A single decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Always set; fragmented messages are rejected during decode
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    /// Mask key as received (client frames only)
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload
    pub payload: Vec<u8>,
}

impl Frame {
    /// Length of the payload as declared on the wire
    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Consume a text frame's payload as a string
    ///
    /// Invalid UTF-8 from a client is a protocol violation.
    pub fn into_text(self) -> FrameResult<String> {
        String::from_utf8(self.payload)
            .map_err(|e| FrameError::Protocol(format!("text frame is not valid UTF-8: {}", e)))
    }
}

/// XOR `payload` in place with the 4-byte mask
///
/// Applying the same mask twice restores the original bytes.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Read one client frame from `reader`
///
/// Client frames must be masked. Payloads declaring more than
/// `max_payload_size` bytes are refused before anything is buffered.
pub async fn read_frame<R>(reader: &mut R, max_payload_size: usize) -> FrameResult<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;

    let fin = header[0] & FIN != 0;
    let opcode = Opcode::try_from(header[0] & OPCODE)?;

    if !opcode.is_supported() {
        return Err(FrameError::UnsupportedFrame(format!(
            "{} frames are not supported",
            opcode
        )));
    }
    if !fin {
        return Err(if opcode.is_control() {
            FrameError::Protocol("control frames must not be fragmented".to_string())
        } else {
            FrameError::UnsupportedFrame("fragmented messages are not supported".to_string())
        });
    }

    let masked = header[1] & MASKED != 0;
    let payload_len = match header[1] & PAYLOAD_LEN {
        PAYLOAD_LEN_EXT16 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len).await?;
            u64::from(u16::from_be_bytes(len))
        }
        PAYLOAD_LEN_EXT64 => {
            let mut len = [0u8; 8];
            reader.read_exact(&mut len).await?;
            u64::from_be_bytes(len)
        }
        len => u64::from(len),
    };

    if !masked {
        return Err(FrameError::Protocol(
            "client frames must be masked".to_string(),
        ));
    }
    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD {
        return Err(FrameError::Protocol(format!(
            "{} frame payload of {} bytes exceeds {}",
            opcode, payload_len, MAX_CONTROL_PAYLOAD
        )));
    }

    let len = usize::try_from(payload_len)
        .ok()
        .filter(|len| *len <= max_payload_size)
        .ok_or_else(|| {
            FrameError::Protocol(format!(
                "payload of {} bytes exceeds limit of {} bytes",
                payload_len, max_payload_size
            ))
        })?;

    let mut mask = [0u8; 4];
    reader.read_exact(&mut mask).await?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    apply_mask(&mut payload, mask);

    Ok(Frame {
        fin: true,
        opcode,
        masked: true,
        mask: Some(mask),
        payload,
    })
}

/// Encode an unmasked server frame
pub fn encode_frame(opcode: Opcode, payload: &[u8]) -> FrameResult<Vec<u8>> {
    encode(opcode, payload, None)
}

/// Encode a text frame, rejecting payloads that are not valid UTF-8
pub fn encode_text(text: &[u8]) -> FrameResult<Vec<u8>> {
    std::str::from_utf8(text)?;
    encode_frame(Opcode::Text, text)
}

/// Encode a close frame carrying `code`
pub fn encode_close(code: u16) -> FrameResult<Vec<u8>> {
    encode_frame(Opcode::Close, &code.to_be_bytes())
}

/// Encode a masked frame the way a client would send it
pub fn encode_masked(opcode: Opcode, payload: &[u8], mask: [u8; 4]) -> FrameResult<Vec<u8>> {
    encode(opcode, payload, Some(mask))
}

fn encode(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> FrameResult<Vec<u8>> {
    if !opcode.is_supported() {
        return Err(FrameError::UnsupportedFrame(format!(
            "cannot send {} frames",
            opcode
        )));
    }

    let len = u64::try_from(payload.len())
        .map_err(|_| FrameError::OversizedPayload(payload.len()))?;
    let mask_bit = if mask.is_some() { MASKED } else { 0 };

    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(FIN | opcode.as_u8());

    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= u64::from(u16::MAX) {
        out.push(mask_bit | PAYLOAD_LEN_EXT16);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | PAYLOAD_LEN_EXT64);
        out.extend_from_slice(&len.to_be_bytes());
    }

    match mask {
        Some(mask) => {
            out.extend_from_slice(&mask);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], mask);
        }
        None => out.extend_from_slice(payload),
    }

    Ok(out)
}
