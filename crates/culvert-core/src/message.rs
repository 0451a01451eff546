//! Wire messages and their framing.
//!
//! Every message travels as `[len: u32 LE][tag: u8][body]`, where `len`
//! counts the tag byte plus the body. The tag selects the variant; bodies
//! are fixed layouts with any trailing bytes being the opaque payload.
//! Payloads are never interpreted by this crate.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{DecodeError, TransportError};

/// Upper bound on the length field, checked before any allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reserved call-id value meaning "no ids available" in the original wire
/// dialect. Never allocated and never placed on the wire.
pub const NO_CALL_ID: u8 = 127;

/// Largest allocatable call-id value. Together with the excluded
/// [`NO_CALL_ID`] sentinel this yields exactly 254 usable ids per `fn_id`.
pub const MAX_CALL_ID: u8 = 254;

mod tag {
    pub const INIT: u8 = 0x01;
    pub const ACCEPT: u8 = 0x02;
    pub const CALL: u8 = 0x03;
    pub const RESULT: u8 = 0x04;
    pub const ERROR: u8 = 0x05;
    pub const PING: u8 = 0x06;
}

/// The `(call_id, fn_id)` pair correlating one in-flight outbound call on
/// one tunnel to its eventual `Result` or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId {
    pub call_id: u8,
    pub fn_id: u8,
}

impl CallId {
    pub fn new(call_id: u8, fn_id: u8) -> Self {
        Self { call_id, fn_id }
    }
}

/// A logical protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Handshake: how many sockets each tunnel should use, in tunnel order.
    Init { socket_counts: Vec<u8> },
    /// Handshake reply: one transfer port per requested socket, in
    /// allocation order.
    Accept { ports: Vec<u16> },
    /// Invoke the procedure at position `fn_id` on the receiver.
    Call { fn_id: u8, call_id: u8, args: Bytes },
    /// Successful reply to a `Call` bearing the same identifying pair.
    Result { fn_id: u8, call_id: u8, response: Bytes },
    /// Failed reply to a `Call`; the payload is the error text as UTF-8.
    Error { fn_id: u8, call_id: u8, message: Bytes },
    /// Liveness echo. Answered with another `Ping`.
    Ping,
}

impl Message {
    /// Short variant name, used in logs and protocol-violation errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "Init",
            Self::Accept { .. } => "Accept",
            Self::Call { .. } => "Call",
            Self::Result { .. } => "Result",
            Self::Error { .. } => "Error",
            Self::Ping => "Ping",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Init { .. } => tag::INIT,
            Self::Accept { .. } => tag::ACCEPT,
            Self::Call { .. } => tag::CALL,
            Self::Result { .. } => tag::RESULT,
            Self::Error { .. } => tag::ERROR,
            Self::Ping => tag::PING,
        }
    }

    fn body_len(&self) -> usize {
        match self {
            Self::Init { socket_counts } => socket_counts.len(),
            Self::Accept { ports } => ports.len() * 2,
            Self::Call { args, .. } => 2 + args.len(),
            Self::Result { response, .. } => 2 + response.len(),
            Self::Error { message, .. } => 2 + message.len(),
            Self::Ping => 0,
        }
    }

    /// Append the framed encoding of `self` to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let len = 1 + self.body_len();
        buf.reserve(4 + len);
        buf.put_u32_le(len as u32);
        buf.put_u8(self.tag());
        match self {
            Self::Init { socket_counts } => buf.put_slice(socket_counts),
            Self::Accept { ports } => {
                for port in ports {
                    buf.put_u16_le(*port);
                }
            }
            Self::Call { fn_id, call_id, args } => {
                buf.put_u8(*fn_id);
                buf.put_u8(*call_id);
                buf.put_slice(args);
            }
            Self::Result { fn_id, call_id, response } => {
                buf.put_u8(*fn_id);
                buf.put_u8(*call_id);
                buf.put_slice(response);
            }
            Self::Error { fn_id, call_id, message } => {
                buf.put_u8(*fn_id);
                buf.put_u8(*call_id);
                buf.put_slice(message);
            }
            Self::Ping => {}
        }
    }

    /// Decode one frame (tag byte plus body, the length prefix already
    /// stripped and validated).
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = frame;
        if buf.is_empty() {
            return Err(DecodeError::FrameTooShort { len: 0 });
        }
        let tag = buf.get_u8();
        let len = buf.remaining();
        match tag {
            tag::INIT => Ok(Self::Init { socket_counts: buf.to_vec() }),
            tag::ACCEPT => {
                if len % 2 != 0 {
                    return Err(DecodeError::InvalidBody { tag, len });
                }
                let mut ports = Vec::with_capacity(len / 2);
                while buf.has_remaining() {
                    ports.push(buf.get_u16_le());
                }
                Ok(Self::Accept { ports })
            }
            tag::CALL | tag::RESULT | tag::ERROR => {
                if len < 2 {
                    return Err(DecodeError::Truncated { tag, len });
                }
                let fn_id = buf.get_u8();
                let call_id = buf.get_u8();
                let payload = Bytes::copy_from_slice(buf);
                Ok(match tag {
                    tag::CALL => Self::Call { fn_id, call_id, args: payload },
                    tag::RESULT => Self::Result { fn_id, call_id, response: payload },
                    _ => Self::Error { fn_id, call_id, message: payload },
                })
            }
            tag::PING => {
                if len != 0 {
                    return Err(DecodeError::InvalidBody { tag, len });
                }
                Ok(Self::Ping)
            }
            other => Err(DecodeError::UnknownTag(other)),
        }
    }
}

/// Read one complete message from `r`.
///
/// A clean EOF before the length prefix maps to [`TransportError::Closed`].
pub async fn read_message<R>(r: &mut R) -> Result<Message, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Err(DecodeError::FrameTooShort { len }.into());
    }
    if len > MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge { len, max: MAX_FRAME_LEN }.into());
    }
    let mut frame = vec![0u8; len];
    r.read_exact(&mut frame).await?;
    Ok(Message::decode(&frame)?)
}

/// Write one complete message to `w` and flush it.
pub async fn write_message<W>(w: &mut W, msg: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    msg.encode(&mut buf);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}
