//! Relay message framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Message tags (first two bytes of every relay message)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageTag {
    ConnectSuccessSid = 1,
    ReconnectSuccessAck = 2,
    Data = 4,
    Ack = 7,
    LongClose = 10,
}

impl TryFrom<u16> for MessageTag {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageTag::ConnectSuccessSid),
            2 => Ok(MessageTag::ReconnectSuccessAck),
            4 => Ok(MessageTag::Data),
            7 => Ok(MessageTag::Ack),
            10 => Ok(MessageTag::LongClose),
            other => Err(other),
        }
    }
}

/// Codec errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Incomplete message")]
    Incomplete,

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Session id is not valid UTF-8")]
    InvalidSid,

    #[error("Cannot encode message with unknown tag {0}")]
    UnknownTag(u16),
}

/// A single relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    /// Sent by the relay once the backend connection is established
    ConnectSuccessSid { sid: String },
    /// Sent by the relay after a successful reconnect
    ReconnectSuccessAck { ack: u64 },
    /// Payload bytes, in either direction
    Data { data: Bytes },
    /// Total number of payload bytes received so far
    Ack { ack: u64 },
    /// Relay-initiated close with an explanation
    LongClose { code: u32, reason: String },
    /// A tag this implementation does not know; receivers skip it
    Unknown(u16),
}

impl RelayMessage {
    /// Tag length in bytes
    pub const TAG_SIZE: usize = 2;

    pub fn data(data: impl Into<Bytes>) -> Self {
        RelayMessage::Data { data: data.into() }
    }

    pub fn ack(ack: u64) -> Self {
        RelayMessage::Ack { ack }
    }

    pub fn tag(&self) -> u16 {
        match self {
            RelayMessage::ConnectSuccessSid { .. } => MessageTag::ConnectSuccessSid as u16,
            RelayMessage::ReconnectSuccessAck { .. } => MessageTag::ReconnectSuccessAck as u16,
            RelayMessage::Data { .. } => MessageTag::Data as u16,
            RelayMessage::Ack { .. } => MessageTag::Ack as u16,
            RelayMessage::LongClose { .. } => MessageTag::LongClose as u16,
            RelayMessage::Unknown(tag) => *tag,
        }
    }

    /// Encode message to bytes
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        buf.put_u16(self.tag());

        match self {
            RelayMessage::ConnectSuccessSid { sid } => {
                buf.put_u32(sid.len() as u32);
                buf.put_slice(sid.as_bytes());
            }
            RelayMessage::ReconnectSuccessAck { ack } | RelayMessage::Ack { ack } => {
                buf.put_u64(*ack);
            }
            RelayMessage::Data { data } => {
                if data.len() > crate::MAX_DATA_PAYLOAD {
                    return Err(CodecError::PayloadTooLarge(data.len()));
                }
                buf.put_u32(data.len() as u32);
                buf.put(data.clone());
            }
            RelayMessage::LongClose { code, reason } => {
                buf.put_u32(*code);
                buf.put_u32(reason.len() as u32);
                buf.put_slice(reason.as_bytes());
            }
            RelayMessage::Unknown(tag) => return Err(CodecError::UnknownTag(*tag)),
        }

        Ok(buf.freeze())
    }

    /// Decode a message from one WebSocket binary frame
    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        if buf.len() < Self::TAG_SIZE {
            return Err(CodecError::Incomplete);
        }

        let tag = match MessageTag::try_from(buf.get_u16()) {
            Ok(tag) => tag,
            Err(unknown) => return Ok(RelayMessage::Unknown(unknown)),
        };

        match tag {
            MessageTag::ConnectSuccessSid => {
                let sid = read_length_prefixed(&mut buf, usize::MAX)?;
                let sid = String::from_utf8(sid.to_vec()).map_err(|_| CodecError::InvalidSid)?;
                Ok(RelayMessage::ConnectSuccessSid { sid })
            }
            MessageTag::ReconnectSuccessAck => Ok(RelayMessage::ReconnectSuccessAck {
                ack: read_u64(&mut buf)?,
            }),
            MessageTag::Ack => Ok(RelayMessage::Ack {
                ack: read_u64(&mut buf)?,
            }),
            MessageTag::Data => {
                let data = read_length_prefixed(&mut buf, crate::MAX_DATA_PAYLOAD)?;
                Ok(RelayMessage::Data { data })
            }
            MessageTag::LongClose => {
                if buf.remaining() < 4 {
                    return Err(CodecError::Incomplete);
                }
                let code = buf.get_u32();
                let reason = read_length_prefixed(&mut buf, usize::MAX)?;
                Ok(RelayMessage::LongClose {
                    code,
                    reason: String::from_utf8_lossy(&reason).into_owned(),
                })
            }
        }
    }
}

fn read_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Incomplete);
    }
    Ok(buf.get_u64())
}

fn read_length_prefixed(buf: &mut Bytes, max_len: usize) -> Result<Bytes, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Incomplete);
    }

    let length = buf.get_u32() as usize;
    if length > max_len {
        return Err(CodecError::PayloadTooLarge(length));
    }
    if buf.remaining() < length {
        return Err(CodecError::Incomplete);
    }

    Ok(buf.split_to(length))
}
