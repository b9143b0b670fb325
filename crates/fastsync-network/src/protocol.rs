//! Wire messages for the block-sync channel.
//!
//! Every message travels as an [`Envelope`]: a one-byte type discriminant and
//! the bincode payload of that type. The receiver dispatches on the
//! discriminant and decodes the payload as exactly that type; a payload that
//! does not decode cleanly (including leftover bytes) is a decode error.

use bytes::Bytes;
use fastsync_core::constants::MAX_MESSAGE_SIZE;
use fastsync_core::error::CodecError;
use fastsync_core::types::{Block, BlockHeader};

/// Discriminant carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    BlockRequest = 0x10,
    BlockResponse = 0x11,
    StatusResponse = 0x20,
    StatusRequest = 0x21,
    BlockHeaderRequest = 0x30,
    BlockHeaderResponse = 0x31,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x10 => MessageType::BlockRequest,
            0x11 => MessageType::BlockResponse,
            0x20 => MessageType::StatusResponse,
            0x21 => MessageType::StatusRequest,
            0x30 => MessageType::BlockHeaderRequest,
            0x31 => MessageType::BlockHeaderResponse,
            other => return Err(CodecError::UnknownMessageType(other)),
        })
    }
}

/// Typed frame around a message payload.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Envelope {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// A message on the block-sync channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Ask a peer for its store height. Carries our own.
    StatusRequest { height: u64 },
    /// Our store height.
    StatusResponse { height: u64 },
    /// Ask a peer for the block at `height`.
    BlockRequest { height: u64 },
    BlockResponse { block: Block },
    /// Ask a peer for the header at `height`.
    BlockHeaderRequest { height: u64 },
    BlockHeaderResponse { header: BlockHeader },
}

impl SyncMessage {
    pub fn kind(&self) -> MessageType {
        match self {
            SyncMessage::StatusRequest { .. } => MessageType::StatusRequest,
            SyncMessage::StatusResponse { .. } => MessageType::StatusResponse,
            SyncMessage::BlockRequest { .. } => MessageType::BlockRequest,
            SyncMessage::BlockResponse { .. } => MessageType::BlockResponse,
            SyncMessage::BlockHeaderRequest { .. } => MessageType::BlockHeaderRequest,
            SyncMessage::BlockHeaderResponse { .. } => MessageType::BlockHeaderResponse,
        }
    }

    /// Encode into an envelope.
    ///
    /// Returns an error if the encoded size exceeds [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let payload = match self {
            SyncMessage::StatusRequest { height }
            | SyncMessage::StatusResponse { height }
            | SyncMessage::BlockRequest { height }
            | SyncMessage::BlockHeaderRequest { height } => encode_payload(height)?,
            SyncMessage::BlockResponse { block } => encode_payload(block)?,
            SyncMessage::BlockHeaderResponse { header } => encode_payload(header)?,
        };
        let envelope = Envelope {
            kind: self.kind() as u8,
            payload,
        };
        let buf = bincode::encode_to_vec(&envelope, bincode::config::standard())
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: buf.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Bytes::from(buf))
    }

    /// Decode an envelope and its payload.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let envelope: Envelope = decode_exact(data)?;
        let payload = envelope.payload.as_slice();
        Ok(match MessageType::try_from(envelope.kind)? {
            MessageType::StatusRequest => SyncMessage::StatusRequest {
                height: decode_exact(payload)?,
            },
            MessageType::StatusResponse => SyncMessage::StatusResponse {
                height: decode_exact(payload)?,
            },
            MessageType::BlockRequest => SyncMessage::BlockRequest {
                height: decode_exact(payload)?,
            },
            MessageType::BlockResponse => SyncMessage::BlockResponse {
                block: decode_exact(payload)?,
            },
            MessageType::BlockHeaderRequest => SyncMessage::BlockHeaderRequest {
                height: decode_exact(payload)?,
            },
            MessageType::BlockHeaderResponse => SyncMessage::BlockHeaderResponse {
                header: decode_exact(payload)?,
            },
        })
    }
}

fn encode_payload<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode `T` and require that it consumes every byte.
fn decode_exact<T: bincode::Decode<()>>(data: &[u8]) -> Result<T, CodecError> {
    let (value, read): (T, usize) = bincode::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| CodecError::Decode(e.to_string()))?;
    if read != data.len() {
        return Err(CodecError::TrailingBytes(data.len() - read));
    }
    Ok(value)
}
