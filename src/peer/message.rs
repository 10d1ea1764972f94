use super::error::PeerError;
use crate::constants::{
    DHT_RESERVED_BYTE, DHT_RESERVED_MASK, ENCRYPTION_RESERVED_BYTE, ENCRYPTION_RESERVED_MASK,
    HANDSHAKE_LEN, PROTOCOL,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Encrypted-stream key exchange
    SendKey = 10,
    SendSymmetricKey = 11,
}

impl MessageId {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageId::Choke),
            1 => Some(MessageId::Unchoke),
            2 => Some(MessageId::Interested),
            3 => Some(MessageId::NotInterested),
            4 => Some(MessageId::Have),
            5 => Some(MessageId::Bitfield),
            6 => Some(MessageId::Request),
            7 => Some(MessageId::Piece),
            8 => Some(MessageId::Cancel),
            9 => Some(MessageId::Port),
            10 => Some(MessageId::SendKey),
            11 => Some(MessageId::SendSymmetricKey),
            _ => None,
        }
    }
}

/// The 68-byte preamble exchanged before framed messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], reserved: [u8; 8]) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_encryption(&self) -> bool {
        (self.reserved[ENCRYPTION_RESERVED_BYTE] & ENCRYPTION_RESERVED_MASK) != 0
    }

    pub fn supports_dht(&self) -> bool {
        (self.reserved[DHT_RESERVED_BYTE] & DHT_RESERVED_MASK) != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }

        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A framed peer wire message.
///
/// `Unknown` is only ever produced by decoding a tag this client does not
/// speak; encoding it writes the tag and payload back unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    /// RSA public key: exponent and modulus, big-endian.
    SendKey {
        chunk_bits: u32,
        key: Bytes,
        modulus: Bytes,
    },
    /// Symmetric stream key, encrypted under the receiver's public key.
    SendSymmetricKey(Bytes),
    Unknown { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message with its 4-byte length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            Message::Have { piece } => {
                buf.put_u32(5);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Request as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.reserve(13 + data.len());
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(MessageId::Cancel as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::SendKey {
                chunk_bits,
                key,
                modulus,
            } => {
                buf.put_u32(13 + key.len() as u32 + modulus.len() as u32);
                buf.put_u8(MessageId::SendKey as u8);
                buf.put_u32(*chunk_bits);
                buf.put_u32(key.len() as u32);
                buf.put_slice(key);
                buf.put_u32(modulus.len() as u32);
                buf.put_slice(modulus);
            }
            Message::SendSymmetricKey(key) => {
                buf.put_u32(1 + key.len() as u32);
                buf.put_u8(MessageId::SendSymmetricKey as u8);
                buf.put_slice(key);
            }
            Message::Unknown { id, payload } => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.freeze()
    }

    /// Decodes one complete frame, length prefix included.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(malformed(0, "frame shorter than its length prefix"));
        }

        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() != length {
            return Err(malformed(0, "length prefix does not match frame"));
        }

        let id = data.get_u8();
        Self::decode_payload(id, data)
    }

    /// Decodes a message from its tag and payload.
    ///
    /// Fails with [`PeerError::MalformedMessage`] when the payload length
    /// does not fit the tag.
    pub fn decode_payload(id: u8, mut payload: Bytes) -> Result<Self, PeerError> {
        let Some(kind) = MessageId::from_u8(id) else {
            return Ok(Message::Unknown { id, payload });
        };
        let len = payload.len();

        match kind {
            MessageId::Choke | MessageId::Unchoke | MessageId::Interested | MessageId::NotInterested
                if len != 0 =>
            {
                Err(malformed(id, "unexpected payload"))
            }
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => {
                if len != 4 {
                    return Err(malformed(id, "have payload must be 4 bytes"));
                }
                Ok(Message::Have {
                    piece: payload.get_u32(),
                })
            }
            MessageId::Bitfield => {
                if len == 0 {
                    return Err(malformed(id, "empty bitfield"));
                }
                Ok(Message::Bitfield(payload))
            }
            MessageId::Request | MessageId::Cancel => {
                if len != 12 {
                    return Err(malformed(id, "request payload must be 12 bytes"));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let length = payload.get_u32();
                if kind == MessageId::Request {
                    Ok(Message::Request {
                        index,
                        begin,
                        length,
                    })
                } else {
                    Ok(Message::Cancel {
                        index,
                        begin,
                        length,
                    })
                }
            }
            MessageId::Piece => {
                if len < 9 {
                    return Err(malformed(id, "piece payload too short"));
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Ok(Message::Piece {
                    index,
                    begin,
                    data: payload,
                })
            }
            MessageId::Port => {
                if len != 2 {
                    return Err(malformed(id, "port payload must be 2 bytes"));
                }
                Ok(Message::Port(payload.get_u16()))
            }
            MessageId::SendKey => decode_send_key(payload),
            MessageId::SendSymmetricKey => {
                if len == 0 {
                    return Err(malformed(id, "empty symmetric key"));
                }
                Ok(Message::SendSymmetricKey(payload))
            }
        }
    }

    /// Tag byte of the message; `None` for keep-alives.
    pub fn id(&self) -> Option<u8> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke as u8,
            Message::Unchoke => MessageId::Unchoke as u8,
            Message::Interested => MessageId::Interested as u8,
            Message::NotInterested => MessageId::NotInterested as u8,
            Message::Have { .. } => MessageId::Have as u8,
            Message::Bitfield(_) => MessageId::Bitfield as u8,
            Message::Request { .. } => MessageId::Request as u8,
            Message::Piece { .. } => MessageId::Piece as u8,
            Message::Cancel { .. } => MessageId::Cancel as u8,
            Message::Port(_) => MessageId::Port as u8,
            Message::SendKey { .. } => MessageId::SendKey as u8,
            Message::SendSymmetricKey(_) => MessageId::SendSymmetricKey as u8,
            Message::Unknown { id, .. } => *id,
        };
        Some(id)
    }
}

fn decode_send_key(mut payload: Bytes) -> Result<Message, PeerError> {
    let id = MessageId::SendKey as u8;
    if payload.len() < 12 {
        return Err(malformed(id, "key payload too short"));
    }

    let chunk_bits = payload.get_u32();
    let key_len = payload.get_u32() as usize;
    if payload.remaining() < key_len + 4 {
        return Err(malformed(id, "key length exceeds payload"));
    }
    let key = payload.split_to(key_len);

    let modulus_len = payload.get_u32() as usize;
    if payload.remaining() != modulus_len {
        return Err(malformed(id, "modulus length does not match payload"));
    }

    Ok(Message::SendKey {
        chunk_bits,
        key,
        modulus: payload,
    })
}

fn malformed(id: u8, reason: &'static str) -> PeerError {
    PeerError::MalformedMessage { id, reason }
}
