use super::error::PeerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Reserved-byte flag for the extension protocol (BEP-10), in byte 5.
const EXTENSION_PROTOCOL_FLAG: u8 = 0x10;
/// Reserved-byte flag for the fast extension (BEP-6), in byte 7.
const FAST_EXTENSION_FLAG: u8 = 0x04;

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
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(PeerError::InvalidMessageId(value)),
        }
    }
}

/// The 68-byte greeting both sides send before any framed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Creates a handshake advertising the extension protocol and the fast
    /// extension.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= EXTENSION_PROTOCOL_FLAG;
        reserved[7] |= FAST_EXTENSION_FLAG;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        (self.reserved[5] & EXTENSION_PROTOCOL_FLAG) != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        (self.reserved[7] & FAST_EXTENSION_FLAG) != 0
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

    /// Decodes a handshake. The protocol tag must match exactly.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() != HANDSHAKE_LEN {
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
    // Fast extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    // Extension protocol
    Extended { id: u8, payload: Bytes },
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        Some(match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::Suggest { .. } => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject { .. } => MessageId::Reject,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
        })
    }

    /// Encodes the message with its 4-byte length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let Some(id) = self.id() else {
            buf.put_u32(0);
            return;
        };

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => {
                buf.put_u32(1);
                buf.put_u8(id as u8);
            }
            Message::Have { piece }
            | Message::Suggest { piece }
            | Message::AllowedFast { piece } => {
                buf.put_u32(5);
                buf.put_u8(id as u8);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(id as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            }
            | Message::Reject {
                index,
                begin,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(id as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(id as u8);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(id as u8);
                buf.put_u16(*port);
            }
            Message::Extended { id: ext_id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(id as u8);
                buf.put_u8(*ext_id);
                buf.put_slice(payload);
            }
        }
    }

    /// Decodes one complete frame, length prefix included.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("too short".into()));
        }

        let length = data.get_u32() as usize;
        if data.remaining() != length {
            return Err(PeerError::InvalidMessage(format!(
                "frame declares {} bytes, carries {}",
                length,
                data.remaining()
            )));
        }

        Self::decode_body(data)
    }

    /// Decodes a frame body (message id and payload, without the length
    /// prefix). An empty body is a keep-alive.
    ///
    /// Every fixed-size message must carry exactly its payload length.
    pub fn decode_body(mut data: Bytes) -> Result<Self, PeerError> {
        if data.is_empty() {
            return Ok(Message::KeepAlive);
        }

        let id = MessageId::try_from(data.get_u8())?;
        let message = match id {
            MessageId::Choke => expect_len(id, &data, 0).map(|_| Message::Choke)?,
            MessageId::Unchoke => expect_len(id, &data, 0).map(|_| Message::Unchoke)?,
            MessageId::Interested => expect_len(id, &data, 0).map(|_| Message::Interested)?,
            MessageId::NotInterested => expect_len(id, &data, 0).map(|_| Message::NotInterested)?,
            MessageId::HaveAll => expect_len(id, &data, 0).map(|_| Message::HaveAll)?,
            MessageId::HaveNone => expect_len(id, &data, 0).map(|_| Message::HaveNone)?,
            MessageId::Have => {
                expect_len(id, &data, 4)?;
                Message::Have {
                    piece: data.get_u32(),
                }
            }
            MessageId::Suggest => {
                expect_len(id, &data, 4)?;
                Message::Suggest {
                    piece: data.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                expect_len(id, &data, 4)?;
                Message::AllowedFast {
                    piece: data.get_u32(),
                }
            }
            MessageId::Bitfield => Message::Bitfield(data),
            MessageId::Request | MessageId::Cancel | MessageId::Reject => {
                expect_len(id, &data, 12)?;
                let index = data.get_u32();
                let begin = data.get_u32();
                let length = data.get_u32();
                match id {
                    MessageId::Request => Message::Request {
                        index,
                        begin,
                        length,
                    },
                    MessageId::Cancel => Message::Cancel {
                        index,
                        begin,
                        length,
                    },
                    _ => Message::Reject {
                        index,
                        begin,
                        length,
                    },
                }
            }
            MessageId::Piece => {
                if data.remaining() < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data,
                }
            }
            MessageId::Port => {
                expect_len(id, &data, 2)?;
                Message::Port(data.get_u16())
            }
            MessageId::Extended => {
                if data.remaining() < 1 {
                    return Err(PeerError::InvalidMessage("extended too short".into()));
                }
                let ext_id = data.get_u8();
                Message::Extended {
                    id: ext_id,
                    payload: data,
                }
            }
        };

        Ok(message)
    }
}

fn expect_len(id: MessageId, payload: &Bytes, len: usize) -> Result<(), PeerError> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(PeerError::InvalidMessage(format!(
            "{:?} payload must be {} bytes, got {}",
            id,
            len,
            payload.len()
        )))
    }
}
