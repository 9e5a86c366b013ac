use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;
use crate::constants::{BLOCK_SIZE, MAX_FRAME_SIZE};

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake message in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Message type identifiers in the peer wire protocol.
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
    /// BitComet's private extension; recognised only to be skipped.
    BitComet = 0xFF,
}

/// One block request, the key for in-flight bookkeeping on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// A delivered block: the payload of a `Piece` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    /// The request this block answers.
    pub fn request(&self) -> BlockRequest {
        BlockRequest {
            index: self.index,
            begin: self.begin,
            length: self.data.len() as u32,
        }
    }
}

/// The BitTorrent handshake: protocol string, reserved capability bytes,
/// info hash and peer ID.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Builds our outgoing handshake: fast extension and extension
    /// protocol always on, the DHT bit only for public torrents.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], dht: bool) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10; // extension protocol (BEP-10)
        reserved[7] |= 0x04; // fast extension (BEP-6)
        if dht {
            reserved[7] |= 0x01; // DHT (BEP-5)
        }
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_extension_protocol(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn supports_fast_extension(&self) -> bool {
        self.reserved[7] & 0x04 != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & 0x01 != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
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
        if data[0] != 19 || &data[1..20] != PROTOCOL {
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

/// A peer wire frame: `<u32 length><u8 id><payload>`, length 0 being the
/// keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockRequest),
    Piece(Block),
    Cancel(BlockRequest),
    Port(u16),
    // Fast extension
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(BlockRequest),
    AllowedFast(u32),
    // Extension protocol: `<u8 sub_id><payload>`
    Extended { id: u8, payload: Bytes },
    /// Any id we do not handle (including BitComet's); skipped.
    Unknown { id: u8 },
}

impl Message {
    /// Encodes the frame including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => put_header(&mut buf, MessageId::Choke, 0),
            Message::Unchoke => put_header(&mut buf, MessageId::Unchoke, 0),
            Message::Interested => put_header(&mut buf, MessageId::Interested, 0),
            Message::NotInterested => put_header(&mut buf, MessageId::NotInterested, 0),
            Message::Have(piece) => {
                put_header(&mut buf, MessageId::Have, 4);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                put_header(&mut buf, MessageId::Bitfield, bits.len() as u32);
                buf.put_slice(bits);
            }
            Message::Request(r) => put_request(&mut buf, MessageId::Request, r),
            Message::Piece(block) => {
                put_header(&mut buf, MessageId::Piece, 8 + block.data.len() as u32);
                buf.put_u32(block.index);
                buf.put_u32(block.begin);
                buf.put_slice(&block.data);
            }
            Message::Cancel(r) => put_request(&mut buf, MessageId::Cancel, r),
            Message::Port(port) => {
                put_header(&mut buf, MessageId::Port, 2);
                buf.put_u16(*port);
            }
            Message::Suggest(piece) => {
                put_header(&mut buf, MessageId::Suggest, 4);
                buf.put_u32(*piece);
            }
            Message::HaveAll => put_header(&mut buf, MessageId::HaveAll, 0),
            Message::HaveNone => put_header(&mut buf, MessageId::HaveNone, 0),
            Message::Reject(r) => put_request(&mut buf, MessageId::Reject, r),
            Message::AllowedFast(piece) => {
                put_header(&mut buf, MessageId::AllowedFast, 4);
                buf.put_u32(*piece);
            }
            Message::Extended { id, payload } => {
                put_header(&mut buf, MessageId::Extended, 1 + payload.len() as u32);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::Unknown { .. } => unreachable!("unknown messages are never sent"),
        }

        buf.freeze()
    }

    /// Decodes a frame including its length prefix.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("frame shorter than prefix"));
        }

        let length = data.get_u32();
        if length >= MAX_FRAME_SIZE {
            return Err(PeerError::Malicious("oversized frame"));
        }
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if (data.remaining() as u32) < length {
            return Err(PeerError::InvalidMessage("truncated frame"));
        }

        let id = data.get_u8();
        let payload_len = length - 1;

        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => Ok(Message::Have(get_index(&mut data)?)),
            5 => Ok(Message::Bitfield(data.copy_to_bytes(payload_len as usize))),
            6 => Ok(Message::Request(get_request(&mut data)?)),
            7 => {
                if payload_len < 8 {
                    return Err(PeerError::InvalidMessage("piece frame too short"));
                }
                let data_len = payload_len - 8;
                if data_len > BLOCK_SIZE * 2 {
                    return Err(PeerError::Malicious("oversized piece payload"));
                }
                let index = data.get_u32();
                let begin = data.get_u32();
                Ok(Message::Piece(Block {
                    index,
                    begin,
                    data: data.copy_to_bytes(data_len as usize),
                }))
            }
            8 => Ok(Message::Cancel(get_request(&mut data)?)),
            9 => {
                if data.remaining() < 2 {
                    return Err(PeerError::InvalidMessage("port frame too short"));
                }
                Ok(Message::Port(data.get_u16()))
            }
            13 => Ok(Message::Suggest(get_index(&mut data)?)),
            14 => Ok(Message::HaveAll),
            15 => Ok(Message::HaveNone),
            16 => Ok(Message::Reject(get_request(&mut data)?)),
            17 => Ok(Message::AllowedFast(get_index(&mut data)?)),
            20 => {
                if payload_len < 1 {
                    return Err(PeerError::InvalidMessage("extended frame too short"));
                }
                let ext_id = data.get_u8();
                Ok(Message::Extended {
                    id: ext_id,
                    payload: data.copy_to_bytes(payload_len as usize - 1),
                })
            }
            other => Ok(Message::Unknown { id: other }),
        }
    }
}

fn put_header(buf: &mut BytesMut, id: MessageId, payload_len: u32) {
    buf.put_u32(1 + payload_len);
    buf.put_u8(id as u8);
}

fn put_request(buf: &mut BytesMut, id: MessageId, r: &BlockRequest) {
    put_header(buf, id, 12);
    buf.put_u32(r.index);
    buf.put_u32(r.begin);
    buf.put_u32(r.length);
}

fn get_index(data: &mut Bytes) -> Result<u32, PeerError> {
    if data.remaining() < 4 {
        return Err(PeerError::InvalidMessage("index frame too short"));
    }
    Ok(data.get_u32())
}

fn get_request(data: &mut Bytes) -> Result<BlockRequest, PeerError> {
    if data.remaining() < 12 {
        return Err(PeerError::InvalidMessage("request frame too short"));
    }
    Ok(BlockRequest {
        index: data.get_u32(),
        begin: data.get_u32(),
        length: data.get_u32(),
    })
}
