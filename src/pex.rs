//! Peer Exchange ([BEP-11]).
//!
//! PEX messages ride the extension protocol and carry compact peer lists:
//! `added`/`added.f`/`dropped` for IPv4 (6 bytes per peer) and
//! `added6`/`added6.f`/`dropped6` for IPv6 (18 bytes per peer).
//!
//! [BEP-11]: http://bittorrent.org/beps/bep_0011.html

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::bencode::{decode, encode, Value};

#[derive(Debug, Error)]
pub enum PexError {
    #[error("pex payload is not a bencoded dict")]
    NotADict,

    #[error("compact peer list has invalid length")]
    BadListLength,

    #[error("added.f length does not match added")]
    FlagMismatch,

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),
}

/// Capability flags attached to an added peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PexFlags {
    pub prefer_encryption: bool,
    pub seed_only: bool,
    pub utp: bool,
    pub holepunch: bool,
    /// The sender reached this peer with an outgoing connection, so the
    /// address is known to be connectable.
    pub outgoing: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            prefer_encryption: b & 0x01 != 0,
            seed_only: b & 0x02 != 0,
            utp: b & 0x04 != 0,
            holepunch: b & 0x08 != 0,
            outgoing: b & 0x10 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        let mut b = 0u8;
        if self.prefer_encryption {
            b |= 0x01;
        }
        if self.seed_only {
            b |= 0x02;
        }
        if self.utp {
            b |= 0x04;
        }
        if self.holepunch {
            b |= 0x08;
        }
        if self.outgoing {
            b |= 0x10;
        }
        b
    }
}

/// A peer learned (or lost) via PEX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PexPeer {
    pub addr: SocketAddr,
    pub flags: PexFlags,
}

/// One decoded (or to-be-encoded) `ut_pex` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<PexPeer>,
    pub dropped: Vec<SocketAddr>,
}

impl PexMessage {
    /// Decodes the bencoded `ut_pex` payload, validating every compact
    /// list's length and the `added`/`added.f` pairing.
    pub fn decode(payload: &[u8]) -> Result<Self, PexError> {
        let value = decode(payload)?;
        let dict = value.as_dict().ok_or(PexError::NotADict)?;

        fn field<'a>(dict: &'a BTreeMap<Bytes, Value>, key: &[u8]) -> &'a [u8] {
            dict.get(key)
                .and_then(Value::as_bytes)
                .map(|b| b.as_ref())
                .unwrap_or(&[])
        }

        let added = field(dict, b"added");
        let added_f = field(dict, b"added.f");
        let added6 = field(dict, b"added6");
        let added6_f = field(dict, b"added6.f");

        if added.len() % 6 != 0 || added6.len() % 18 != 0 {
            return Err(PexError::BadListLength);
        }
        if !added_f.is_empty() && added_f.len() != added.len() / 6 {
            return Err(PexError::FlagMismatch);
        }
        if !added6_f.is_empty() && added6_f.len() != added6.len() / 18 {
            return Err(PexError::FlagMismatch);
        }

        let dropped = field(dict, b"dropped");
        let dropped6 = field(dict, b"dropped6");
        if dropped.len() % 6 != 0 || dropped6.len() % 18 != 0 {
            return Err(PexError::BadListLength);
        }

        let mut msg = PexMessage::default();

        for (i, chunk) in added.chunks_exact(6).enumerate() {
            let flags = added_f.get(i).copied().map(PexFlags::from_byte).unwrap_or_default();
            msg.added.push(PexPeer {
                addr: v4_addr(chunk),
                flags,
            });
        }
        for (i, chunk) in added6.chunks_exact(18).enumerate() {
            let flags = added6_f.get(i).copied().map(PexFlags::from_byte).unwrap_or_default();
            msg.added.push(PexPeer {
                addr: v6_addr(chunk),
                flags,
            });
        }
        msg.dropped.extend(dropped.chunks_exact(6).map(v4_addr));
        msg.dropped.extend(dropped6.chunks_exact(18).map(v6_addr));

        Ok(msg)
    }

    /// Encodes to the bencoded wire payload.
    pub fn encode(&self) -> Bytes {
        let mut added = BytesMut::new();
        let mut added_f = BytesMut::new();
        let mut added6 = BytesMut::new();
        let mut added6_f = BytesMut::new();
        let mut dropped = BytesMut::new();
        let mut dropped6 = BytesMut::new();

        for peer in &self.added {
            match peer.addr {
                SocketAddr::V4(v4) => {
                    added.put_slice(&v4.ip().octets());
                    added.put_u16(v4.port());
                    added_f.put_u8(peer.flags.to_byte());
                }
                SocketAddr::V6(v6) => {
                    added6.put_slice(&v6.ip().octets());
                    added6.put_u16(v6.port());
                    added6_f.put_u8(peer.flags.to_byte());
                }
            }
        }
        for addr in &self.dropped {
            match addr {
                SocketAddr::V4(v4) => {
                    dropped.put_slice(&v4.ip().octets());
                    dropped.put_u16(v4.port());
                }
                SocketAddr::V6(v6) => {
                    dropped6.put_slice(&v6.ip().octets());
                    dropped6.put_u16(v6.port());
                }
            }
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"added"), Value::Bytes(added.freeze()));
        dict.insert(Bytes::from_static(b"added.f"), Value::Bytes(added_f.freeze()));
        dict.insert(Bytes::from_static(b"added6"), Value::Bytes(added6.freeze()));
        dict.insert(
            Bytes::from_static(b"added6.f"),
            Value::Bytes(added6_f.freeze()),
        );
        dict.insert(Bytes::from_static(b"dropped"), Value::Bytes(dropped.freeze()));
        dict.insert(
            Bytes::from_static(b"dropped6"),
            Value::Bytes(dropped6.freeze()),
        );

        encode(&Value::Dict(dict)).freeze()
    }
}

fn v4_addr(chunk: &[u8]) -> SocketAddr {
    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
    SocketAddr::V4(SocketAddrV4::new(ip, port))
}

fn v6_addr(chunk: &[u8]) -> SocketAddr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&chunk[..16]);
    let port = u16::from_be_bytes([chunk[16], chunk[17]]);
    SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
}
