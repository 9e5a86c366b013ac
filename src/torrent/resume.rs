use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;

use bytes::Bytes;

use super::download::Torrent;
use super::State;
use crate::bencode::{decode, encode, Value};
use crate::metainfo::InfoHash;

/// The bencoded record persisted per torrent so a restart can pick up
/// where it left off.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResumeData {
    pub info_hash: InfoHash,
    pub base_path: PathBuf,
    /// Wire-encoded `have` bitfield at save time; advisory, the startup
    /// check re-verifies from disk.
    pub bitfield: Vec<u8>,
    pub tags: Vec<String>,
    pub trackers: Vec<Vec<String>>,
    pub added_at: i64,
    pub completed_at: i64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub state: State,
}

impl ResumeData {
    pub fn to_bytes(&self) -> Bytes {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"added_at"),
            Value::Int(self.added_at),
        );
        dict.insert(
            Bytes::from_static(b"base_path"),
            Value::text(&self.base_path.to_string_lossy()),
        );
        dict.insert(
            Bytes::from_static(b"bitfield"),
            Value::Bytes(Bytes::copy_from_slice(&self.bitfield)),
        );
        dict.insert(
            Bytes::from_static(b"completed_at"),
            Value::Int(self.completed_at),
        );
        dict.insert(
            Bytes::from_static(b"downloaded"),
            Value::Int(self.downloaded as i64),
        );
        dict.insert(
            Bytes::from_static(b"info_hash"),
            Value::Bytes(Bytes::copy_from_slice(self.info_hash.as_bytes())),
        );
        dict.insert(
            Bytes::from_static(b"state"),
            Value::Int(self.state.to_bits() as i64),
        );
        dict.insert(
            Bytes::from_static(b"tags"),
            Value::List(self.tags.iter().map(|t| Value::text(t)).collect()),
        );
        dict.insert(
            Bytes::from_static(b"trackers"),
            Value::List(
                self.trackers
                    .iter()
                    .map(|tier| Value::List(tier.iter().map(|u| Value::text(u)).collect()))
                    .collect(),
            ),
        );
        dict.insert(
            Bytes::from_static(b"uploaded"),
            Value::Int(self.uploaded as i64),
        );
        encode(&Value::Dict(dict)).freeze()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let value = decode(data).ok()?;
        let dict = value.as_dict()?;

        let hash_bytes = dict.get(b"info_hash".as_slice())?.as_bytes()?;
        let info_hash = InfoHash(<[u8; 20]>::try_from(hash_bytes.as_ref()).ok()?);

        let trackers = dict
            .get(b"trackers".as_slice())
            .and_then(Value::as_list)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect::<Vec<_>>()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let tags = dict
            .get(b"tags".as_slice())
            .and_then(Value::as_list)
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        let int = |key: &[u8]| dict.get(key).and_then(Value::as_int);

        Some(ResumeData {
            info_hash,
            base_path: PathBuf::from(dict.get(b"base_path".as_slice())?.as_str()?),
            bitfield: dict
                .get(b"bitfield".as_slice())
                .and_then(Value::as_bytes)
                .map(|b| b.to_vec())
                .unwrap_or_default(),
            tags,
            trackers,
            added_at: int(b"added_at").unwrap_or(0),
            completed_at: int(b"completed_at").unwrap_or(0),
            downloaded: int(b"downloaded").unwrap_or(0).max(0) as u64,
            uploaded: int(b"uploaded").unwrap_or(0).max(0) as u64,
            state: int(b"state")
                .and_then(|bits| State::from_bits(bits as u8))
                .unwrap_or(State::STOPPED),
        })
    }
}

impl Torrent {
    /// Snapshot of everything the resume record needs.
    pub(crate) fn resume_data(&self) -> ResumeData {
        ResumeData {
            info_hash: self.info().hash,
            base_path: self.base_path(),
            bitfield: self.have_clone().as_bytes().to_vec(),
            tags: self.tags(),
            trackers: self
                .tiers
                .iter()
                .map(|tier| {
                    tier.trackers
                        .iter()
                        .map(|t| t.url().to_string())
                        .collect()
                })
                .collect(),
            added_at: self.added_at(),
            completed_at: self.completed_at.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            state: self.state(),
        }
    }
}
