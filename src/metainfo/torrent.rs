use std::path::PathBuf;

use bytes::Bytes;

use super::error::MetainfoError;
use super::info_hash::InfoHash;
use crate::bencode::{decode, encode, Value};

/// A parsed `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    /// Primary tracker URL.
    pub announce: Option<String>,
    /// Tracker tiers ([BEP-12](http://bittorrent.org/beps/bep_0012.html)).
    pub announce_list: Vec<Vec<String>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
}

/// The immutable per-torrent record the engine runs on.
///
/// Built once from the `info` dictionary; all derived sizes are validated
/// at construction so the rest of the engine can rely on them.
#[derive(Debug, Clone)]
pub struct Info {
    pub hash: InfoHash,
    pub name: String,
    pub private: bool,
    pub piece_length: u64,
    pub total_length: u64,
    /// `total_length - piece_length * (num_pieces - 1)`; always in
    /// `1..=piece_length`.
    pub last_piece_size: u64,
    pub num_pieces: u32,
    /// Expected SHA-1 digest per piece, in piece order.
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
}

/// One file of the torrent payload.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the torrent's base directory.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of this file within the concatenated payload.
    pub offset: u64,
}

impl Metainfo {
    /// Parses torrent-file bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let root = decode(data)?;
        let dict = root.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;

        // Valid torrents carry the info dict in canonical order, so
        // re-encoding reproduces the exact bytes the hash covers.
        let raw_info = encode(info_value);
        let hash = InfoHash::from_info_bytes(&raw_info);
        let info = parse_info(info_value, hash)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(Value::as_str)
            .map(String::from);

        let announce_list = dict
            .get(b"announce-list".as_slice())
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
                    .filter(|tier: &Vec<String>| !tier.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info,
            announce,
            announce_list,
            comment: dict
                .get(b"comment".as_slice())
                .and_then(Value::as_str)
                .map(String::from),
            created_by: dict
                .get(b"created by".as_slice())
                .and_then(Value::as_str)
                .map(String::from),
            creation_date: dict
                .get(b"creation date".as_slice())
                .and_then(Value::as_int),
        })
    }

    /// Tracker tiers, falling back to a single-tracker tier built from
    /// `announce` when `announce-list` is absent.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        match &self.announce {
            Some(url) => vec![vec![url.clone()]],
            None => Vec::new(),
        }
    }
}

impl Info {
    /// Piece length of `index`; the tail piece is usually shorter.
    pub fn piece_len(&self, index: u32) -> u64 {
        if index == self.num_pieces - 1 {
            self.last_piece_size
        } else {
            self.piece_length
        }
    }

    /// Number of transfer blocks in piece `index`.
    pub fn blocks_in_piece(&self, index: u32) -> u32 {
        self.piece_len(index).div_ceil(crate::constants::BLOCK_SIZE as u64) as u32
    }

    /// Blocks in a full-size piece; the stride of the block-id space.
    pub fn blocks_per_piece(&self) -> u32 {
        self.piece_length.div_ceil(crate::constants::BLOCK_SIZE as u64) as u32
    }

    /// Total entries in the accepted-block bitfield.
    pub fn total_blocks(&self) -> u32 {
        self.num_pieces * self.blocks_per_piece()
    }
}

fn parse_info(value: &Value, hash: InfoHash) -> Result<Info, MetainfoError> {
    let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

    // `name.utf-8` wins over `name` when both are present.
    let name = dict
        .get(b"name.utf-8".as_slice())
        .and_then(Value::as_str)
        .or_else(|| dict.get(b"name".as_slice()).and_then(Value::as_str))
        .ok_or(MetainfoError::MissingField("name"))?
        .to_string();

    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(Value::as_int)
        .filter(|&n| n > 0)
        .ok_or(MetainfoError::InvalidField("piece length"))? as u64;

    let pieces_raw = dict
        .get(b"pieces".as_slice())
        .and_then(Value::as_bytes)
        .ok_or(MetainfoError::NotV1)?;

    if pieces_raw.is_empty() || pieces_raw.len() % 20 != 0 {
        return Err(MetainfoError::InvalidField("pieces"));
    }

    let pieces: Vec<[u8; 20]> = pieces_raw
        .chunks_exact(20)
        .map(|chunk| {
            let mut digest = [0u8; 20];
            digest.copy_from_slice(chunk);
            digest
        })
        .collect();

    let private = dict
        .get(b"private".as_slice())
        .and_then(Value::as_int)
        .map(|v| v == 1)
        .unwrap_or(false);

    let length = dict.get(b"length".as_slice()).and_then(Value::as_int);
    let files_list = dict.get(b"files".as_slice()).and_then(Value::as_list);

    let files = match (length, files_list) {
        // Single-file and multi-file modes are mutually exclusive.
        (Some(_), Some(_)) => return Err(MetainfoError::InvalidField("length and files")),
        (None, None) => return Err(MetainfoError::NotV1),
        (Some(length), None) => {
            let length = u64::try_from(length)
                .map_err(|_| MetainfoError::InvalidField("length"))?;
            vec![FileEntry {
                path: PathBuf::from(&name),
                length,
                offset: 0,
            }]
        }
        (None, Some(list)) => parse_files(list)?,
    };

    let total_length: u64 = files.iter().map(|f| f.length).sum();
    if total_length == 0 {
        return Err(MetainfoError::InvalidField("total length"));
    }

    let num_pieces = total_length.div_ceil(piece_length);
    if num_pieces != pieces.len() as u64 || num_pieces > u32::MAX as u64 {
        return Err(MetainfoError::InvalidField("pieces"));
    }
    let num_pieces = num_pieces as u32;

    let last_piece_size = total_length - piece_length * (num_pieces as u64 - 1);

    Ok(Info {
        hash,
        name,
        private,
        piece_length,
        total_length,
        last_piece_size,
        num_pieces,
        pieces,
        files,
    })
}

fn parse_files(list: &[Value]) -> Result<Vec<FileEntry>, MetainfoError> {
    let mut files = Vec::with_capacity(list.len());
    let mut offset = 0u64;

    for entry in list {
        let dict = entry.as_dict().ok_or(MetainfoError::InvalidField("files"))?;

        let length = dict
            .get(b"length".as_slice())
            .and_then(Value::as_int)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or(MetainfoError::InvalidField("file length"))?;

        let components = dict
            .get(b"path.utf-8".as_slice())
            .and_then(Value::as_list)
            .or_else(|| dict.get(b"path".as_slice()).and_then(Value::as_list))
            .ok_or(MetainfoError::MissingField("file path"))?;

        let mut path = PathBuf::new();
        for component in components {
            let part = component
                .as_str()
                .ok_or(MetainfoError::InvalidField("file path"))?;
            if part.is_empty() || part == "." || part == ".." || part.contains('/') {
                return Err(MetainfoError::InvalidField("file path"));
            }
            path.push(part);
        }
        if path.as_os_str().is_empty() {
            return Err(MetainfoError::InvalidField("file path"));
        }

        files.push(FileEntry {
            path,
            length,
            offset,
        });
        offset += length;
    }

    Ok(files)
}
