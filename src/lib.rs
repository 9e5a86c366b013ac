//! drift - a BitTorrent v1 download/seed engine
//!
//! A long-running engine that downloads and seeds many torrents at once:
//! it speaks the peer wire protocol over TCP, schedules block requests
//! rarest-first across peers, verifies completed pieces against their
//! SHA-1 digests, and serves requested blocks back to the swarm.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`metainfo`] - BEP-3 torrent metainfo (v1 only)
//! - [`bitfield`] - fixed-length bitsets with the wire bitfield encoding
//! - [`peer`] - BEP-3/6/10 peer wire protocol and connection state machine
//! - [`pex`] - BEP-11 peer exchange
//! - [`tracker`] - HTTP announce/scrape with BEP-12 tiers
//! - [`bep40`] - canonical peer priority
//! - [`torrent`] - per-torrent scheduling, assembly, verification, upload
//! - [`storage`] - shared file-handle pool and piece-to-file geometry
//! - [`cache`] - upload piece cache
//! - [`bandwidth`] - transfer-rate measurement
//! - [`client`] - the engine container: budget, listener, registry, session

pub mod bandwidth;
pub mod bencode;
pub mod bep40;
pub mod bitfield;
pub mod cache;
pub mod client;
pub mod config;
pub mod constants;
pub mod metainfo;
pub mod peer;
pub mod pex;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use bandwidth::RateMonitor;
pub use bencode::{decode, encode, BencodeError, Value};
pub use bitfield::Bitfield;
pub use cache::PieceCache;
pub use client::{Client, ClientError, TransferSummary};
pub use config::Config;
pub use metainfo::{FileEntry, Info, InfoHash, Metainfo, MetainfoError};
pub use peer::{Block, BlockRequest, Handshake, Message, Peer, PeerError, PeerId};
pub use pex::{PexFlags, PexMessage, PexPeer};
pub use storage::{FilePool, FileSpan, PieceMap, StorageError};
pub use torrent::{State, Torrent, TorrentStats};
pub use tracker::{AnnounceEvent, AnnounceResponse, TrackerError, TrackerTier};
