//! Torrent metainfo ([BEP-3]) loading.
//!
//! Parses `.torrent` files, computes the info hash and produces the
//! immutable [`Info`] record the engine runs on. BitTorrent v2 and hybrid
//! torrents are rejected.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html

mod error;
mod info_hash;
mod torrent;

#[cfg(test)]
mod tests;

pub use error::MetainfoError;
pub use info_hash::InfoHash;
pub use torrent::{FileEntry, Info, Metainfo};
