//! Engine configuration.
//!
//! All tunables live here; the engine never reads them from scattered
//! globals. The whole struct is TOML-deserialisable so a host application
//! can load it from a config file, and `Default` gives a working setup.

use std::path::PathBuf;

use serde::Deserialize;

use crate::constants::DEFAULT_PORT;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// TCP port for the peer listener, also announced to trackers.
    pub p2p_port: u16,

    /// Process-wide cap on peer connections, incoming and outgoing.
    pub global_connection_limit: usize,

    /// Preallocate files to their final size during the initial check.
    pub fallocate: bool,

    /// Root of the session directory (resume data, stored torrents, lock).
    pub session_path: PathBuf,

    /// Default directory for torrent payload data.
    pub download_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            p2p_port: DEFAULT_PORT,
            global_connection_limit: 512,
            fallocate: false,
            session_path: PathBuf::from("session"),
            download_dir: PathBuf::from("downloads"),
        }
    }
}

impl Config {
    /// Parses a TOML config document.
    pub fn from_toml(doc: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(doc)
    }
}
