use std::net::SocketAddr;
use std::sync::atomic::Ordering;

use super::download::Torrent;
use super::State;

/// Point-in-time view of one torrent, for RPC/UI surfaces.
#[derive(Debug, Clone)]
pub struct TorrentStats {
    pub info_hash: String,
    pub name: String,
    pub state: State,
    pub error: Option<String>,
    pub private: bool,
    pub total_length: u64,
    pub completed: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub corrupted: u64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peer_count: usize,
    pub tags: Vec<String>,
    pub added_at: i64,
    pub completed_at: i64,
}

/// Point-in-time view of one connected peer.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub client: Option<String>,
    pub progress: f64,
    pub download_rate: u64,
    pub upload_rate: u64,
    pub incoming: bool,
}

/// Per-file completion, derived from the pieces overlapping the file.
#[derive(Debug, Clone)]
pub struct FileStats {
    pub path: std::path::PathBuf,
    pub length: u64,
    pub progress: f64,
}

impl Torrent {
    pub fn stats(&self) -> TorrentStats {
        TorrentStats {
            info_hash: self.info().hash.to_hex(),
            name: self.info().name.clone(),
            state: self.state(),
            error: self.error_message(),
            private: self.is_private(),
            total_length: self.info().total_length,
            completed: self.completed_bytes(),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            download_rate: self.io_down.rate(),
            upload_rate: self.io_up.rate(),
            peer_count: self.peer_count(),
            tags: self.tags(),
            added_at: self.added_at(),
            completed_at: self.completed_at.load(Ordering::Relaxed),
        }
    }

    pub fn peer_stats(&self) -> Vec<PeerStats> {
        self.peers
            .iter()
            .map(|entry| {
                let peer = entry.value();
                PeerStats {
                    addr: peer.addr,
                    client: peer.user_agent(),
                    progress: peer.progress(),
                    download_rate: peer.download_rate(),
                    upload_rate: peer.upload_rate(),
                    incoming: peer.incoming,
                }
            })
            .collect()
    }

    pub fn file_stats(&self) -> Vec<FileStats> {
        let info = self.info();
        let have = self.have_clone();

        info.files
            .iter()
            .map(|file| {
                let first = (file.offset / info.piece_length) as u32;
                let last = ((file.offset + file.length).div_ceil(info.piece_length) as u32)
                    .min(info.num_pieces);
                let total = last.saturating_sub(first).max(1);
                let done = (first..last).filter(|&i| have.contains(i)).count();
                FileStats {
                    path: file.path.clone(),
                    length: file.length,
                    progress: done as f64 / total as f64,
                }
            })
            .collect()
    }
}
