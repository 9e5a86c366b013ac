//! The engine container: global connection budget, peer listener, torrent
//! registry, shared services and session persistence.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng as _;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bandwidth::RateMonitor;
use crate::bep40;
use crate::cache::PieceCache;
use crate::config::Config;
use crate::constants::PIECE_CACHE_BYTES;
use crate::metainfo::{InfoHash, Metainfo, MetainfoError};
use crate::peer::read_handshake;
use crate::storage::FilePool;
use crate::torrent::{ResumeData, State, Torrent};
use crate::tracker;

const SESSION_SAVE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const SCRAPE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const INCOMING_LINGER: Option<Duration> = Some(Duration::ZERO);
/// Resume files written concurrently during save-all.
const SAVE_PARALLELISM: usize = 4;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid torrent: {0}")]
    InvalidTorrent(#[from] MetainfoError),

    #[error("torrent already added: {0}")]
    Duplicate(InfoHash),

    #[error("torrent not found: {0}")]
    NotFound(InfoHash),

    #[error("session directory locked by another process")]
    SessionLocked,
}

/// Process-wide transfer totals.
#[derive(Debug, Clone, Copy)]
pub struct TransferSummary {
    pub download_rate: u64,
    pub download_total: u64,
    pub upload_rate: u64,
    pub upload_total: u64,
}

/// Services every torrent shares: budget, disk plumbing, HTTP, rate
/// meters, local addressing and the session secret.
pub(crate) struct Shared {
    pub config: Config,
    pub cancel: CancellationToken,
    pub budget: Arc<Semaphore>,
    pub connection_count: AtomicUsize,
    pub file_pool: FilePool,
    pub piece_cache: PieceCache,
    pub http: reqwest::Client,
    pub io_up: RateMonitor,
    pub io_down: RateMonitor,
    pub ipv4: Mutex<Option<Ipv4Addr>>,
    pub ipv6: Mutex<Option<Ipv6Addr>>,
    /// Stands in for the local address in BEP-40 when it is unknown.
    pub secret: [u8; 32],
    pub dht_tx: Mutex<Option<mpsc::UnboundedSender<SocketAddr>>>,
    pub listen_addr: Mutex<Option<SocketAddr>>,
}

impl Shared {
    pub(crate) fn new(config: Config) -> Arc<Shared> {
        Arc::new(Shared {
            budget: Arc::new(Semaphore::new(config.global_connection_limit)),
            config,
            cancel: CancellationToken::new(),
            connection_count: AtomicUsize::new(0),
            file_pool: FilePool::new(),
            piece_cache: PieceCache::new(PIECE_CACHE_BYTES),
            http: tracker::http_client(),
            io_up: RateMonitor::new(),
            io_down: RateMonitor::new(),
            ipv4: Mutex::new(None),
            ipv6: Mutex::new(None),
            secret: rand::rng().random(),
            dht_tx: Mutex::new(None),
            listen_addr: Mutex::new(None),
        })
    }

    /// Stable candidate-peer priority per [BEP-40].
    ///
    /// [BEP-40]: http://bittorrent.org/beps/bep_0040.html
    pub(crate) fn peer_priority(&self, remote: SocketAddr) -> u32 {
        let port = self.config.p2p_port;
        let local = match remote {
            SocketAddr::V4(_) => (*self.ipv4.lock()).map(|ip| SocketAddr::new(ip.into(), port)),
            SocketAddr::V6(_) => (*self.ipv6.lock()).map(|ip| SocketAddr::new(ip.into(), port)),
        };
        match local {
            Some(local) => bep40::priority(local, remote),
            None => bep40::fallback_priority(&self.secret, remote),
        }
    }
}

/// The engine: owns every torrent, the listener, and the session state on
/// disk. An ordinary value with a scoped lifetime; `shutdown` unwinds it.
pub struct Client {
    shared: Arc<Shared>,
    torrents: DashMap<InfoHash, Arc<Torrent>>,
}

impl Client {
    pub fn new(config: Config) -> Client {
        Client {
            shared: Shared::new(config),
            torrents: DashMap::new(),
        }
    }

    /// Locks the session, restores persisted torrents, binds the peer
    /// listener and starts the background housekeeping.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClientError> {
        let session = self.shared.config.session_path.clone();
        tokio::fs::create_dir_all(session.join("resume")).await?;
        tokio::fs::create_dir_all(session.join("torrents")).await?;

        // Advisory single-instance lock on the session directory.
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(session.join(".lock"))
        {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(ClientError::SessionLocked);
            }
            Err(err) => return Err(err.into()),
        }

        self.restore_session().await?;
        self.spawn_listener().await?;

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = client.shared.cancel.cancelled() => return,
                    _ = tokio::time::sleep(SESSION_SAVE_INTERVAL) => {}
                }
                client.save_all_resume().await;
            }
        });

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = client.shared.cancel.cancelled() => return,
                    _ = tokio::time::sleep(SCRAPE_INTERVAL) => {}
                }
                for torrent in client.list() {
                    if let Some(counts) = torrent.scrape().await {
                        debug!(
                            info_hash = %torrent.info().hash,
                            seeders = counts.complete,
                            leechers = counts.incomplete,
                            "scrape"
                        );
                    }
                }
            }
        });

        info!(port = self.shared.config.p2p_port, "client started");
        Ok(())
    }

    /// Adds a torrent from raw metainfo bytes. The metainfo is persisted
    /// under the session directory and the startup check begins
    /// immediately.
    pub async fn add_torrent(
        &self,
        data: &[u8],
        base_path: Option<PathBuf>,
        tags: Vec<String>,
    ) -> Result<Arc<Torrent>, ClientError> {
        let metainfo = Metainfo::from_bytes(data)?;
        let hash = metainfo.info.hash;

        if self.torrents.contains_key(&hash) {
            return Err(ClientError::Duplicate(hash));
        }

        let path = self.torrent_file_path(hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;

        let base_path = base_path.unwrap_or_else(|| {
            self.shared
                .config
                .download_dir
                .join(&metainfo.info.name)
        });

        let torrent = Torrent::new(self.shared.clone(), &metainfo, base_path, tags, None);
        self.torrents.insert(hash, torrent.clone());
        torrent.init();
        self.save_resume(&torrent).await;

        info!(info_hash = %hash, name = metainfo.info.name, "torrent added");
        Ok(torrent)
    }

    /// Removes a torrent: cancels its tasks, purges pooled handles and
    /// deletes its session records. Payload data stays on disk.
    pub async fn remove_torrent(&self, hash: InfoHash) -> Result<(), ClientError> {
        let Some((_, torrent)) = self.torrents.remove(&hash) else {
            return Err(ClientError::NotFound(hash));
        };
        torrent.shutdown();
        let _ = tokio::fs::remove_file(self.resume_file_path(hash)).await;
        let _ = tokio::fs::remove_file(self.torrent_file_path(hash)).await;
        info!(info_hash = %hash, "torrent removed");
        Ok(())
    }

    pub fn get(&self, hash: InfoHash) -> Option<Arc<Torrent>> {
        self.torrents.get(&hash).map(|entry| entry.value().clone())
    }

    /// Every torrent, ordered by info hash.
    pub fn list(&self) -> Vec<Arc<Torrent>> {
        let mut torrents: Vec<Arc<Torrent>> = self
            .torrents
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        torrents.sort_by_key(|t| *t.info().hash.as_bytes());
        torrents
    }

    pub fn transfer_summary(&self) -> TransferSummary {
        TransferSummary {
            download_rate: self.shared.io_down.rate(),
            download_total: self.shared.io_down.total(),
            upload_rate: self.shared.io_up.rate(),
            upload_total: self.shared.io_up.total(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connection_count.load(Ordering::Relaxed)
    }

    /// The bound peer-listener address, once `start` has run.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.shared.listen_addr.lock()
    }

    /// Subscribes the host's DHT collaborator to Port announcements from
    /// peers of public torrents.
    pub fn dht_events(&self) -> mpsc::UnboundedReceiver<SocketAddr> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.dht_tx.lock() = Some(tx);
        rx
    }

    /// Entry point for DHT/LSD collaborators feeding peer candidates.
    pub fn add_peer_candidates(&self, hash: InfoHash, peers: &[SocketAddr]) -> bool {
        match self.get(hash) {
            Some(torrent) => {
                torrent.ingest_candidates(peers);
                true
            }
            None => false,
        }
    }

    /// Publishes the local addresses used for announce and BEP-40.
    pub fn set_local_addrs(&self, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) {
        *self.shared.ipv4.lock() = ipv4;
        *self.shared.ipv6.lock() = ipv6;
    }

    /// Persists all resume data, unwinds every task and releases the
    /// session lock.
    pub async fn shutdown(&self) {
        info!("client shutting down");
        self.save_all_resume().await;
        for entry in self.torrents.iter() {
            entry.value().shutdown();
        }
        self.shared.cancel.cancel();
        self.shared.file_pool.sync_all().await;
        let _ = std::fs::remove_file(self.shared.config.session_path.join(".lock"));
    }

    // --- listener ---

    async fn spawn_listener(self: &Arc<Self>) -> Result<(), ClientError> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.shared.config.p2p_port)).await?;
        *self.shared.listen_addr.lock() = listener.local_addr().ok();

        let client = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = client.shared.cancel.cancelled() => return,
                    accepted = listener.accept() => accepted,
                };
                let (stream, addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        continue;
                    }
                };

                // Admission happens before the handshake is read.
                let Ok(permit) = client.shared.budget.clone().try_acquire_owned() else {
                    drop(stream);
                    continue;
                };
                client
                    .shared
                    .connection_count
                    .fetch_add(1, Ordering::Relaxed);

                let client = client.clone();
                tokio::spawn(async move {
                    client.handle_incoming(stream, addr, permit).await;
                });
            }
        });

        Ok(())
    }

    /// Reads the handshake off a fresh connection and routes it to the
    /// torrent it names; unknown info hashes release the permit and drop
    /// the socket.
    async fn handle_incoming(
        &self,
        mut stream: TcpStream,
        addr: SocketAddr,
        permit: OwnedSemaphorePermit,
    ) {
        let _ = stream.set_linger(INCOMING_LINGER);

        let handshake = match read_handshake(&mut stream).await {
            Ok(handshake) => handshake,
            Err(err) => {
                debug!(%addr, error = %err, "incoming handshake failed");
                drop(permit);
                self.shared.connection_count.fetch_sub(1, Ordering::Relaxed);
                return;
            }
        };

        let hash = InfoHash(handshake.info_hash);
        match self.get(hash) {
            Some(torrent) => {
                debug!(%addr, info_hash = %hash, "incoming peer");
                torrent.add_incoming(stream, addr, handshake, permit);
            }
            None => {
                debug!(%addr, info_hash = %hash, "incoming peer for unknown torrent");
                drop(permit);
                self.shared.connection_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    // --- session persistence ---

    fn torrent_file_path(&self, hash: InfoHash) -> PathBuf {
        let hex = hash.to_hex();
        self.shared
            .config
            .session_path
            .join("torrents")
            .join(&hex[..2])
            .join(&hex[..4])
            .join(format!("{hex}.torrent"))
    }

    fn resume_file_path(&self, hash: InfoHash) -> PathBuf {
        let hex = hash.to_hex();
        self.shared
            .config
            .session_path
            .join("resume")
            .join(&hex[..2])
            .join(format!("{hex}.resume"))
    }

    async fn save_resume(&self, torrent: &Arc<Torrent>) {
        let path = self.resume_file_path(torrent.info().hash);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        let data = torrent.resume_data().to_bytes();
        if let Err(err) = tokio::fs::write(&path, &data).await {
            warn!(info_hash = %torrent.info().hash, error = %err, "resume save failed");
        }
    }

    async fn save_all_resume(&self) {
        let gate = Arc::new(Semaphore::new(SAVE_PARALLELISM));
        let mut handles = Vec::new();

        for torrent in self.list() {
            let gate = gate.clone();
            let path = self.resume_file_path(torrent.info().hash);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = gate.acquire().await else {
                    return;
                };
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                let data = torrent.resume_data().to_bytes();
                if let Err(err) = tokio::fs::write(&path, &data).await {
                    warn!(info_hash = %torrent.info().hash, error = %err, "resume save failed");
                }
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Reloads every persisted torrent. Stopped torrents stay stopped;
    /// the rest re-run the startup check.
    async fn restore_session(self: &Arc<Self>) -> Result<(), ClientError> {
        let resume_root = self.shared.config.session_path.join("resume");

        let mut shards = match tokio::fs::read_dir(&resume_root).await {
            Ok(dir) => dir,
            Err(_) => return Ok(()),
        };

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = tokio::fs::read_dir(shard.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("resume") {
                    continue;
                }
                if let Err(err) = self.restore_one(&path).await {
                    warn!(path = %path.display(), error = %err, "resume restore failed");
                }
            }
        }

        Ok(())
    }

    async fn restore_one(self: &Arc<Self>, path: &std::path::Path) -> Result<(), ClientError> {
        let data = tokio::fs::read(path).await?;
        let Some(resume) = ResumeData::from_bytes(&data) else {
            warn!(path = %path.display(), "malformed resume record");
            return Ok(());
        };

        let torrent_bytes = tokio::fs::read(self.torrent_file_path(resume.info_hash)).await?;
        let metainfo = Metainfo::from_bytes(&torrent_bytes)?;
        if metainfo.info.hash != resume.info_hash {
            warn!(path = %path.display(), "resume record does not match torrent file");
            return Ok(());
        }

        let torrent = Torrent::new(
            self.shared.clone(),
            &metainfo,
            resume.base_path.clone(),
            resume.tags.clone(),
            Some(&resume),
        );
        self.torrents.insert(resume.info_hash, torrent.clone());

        if resume.state.matches(State::STOPPED) {
            torrent.mark_stopped();
        } else {
            torrent.init();
        }

        debug!(info_hash = %resume.info_hash, "torrent restored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::Path;
    use std::time::Duration;

    use bytes::Bytes;
    use sha1::{Digest, Sha1};
    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::bencode::{encode, Value};
    use crate::peer::Handshake;
    use crate::torrent::{State, Torrent};

    fn torrent_bytes(piece_length: usize, data: &[u8]) -> Vec<u8> {
        let pieces: Vec<u8> = data
            .chunks(piece_length)
            .flat_map(|chunk| {
                let digest: [u8; 20] = Sha1::digest(chunk).into();
                digest
            })
            .collect();

        let mut info = BTreeMap::new();
        info.insert(Bytes::from_static(b"length"), Value::Int(data.len() as i64));
        info.insert(Bytes::from_static(b"name"), Value::text("payload"));
        info.insert(
            Bytes::from_static(b"piece length"),
            Value::Int(piece_length as i64),
        );
        info.insert(Bytes::from_static(b"pieces"), Value::Bytes(Bytes::from(pieces)));

        let mut root = BTreeMap::new();
        root.insert(Bytes::from_static(b"info"), Value::Dict(info));
        encode(&Value::Dict(root)).to_vec()
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn test_config(root: &Path, name: &str) -> Config {
        Config {
            p2p_port: 0,
            session_path: root.join(name).join("session"),
            download_dir: root.join(name).join("downloads"),
            ..Config::default()
        }
    }

    async fn wait_for_state(torrent: &Arc<Torrent>, mask: State, secs: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
        while tokio::time::Instant::now() < deadline {
            if torrent.state().matches(mask) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    fn loopback(client: &Client) -> SocketAddr {
        let port = client.listen_addr().expect("listener bound").port();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_swarm_download_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(40_000);
        let doc = torrent_bytes(16 * 1024, &data);

        // Seeder: payload already on disk, discovered by the startup check.
        let seeder = Arc::new(Client::new(test_config(dir.path(), "seeder")));
        seeder.start().await.unwrap();
        let seed_base = dir.path().join("seeder").join("payload-dir");
        tokio::fs::create_dir_all(&seed_base).await.unwrap();
        tokio::fs::write(seed_base.join("payload"), &data)
            .await
            .unwrap();
        let seed_torrent = seeder
            .add_torrent(&doc, Some(seed_base), vec![])
            .await
            .unwrap();
        assert!(wait_for_state(&seed_torrent, State::SEEDING, 10).await);

        // Leecher: empty disk, learns the seeder as a peer candidate.
        let leecher = Arc::new(Client::new(test_config(dir.path(), "leecher")));
        leecher.start().await.unwrap();
        let leech_base = dir.path().join("leecher").join("payload-dir");
        let leech_torrent = leecher
            .add_torrent(&doc, Some(leech_base.clone()), vec![])
            .await
            .unwrap();
        assert!(wait_for_state(&leech_torrent, State::DOWNLOADING, 10).await);

        let hash = leech_torrent.info().hash;
        assert!(leecher.add_peer_candidates(hash, &[loopback(&seeder)]));

        assert!(
            wait_for_state(&leech_torrent, State::SEEDING, 60).await,
            "download did not complete: state={} completed={}",
            leech_torrent.state(),
            leech_torrent.completed_bytes()
        );

        let downloaded = tokio::fs::read(leech_base.join("payload")).await.unwrap();
        assert_eq!(downloaded, data);
        assert_eq!(leech_torrent.completed_bytes(), data.len() as u64);

        leecher.shutdown().await;
        seeder.shutdown().await;
    }

    /// Spins up a client seeding `data` and returns it with its torrent.
    async fn seeding_client(
        dir: &Path,
        data: &[u8],
        doc: &[u8],
    ) -> (Arc<Client>, Arc<Torrent>) {
        let client = Arc::new(Client::new(test_config(dir, "seeder")));
        client.start().await.unwrap();

        let base = dir.join("seeder").join("payload-dir");
        tokio::fs::create_dir_all(&base).await.unwrap();
        tokio::fs::write(base.join("payload"), data).await.unwrap();

        let torrent = client.add_torrent(doc, Some(base), vec![]).await.unwrap();
        assert!(wait_for_state(&torrent, State::SEEDING, 10).await);
        (client, torrent)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_request_is_rejected_not_dropped() {
        use crate::peer::{BlockRequest, FrameReader, FrameWriter, Message};

        let dir = tempfile::tempdir().unwrap();
        let data = payload(40_000);
        let doc = torrent_bytes(16 * 1024, &data);
        let (client, torrent) = seeding_client(dir.path(), &data, &doc).await;
        let info_hash = *torrent.info().hash.as_bytes();

        // A hand-driven remote peer on a raw socket.
        let stream = TcpStream::connect(loopback(&client)).await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        writer
            .write_handshake(&Handshake::new(info_hash, [0x2D; 20], false))
            .await
            .unwrap();
        let theirs = reader.read_handshake().await.unwrap();
        assert_eq!(theirs.info_hash, info_hash);
        assert!(theirs.supports_fast_extension());

        writer.write_frame(&Message::Interested).await.unwrap();

        // Out-of-bounds length: answered with Reject, not a disconnect.
        let bad = BlockRequest {
            index: 0,
            begin: 0,
            length: 0x10001,
        };
        writer.write_frame(&Message::Request(bad)).await.unwrap();

        let rejected = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match reader.read_frame().await.unwrap() {
                    Message::Reject(request) => break request,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(rejected, bad);

        // The connection survived: a valid request is served.
        let good = BlockRequest {
            index: 0,
            begin: 0,
            length: 16 * 1024,
        };
        writer.write_frame(&Message::Request(good)).await.unwrap();

        let block = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match reader.read_frame().await.unwrap() {
                    Message::Piece(block) => break block,
                    _ => continue,
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.begin, 0);
        assert_eq!(block.data.as_ref(), &data[..16 * 1024]);

        client.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_incoming_unknown_torrent_releases_permit() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(Client::new(test_config(dir.path(), "lonely")));
        client.start().await.unwrap();

        let limit = client.shared.config.global_connection_limit;
        let mut stream = TcpStream::connect(loopback(&client)).await.unwrap();
        let handshake = Handshake::new([0xAB; 20], [0xCD; 20], false);
        stream.write_all(&handshake.encode()).await.unwrap();

        // The listener closes the socket and returns the permit.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if client.shared.budget.available_permits() == limit
                && client.connection_count() == 0
            {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "permit not released");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_session_lock_rejects_second_client() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), "locked");

        let first = Arc::new(Client::new(config.clone()));
        first.start().await.unwrap();

        let second = Arc::new(Client::new(config));
        assert!(matches!(
            second.start().await,
            Err(ClientError::SessionLocked)
        ));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_duplicate_torrent_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let doc = torrent_bytes(16 * 1024, &payload(20_000));

        let client = Arc::new(Client::new(test_config(dir.path(), "dup")));
        client.start().await.unwrap();

        client.add_torrent(&doc, None, vec![]).await.unwrap();
        assert!(matches!(
            client.add_torrent(&doc, None, vec![]).await,
            Err(ClientError::Duplicate(_))
        ));
        assert_eq!(client.list().len(), 1);

        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = payload(20_000);
        let doc = torrent_bytes(16 * 1024, &data);
        let config = test_config(dir.path(), "restore");

        let hash;
        {
            let client = Arc::new(Client::new(config.clone()));
            client.start().await.unwrap();
            let torrent = client
                .add_torrent(&doc, None, vec!["keep".into()])
                .await
                .unwrap();
            hash = torrent.info().hash;
            assert!(wait_for_state(&torrent, State::DOWNLOADING, 10).await);
            torrent.stop();
            client.shutdown().await;
        }

        let client = Arc::new(Client::new(config));
        client.start().await.unwrap();
        let restored = client.get(hash).expect("torrent restored from session");
        assert_eq!(restored.tags(), vec!["keep".to_string()]);
        assert!(restored.state().matches(State::STOPPED));

        client.shutdown().await;
    }
}
