use std::collections::BinaryHeap;
use std::io::SeekFrom;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::pending::{ConnHistory, PendingPeer};
use super::resume::ResumeData;
use super::State;
use crate::bitfield::Bitfield;
use crate::client::Shared;
use crate::constants::BLOCK_SIZE;
use crate::metainfo::{Info, Metainfo};
use crate::peer::{Block, BlockRequest, Handshake, Peer, PeerId};
use crate::pex::PexMessage;
use crate::bandwidth::RateMonitor;
use crate::storage::{PieceMap, StorageError};
use crate::tracker::{AnnounceEvent, TrackerTier};

/// The request a peer's pump issues for block `b` of piece `index`.
pub fn block_request(info: &Info, index: u32, b: u32) -> BlockRequest {
    let piece_len = info.piece_len(index);
    let begin = b as u64 * BLOCK_SIZE as u64;
    let end = (begin + BLOCK_SIZE as u64).min(piece_len);
    BlockRequest {
        index,
        begin: begin as u32,
        length: (end - begin) as u32,
    }
}

/// One managed torrent: piece/block state, connected and pending peers,
/// trackers, counters, and the background tasks driving them.
///
/// The cancellation token is cancelled when the torrent is *removed*, not
/// when it is merely stopped.
pub struct Torrent {
    info: Info,
    pub(super) piece_map: PieceMap,
    peer_id: PeerId,
    pub(super) tracker_key: [u8; 16],
    pub(super) tiers: Vec<TrackerTier>,
    tags: RwLock<Vec<String>>,
    added_at: i64,
    pub(super) completed_at: AtomicI64,

    state_tx: watch::Sender<State>,
    error: Mutex<Option<String>>,

    have: RwLock<Bitfield>,
    /// Accepted (written or in-heap) blocks of the current download.
    pub(super) chunk_map: Mutex<Bitfield>,
    pub(super) completed: AtomicU64,
    pub(super) downloaded: AtomicU64,
    pub(super) uploaded: AtomicU64,
    pub(super) corrupted: AtomicU64,
    pub(super) endgame: AtomicBool,

    /// Network and disk bytes in (checking streams through this too).
    pub(super) io_down: RateMonitor,
    /// Network bytes in only.
    pub(super) net_down: RateMonitor,
    pub(super) io_up: RateMonitor,

    pub(super) peers: DashMap<SocketAddr, Arc<Peer>>,
    pub(super) pending: Mutex<BinaryHeap<PendingPeer>>,
    pub(super) history: Mutex<ConnHistory>,

    base_path: RwLock<PathBuf>,

    res_tx: mpsc::Sender<Block>,
    pub(super) res_rx: TokioMutex<Option<mpsc::Receiver<Block>>>,

    pub(super) req_signal: Notify,
    pub(super) upload_signal: Notify,
    pub(super) pending_signal: Notify,
    pub(super) announce_inflight: AtomicBool,
    /// Set once the background tasks have been spawned.
    initialized: AtomicBool,

    cancel: CancellationToken,
    pub(super) shared: Arc<Shared>,
}

impl Torrent {
    pub(crate) fn new(
        shared: Arc<Shared>,
        metainfo: &Metainfo,
        base_path: PathBuf,
        tags: Vec<String>,
        resume: Option<&ResumeData>,
    ) -> Arc<Torrent> {
        let info = metainfo.info.clone();
        let piece_map = PieceMap::new(&info);
        let (res_tx, res_rx) = mpsc::channel(1);

        let tier_urls = resume
            .map(|r| r.trackers.clone())
            .filter(|tiers| !tiers.is_empty())
            .unwrap_or_else(|| metainfo.tracker_tiers());
        let tiers = tier_urls.into_iter().map(TrackerTier::new).collect();

        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let num_pieces = info.num_pieces;
        let total_blocks = info.total_blocks();

        let torrent = Arc::new(Torrent {
            piece_map,
            peer_id: PeerId::generate(),
            tracker_key: rand::rng().random(),
            tiers,
            tags: RwLock::new(tags),
            added_at: resume.map(|r| r.added_at).unwrap_or(now),
            completed_at: AtomicI64::new(resume.map(|r| r.completed_at).unwrap_or(0)),
            state_tx: watch::channel(State::CHECKING).0,
            error: Mutex::new(None),
            have: RwLock::new(Bitfield::new(num_pieces)),
            chunk_map: Mutex::new(Bitfield::new(total_blocks)),
            completed: AtomicU64::new(0),
            downloaded: AtomicU64::new(resume.map(|r| r.downloaded).unwrap_or(0)),
            uploaded: AtomicU64::new(resume.map(|r| r.uploaded).unwrap_or(0)),
            corrupted: AtomicU64::new(0),
            endgame: AtomicBool::new(false),
            io_down: RateMonitor::new(),
            net_down: RateMonitor::new(),
            io_up: RateMonitor::new(),
            peers: DashMap::new(),
            pending: Mutex::new(BinaryHeap::new()),
            history: Mutex::new(ConnHistory::new()),
            base_path: RwLock::new(base_path),
            res_tx,
            res_rx: TokioMutex::new(Some(res_rx)),
            req_signal: Notify::new(),
            upload_signal: Notify::new(),
            pending_signal: Notify::new(),
            announce_inflight: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            cancel: shared.cancel.child_token(),
            shared,
            info,
        });

        debug!(info_hash = %torrent.info.hash, name = torrent.info.name, "torrent created");
        torrent
    }

    // --- identity and basic accessors ---

    pub fn info(&self) -> &Info {
        &self.info
    }

    pub fn is_private(&self) -> bool {
        self.info.private
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn base_path(&self) -> PathBuf {
        self.base_path.read().clone()
    }

    pub(super) fn set_base_path(&self, path: PathBuf) {
        *self.base_path.write() = path;
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.read().clone()
    }

    pub fn added_at(&self) -> i64 {
        self.added_at
    }

    // --- state machine ---

    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    pub(super) fn set_state(&self, state: State) {
        self.state_tx.send_replace(state);
    }

    pub fn error_message(&self) -> Option<String> {
        self.error.lock().clone()
    }

    /// Any disk failure parks the torrent in `Error` until user action.
    pub(super) fn set_error(&self, err: StorageError) {
        warn!(info_hash = %self.info.hash, error = %err, "torrent failed");
        *self.error.lock() = Some(err.to_string());
        self.set_state(State::ERROR);
    }

    /// Blocks until the state matches `mask`. Returns `false` when the
    /// torrent is removed first.
    pub(super) async fn wait_state(&self, mask: State) -> bool {
        let mut rx = self.state_tx.subscribe();
        loop {
            if rx.borrow().matches(mask) {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    // --- piece bookkeeping ---

    pub fn have_clone(&self) -> Bitfield {
        self.have.read().clone()
    }

    pub fn have_count(&self) -> u32 {
        self.have.read().count()
    }

    pub fn completed_bytes(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Index of a block in the torrent-wide accepted-block bitfield.
    pub(super) fn block_id(&self, index: u32, begin: u32) -> u32 {
        index * self.info.blocks_per_piece() + begin / BLOCK_SIZE
    }

    pub(super) fn have_contains(&self, index: u32) -> bool {
        self.have.read().contains(index)
    }

    /// Marks a verified piece, returning `true` only on the first
    /// `false → true` transition.
    pub(super) fn set_have_if_new(&self, index: u32) -> bool {
        let mut have = self.have.write();
        if have.contains(index) {
            return false;
        }
        have.set(index);
        true
    }

    pub(super) fn piece_blocks_done(&self, index: u32) -> bool {
        let chunk_map = self.chunk_map.lock();
        let start = index * self.info.blocks_per_piece();
        (0..self.info.blocks_in_piece(index)).all(|b| chunk_map.contains(start + b))
    }

    pub(super) fn clear_piece_blocks(&self, index: u32) {
        let mut chunk_map = self.chunk_map.lock();
        let start = index * self.info.blocks_per_piece();
        for b in 0..self.info.blocks_in_piece(index) {
            chunk_map.clear(start + b);
        }
    }

    // --- peer registry ---

    /// Registers a handshaked peer; refuses a second connection for the
    /// same address.
    pub(crate) fn register_peer(&self, addr: SocketAddr, peer: Arc<Peer>) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.peers.entry(addr) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(peer);
                true
            }
        }
    }

    pub(crate) fn unregister_peer(&self, addr: SocketAddr) {
        self.peers.remove(&addr);
    }

    /// Bookkeeping for a permit released by a closing peer.
    pub(crate) fn connection_closed(&self) {
        self.shared
            .connection_count
            .fetch_sub(1, Ordering::Relaxed);
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Clones the peer list out of the registry; callers that may close
    /// peers must not iterate the map directly, since close removes the
    /// entry.
    pub(super) fn peer_snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Accepts an incoming connection whose handshake the listener
    /// already consumed.
    pub(crate) fn add_incoming(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        addr: SocketAddr,
        handshake: Handshake,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        self.history
            .lock()
            .record(addr, super::pending::DialOutcome::Connected);
        Peer::spawn_incoming(stream, addr, self.clone(), permit, handshake);
    }

    // --- signals ---

    pub(crate) fn signal_request(&self) {
        self.req_signal.notify_one();
    }

    pub(crate) fn signal_upload(&self) {
        self.upload_signal.notify_one();
    }

    pub(crate) fn signal_pending(&self) {
        self.pending_signal.notify_one();
    }

    /// A peer appeared, vanished, or changed its claimed pieces.
    pub(crate) fn on_peer_change(&self) {
        self.signal_request();
    }

    /// Hands a DHT port announcement to the host's collaborator hook.
    pub(crate) fn notify_dht(&self, addr: SocketAddr) {
        if let Some(tx) = self.shared.dht_tx.lock().as_ref() {
            let _ = tx.send(addr);
        }
    }

    /// Queues a delivered block for the assembler. Returns `false` when
    /// the torrent is shutting down.
    pub(crate) async fn push_block(&self, block: Block) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.res_tx.send(block) => sent.is_ok(),
        }
    }

    /// Feeds PEX-learned peers into the pending heap.
    ///
    /// Only peers the sender reached via an outgoing connection are
    /// usable; seed-only peers are useless to a seeding torrent.
    pub(crate) fn ingest_pex(&self, message: PexMessage) {
        let seeding = self.state().matches(State::SEEDING);
        let mut added = 0usize;
        {
            let mut pending = self.pending.lock();
            for peer in &message.added {
                if !peer.flags.outgoing {
                    continue;
                }
                if seeding && peer.flags.seed_only {
                    continue;
                }
                pending.push(PendingPeer {
                    addr: peer.addr,
                    priority: self.shared.peer_priority(peer.addr),
                });
                added += 1;
            }
        }
        if added > 0 {
            trace!(info_hash = %self.info.hash, added, "pex peers queued");
            self.signal_pending();
        }
    }

    /// Entry point for collaborator-discovered candidates (DHT, LSD).
    pub(crate) fn ingest_candidates(&self, peers: &[SocketAddr]) {
        self.ingest_tracker_peers(peers);
    }

    /// Restores a torrent in the stopped state without checking disk.
    pub(crate) fn mark_stopped(&self) {
        self.set_state(State::STOPPED);
    }

    /// Queues tracker-announced peers into the pending heap.
    pub(super) fn ingest_tracker_peers(&self, peers: &[SocketAddr]) {
        if peers.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.lock();
            for &addr in peers {
                pending.push(PendingPeer {
                    addr,
                    priority: self.shared.peer_priority(addr),
                });
            }
        }
        self.signal_pending();
    }

    // --- lifecycle ---

    /// Runs the startup integrity check, then enters Downloading or
    /// Seeding. The background tasks (and the `started` announce) launch
    /// only on the first call; re-checks reuse the running loops.
    pub fn init(self: &Arc<Self>) {
        let first = !self.initialized.swap(true, Ordering::SeqCst);
        let torrent = self.clone();
        tokio::spawn(async move {
            torrent.set_state(State::CHECKING);

            if let Err(err) = torrent.initial_check().await {
                torrent.set_error(err);
                return;
            }
            torrent.io_down.reset();
            if torrent.cancel.is_cancelled() {
                return;
            }

            torrent.enter_active_state();
            if first {
                torrent.spawn_background();
                torrent.announce(AnnounceEvent::Started).await;
            } else {
                torrent.signal_request();
                torrent.signal_pending();
            }
        });
    }

    pub(super) fn enter_active_state(&self) {
        if self.have_count() == self.info.num_pieces {
            self.set_state(State::SEEDING);
        } else {
            self.set_state(State::DOWNLOADING);
        }
    }

    /// Resumes a stopped torrent. A torrent restored in the stopped state
    /// runs its first disk check here.
    pub fn start(self: &Arc<Self>) {
        if !self.state().matches(State::STOPPED | State::ERROR) {
            return;
        }
        *self.error.lock() = None;
        if !self.initialized.load(Ordering::SeqCst) {
            self.init();
            return;
        }
        self.enter_active_state();
        self.signal_request();
        self.signal_pending();
    }

    /// Stops transfers and tells trackers, keeping verified state.
    pub fn stop(self: &Arc<Self>) {
        if self.state().matches(State::STOPPED) {
            return;
        }
        self.set_state(State::STOPPED);
        for peer in self.peer_snapshot() {
            peer.close();
        }
        let torrent = self.clone();
        tokio::spawn(async move {
            torrent.announce_stopped().await;
        });
    }

    /// Drops verified state and re-checks everything on disk.
    pub fn check(self: &Arc<Self>) {
        if self.state().matches(State::CHECKING | State::MOVING) {
            return;
        }
        self.have.write().clear_all();
        self.chunk_map.lock().clear_all();
        self.completed.store(0, Ordering::Relaxed);
        self.endgame.store(false, Ordering::Relaxed);
        self.init();
    }

    /// Called on removal: cancels every task and purges pooled handles.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
        self.shared.file_pool.purge(&self.base_path());
        self.shared.piece_cache.remove_torrent(self.info.hash);
    }

    /// Checks which pieces are already valid on disk, optionally
    /// preallocating files first. Hashing streams through the disk rate
    /// monitor.
    async fn initial_check(&self) -> Result<(), StorageError> {
        let base = self.base_path();
        tokio::fs::create_dir_all(&base).await?;

        // Note each file's current size; absent files simply yield no
        // checkable pieces.
        let mut sizes = vec![None; self.info.files.len()];
        for (i, entry) in self.info.files.iter().enumerate() {
            let path = base.join(&entry.path);
            match tokio::fs::metadata(&path).await {
                Ok(meta) => sizes[i] = Some(meta.len()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            if self.shared.config.fallocate {
                let handle = self.shared.file_pool.open(&path, true).await?;
                let file = handle.file.lock().await;
                if file.metadata().await?.len() < entry.length {
                    file.set_len(entry.length).await?;
                }
            }
        }

        let mut buf = Vec::new();
        for index in 0..self.info.num_pieces {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let spans = self.piece_map.piece_spans(index);
            let backed = spans.iter().all(|span| {
                sizes[span.file_index]
                    .map(|size| span.offset + span.length <= size)
                    .unwrap_or(false)
            });
            if !backed {
                continue;
            }

            let piece_len = self.info.piece_len(index) as usize;
            buf.resize(piece_len, 0);
            self.read_piece_into(index, &mut buf).await?;
            self.io_down.record(piece_len);

            let digest: [u8; 20] = Sha1::digest(&buf).into();
            if digest == self.info.pieces[index as usize] {
                if self.set_have_if_new(index) {
                    self.completed
                        .fetch_add(self.info.piece_len(index), Ordering::Relaxed);
                }
                let start = index * self.info.blocks_per_piece();
                let mut chunk_map = self.chunk_map.lock();
                for b in 0..self.info.blocks_in_piece(index) {
                    chunk_map.set(start + b);
                }
            }
        }

        info!(
            info_hash = %self.info.hash,
            pieces = self.have_count(),
            total = self.info.num_pieces,
            "initial check complete"
        );
        Ok(())
    }

    fn spawn_background(self: &Arc<Self>) {
        let tasks: [fn(Arc<Torrent>) -> tokio::task::JoinHandle<()>; 5] = [
            |t| tokio::spawn(async move { t.assembler_loop().await }),
            |t| tokio::spawn(async move { t.request_scheduler_loop().await }),
            |t| tokio::spawn(async move { t.upload_loop().await }),
            |t| tokio::spawn(async move { t.connect_loop().await }),
            |t| tokio::spawn(async move { t.tracker_loop().await }),
        ];
        for task in tasks {
            task(self.clone());
        }
    }

    // --- disk I/O ---

    /// Writes `data` at global payload offset `begin`, fanning out across
    /// the files it touches.
    pub(super) async fn write_range(&self, begin: u64, data: &[u8]) -> Result<(), StorageError> {
        let base = self.base_path();
        let mut offset = 0usize;

        for span in self.piece_map.range_spans(begin, data.len() as u64) {
            let path = base.join(&self.info.files[span.file_index].path);
            let handle = self.shared.file_pool.open(&path, true).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.offset)).await?;
            file.write_all(&data[offset..offset + span.length as usize])
                .await?;
            offset += span.length as usize;
        }

        Ok(())
    }

    /// Reads piece `index` into `buf` (`buf.len()` must equal the piece
    /// length).
    pub(super) async fn read_piece_into(
        &self,
        index: u32,
        buf: &mut [u8],
    ) -> Result<(), StorageError> {
        let base = self.base_path();
        let mut offset = 0usize;

        for span in self.piece_map.piece_spans(index) {
            let path = base.join(&self.info.files[span.file_index].path);
            let handle = self.shared.file_pool.open(&path, true).await?;
            let mut file = handle.file.lock().await;
            file.seek(SeekFrom::Start(span.offset)).await?;
            file.read_exact(&mut buf[offset..offset + span.length as usize])
                .await?;
            offset += span.length as usize;
        }

        Ok(())
    }

    /// Reads piece `index` back and compares its SHA-1 against the
    /// expected digest. A mismatch re-arms every block of the piece.
    pub(super) async fn verify_piece(self: &Arc<Self>, index: u32) -> Result<bool, StorageError> {
        let piece_len = self.info.piece_len(index) as usize;
        let mut buf = vec![0u8; piece_len];
        self.read_piece_into(index, &mut buf).await?;

        let digest: [u8; 20] = Sha1::digest(&buf).into();
        if digest != self.info.pieces[index as usize] {
            debug!(info_hash = %self.info.hash, piece = index, "piece digest mismatch");
            self.corrupted
                .fetch_add(self.info.piece_length, Ordering::Relaxed);
            self.clear_piece_blocks(index);
            // Put the piece back into rarity selection.
            for entry in self.peers.iter() {
                entry.value().clear_requested(index);
            }
            self.signal_request();
            return Ok(false);
        }

        if self.set_have_if_new(index) {
            trace!(info_hash = %self.info.hash, piece = index, "piece verified");
            self.completed
                .fetch_add(self.info.piece_len(index), Ordering::Relaxed);
            self.broadcast_have(index);
            self.check_completion().await;
        }
        Ok(true)
    }

    fn broadcast_have(&self, index: u32) {
        for entry in self.peers.iter() {
            let peer = entry.value().clone();
            tokio::spawn(async move { peer.send_have(index).await });
        }
    }

    /// On the last piece: become a seed, reset the download meter, wave
    /// goodbye to other seeds and announce completion.
    async fn check_completion(self: &Arc<Self>) {
        if self.have_count() != self.info.num_pieces {
            return;
        }

        info!(info_hash = %self.info.hash, "download complete");
        self.set_state(State::SEEDING);
        self.io_down.reset();
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.completed_at.store(now, Ordering::Relaxed);

        for peer in self.peer_snapshot() {
            if peer.is_seed() {
                peer.close();
            }
        }

        let torrent = self.clone();
        tokio::spawn(async move {
            torrent.announce(AnnounceEvent::Completed).await;
        });
    }
}
