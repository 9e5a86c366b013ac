use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex, Notify, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::error::PeerError;
use super::extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID};
use super::message::{Block, BlockRequest, Handshake, Message};
use super::peer_id::PeerId;
use super::transport::{FrameReader, FrameWriter};
use crate::bandwidth::RateMonitor;
use crate::bitfield::Bitfield;
use crate::constants::{
    BLOCK_SIZE, DEFAULT_QUEUE_LIMIT, KEEPALIVE_INTERVAL, MAX_QUEUE_LIMIT, REJECTED_CAPACITY,
};
use crate::pex::PexMessage;
use crate::torrent::{State, Torrent};

/// Averaged request round-trip window, kept as a peer quality hint.
struct RttWindow {
    samples: Vec<Duration>,
    next: usize,
}

impl RttWindow {
    const LIMIT: usize = 256;

    fn new() -> Self {
        Self {
            samples: Vec::new(),
            next: 0,
        }
    }

    fn push(&mut self, sample: Duration) {
        if self.samples.len() < Self::LIMIT {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
            self.next = (self.next + 1) % Self::LIMIT;
        }
    }

    fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

/// One remote peer connection.
///
/// A peer runs three tasks: the frame reader (which also dispatches), the
/// request pump draining the scheduler's piece assignments, and the
/// keep-alive timer. All exit when the peer token is cancelled. `close()`
/// is idempotent; it releases the global connection permit exactly once,
/// removes the peer from the torrent registry and wakes the scheduler to
/// rebuild rarity.
pub struct Peer {
    pub addr: SocketAddr,
    pub incoming: bool,

    torrent: Arc<Torrent>,
    cancel: CancellationToken,
    closed: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,

    peer_id: Mutex<Option<PeerId>>,
    user_agent: Mutex<Option<String>>,
    fast: AtomicBool,
    extended: AtomicBool,
    dht: AtomicBool,

    our_choking: AtomicBool,
    our_interested: AtomicBool,
    peer_choking: AtomicBool,
    peer_interested: AtomicBool,

    /// Pieces the remote claims to have.
    bitfield: RwLock<Bitfield>,
    /// Pieces we may request while choked ([BEP-6]).
    allow_fast: RwLock<Bitfield>,
    /// Pieces the scheduler has routed to this peer.
    requested: RwLock<Bitfield>,

    my_requests: Mutex<HashMap<BlockRequest, Instant>>,
    rejected: Mutex<HashSet<BlockRequest>>,
    peer_requests: Mutex<HashSet<BlockRequest>>,

    queue_limit: AtomicU32,
    pex_id: Mutex<Option<u8>>,
    dont_have_id: Mutex<Option<u8>>,

    /// Signalled whenever an in-flight request slot frees up.
    slot_free: Notify,
    work_tx: mpsc::Sender<u32>,
    work_rx: Mutex<Option<mpsc::Receiver<u32>>>,

    writer: TokioMutex<Option<FrameWriter>>,
    last_send: Mutex<Instant>,

    pub io_in: RateMonitor,
    pub io_out: RateMonitor,
    rtt: Mutex<RttWindow>,
}

impl Peer {
    /// Spawns an outgoing peer; the handshake has not been exchanged yet.
    pub fn spawn_outgoing(
        stream: TcpStream,
        addr: SocketAddr,
        torrent: Arc<Torrent>,
        permit: OwnedSemaphorePermit,
    ) -> Arc<Peer> {
        let peer = Self::build(addr, false, torrent, permit);
        tokio::spawn(peer.clone().run(stream, None));
        peer
    }

    /// Spawns an incoming peer whose handshake the listener already read.
    pub fn spawn_incoming(
        stream: TcpStream,
        addr: SocketAddr,
        torrent: Arc<Torrent>,
        permit: OwnedSemaphorePermit,
        handshake: Handshake,
    ) -> Arc<Peer> {
        let peer = Self::build(addr, true, torrent, permit);
        tokio::spawn(peer.clone().run(stream, Some(handshake)));
        peer
    }

    fn build(
        addr: SocketAddr,
        incoming: bool,
        torrent: Arc<Torrent>,
        permit: OwnedSemaphorePermit,
    ) -> Arc<Peer> {
        let num_pieces = torrent.info().num_pieces;
        let (work_tx, work_rx) = mpsc::channel(1);

        Arc::new(Peer {
            addr,
            incoming,
            cancel: torrent.cancel_token().child_token(),
            torrent,
            closed: AtomicBool::new(false),
            permit: Mutex::new(Some(permit)),
            peer_id: Mutex::new(None),
            user_agent: Mutex::new(None),
            fast: AtomicBool::new(false),
            extended: AtomicBool::new(false),
            dht: AtomicBool::new(false),
            our_choking: AtomicBool::new(true),
            our_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            bitfield: RwLock::new(Bitfield::new(num_pieces)),
            allow_fast: RwLock::new(Bitfield::new(num_pieces)),
            requested: RwLock::new(Bitfield::new(num_pieces)),
            my_requests: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            peer_requests: Mutex::new(HashSet::new()),
            queue_limit: AtomicU32::new(DEFAULT_QUEUE_LIMIT),
            pex_id: Mutex::new(None),
            dont_have_id: Mutex::new(None),
            slot_free: Notify::new(),
            work_tx,
            work_rx: Mutex::new(Some(work_rx)),
            writer: TokioMutex::new(None),
            last_send: Mutex::new(Instant::now()),
            io_in: RateMonitor::new(),
            io_out: RateMonitor::new(),
            rtt: Mutex::new(RttWindow::new()),
        })
    }

    async fn run(self: Arc<Self>, stream: TcpStream, pre_handshake: Option<Handshake>) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);
        *self.writer.lock().await = Some(FrameWriter::new(write_half));

        if let Err(err) = self.startup(&mut reader, pre_handshake).await {
            trace!(addr = %self.addr, error = %err, "peer startup failed");
            self.close();
            return;
        }

        match self.read_loop(&mut reader).await {
            Ok(()) => trace!(addr = %self.addr, "peer loop done"),
            Err(PeerError::ConnectionClosed) => trace!(addr = %self.addr, "peer disconnected"),
            Err(err) => debug!(addr = %self.addr, error = %err, "peer closed"),
        }
        self.close();
    }

    async fn startup(
        self: &Arc<Self>,
        reader: &mut FrameReader,
        pre_handshake: Option<Handshake>,
    ) -> Result<(), PeerError> {
        let info_hash = *self.torrent.info().hash.as_bytes();
        let ours = Handshake::new(
            info_hash,
            self.torrent.peer_id().0,
            !self.torrent.is_private(),
        );

        {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or(PeerError::ConnectionClosed)?;
            writer.write_handshake(&ours).await?;
        }
        *self.last_send.lock() = Instant::now();

        let theirs = match pre_handshake {
            Some(handshake) => handshake,
            None => reader.read_handshake().await?,
        };
        if theirs.info_hash != info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        self.fast.store(theirs.supports_fast_extension(), Ordering::Relaxed);
        self.extended
            .store(theirs.supports_extension_protocol(), Ordering::Relaxed);
        self.dht.store(theirs.supports_dht(), Ordering::Relaxed);

        if let Some(id) = PeerId::from_bytes(&theirs.peer_id) {
            *self.user_agent.lock() = id.client_id().map(String::from);
            *self.peer_id.lock() = Some(id);
        }

        // At most one connection per remote address.
        if !self.torrent.register_peer(self.addr, self.clone()) {
            return Err(PeerError::ConnectionClosed);
        }

        let pump = self.clone();
        tokio::spawn(async move { pump.pump_loop().await });
        let keepalive = self.clone();
        tokio::spawn(async move { keepalive.keepalive_loop().await });

        self.send_initial_state().await?;
        Ok(())
    }

    /// Tells the fresh peer what we have: HaveNone/HaveAll shortcuts when
    /// both sides speak the fast extension, a bitfield otherwise, nothing
    /// when we have nothing to declare. Then the extension handshake.
    async fn send_initial_state(&self) -> Result<(), PeerError> {
        let have = self.torrent.have_clone();
        let count = have.count();
        let fast = self.fast.load(Ordering::Relaxed);

        if fast && count == 0 {
            self.write(Message::HaveNone).await?;
        } else if fast && count == have.len() {
            self.write(Message::HaveAll).await?;
        } else if count > 0 {
            self.write(Message::Bitfield(have.to_bytes())).await?;
        }

        if self.extended.load(Ordering::Relaxed) {
            let handshake = ExtensionHandshake::local(!self.torrent.is_private());
            self.write(Message::Extended {
                id: EXTENSION_HANDSHAKE_ID,
                payload: handshake.encode(),
            })
            .await?;
        }

        Ok(())
    }

    async fn read_loop(self: &Arc<Self>, reader: &mut FrameReader) -> Result<(), PeerError> {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                frame = reader.read_frame() => frame?,
            };
            self.dispatch(frame).await?;
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Message) -> Result<(), PeerError> {
        let num_pieces = self.torrent.info().num_pieces;

        match frame {
            Message::KeepAlive => {}
            Message::Choke => {
                self.peer_choking.store(true, Ordering::Relaxed);
            }
            Message::Unchoke => {
                self.peer_choking.store(false, Ordering::Relaxed);
                self.torrent.signal_request();
            }
            Message::Interested => {
                self.peer_interested.store(true, Ordering::Relaxed);
                self.torrent.signal_upload();
            }
            Message::NotInterested => {
                self.peer_interested.store(false, Ordering::Relaxed);
                self.torrent.signal_upload();
            }
            Message::Have(index) => {
                if index >= num_pieces {
                    return Err(PeerError::Malicious("have index out of range"));
                }
                self.bitfield.write().set(index);
                self.after_have_update().await?;
            }
            Message::Bitfield(bits) => {
                let decoded = Bitfield::from_bytes(&bits, num_pieces)
                    .ok_or(PeerError::InvalidMessage("bitfield length mismatch"))?;
                *self.bitfield.write() = decoded;
                self.after_have_update().await?;
            }
            Message::HaveAll => {
                if !self.fast.load(Ordering::Relaxed) {
                    return Err(PeerError::Malicious("have-all without fast extension"));
                }
                self.bitfield.write().fill();
                self.after_have_update().await?;
            }
            Message::HaveNone => {
                if !self.fast.load(Ordering::Relaxed) {
                    return Err(PeerError::Malicious("have-none without fast extension"));
                }
                self.bitfield.write().clear_all();
            }
            Message::Request(request) => {
                if !self.valid_request(&request) {
                    warn!(addr = %self.addr, ?request, "invalid request");
                    if self.fast.load(Ordering::Relaxed) {
                        self.write(Message::Reject(request)).await?;
                    }
                } else {
                    self.peer_requests.lock().insert(request);
                    self.torrent.signal_upload();
                }
            }
            Message::Piece(block) => {
                self.accept_block(block).await?;
            }
            Message::Cancel(request) => {
                self.peer_requests.lock().remove(&request);
            }
            Message::Reject(request) => {
                let mut rejected = self.rejected.lock();
                if rejected.len() < REJECTED_CAPACITY {
                    rejected.insert(request);
                }
                drop(rejected);
                self.my_requests.lock().remove(&request);
                self.slot_free.notify_one();
            }
            Message::AllowedFast(index) => {
                if index >= num_pieces {
                    return Err(PeerError::Malicious("allowed-fast index out of range"));
                }
                self.allow_fast.write().set(index);
            }
            Message::Suggest(_) => {}
            Message::Port(port) => {
                if !self.torrent.is_private() {
                    self.torrent.notify_dht(SocketAddr::new(self.addr.ip(), port));
                }
            }
            Message::Extended { id, payload } => {
                self.dispatch_extended(id, &payload).await?;
            }
            Message::Unknown { id } => {
                trace!(addr = %self.addr, id, "skipping unknown message");
            }
        }

        Ok(())
    }

    async fn dispatch_extended(&self, id: u8, payload: &[u8]) -> Result<(), PeerError> {
        if !self.extended.load(Ordering::Relaxed) {
            return Err(PeerError::Malicious("extended frame without negotiation"));
        }

        if id == EXTENSION_HANDSHAKE_ID {
            let handshake = ExtensionHandshake::decode(payload)?;
            if let Some(client) = handshake.client {
                *self.user_agent.lock() = Some(client);
            }
            if let Some(reqq) = handshake.reqq {
                self.queue_limit.store(reqq, Ordering::Relaxed);
                self.slot_free.notify_one();
            }
            *self.pex_id.lock() = handshake.pex_id;
            *self.dont_have_id.lock() = handshake.dont_have_id;
            return Ok(());
        }

        let pex_id = *self.pex_id.lock();
        if pex_id == Some(id) {
            if !self.torrent.is_private() {
                let message = PexMessage::decode(payload)
                    .map_err(|_| PeerError::InvalidMessage("malformed pex payload"))?;
                self.torrent.ingest_pex(message);
            }
            return Ok(());
        }

        let dont_have_id = *self.dont_have_id.lock();
        if dont_have_id == Some(id) {
            if payload.len() != 4 {
                return Err(PeerError::InvalidMessage("malformed dont-have payload"));
            }
            let index = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if index < self.torrent.info().num_pieces {
                self.bitfield.write().clear(index);
            }
            return Ok(());
        }

        trace!(addr = %self.addr, id, "skipping unknown extension message");
        Ok(())
    }

    /// Runs after Have/HaveAll/Bitfield: declare interest if the peer has
    /// anything we lack, wake the scheduler, and hang up when both sides
    /// are seeds.
    async fn after_have_update(&self) -> Result<(), PeerError> {
        let wanted = {
            let have = self.torrent.have_clone();
            let mut theirs = self.bitfield.read().clone();
            theirs.and_not(&have);
            theirs.count() > 0
        };

        if wanted {
            if self
                .our_interested
                .compare_exchange(false, true, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                self.write(Message::Interested).await?;
            }
        } else if self
            .our_interested
            .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.write(Message::NotInterested).await?;
        }

        self.torrent.on_peer_change();

        if self.is_seed() && self.torrent.state().matches(State::SEEDING) {
            return Err(PeerError::ConnectionClosed);
        }

        Ok(())
    }

    /// Validates an incoming block against our own outstanding requests,
    /// samples the round trip, and hands it to the torrent's assembler.
    async fn accept_block(&self, block: Block) -> Result<(), PeerError> {
        let request = block.request();
        let sent_at = self.my_requests.lock().remove(&request);
        let Some(sent_at) = sent_at else {
            return Err(PeerError::Malicious("piece without matching request"));
        };

        self.rtt.lock().push(sent_at.elapsed());
        self.io_in.record(block.data.len());
        self.slot_free.notify_one();

        if !self.torrent.push_block(block).await {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }

    /// Request validity: in-range index, sane length (full blocks, or the
    /// short tail block), and inside the piece.
    fn valid_request(&self, request: &BlockRequest) -> bool {
        let info = self.torrent.info();
        if request.index >= info.num_pieces {
            return false;
        }
        let piece_len = info.piece_len(request.index);
        if request.length == 0 || request.length > BLOCK_SIZE * 2 {
            return false;
        }
        let end = request.begin as u64 + request.length as u64;
        if end > piece_len {
            return false;
        }
        request.length % BLOCK_SIZE == 0 || end == piece_len
    }

    /// Drains piece assignments from the scheduler, issuing one Request
    /// per block with backpressure against the negotiated queue depth.
    async fn pump_loop(self: Arc<Self>) {
        let Some(mut work_rx) = self.work_rx.lock().take() else {
            return;
        };

        loop {
            let index = tokio::select! {
                _ = self.cancel.cancelled() => return,
                index = work_rx.recv() => match index {
                    Some(index) => index,
                    None => return,
                },
            };

            let blocks = self.torrent.info().blocks_in_piece(index);
            'blocks: for b in 0..blocks {
                if self.closed.load(Ordering::Relaxed) {
                    return;
                }

                while self.my_requests.lock().len() >= self.inflight_limit() {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = self.slot_free.notified() => {}
                    }
                }

                if self.peer_choking.load(Ordering::Relaxed)
                    && !self.allow_fast.read().contains(index)
                {
                    // Give the piece back to the planner.
                    self.requested.write().clear(index);
                    break 'blocks;
                }

                let request = crate::torrent::block_request(self.torrent.info(), index, b);
                let fresh = self
                    .my_requests
                    .lock()
                    .insert(request, Instant::now())
                    .is_none();
                if fresh && self.write(Message::Request(request)).await.is_err() {
                    return;
                }
            }

            self.torrent.signal_request();
        }
    }

    /// The −10 reserve keeps us under the remote's advertised queue so it
    /// does not start rejecting.
    fn inflight_limit(&self) -> usize {
        let limit = self.queue_limit.load(Ordering::Relaxed);
        limit.saturating_sub(10).clamp(1, MAX_QUEUE_LIMIT) as usize
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(KEEPALIVE_INTERVAL / 2);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tick.tick() => {}
            }
            let idle = self.last_send.lock().elapsed();
            if idle >= KEEPALIVE_INTERVAL && self.write(Message::KeepAlive).await.is_err() {
                self.close();
                return;
            }
        }
    }

    /// Writes one frame under the peer's write lock.
    async fn write(&self, message: Message) -> Result<(), PeerError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(PeerError::ConnectionClosed)?;
        writer.write_frame(&message).await?;
        *self.last_send.lock() = Instant::now();
        Ok(())
    }

    // --- surface consumed by the torrent ---

    /// Non-blocking piece assignment from the planner; at most one piece
    /// rides in the queue.
    pub fn try_assign(&self, index: u32) -> bool {
        if self.work_tx.try_send(index).is_ok() {
            self.requested.write().set(index);
            true
        } else {
            false
        }
    }

    /// Announces a freshly verified piece.
    pub async fn send_have(self: Arc<Self>, index: u32) {
        if self.write(Message::Have(index)).await.is_err() {
            self.close();
        }
    }

    /// Unchokes the peer if we were choking it.
    pub async fn unchoke(self: &Arc<Self>) {
        if self
            .our_choking
            .compare_exchange(true, false, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
            && self.write(Message::Unchoke).await.is_err()
        {
            self.close();
        }
    }

    /// Serves one block the remote asked for. Returns `false` when the
    /// request is no longer queued (e.g. it was cancelled since the
    /// responder snapshotted).
    pub async fn respond(self: &Arc<Self>, block: Block) -> bool {
        let request = block.request();
        if !self.peer_requests.lock().remove(&request) {
            return false;
        }
        self.io_out.record(block.data.len());
        if self.write(Message::Piece(block)).await.is_err() {
            self.close();
            return false;
        }
        true
    }

    /// Idempotent close: cancels the peer tasks, removes the registry
    /// entry, releases the global connection permit and wakes the
    /// scheduler.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!(addr = %self.addr, "closing peer");
        self.cancel.cancel();
        self.torrent.unregister_peer(self.addr);
        self.permit.lock().take();
        self.torrent.connection_closed();
        self.torrent.on_peer_change();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn bitfield_snapshot(&self) -> Bitfield {
        self.bitfield.read().clone()
    }

    pub fn requested_snapshot(&self) -> Bitfield {
        self.requested.read().clone()
    }

    pub fn allow_fast_contains(&self, index: u32) -> bool {
        self.allow_fast.read().contains(index)
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.read().contains(index)
    }

    pub fn is_seed(&self) -> bool {
        self.bitfield.read().is_full()
    }

    pub fn supports_dht(&self) -> bool {
        self.dht.load(Ordering::Relaxed)
    }

    /// Whether the remote has rejected this exact request before; the
    /// planner can use it to prefer other peers for the piece.
    pub fn was_rejected(&self, request: &BlockRequest) -> bool {
        self.rejected.lock().contains(request)
    }

    pub fn is_choking_us(&self) -> bool {
        self.peer_choking.load(Ordering::Relaxed)
    }

    pub fn is_interested_in_us(&self) -> bool {
        self.peer_interested.load(Ordering::Relaxed)
    }

    pub fn queued_requests(&self) -> Vec<BlockRequest> {
        self.peer_requests.lock().iter().copied().collect()
    }

    pub fn has_queued_requests(&self) -> bool {
        !self.peer_requests.lock().is_empty()
    }

    /// Drops queued requests the responder can no longer serve.
    pub fn drop_requests_for(&self, index: u32) {
        self.peer_requests.lock().retain(|r| r.index != index);
    }

    /// Releases a piece assignment so the planner may route it again.
    pub fn clear_requested(&self, index: u32) {
        self.requested.write().clear(index);
    }

    pub fn download_rate(&self) -> u64 {
        self.io_in.rate()
    }

    pub fn upload_rate(&self) -> u64 {
        self.io_out.rate()
    }

    pub fn peer_id(&self) -> Option<PeerId> {
        *self.peer_id.lock()
    }

    pub fn user_agent(&self) -> Option<String> {
        self.user_agent.lock().clone()
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        self.rtt.lock().average()
    }

    /// Fraction of the torrent the peer claims to have.
    pub fn progress(&self) -> f64 {
        let bitfield = self.bitfield.read();
        if bitfield.len() == 0 {
            return 0.0;
        }
        bitfield.count() as f64 / bitfield.len() as f64
    }
}
