use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::download::Torrent;
use super::pending::DialOutcome;
use super::State;
use crate::bitfield::Bitfield;
use crate::constants::{CONNECT_TIMEOUT, ENDGAME_THRESHOLD, SCHEDULER_TICK};
use crate::peer::Peer;

/// A piece and how many connected peers advertise it. Min-heap order:
/// rarest first, ties by index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PieceRarity {
    rarity: u32,
    index: u32,
}

impl Ord for PieceRarity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rarity
            .cmp(&other.rarity)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl PartialOrd for PieceRarity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Torrent {
    /// The request planner: woken by peer events or a 200 ms tick, runs
    /// only while downloading.
    pub(super) async fn request_scheduler_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel_token().cancelled() => return,
                _ = self.req_signal.notified() => {}
                _ = tokio::time::sleep(SCHEDULER_TICK) => {}
            }

            if !self.wait_state(State::DOWNLOADING).await {
                return;
            }
            self.schedule();
        }
    }

    fn schedule(self: &Arc<Self>) {
        if self.endgame.load(Ordering::Relaxed) {
            self.schedule_endgame();
            return;
        }

        let remaining = self
            .info()
            .total_length
            .saturating_sub(self.completed_bytes());
        if remaining <= ENDGAME_THRESHOLD {
            debug!(info_hash = %self.info().hash, "entering endgame");
            self.endgame.store(true, Ordering::Relaxed);
            self.schedule_endgame();
            return;
        }

        self.schedule_rarest();
    }

    /// Rarest-first planning: offer each wanted piece, rarest first, to
    /// the slowest peer that can serve it. The capacity-1 work queue per
    /// peer bounds the planner's fan-out.
    fn schedule_rarest(self: &Arc<Self>) {
        let mut peers: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        if peers.is_empty() {
            return;
        }
        peers.sort_by_key(|p| p.download_rate());

        let mut queue = self.build_rarity_queue(&peers);

        'pieces: while let Some(Reverse(piece)) = queue.pop() {
            for peer in &peers {
                if peer.is_closed() {
                    // Registry changed under us; replan on the next tick.
                    return;
                }

                if peer.is_choking_us() {
                    // Choked peers can still serve their allowed-fast set.
                    if peer.allow_fast_contains(piece.index) && peer.has_piece(piece.index) {
                        peer.try_assign(piece.index);
                    }
                    continue;
                }

                if !peer.has_piece(piece.index) {
                    continue;
                }

                if peer.try_assign(piece.index) {
                    continue 'pieces;
                }
            }
        }
    }

    /// Computes rarity over connected peers.
    ///
    /// Choked peers contribute only their allowed-fast pieces; seeds
    /// contribute one shared increment so they do not flatten the
    /// ordering among partial peers. Pieces we have, and pieces already
    /// assigned to a peer, are excluded.
    fn build_rarity_queue(&self, peers: &[Arc<Peer>]) -> BinaryHeap<Reverse<PieceRarity>> {
        let num_pieces = self.info().num_pieces;
        let mut rarity = vec![0u32; num_pieces as usize];
        let mut requested = Bitfield::new(num_pieces);
        let mut base_rare = 0u32;

        for peer in peers {
            requested.union(&peer.requested_snapshot());

            let bitfield = peer.bitfield_snapshot();
            if peer.is_choking_us() {
                for index in 0..num_pieces {
                    if peer.allow_fast_contains(index) && bitfield.contains(index) {
                        rarity[index as usize] += 1;
                    }
                }
                continue;
            }

            if bitfield.is_full() {
                base_rare += 1;
                continue;
            }

            for index in bitfield.iter_set() {
                rarity[index as usize] += 1;
            }
        }

        let have = self.have_clone();
        let mut queue = BinaryHeap::with_capacity(num_pieces as usize);
        for (index, &rare) in rarity.iter().enumerate() {
            let index = index as u32;
            if have.contains(index) || requested.contains(index) {
                continue;
            }
            let total = rare + base_rare;
            if total == 0 {
                // Unobtainable right now.
                continue;
            }
            queue.push(Reverse(PieceRarity {
                rarity: total,
                index,
            }));
        }
        queue
    }

    /// Endgame planning: every missing piece is offered to every peer
    /// that has it. Duplicate deliveries are accepted and dropped; no
    /// Cancel frames chase them.
    fn schedule_endgame(&self) {
        let mut missing = Bitfield::full(self.info().num_pieces);
        missing.and_not(&self.have_clone());

        for entry in self.peers.iter() {
            let peer = entry.value();
            for index in missing.iter_set() {
                if peer.has_piece(index) {
                    peer.try_assign(index);
                }
            }
        }
    }

    /// Dials pending candidates, highest BEP-40 priority first, while the
    /// global connection budget allows.
    pub(super) async fn connect_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel_token().cancelled() => return,
                _ = self.pending_signal.notified() => {}
            }

            if !self.wait_state(State::DOWNLOADING | State::SEEDING).await {
                return;
            }
            self.connect_pending();
        }
    }

    fn connect_pending(self: &Arc<Self>) {
        loop {
            let Some(candidate) = self.pending.lock().pop() else {
                return;
            };

            {
                let history = self.history.lock();
                if history.recently_unreachable(candidate.addr) {
                    continue;
                }
            }
            if self.peers.contains_key(&candidate.addr) {
                continue;
            }

            let Ok(permit) = self.shared.budget.clone().try_acquire_owned() else {
                // Budget exhausted; keep the candidate for later.
                self.pending.lock().push(candidate);
                return;
            };
            self.shared.connection_count.fetch_add(1, Ordering::Relaxed);
            self.history.lock().record(candidate.addr, DialOutcome::Pending);

            let torrent = self.clone();
            tokio::spawn(async move {
                torrent.dial(candidate.addr, permit).await;
            });
        }
    }

    async fn dial(self: Arc<Self>, addr: SocketAddr, permit: tokio::sync::OwnedSemaphorePermit) {
        trace!(info_hash = %self.info().hash, %addr, "dialing peer");

        let outcome = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Err(_) => Err(DialOutcome::Timeout),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                Err(DialOutcome::Refused)
            }
            Ok(Err(_)) => Err(DialOutcome::Failed),
            Ok(Ok(stream)) => Ok(stream),
        };

        match outcome {
            Ok(stream) => {
                let _ = stream.set_linger(Some(std::time::Duration::ZERO));
                self.history.lock().record(addr, DialOutcome::Connected);
                Peer::spawn_outgoing(stream, addr, self.clone(), permit);
            }
            Err(outcome) => {
                self.history.lock().record(addr, outcome);
                drop(permit);
                self.connection_closed();
            }
        }
    }
}
