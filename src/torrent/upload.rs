use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use super::download::Torrent;
use super::State;
use crate::peer::{Block, Peer};

impl Torrent {
    /// The upload responder: woken on every incoming Request, serves the
    /// most-wanted piece out of the shared piece cache.
    pub(super) async fn upload_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel_token().cancelled() => return,
                _ = self.upload_signal.notified() => {}
            }

            if !self.wait_state(State::DOWNLOADING | State::SEEDING).await {
                return;
            }
            // One wake drains everything queued, piece by piece.
            while self.serve_requests().await {}
        }
    }

    /// Serves the currently most-requested piece; `true` when something
    /// was served and another pass may find more queued requests.
    async fn serve_requests(self: &Arc<Self>) -> bool {
        // Unchoke whoever is interested, and snapshot peers with work.
        let peers: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut active: Vec<Arc<Peer>> = Vec::new();
        for peer in peers {
            if peer.is_interested_in_us() {
                peer.unchoke().await;
            }
            if peer.has_queued_requests() {
                active.push(peer);
            }
        }
        if active.is_empty() {
            return false;
        }

        // Most-requested piece wins; requests for pieces we lack are
        // dropped rather than served.
        let mut counts: HashMap<u32, u32> = HashMap::new();
        for peer in &active {
            for request in peer.queued_requests() {
                if self.have_contains(request.index) {
                    *counts.entry(request.index).or_default() += 1;
                } else {
                    peer.drop_requests_for(request.index);
                }
            }
        }
        let Some(index) = counts
            .into_iter()
            .max_by_key(|&(index, count)| (count, std::cmp::Reverse(index)))
            .map(|(index, _)| index)
        else {
            return false;
        };

        let Some(data) = self.piece_for_upload(index).await else {
            return false;
        };

        let mut served = Vec::new();
        for peer in &active {
            for request in peer.queued_requests() {
                if request.index != index {
                    continue;
                }
                let end = (request.begin + request.length) as usize;
                if end > data.len() {
                    peer.drop_requests_for(request.index);
                    continue;
                }
                let block = Block {
                    index,
                    begin: request.begin,
                    data: data.slice(request.begin as usize..end),
                };

                let torrent = self.clone();
                let peer = peer.clone();
                served.push(tokio::spawn(async move {
                    let n = block.data.len();
                    if peer.respond(block).await {
                        torrent.io_up.record(n);
                        torrent.shared.io_up.record(n);
                        torrent.uploaded.fetch_add(n as u64, Ordering::Relaxed);
                    }
                }));
            }
        }
        let any = !served.is_empty();
        for handle in served {
            let _ = handle.await;
        }
        any
    }

    /// Fetches a whole piece for the responder, through the shared cache.
    async fn piece_for_upload(self: &Arc<Self>, index: u32) -> Option<Bytes> {
        let hash = self.info().hash;
        if let Some(data) = self.shared.piece_cache.get(hash, index) {
            return Some(data);
        }

        let mut buf = vec![0u8; self.info().piece_len(index) as usize];
        if let Err(err) = self.read_piece_into(index, &mut buf).await {
            self.set_error(err);
            return None;
        }

        let data = Bytes::from(buf);
        self.shared.piece_cache.insert(hash, index, data.clone());
        trace!(info_hash = %hash, piece = index, "piece cached for upload");
        Some(data)
    }
}
