use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use super::download::Torrent;
use super::State;
use crate::constants::TRACKER_TICK;
use crate::tracker::{self, AnnounceEvent, AnnounceParams, ScrapeCounts, TrackerStatus};

impl Torrent {
    /// Periodic tracker driver; the per-tracker `next_announce` stamps do
    /// the real scheduling.
    pub(super) async fn tracker_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel_token().cancelled() => return,
                _ = tokio::time::sleep(TRACKER_TICK) => {}
            }

            if !self.wait_state(State::DOWNLOADING | State::SEEDING).await {
                return;
            }
            self.try_announce().await;
        }
    }

    /// Single-flight announce: overlapping attempts collapse into one.
    pub async fn try_announce(self: &Arc<Self>) {
        if self
            .announce_inflight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.announce(AnnounceEvent::None).await;
        self.announce_inflight.store(false, Ordering::SeqCst);
    }

    /// Announces tier by tier; the first tier that yields peers feeds the
    /// pending heap.
    pub(super) async fn announce(self: &Arc<Self>, event: AnnounceEvent) {
        let params = self.announce_params(event);

        for tier in &self.tiers {
            if let Some(response) = tier.announce(&self.shared.http, &params).await {
                trace!(
                    info_hash = %self.info().hash,
                    peers = response.peers.len(),
                    "announce succeeded"
                );
                self.ingest_tracker_peers(&response.peers);
                return;
            }
        }
    }

    /// Best-effort `stopped` to every tracker that heard from us.
    pub(super) async fn announce_stopped(self: &Arc<Self>) {
        let params = self.announce_params(AnnounceEvent::Stopped);
        for tier in &self.tiers {
            tier.announce_stopped(&self.shared.http, &params).await;
        }
    }

    fn announce_params(&self, event: AnnounceEvent) -> AnnounceParams {
        AnnounceParams {
            info_hash: *self.info().hash.as_bytes(),
            peer_id: self.peer_id().0,
            port: self.shared.config.p2p_port,
            key: self.tracker_key,
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            left: self
                .info()
                .total_length
                .saturating_sub(self.completed_bytes()),
            event,
            ipv4: *self.shared.ipv4.lock(),
            ipv6: *self.shared.ipv6.lock(),
        }
    }

    /// Scrapes the first tracker that has a scrape endpoint.
    pub async fn scrape(&self) -> Option<ScrapeCounts> {
        let hash = *self.info().hash.as_bytes();
        for tier in &self.tiers {
            for t in &tier.trackers {
                if tracker::scrape_url(t.url()).is_none() {
                    continue;
                }
                match tracker::scrape(&self.shared.http, t.url(), &hash).await {
                    Ok(files) => {
                        return files
                            .into_iter()
                            .find(|(h, _)| *h == hash)
                            .map(|(_, counts)| counts);
                    }
                    Err(err) => {
                        debug!(url = t.url(), error = %err, "scrape failed");
                    }
                }
            }
        }
        None
    }

    /// Tracker status snapshot for the host application.
    pub fn tracker_statuses(&self) -> Vec<(String, TrackerStatus)> {
        self.tiers
            .iter()
            .flat_map(|tier| {
                tier.trackers
                    .iter()
                    .map(|t| (t.url().to_string(), t.status()))
            })
            .collect()
    }
}
