use std::time::Instant;

use parking_lot::Mutex;
use rand::seq::SliceRandom as _;
use reqwest::Client;
use tracing::{debug, trace};

use super::http::{announce, AnnounceParams};
use super::response::{AnnounceEvent, AnnounceResponse};
use crate::constants::DEFAULT_ANNOUNCE_INTERVAL;

/// One tracker of a tier and its announce bookkeeping.
pub struct Tracker {
    url: String,
    status: Mutex<Status>,
}

#[derive(Debug, Clone)]
pub struct Status {
    pub next_announce: Instant,
    pub last_announce: Option<Instant>,
    /// Peers in the last successful response.
    pub peer_count: usize,
    /// Transport or parse error of the last attempt.
    pub last_error: Option<String>,
    /// `failure reason` string from the tracker, when it sent one.
    pub failure_message: Option<String>,
    /// Whether this tracker ever saw a successful announce from us; only
    /// those get the best-effort `stopped` event.
    pub announced: bool,
}

impl Tracker {
    fn new(url: String) -> Self {
        Self {
            url,
            status: Mutex::new(Status {
                next_announce: Instant::now(),
                last_announce: None,
                peer_count: 0,
                last_error: None,
                failure_message: None,
                announced: false,
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> Status {
        self.status.lock().clone()
    }
}

/// An ordered tier of trackers ([BEP-12]): shuffled once at build time,
/// then tried in order until one answers.
///
/// [BEP-12]: http://bittorrent.org/beps/bep_0012.html
pub struct TrackerTier {
    pub trackers: Vec<Tracker>,
}

impl TrackerTier {
    pub fn new(mut urls: Vec<String>) -> Self {
        urls.shuffle(&mut rand::rng());
        Self {
            trackers: urls.into_iter().map(Tracker::new).collect(),
        }
    }

    /// Announces to the first due tracker in the tier.
    ///
    /// A failure records the error on that tracker, pushes its next
    /// attempt out 30 minutes and moves on within the tier; a success
    /// satisfies the whole tier until the returned interval elapses.
    pub async fn announce(
        &self,
        client: &Client,
        params: &AnnounceParams,
    ) -> Option<AnnounceResponse> {
        let now = Instant::now();

        for tracker in &self.trackers {
            if self.due(tracker, now) {
                trace!(url = tracker.url(), "announcing");
                match announce(client, tracker.url(), params).await {
                    Ok(response) => {
                        let mut status = tracker.status.lock();
                        status.last_announce = Some(now);
                        status.next_announce = now + response.interval;
                        status.peer_count = response.peers.len();
                        status.last_error = None;
                        status.failure_message = None;
                        status.announced = true;
                        return Some(response);
                    }
                    Err(err) => {
                        debug!(url = tracker.url(), error = %err, "announce failed");
                        let mut status = tracker.status.lock();
                        status.last_announce = Some(now);
                        status.next_announce = now + DEFAULT_ANNOUNCE_INTERVAL;
                        match err {
                            super::TrackerError::Failure(reason) => {
                                status.failure_message = Some(reason);
                            }
                            other => status.last_error = Some(other.to_string()),
                        }
                    }
                }
            }
        }

        None
    }

    /// Best-effort `stopped` notification to every tracker that has
    /// previously accepted an announce from us.
    pub async fn announce_stopped(&self, client: &Client, params: &AnnounceParams) {
        let params = AnnounceParams {
            event: AnnounceEvent::Stopped,
            ..params.clone()
        };
        for tracker in &self.trackers {
            if tracker.status.lock().announced {
                let _ = announce(client, tracker.url(), &params).await;
            }
        }
    }

    fn due(&self, tracker: &Tracker, now: Instant) -> bool {
        tracker.status.lock().next_announce <= now
    }
}
