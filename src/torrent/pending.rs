use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use crate::constants::{CONN_HISTORY_CAPACITY, CONN_HISTORY_TTL};

/// A candidate peer waiting for an outgoing connection, ordered by
/// [BEP-40] priority (highest first).
///
/// [BEP-40]: http://bittorrent.org/beps/bep_0040.html
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingPeer {
    pub addr: SocketAddr,
    pub priority: u32,
}

impl Ord for PendingPeer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.addr.cmp(&other.addr))
    }
}

impl PartialOrd for PendingPeer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// How the last dial to an address went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DialOutcome {
    Pending,
    Connected,
    Timeout,
    Refused,
    Failed,
}

/// Bounded, TTL-expiring memory of recent dial attempts, so the connect
/// loop does not hammer dead addresses every time a tracker re-lists
/// them.
pub(crate) struct ConnHistory {
    entries: HashMap<SocketAddr, (DialOutcome, Instant)>,
    order: VecDeque<SocketAddr>,
}

impl ConnHistory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn record(&mut self, addr: SocketAddr, outcome: DialOutcome) {
        if self.entries.insert(addr, (outcome, Instant::now())).is_none() {
            self.order.push_back(addr);
        }
        while self.order.len() > CONN_HISTORY_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    /// `true` when a timeout or refusal for `addr` is still fresh.
    pub fn recently_unreachable(&self, addr: SocketAddr) -> bool {
        match self.entries.get(&addr) {
            Some((DialOutcome::Timeout | DialOutcome::Refused, at)) => {
                at.elapsed() < CONN_HISTORY_TTL
            }
            _ => false,
        }
    }
}
