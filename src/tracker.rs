//! HTTP tracker client ([BEP-3] announce, scrape, [BEP-12] tiers).
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-12]: http://bittorrent.org/beps/bep_0012.html

mod error;
mod http;
mod response;
mod tier;

#[cfg(test)]
mod tests;

pub use error::TrackerError;
pub use http::{announce, http_client, scrape, scrape_url, AnnounceParams};
pub use response::{AnnounceEvent, AnnounceResponse, ScrapeCounts};
pub use tier::{Status as TrackerStatus, Tracker, TrackerTier};
