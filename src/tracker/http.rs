use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use reqwest::Client;

use super::error::TrackerError;
use super::response::{parse_announce, parse_scrape, AnnounceEvent, AnnounceResponse, ScrapeCounts};
use crate::bencode::decode;
use crate::constants::USER_AGENT;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the shared HTTP client for tracker traffic.
///
/// Redirects are never followed; trackers abusing them are treated as
/// failing.
pub fn http_client() -> Client {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(USER_AGENT)
        .build()
        .unwrap_or_default()
}

/// Everything an announce request carries besides the tracker URL.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    /// Stable random key identifying this torrent across IP changes.
    pub key: [u8; 16],
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

/// One announce GET against `url`.
pub async fn announce(
    client: &Client,
    url: &str,
    params: &AnnounceParams,
) -> Result<AnnounceResponse, TrackerError> {
    let mut query = format!(
        "{url}{sep}info_hash={ih}&peer_id={pid}&port={port}&compact=1&key={key}&uploaded={up}&downloaded={down}&left={left}",
        sep = if url.contains('?') { "&" } else { "?" },
        ih = percent_encode(&params.info_hash),
        pid = percent_encode(&params.peer_id),
        port = params.port,
        key = hex(&params.key),
        up = params.uploaded,
        down = params.downloaded,
        left = params.left,
    );

    if params.event != AnnounceEvent::None {
        query.push_str("&event=");
        query.push_str(params.event.as_str());
    }
    if let Some(v4) = params.ipv4 {
        query.push_str(&format!("&ipv4={v4}"));
    }
    if let Some(v6) = params.ipv6 {
        query.push_str(&format!("&ipv6={v6}"));
    }

    let body = client
        .get(&query)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    let value = decode(&body)?;
    parse_announce(&value)
}

/// One scrape GET for a single torrent.
pub async fn scrape(
    client: &Client,
    announce_url: &str,
    info_hash: &[u8; 20],
) -> Result<Vec<([u8; 20], ScrapeCounts)>, TrackerError> {
    let url = scrape_url(announce_url)
        .ok_or(TrackerError::InvalidResponse("tracker has no scrape endpoint"))?;
    let query = format!(
        "{url}{sep}info_hash={ih}",
        sep = if url.contains('?') { "&" } else { "?" },
        ih = percent_encode(info_hash),
    );

    let body = client
        .get(&query)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    let value = decode(&body)?;
    parse_scrape(&value)
}

/// Derives the scrape URL per the convention: the last path segment must
/// begin with `announce` and is rewritten to `scrape`.
pub fn scrape_url(announce_url: &str) -> Option<String> {
    let (prefix, last) = announce_url.rsplit_once('/')?;
    let rest = last.strip_prefix("announce")?;
    Some(format!("{prefix}/scrape{rest}"))
}

fn percent_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
