use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::bencode::Value;
use crate::constants::DEFAULT_ANNOUNCE_INTERVAL;

use super::error::TrackerError;

/// The `event` query parameter of an announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    #[default]
    None,
    Started,
    Completed,
    Stopped,
}

impl AnnounceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

/// A successfully parsed announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    /// Unique peer addresses, v4 and v6 combined.
    pub peers: Vec<SocketAddr>,
}

/// Parses the bencoded announce body.
///
/// A `failure reason` key wins over everything else. Both compact and
/// dictionary-list peer forms are accepted for `peers` and `peers6`; the
/// two forms are told apart by the value's bencode type.
pub fn parse_announce(value: &Value) -> Result<AnnounceResponse, TrackerError> {
    let dict = value
        .as_dict()
        .ok_or(TrackerError::InvalidResponse("response is not a dict"))?;

    if let Some(reason) = dict.get(b"failure reason".as_slice()).and_then(Value::as_str) {
        return Err(TrackerError::Failure(reason.to_string()));
    }

    let interval = dict
        .get(b"interval".as_slice())
        .and_then(Value::as_int)
        .filter(|&n| n > 0)
        .map(|n| Duration::from_secs(n as u64))
        .unwrap_or(DEFAULT_ANNOUNCE_INTERVAL);

    let mut peers = Vec::new();
    if let Some(value) = dict.get(b"peers".as_slice()) {
        parse_peers(value, 4, &mut peers)?;
    }
    if let Some(value) = dict.get(b"peers6".as_slice()) {
        parse_peers(value, 16, &mut peers)?;
    }
    dedup(&mut peers);

    Ok(AnnounceResponse {
        interval,
        complete: dict
            .get(b"complete".as_slice())
            .and_then(Value::as_int)
            .map(|n| n as u32),
        incomplete: dict
            .get(b"incomplete".as_slice())
            .and_then(Value::as_int)
            .map(|n| n as u32),
        peers,
    })
}

fn parse_peers(value: &Value, ip_len: usize, out: &mut Vec<SocketAddr>) -> Result<(), TrackerError> {
    match value {
        Value::Bytes(data) => {
            let stride = ip_len + 2;
            if data.len() % stride != 0 {
                return Err(TrackerError::InvalidResponse("compact peers length"));
            }
            for chunk in data.chunks_exact(stride) {
                let ip: IpAddr = if ip_len == 4 {
                    Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]).into()
                } else {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(&chunk[..16]);
                    Ipv6Addr::from(octets).into()
                };
                let port = u16::from_be_bytes([chunk[ip_len], chunk[ip_len + 1]]);
                out.push(SocketAddr::new(ip, port));
            }
        }
        Value::List(entries) => {
            for entry in entries {
                let ip = entry
                    .get(b"ip")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok());
                let port = entry
                    .get(b"port")
                    .and_then(Value::as_int)
                    .and_then(|p| u16::try_from(p).ok());
                if let (Some(ip), Some(port)) = (ip, port) {
                    out.push(SocketAddr::new(ip, port));
                }
            }
        }
        _ => return Err(TrackerError::InvalidResponse("peers type")),
    }
    Ok(())
}

fn dedup(peers: &mut Vec<SocketAddr>) {
    let mut seen = HashSet::with_capacity(peers.len());
    peers.retain(|addr| seen.insert(*addr));
}

/// One torrent's counters from a scrape response.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeCounts {
    pub complete: u32,
    pub incomplete: u32,
    pub downloaded: u32,
}

/// Parses the `files` dict of a scrape response, keyed by raw info hash.
pub fn parse_scrape(value: &Value) -> Result<Vec<([u8; 20], ScrapeCounts)>, TrackerError> {
    let files = value
        .get(b"files")
        .and_then(Value::as_dict)
        .ok_or(TrackerError::InvalidResponse("scrape files"))?;

    let mut out = Vec::with_capacity(files.len());
    for (key, counts) in files {
        let Ok(hash) = <[u8; 20]>::try_from(key.as_ref()) else {
            continue;
        };
        let count = |name: &[u8]| {
            counts
                .get(name)
                .and_then(Value::as_int)
                .map(|n| n as u32)
                .unwrap_or(0)
        };
        out.push((
            hash,
            ScrapeCounts {
                complete: count(b"complete"),
                incomplete: count(b"incomplete"),
                downloaded: count(b"downloaded"),
            },
        ));
    }
    Ok(out)
}
