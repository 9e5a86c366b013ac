use std::collections::BTreeMap;

use bytes::Bytes;

use super::response::{parse_announce, parse_scrape, AnnounceEvent};
use super::*;
use crate::bencode::{decode, encode, Value};

fn announce_dict(entries: Vec<(&'static [u8], Value)>) -> Value {
    let mut dict = BTreeMap::new();
    for (key, value) in entries {
        dict.insert(Bytes::from_static(key), value);
    }
    Value::Dict(dict)
}

#[test]
fn test_parse_compact_v4_peers() {
    let peers = vec![
        10u8, 0, 0, 1, 0x1A, 0xE1, // 10.0.0.1:6881
        192, 168, 0, 9, 0xC8, 0xD5, // 192.168.0.9:51413
    ];
    let value = announce_dict(vec![
        (b"interval", Value::Int(120)),
        (b"peers", Value::Bytes(Bytes::from(peers))),
    ]);

    let response = parse_announce(&value).unwrap();
    assert_eq!(response.interval.as_secs(), 120);
    assert_eq!(response.peers.len(), 2);
    assert_eq!(response.peers[0], "10.0.0.1:6881".parse().unwrap());
    assert_eq!(response.peers[1], "192.168.0.9:51413".parse().unwrap());
}

#[test]
fn test_parse_compact_v6_peers() {
    let mut peers6 = vec![0u8; 18];
    peers6[15] = 1; // ::1
    peers6[16] = 0x1A;
    peers6[17] = 0xE1;
    let value = announce_dict(vec![
        (b"interval", Value::Int(60)),
        (b"peers6", Value::Bytes(Bytes::from(peers6))),
    ]);

    let response = parse_announce(&value).unwrap();
    assert_eq!(response.peers, vec!["[::1]:6881".parse().unwrap()]);
}

#[test]
fn test_parse_dict_list_peers() {
    let raw = b"d8:intervali300e5:peersld2:ip8:10.0.0.24:porti7000eeee";
    let value = decode(raw).unwrap();
    let response = parse_announce(&value).unwrap();
    assert_eq!(response.peers, vec!["10.0.0.2:7000".parse().unwrap()]);
}

#[test]
fn test_peers_are_deduplicated() {
    let peers = vec![10u8, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 1, 0x1A, 0xE1];
    let value = announce_dict(vec![
        (b"interval", Value::Int(60)),
        (b"peers", Value::Bytes(Bytes::from(peers))),
    ]);
    let response = parse_announce(&value).unwrap();
    assert_eq!(response.peers.len(), 1);
}

#[test]
fn test_failure_reason_wins() {
    let value = announce_dict(vec![
        (b"failure reason", Value::text("banned")),
        (b"interval", Value::Int(60)),
    ]);
    assert!(matches!(
        parse_announce(&value),
        Err(TrackerError::Failure(reason)) if reason == "banned"
    ));
}

#[test]
fn test_missing_interval_defaults_to_thirty_minutes() {
    let value = announce_dict(vec![(b"peers", Value::Bytes(Bytes::new()))]);
    let response = parse_announce(&value).unwrap();
    assert_eq!(response.interval.as_secs(), 30 * 60);
}

#[test]
fn test_compact_length_must_be_multiple() {
    let value = announce_dict(vec![
        (b"interval", Value::Int(60)),
        (b"peers", Value::Bytes(Bytes::from_static(&[1, 2, 3]))),
    ]);
    assert!(parse_announce(&value).is_err());
}

#[test]
fn test_scrape_url_derivation() {
    assert_eq!(
        scrape_url("http://t.example/announce").as_deref(),
        Some("http://t.example/scrape")
    );
    assert_eq!(
        scrape_url("http://t.example/announce?auth=abc").as_deref(),
        Some("http://t.example/scrape?auth=abc")
    );
    assert_eq!(scrape_url("http://t.example/a"), None);
}

#[test]
fn test_parse_scrape_counts() {
    let mut files = BTreeMap::new();
    files.insert(
        Bytes::copy_from_slice(&[7u8; 20]),
        announce_dict(vec![
            (b"complete", Value::Int(12)),
            (b"downloaded", Value::Int(99)),
            (b"incomplete", Value::Int(3)),
        ]),
    );
    let doc = announce_dict(vec![]);
    let mut dict = doc.into_dict().unwrap();
    dict.insert(Bytes::from_static(b"files"), Value::Dict(files));
    let value = Value::Dict(dict);
    // Round-trip through bytes the way a real response arrives.
    let value = decode(&encode(&value)).unwrap();

    let counts = parse_scrape(&value).unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].0, [7u8; 20]);
    assert_eq!(counts[0].1.complete, 12);
    assert_eq!(counts[0].1.incomplete, 3);
    assert_eq!(counts[0].1.downloaded, 99);
}

#[test]
fn test_event_strings() {
    assert_eq!(AnnounceEvent::None.as_str(), "");
    assert_eq!(AnnounceEvent::Started.as_str(), "started");
    assert_eq!(AnnounceEvent::Completed.as_str(), "completed");
    assert_eq!(AnnounceEvent::Stopped.as_str(), "stopped");
}

#[test]
fn test_tier_shuffles_but_keeps_urls() {
    let urls: Vec<String> = (0..8).map(|i| format!("http://t{i}.example/announce")).collect();
    let tier = TrackerTier::new(urls.clone());
    let mut got: Vec<String> = tier.trackers.iter().map(|t| t.url().to_string()).collect();
    got.sort();
    let mut want = urls;
    want.sort();
    assert_eq!(got, want);
}
