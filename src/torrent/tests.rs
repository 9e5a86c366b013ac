use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};

use super::download::{block_request, Torrent};
use super::pending::{ConnHistory, DialOutcome, PendingPeer};
use super::resume::ResumeData;
use super::State;
use crate::bencode::{encode, Value};
use crate::client::Shared;
use crate::config::Config;
use crate::metainfo::Metainfo;
use crate::pex::{PexFlags, PexMessage, PexPeer};

/// Builds a single-file v1 torrent over `data` and a shared service set
/// rooted in `dir`.
fn fixture(dir: &Path, piece_length: usize, data: &[u8]) -> (Arc<Shared>, Metainfo) {
    fixture_with_trackers(dir, piece_length, data, &[])
}

fn fixture_with_trackers(
    dir: &Path,
    piece_length: usize,
    data: &[u8],
    tiers: &[Vec<String>],
) -> (Arc<Shared>, Metainfo) {
    let pieces: Vec<u8> = data
        .chunks(piece_length)
        .flat_map(|chunk| {
            let digest: [u8; 20] = Sha1::digest(chunk).into();
            digest
        })
        .collect();

    let mut info = BTreeMap::new();
    info.insert(
        Bytes::from_static(b"length"),
        Value::Int(data.len() as i64),
    );
    info.insert(Bytes::from_static(b"name"), Value::text("payload"));
    info.insert(
        Bytes::from_static(b"piece length"),
        Value::Int(piece_length as i64),
    );
    info.insert(Bytes::from_static(b"pieces"), Value::Bytes(Bytes::from(pieces)));

    let mut root = BTreeMap::new();
    if !tiers.is_empty() {
        root.insert(
            Bytes::from_static(b"announce-list"),
            Value::List(
                tiers
                    .iter()
                    .map(|tier| {
                        Value::List(tier.iter().map(|url| Value::text(url)).collect())
                    })
                    .collect(),
            ),
        );
    }
    root.insert(Bytes::from_static(b"info"), Value::Dict(info));

    let metainfo = Metainfo::from_bytes(&encode(&Value::Dict(root))).unwrap();

    let config = Config {
        session_path: dir.join("session"),
        download_dir: dir.join("downloads"),
        ..Config::default()
    };
    (Shared::new(config), metainfo)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn test_block_request_geometry() {
    let dir = tempfile::tempdir().unwrap();
    let (_, metainfo) = fixture(dir.path(), 32 * 1024, &payload(100 * 1024));
    let info = &metainfo.info;

    // 100 KiB / 32 KiB pieces: last piece is 4 KiB.
    assert_eq!(info.num_pieces, 4);
    let first = block_request(info, 0, 0);
    assert_eq!((first.begin, first.length), (0, 16384));
    let second = block_request(info, 0, 1);
    assert_eq!((second.begin, second.length), (16384, 16384));
    let tail = block_request(info, 3, 0);
    assert_eq!((tail.begin, tail.length), (0, 4096));
    assert_eq!(info.blocks_in_piece(3), 1);
}

#[test]
fn test_state_masks() {
    assert!(State::DOWNLOADING.matches(State::DOWNLOADING | State::SEEDING));
    assert!(!State::STOPPED.matches(State::DOWNLOADING | State::SEEDING));
    assert_eq!(State::SEEDING.as_str(), "seeding");
    assert_eq!(
        State::from_bits(State::CHECKING.to_bits()),
        Some(State::CHECKING)
    );
    assert_eq!(State::from_bits(0b11), None);
}

#[test]
fn test_pending_heap_pops_highest_priority() {
    let mut heap = std::collections::BinaryHeap::new();
    heap.push(PendingPeer {
        addr: "10.0.0.1:1".parse().unwrap(),
        priority: 5,
    });
    heap.push(PendingPeer {
        addr: "10.0.0.2:1".parse().unwrap(),
        priority: 900,
    });
    heap.push(PendingPeer {
        addr: "10.0.0.3:1".parse().unwrap(),
        priority: 40,
    });

    let order: Vec<u32> = std::iter::from_fn(|| heap.pop().map(|p| p.priority)).collect();
    assert_eq!(order, vec![900, 40, 5]);
}

#[test]
fn test_conn_history_skips_unreachable() {
    let mut history = ConnHistory::new();
    let a = "10.0.0.1:1".parse().unwrap();
    let b = "10.0.0.2:1".parse().unwrap();
    let c = "10.0.0.3:1".parse().unwrap();

    history.record(a, DialOutcome::Timeout);
    history.record(b, DialOutcome::Refused);
    history.record(c, DialOutcome::Failed);

    assert!(history.recently_unreachable(a));
    assert!(history.recently_unreachable(b));
    assert!(!history.recently_unreachable(c));
    assert!(!history.recently_unreachable("10.0.0.4:1".parse().unwrap()));
}

#[tokio::test]
async fn test_have_transitions_once() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, metainfo) = fixture(dir.path(), 16384, &payload(40_000));
    let torrent = Torrent::new(shared, &metainfo, dir.path().join("data"), vec![], None);

    assert!(torrent.set_have_if_new(1));
    assert!(!torrent.set_have_if_new(1));
    assert_eq!(torrent.have_count(), 1);
}

#[tokio::test]
async fn test_chunk_map_bookkeeping() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, metainfo) = fixture(dir.path(), 65536, &payload(100_000));
    let torrent = Torrent::new(shared, &metainfo, dir.path().join("data"), vec![], None);

    // 64 KiB pieces hold 4 blocks each.
    assert_eq!(torrent.block_id(0, 16384), 1);
    assert_eq!(torrent.block_id(1, 0), 4);

    assert!(!torrent.piece_blocks_done(0));
    for b in 0..4 {
        torrent.chunk_map.lock().set(b);
    }
    assert!(torrent.piece_blocks_done(0));

    torrent.clear_piece_blocks(0);
    assert!(!torrent.piece_blocks_done(0));
}

#[tokio::test]
async fn test_write_and_verify_pieces() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(40_000);
    let (shared, metainfo) = fixture(dir.path(), 16384, &data);
    let torrent = Torrent::new(shared, &metainfo, dir.path().join("data"), vec![], None);

    torrent.write_range(0, &data).await.unwrap();

    for index in 0..torrent.info().num_pieces {
        assert!(torrent.verify_piece(index).await.unwrap(), "piece {index}");
    }
    assert_eq!(torrent.completed_bytes(), data.len() as u64);
    assert_eq!(torrent.have_count(), torrent.info().num_pieces);
    // The last verification flips the torrent into seeding.
    assert!(torrent.state().matches(State::SEEDING));
}

#[tokio::test]
async fn test_corrupt_piece_rearms_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(40_000);
    let (shared, metainfo) = fixture(dir.path(), 16384, &data);
    let torrent = Torrent::new(shared, &metainfo, dir.path().join("data"), vec![], None);

    let mut corrupted = data.clone();
    corrupted[20_000] ^= 0xFF; // inside piece 1
    torrent.write_range(0, &corrupted).await.unwrap();

    let start = torrent.info().blocks_per_piece();
    torrent.chunk_map.lock().set(start);

    assert!(torrent.verify_piece(0).await.unwrap());
    assert!(!torrent.verify_piece(1).await.unwrap());

    assert_eq!(
        torrent.corrupted.load(Ordering::Relaxed),
        torrent.info().piece_length
    );
    assert!(!torrent.piece_blocks_done(1));
    assert!(!torrent.have_contains(1));

    // A clean rewrite completes the piece.
    torrent.write_range(0, &data).await.unwrap();
    assert!(torrent.verify_piece(1).await.unwrap());
}

#[tokio::test]
async fn test_ingest_pex_filters_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, metainfo) = fixture(dir.path(), 16384, &payload(40_000));
    let torrent = Torrent::new(shared, &metainfo, dir.path().join("data"), vec![], None);
    torrent.set_state(State::DOWNLOADING);

    let outgoing = PexFlags {
        outgoing: true,
        ..Default::default()
    };
    let message = PexMessage {
        added: vec![
            PexPeer {
                addr: "10.0.0.1:6881".parse().unwrap(),
                flags: outgoing,
            },
            PexPeer {
                addr: "10.0.0.2:6881".parse().unwrap(),
                flags: outgoing,
            },
            PexPeer {
                addr: "10.0.0.3:6881".parse().unwrap(),
                flags: PexFlags::default(),
            },
        ],
        dropped: vec![],
    };

    torrent.ingest_pex(message);
    assert_eq!(torrent.pending.lock().len(), 2);
}

#[tokio::test]
async fn test_ingest_pex_seed_only_skipped_while_seeding() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, metainfo) = fixture(dir.path(), 16384, &payload(40_000));
    let torrent = Torrent::new(shared, &metainfo, dir.path().join("data"), vec![], None);
    torrent.set_state(State::SEEDING);

    let message = PexMessage {
        added: vec![PexPeer {
            addr: "10.0.0.1:6881".parse().unwrap(),
            flags: PexFlags {
                outgoing: true,
                seed_only: true,
                ..Default::default()
            },
        }],
        dropped: vec![],
    };

    torrent.ingest_pex(message);
    assert!(torrent.pending.lock().is_empty());
}

#[tokio::test]
async fn test_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (shared, metainfo) = fixture(dir.path(), 16384, &payload(40_000));
    let torrent = Torrent::new(
        shared,
        &metainfo,
        dir.path().join("data"),
        vec!["linux".into(), "iso".into()],
        None,
    );
    torrent.downloaded.store(123_456, Ordering::Relaxed);
    torrent.uploaded.store(7_890, Ordering::Relaxed);
    torrent.set_have_if_new(2);
    torrent.set_state(State::STOPPED);

    let record = torrent.resume_data();
    let decoded = ResumeData::from_bytes(&record.to_bytes()).unwrap();
    assert_eq!(decoded, record);
    assert_eq!(decoded.info_hash, metainfo.info.hash);
    assert_eq!(decoded.downloaded, 123_456);
    assert_eq!(decoded.uploaded, 7_890);
    assert_eq!(decoded.state, State::STOPPED);
    assert_eq!(decoded.tags, vec!["linux".to_string(), "iso".to_string()]);
}

#[tokio::test]
async fn test_initial_check_finds_existing_pieces() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(40_000);
    let (shared, metainfo) = fixture(dir.path(), 16384, &data);
    let base = dir.path().join("data");

    // Pre-seed the payload on disk, then let init discover it.
    tokio::fs::create_dir_all(&base).await.unwrap();
    tokio::fs::write(base.join("payload"), &data).await.unwrap();

    let torrent = Torrent::new(shared, &metainfo, base, vec![], None);
    torrent.init();
    assert!(torrent.wait_state(State::SEEDING).await);
    assert_eq!(torrent.completed_bytes(), data.len() as u64);
}

/// Serves every request on an ephemeral port with a canned HTTP response
/// and returns the announce URL.
async fn canned_tracker(status_line: &'static str, body: Vec<u8>) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = sock.write_all(head.as_bytes()).await;
                let _ = sock.write_all(&body).await;
                let _ = sock.shutdown().await;
            });
        }
    });

    format!("http://{addr}/announce")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tracker_tier_failover() {
    // Tier 1 is broken (HTTP 502), tier 2 answers with a failure reason,
    // tier 3 delivers two peers; the announce walk must reach tier 3.
    let bad = canned_tracker("502 Bad Gateway", b"oops".to_vec()).await;
    let banned = canned_tracker("200 OK", b"d14:failure reason6:bannede".to_vec()).await;

    let mut good_body = Vec::new();
    good_body.extend_from_slice(b"d8:intervali1800e5:peers12:");
    good_body.extend_from_slice(&[10, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE2]);
    good_body.extend_from_slice(b"e");
    let good = canned_tracker("200 OK", good_body).await;

    let dir = tempfile::tempdir().unwrap();
    let tiers = vec![vec![bad.clone()], vec![banned.clone()], vec![good.clone()]];
    let (shared, metainfo) = fixture_with_trackers(dir.path(), 16384, &payload(40_000), &tiers);
    let torrent = Torrent::new(shared, &metainfo, dir.path().join("data"), vec![], None);

    torrent
        .announce(crate::tracker::AnnounceEvent::None)
        .await;

    assert_eq!(torrent.pending.lock().len(), 2);

    let statuses: std::collections::HashMap<String, crate::tracker::TrackerStatus> =
        torrent.tracker_statuses().into_iter().collect();
    assert!(statuses[&bad].last_error.is_some());
    assert_eq!(statuses[&banned].failure_message.as_deref(), Some("banned"));
    assert_eq!(statuses[&good].peer_count, 2);
    assert!(statuses[&good].announced);
}

#[tokio::test]
async fn test_move_to_relocates_payload() {
    let dir = tempfile::tempdir().unwrap();
    let data = payload(40_000);
    let (shared, metainfo) = fixture(dir.path(), 16384, &data);
    let source = dir.path().join("data");
    let target = dir.path().join("moved");

    let torrent = Torrent::new(shared, &metainfo, source.clone(), vec![], None);
    torrent.write_range(0, &data).await.unwrap();
    torrent.set_state(State::SEEDING);

    torrent.move_to(target.clone()).await.unwrap();

    assert!(torrent.state().matches(State::SEEDING));
    assert_eq!(torrent.base_path(), target);
    let moved = tokio::fs::read(target.join("payload")).await.unwrap();
    assert_eq!(moved, data);
    assert!(tokio::fs::metadata(source.join("payload")).await.is_err());

    // Pieces still verify from the new location.
    for index in 0..torrent.info().num_pieces {
        assert!(torrent.verify_piece(index).await.unwrap());
    }
}
