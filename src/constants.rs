//! Protocol constants and tuning parameters.

use std::time::Duration;

/// Client ID prefix for peer ID generation (Azureus-style).
pub const CLIENT_PREFIX: &[u8; 8] = b"-DR0010-";

/// User agent for tracker requests and the extension handshake.
pub const USER_AGENT: &str = "drift/0.1.0";

/// Default BitTorrent listen port.
pub const DEFAULT_PORT: u16 = 6881;

/// Transfer block size; the unit of Request/Piece exchange.
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Frames at or above this size are treated as malicious.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Default outstanding-request queue toward one peer, before the remote
/// advertises its own `reqq`.
pub const DEFAULT_QUEUE_LIMIT: u32 = 200;

/// Hard cap on the per-peer outstanding-request queue.
pub const MAX_QUEUE_LIMIT: u32 = 300;

/// `reqq` we advertise in our extension handshake.
pub const LOCAL_QUEUE_LIMIT: u32 = 1000;

/// Local sub-id assignment for `ut_pex` messages we emit.
pub const PEX_LOCAL_ID: u8 = 22;

/// Local sub-id assignment for `lt_donthave` messages we emit.
pub const DONT_HAVE_LOCAL_ID: u8 = 23;

/// Remaining-bytes threshold that flips a torrent into endgame mode.
pub const ENDGAME_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Response-heap size at which contiguous runs are spilled to disk.
pub const RESPONSE_HEAP_SPILL: usize = 1000;

/// Longest contiguous block run written in one spill merge.
pub const SPILL_RUN_BLOCKS: u32 = 10;

/// Idle time on a peer connection before a keep-alive is sent.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Read/write deadline for established peer connections.
pub const PEER_IO_TIMEOUT: Duration = Duration::from_secs(180);

/// Deadline applied while a connection is still handshaking.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outgoing TCP connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between request-scheduler ticks.
pub const SCHEDULER_TICK: Duration = Duration::from_millis(200);

/// Interval between tracker-loop wakeups.
pub const TRACKER_TICK: Duration = Duration::from_secs(5);

/// Announce interval assumed when a tracker omits one, and the back-off
/// applied after a tracker failure.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Open-file handles kept by the file pool.
pub const FILE_POOL_CAPACITY: usize = 128;

/// How long a pooled file handle may sit idle before eviction.
pub const FILE_POOL_TTL: Duration = Duration::from_secs(5 * 60);

/// Upload piece-cache budget in bytes.
pub const PIECE_CACHE_BYTES: usize = 1024 * 1024 * 1024;

/// Connection-history entries remembered per torrent.
pub const CONN_HISTORY_CAPACITY: usize = 1024;

/// How long a dial outcome disqualifies a candidate peer.
pub const CONN_HISTORY_TTL: Duration = Duration::from_secs(10 * 60);

/// Rejected-request entries remembered per peer.
pub const REJECTED_CAPACITY: usize = 512;
