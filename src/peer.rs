//! The peer wire protocol ([BEP-3]) with the fast extension ([BEP-6]) and
//! the extension protocol ([BEP-10]), plus the per-connection state
//! machine.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-6]: http://bittorrent.org/beps/bep_0006.html
//! [BEP-10]: http://bittorrent.org/beps/bep_0010.html

mod connection;
mod error;
mod extension;
mod message;
mod peer_id;
mod transport;

#[cfg(test)]
mod tests;

pub use connection::Peer;
pub use error::PeerError;
pub use extension::{ExtensionHandshake, EXTENSION_HANDSHAKE_ID};
pub use message::{Block, BlockRequest, Handshake, Message, MessageId, HANDSHAKE_LEN, PROTOCOL};
pub use peer_id::PeerId;
pub use transport::{read_handshake, FrameReader, FrameWriter};
