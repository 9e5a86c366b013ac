use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use crate::constants::{HANDSHAKE_TIMEOUT, MAX_FRAME_SIZE, PEER_IO_TIMEOUT};

/// Reads one 68-byte handshake from a stream.
///
/// Used on raw accepted sockets (before the owning torrent is known) as
/// well as on outgoing connections.
pub async fn read_handshake<S>(stream: &mut S) -> Result<Handshake, PeerError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .map_err(|_| PeerError::Timeout)?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                PeerError::ConnectionClosed
            } else {
                PeerError::Io(e)
            }
        })?;
    Handshake::decode(&buf)
}

/// The read half of a peer connection, yielding whole frames.
pub struct FrameReader {
    stream: OwnedReadHalf,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(stream: OwnedReadHalf) -> Self {
        Self {
            stream,
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Reads the remote handshake; used on outgoing connections before
    /// the frame loop starts.
    pub async fn read_handshake(&mut self) -> Result<Handshake, PeerError> {
        while self.buf.len() < HANDSHAKE_LEN {
            let n = timeout(HANDSHAKE_TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::ConnectionClosed);
            }
        }
        let data = self.buf.split_to(HANDSHAKE_LEN);
        Handshake::decode(&data)
    }

    /// Reads the next frame, enforcing the read deadline and the frame
    /// size cap before buffering the body.
    pub async fn read_frame(&mut self) -> Result<Message, PeerError> {
        while self.buf.len() < 4 {
            self.fill().await?;
        }

        let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if length >= MAX_FRAME_SIZE {
            return Err(PeerError::Malicious("oversized frame"));
        }

        let total = 4 + length as usize;
        while self.buf.len() < total {
            self.fill().await?;
        }

        let frame = self.buf.split_to(total).freeze();
        Message::decode(frame)
    }

    async fn fill(&mut self) -> Result<(), PeerError> {
        let n = timeout(PEER_IO_TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .map_err(|_| PeerError::Timeout)??;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }
}

/// The write half of a peer connection. Callers serialise access through
/// the peer's write lock.
pub struct FrameWriter {
    stream: OwnedWriteHalf,
}

impl FrameWriter {
    pub fn new(stream: OwnedWriteHalf) -> Self {
        Self { stream }
    }

    pub async fn write_handshake(&mut self, handshake: &Handshake) -> Result<(), PeerError> {
        self.write_all(&handshake.encode()).await
    }

    pub async fn write_frame(&mut self, message: &Message) -> Result<(), PeerError> {
        self.write_all(&message.encode()).await
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), PeerError> {
        timeout(PEER_IO_TIMEOUT, self.stream.write_all(data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}
