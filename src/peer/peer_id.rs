use std::fmt;

use rand::Rng as _;

use crate::constants::CLIENT_PREFIX;

/// Printable bytes used for the random tail of a generated peer ID.
const ID_CHARS: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-_~";

/// A 20-byte peer identity: our Azureus-style prefix followed by twelve
/// printable random bytes. Generated once per torrent.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(CLIENT_PREFIX);
        let mut rng = rand::rng();
        for b in &mut id[8..] {
            *b = ID_CHARS[rng.random_range(0..ID_CHARS.len())];
        }
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 20] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// The Azureus-style client tag, e.g. `qB4560`, when present.
    pub fn client_id(&self) -> Option<&str> {
        if self.0[0] == b'-' && self.0[7] == b'-' {
            std::str::from_utf8(&self.0[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.client_id() {
            Some(client) => write!(f, "PeerId({client})"),
            None => write!(f, "PeerId({:02x?})", &self.0[..8]),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            if byte.is_ascii_graphic() {
                write!(f, "{}", *byte as char)?;
            } else {
                write!(f, "%{byte:02x}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let id = PeerId::generate();
        assert_eq!(&id.0[..8], CLIENT_PREFIX);
        assert!(id.0[8..].iter().all(|b| b.is_ascii_graphic()));
        assert_eq!(id.client_id(), Some("DR0010"));
    }

    #[test]
    fn test_from_bytes_length() {
        assert!(PeerId::from_bytes(&[0u8; 19]).is_none());
        assert!(PeerId::from_bytes(&[0u8; 20]).is_some());
    }
}
