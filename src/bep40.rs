//! Canonical peer priority ([BEP-40]).
//!
//! Assigns every candidate peer a stable priority derived from the CRC32C
//! of the two endpoint addresses in canonical order, so that both sides of
//! a potential connection compute the same value.
//!
//! [BEP-40]: http://bittorrent.org/beps/bep_0040.html

use std::net::{IpAddr, SocketAddr};

/// Priority for a known local address: CRC32C over the two compact
/// `(ip, port)` tuples, smaller tuple first.
///
/// Swapping the arguments yields the same value.
pub fn priority(local: SocketAddr, remote: SocketAddr) -> u32 {
    let a = compact(local);
    let b = compact(remote);
    let mut buf = Vec::with_capacity(a.len() + b.len());
    if a <= b {
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b);
    } else {
        buf.extend_from_slice(&b);
        buf.extend_from_slice(&a);
    }
    crc32c::crc32c(&buf)
}

/// Fallback when the local address is unknown: CRC32C of the session
/// secret followed by the remote compact form.
pub fn fallback_priority(secret: &[u8; 32], remote: SocketAddr) -> u32 {
    let compact = compact(remote);
    let mut buf = Vec::with_capacity(secret.len() + compact.len());
    buf.extend_from_slice(secret);
    buf.extend_from_slice(&compact);
    crc32c::crc32c(&buf)
}

/// Compact form: 4 or 16 address bytes followed by the big-endian port.
fn compact(addr: SocketAddr) -> Vec<u8> {
    let mut buf = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    buf.extend_from_slice(&addr.port().to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_is_symmetric() {
        let a: SocketAddr = "192.168.1.2:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.7:51413".parse().unwrap();
        assert_eq!(priority(a, b), priority(b, a));
    }

    #[test]
    fn test_priority_v6() {
        let a: SocketAddr = "[2001:db8::1]:6881".parse().unwrap();
        let b: SocketAddr = "[2001:db8::2]:6881".parse().unwrap();
        assert_eq!(priority(a, b), priority(b, a));
        assert_ne!(priority(a, b), 0);
    }

    #[test]
    fn test_fallback_depends_on_secret() {
        let remote: SocketAddr = "10.0.0.7:51413".parse().unwrap();
        let p1 = fallback_priority(&[1u8; 32], remote);
        let p2 = fallback_priority(&[2u8; 32], remote);
        assert_ne!(p1, p2);
        assert_eq!(p1, fallback_priority(&[1u8; 32], remote));
    }
}
