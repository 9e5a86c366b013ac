use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{decode, encode, Value};
use crate::constants::{DONT_HAVE_LOCAL_ID, LOCAL_QUEUE_LIMIT, PEX_LOCAL_ID, USER_AGENT};

/// Sub-id of the extension handshake itself.
pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The decoded extension handshake ([BEP-10]).
///
/// The `m` dictionary maps extension names to the sub-ids the *sender*
/// will understand; the two directions are independent namespaces.
///
/// [BEP-10]: http://bittorrent.org/beps/bep_0010.html
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionHandshake {
    /// Sub-id the remote assigned to `ut_pex`, if any.
    pub pex_id: Option<u8>,
    /// Sub-id the remote assigned to `lt_donthave`, if any.
    pub dont_have_id: Option<u8>,
    /// The remote's client name and version.
    pub client: Option<String>,
    /// The remote's outstanding-request queue capacity.
    pub reqq: Option<u32>,
    /// Our external address as the remote sees it (compact form).
    pub yourip: Option<Vec<u8>>,
}

impl ExtensionHandshake {
    /// The handshake we send: our agent string, our `reqq`, and our local
    /// sub-id assignments. PEX is only advertised on public torrents.
    pub fn local(advertise_pex: bool) -> Self {
        Self {
            pex_id: advertise_pex.then_some(PEX_LOCAL_ID),
            dont_have_id: Some(DONT_HAVE_LOCAL_ID),
            client: Some(USER_AGENT.to_string()),
            reqq: Some(LOCAL_QUEUE_LIMIT),
            yourip: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut m = BTreeMap::new();
        if let Some(id) = self.pex_id {
            m.insert(Bytes::from_static(b"ut_pex"), Value::Int(id as i64));
        }
        if let Some(id) = self.dont_have_id {
            m.insert(Bytes::from_static(b"lt_donthave"), Value::Int(id as i64));
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
        if let Some(ref client) = self.client {
            dict.insert(Bytes::from_static(b"v"), Value::text(client));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(Bytes::from_static(b"reqq"), Value::Int(reqq as i64));
        }
        if let Some(ref ip) = self.yourip {
            dict.insert(
                Bytes::from_static(b"yourip"),
                Value::Bytes(Bytes::copy_from_slice(ip)),
            );
        }

        encode(&Value::Dict(dict)).freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or(PeerError::InvalidMessage("extension handshake is not a dict"))?;

        let mut hs = Self::default();

        if let Some(m) = dict.get(b"m".as_slice()).and_then(Value::as_dict) {
            // An id of 0 disables the extension.
            let sub_id = |name: &[u8]| {
                m.get(name)
                    .and_then(Value::as_int)
                    .filter(|&id| id > 0 && id <= u8::MAX as i64)
                    .map(|id| id as u8)
            };
            hs.pex_id = sub_id(b"ut_pex");
            hs.dont_have_id = sub_id(b"lt_donthave");
        }

        hs.client = dict
            .get(b"v".as_slice())
            .and_then(Value::as_str)
            .map(String::from);
        hs.reqq = dict
            .get(b"reqq".as_slice())
            .and_then(Value::as_int)
            .filter(|&n| n > 0)
            .map(|n| n.min(u32::MAX as i64) as u32);
        hs.yourip = dict
            .get(b"yourip".as_slice())
            .and_then(Value::as_bytes)
            .map(|b| b.to_vec());

        Ok(hs)
    }
}
