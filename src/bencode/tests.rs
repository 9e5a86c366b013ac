use bytes::Bytes;

use super::{decode, encode, BencodeError, Value};

#[test]
fn test_decode_scalars() {
    assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
    assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
    assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
    assert_eq!(decode(b"4:spam").unwrap(), Value::text("spam"));
    assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Bytes::new()));
}

#[test]
fn test_decode_rejects_bad_integers() {
    assert!(matches!(decode(b"i007e"), Err(BencodeError::Syntax(_))));
    assert!(matches!(decode(b"i-0e"), Err(BencodeError::Syntax(_))));
    assert!(matches!(decode(b"ie"), Err(BencodeError::Syntax(_))));
    assert!(matches!(decode(b"i42"), Err(BencodeError::Truncated)));
}

#[test]
fn test_decode_collections() {
    let list = decode(b"l4:spami3ee").unwrap();
    assert_eq!(
        list.as_list().unwrap(),
        &[Value::text("spam"), Value::Int(3)]
    );

    let dict = decode(b"d3:bar4:spam3:fooi42ee").unwrap();
    assert_eq!(dict.get(b"foo").and_then(Value::as_int), Some(42));
    assert_eq!(dict.get(b"bar").and_then(Value::as_str), Some("spam"));
    assert_eq!(dict.get(b"missing"), None);
}

#[test]
fn test_decode_rejects_trailing_bytes() {
    assert!(matches!(decode(b"i1eX"), Err(BencodeError::Trailing)));
}

#[test]
fn test_decode_rejects_non_string_keys() {
    assert!(matches!(decode(b"di1ei2ee"), Err(BencodeError::Syntax(_))));
}

#[test]
fn test_decode_depth_limit() {
    let mut deep = Vec::new();
    deep.extend(std::iter::repeat(b'l').take(80));
    deep.extend(std::iter::repeat(b'e').take(80));
    assert!(matches!(decode(&deep), Err(BencodeError::DepthLimit)));
}

#[test]
fn test_encode_canonical_round_trip() {
    let raw: &[u8] = b"d4:infod6:lengthi1024e4:name4:file12:piece lengthi256eee";
    let value = decode(raw).unwrap();
    assert_eq!(encode(&value).as_ref(), raw);
}

#[test]
fn test_encode_sorts_dict_keys() {
    let mut map = std::collections::BTreeMap::new();
    map.insert(Bytes::from_static(b"zz"), Value::Int(1));
    map.insert(Bytes::from_static(b"aa"), Value::Int(2));
    assert_eq!(encode(&Value::Dict(map)).as_ref(), b"d2:aai2e2:zzi1ee");
}
