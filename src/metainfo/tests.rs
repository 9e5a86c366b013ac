use super::*;

fn single_file_torrent() -> Vec<u8> {
    // 100 KiB payload, 32 KiB pieces -> 4 pieces, tail piece 4 KiB.
    let mut doc = Vec::new();
    doc.extend_from_slice(b"d8:announce18:http://t.example/a13:announce-listll18:http://t.example/ael22:http://t2.example/ann1ee4:info");
    doc.extend_from_slice(b"d6:lengthi102400e4:name4:file12:piece lengthi32768e6:pieces80:");
    doc.extend_from_slice(&[0xABu8; 80]);
    doc.extend_from_slice(b"e");
    doc.extend_from_slice(b"e");
    doc
}

#[test]
fn test_single_file_mode() {
    let m = Metainfo::from_bytes(&single_file_torrent()).unwrap();
    assert_eq!(m.info.name, "file");
    assert_eq!(m.info.total_length, 102_400);
    assert_eq!(m.info.piece_length, 32_768);
    assert_eq!(m.info.num_pieces, 4);
    assert_eq!(m.info.last_piece_size, 4_096);
    assert_eq!(m.info.files.len(), 1);
    assert_eq!(m.info.files[0].path, std::path::PathBuf::from("file"));
    assert!(!m.info.private);
    assert_eq!(m.announce.as_deref(), Some("http://t.example/a"));
    assert_eq!(m.tracker_tiers().len(), 2);
}

#[test]
fn test_piece_len_and_blocks() {
    let m = Metainfo::from_bytes(&single_file_torrent()).unwrap();
    assert_eq!(m.info.piece_len(0), 32_768);
    assert_eq!(m.info.piece_len(3), 4_096);
    assert_eq!(m.info.blocks_in_piece(0), 2);
    assert_eq!(m.info.blocks_in_piece(3), 1);
    assert_eq!(m.info.blocks_per_piece(), 2);
}

#[test]
fn test_multi_file_mode_offsets() {
    let mut doc = Vec::new();
    doc.extend_from_slice(b"d4:infod5:filesl");
    doc.extend_from_slice(b"d6:lengthi1000e4:pathl1:a1:bee");
    doc.extend_from_slice(b"d6:lengthi24e4:pathl1:cee");
    doc.extend_from_slice(b"e4:name3:dir12:piece lengthi512e6:pieces40:");
    doc.extend_from_slice(&[0u8; 40]);
    doc.extend_from_slice(b"ee");

    let m = Metainfo::from_bytes(&doc).unwrap();
    assert_eq!(m.info.files.len(), 2);
    assert_eq!(m.info.files[0].path, std::path::PathBuf::from("a/b"));
    assert_eq!(m.info.files[0].offset, 0);
    assert_eq!(m.info.files[1].offset, 1000);
    assert_eq!(m.info.total_length, 1024);
    assert_eq!(m.info.num_pieces, 2);
    assert_eq!(m.info.last_piece_size, 512);
}

#[test]
fn test_private_flag() {
    let mut doc = Vec::new();
    doc.extend_from_slice(b"d4:infod6:lengthi512e4:name1:x12:piece lengthi512e6:pieces20:");
    doc.extend_from_slice(&[1u8; 20]);
    doc.extend_from_slice(b"7:privatei1eee");
    let m = Metainfo::from_bytes(&doc).unwrap();
    assert!(m.info.private);
}

#[test]
fn test_rejects_piece_count_mismatch() {
    // 2 pieces of data but only one digest.
    let mut doc = Vec::new();
    doc.extend_from_slice(b"d4:infod6:lengthi1024e4:name1:x12:piece lengthi512e6:pieces20:");
    doc.extend_from_slice(&[0u8; 20]);
    doc.extend_from_slice(b"ee");
    assert!(matches!(
        Metainfo::from_bytes(&doc),
        Err(MetainfoError::InvalidField("pieces"))
    ));
}

#[test]
fn test_rejects_v2_only_torrent() {
    let doc = b"d4:infod9:file treed1:xd0:d6:lengthi1eeee4:name1:x12:piece lengthi512eee";
    assert!(Metainfo::from_bytes(doc).is_err());
}

#[test]
fn test_rejects_both_modes() {
    let mut doc = Vec::new();
    doc.extend_from_slice(
        b"d4:infod5:filesld6:lengthi512e4:pathl1:aeee6:lengthi512e4:name1:x12:piece lengthi512e6:pieces20:",
    );
    doc.extend_from_slice(&[0u8; 20]);
    doc.extend_from_slice(b"ee");
    assert!(matches!(
        Metainfo::from_bytes(&doc),
        Err(MetainfoError::InvalidField("length and files"))
    ));
}

#[test]
fn test_rejects_path_traversal() {
    let mut doc = Vec::new();
    doc.extend_from_slice(b"d4:infod5:filesld6:lengthi512e4:pathl2:..2:okeee4:name1:x12:piece lengthi512e6:pieces20:");
    doc.extend_from_slice(&[0u8; 20]);
    doc.extend_from_slice(b"ee");
    assert!(Metainfo::from_bytes(&doc).is_err());
}

#[test]
fn test_info_hash_is_stable() {
    let a = Metainfo::from_bytes(&single_file_torrent()).unwrap();
    let b = Metainfo::from_bytes(&single_file_torrent()).unwrap();
    assert_eq!(a.info.hash, b.info.hash);
    assert_eq!(a.info.hash.to_hex().len(), 40);
    assert_eq!(InfoHash::from_hex(&a.info.hash.to_hex()), Some(a.info.hash));
}

#[test]
fn test_name_utf8_preferred() {
    let mut doc = Vec::new();
    doc.extend_from_slice(
        b"d4:infod6:lengthi512e4:name3:old10:name.utf-83:new12:piece lengthi512e6:pieces20:",
    );
    doc.extend_from_slice(&[0u8; 20]);
    doc.extend_from_slice(b"ee");
    let m = Metainfo::from_bytes(&doc).unwrap();
    assert_eq!(m.info.name, "new");
}
