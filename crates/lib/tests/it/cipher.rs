//! Chunked cipher properties over real files.

use std::fs;

use lockbox::cipher::{self, CHUNK_SIZE, NONCE_LENGTH, RECORD_LENGTH, TAG_LENGTH};
use lockbox::{DataKey, ErrorKind};
use rand::RngCore;

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

const LENGTHS: [usize; 7] = [
    0,
    1,
    CHUNK_SIZE - 1,
    CHUNK_SIZE,
    CHUNK_SIZE + 1,
    3 * CHUNK_SIZE,
    5 * CHUNK_SIZE + 77,
];

#[test]
fn file_round_trip_for_chunk_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let key = DataKey::generate();

    for len in LENGTHS {
        let plain = dir.path().join(format!("in-{len}"));
        let sealed = dir.path().join(format!("in-{len}.enc"));
        let opened = dir.path().join(format!("out-{len}"));
        let data = random_bytes(len);
        fs::write(&plain, &data).unwrap();

        assert_eq!(cipher::encrypt_file(&plain, &sealed, &key).unwrap(), len as u64);
        assert_eq!(
            fs::metadata(&sealed).unwrap().len() as usize,
            cipher::sealed_len(len)
        );
        assert_eq!(cipher::decrypt_file(&sealed, &opened, &key).unwrap(), len as u64);
        assert_eq!(fs::read(&opened).unwrap(), data, "length {len}");
    }
}

#[test]
fn any_other_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let key = DataKey::generate();
    let plain = dir.path().join("db");
    let sealed = dir.path().join("db.enc");
    fs::write(&plain, random_bytes(2 * CHUNK_SIZE + 5)).unwrap();
    cipher::encrypt_file(&plain, &sealed, &key).unwrap();

    for _ in 0..8 {
        let out = dir.path().join("out");
        let err = cipher::decrypt_file(&sealed, &out, &DataKey::generate()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidKey);
        assert!(!out.exists());
    }
}

#[test]
fn single_bit_flips_are_detected_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let key = DataKey::generate();
    let plain = dir.path().join("db");
    let sealed = dir.path().join("db.enc");
    fs::write(&plain, random_bytes(2 * CHUNK_SIZE + 100)).unwrap();
    cipher::encrypt_file(&plain, &sealed, &key).unwrap();
    let pristine = fs::read(&sealed).unwrap();

    // Nonce, body and tag of the first record, the middle record and the short tail.
    let offsets = [
        0,
        NONCE_LENGTH - 1,
        NONCE_LENGTH,
        NONCE_LENGTH + CHUNK_SIZE / 2,
        RECORD_LENGTH - TAG_LENGTH,
        RECORD_LENGTH - 1,
        RECORD_LENGTH + 3,
        2 * RECORD_LENGTH + NONCE_LENGTH + 50,
        pristine.len() - 1,
    ];
    for offset in offsets {
        for bit in [0u8, 7] {
            let mut tampered = pristine.clone();
            tampered[offset] ^= 1 << bit;
            let path = dir.path().join("tampered.enc");
            fs::write(&path, &tampered).unwrap();

            let out = dir.path().join("tampered");
            let err = cipher::decrypt_file(&path, &out, &key).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidKey, "offset {offset} bit {bit}");
            assert!(!out.exists(), "plaintext left behind for offset {offset}");
            assert!(!dir.path().join("tampered.partial").exists());
        }
    }
}

#[test]
fn nonces_are_fresh_per_chunk_and_per_file() {
    let key = DataKey::generate();
    let data = vec![0u8; 3 * CHUNK_SIZE];
    let first = cipher::encrypt_bytes(&data, &key).unwrap();
    let second = cipher::encrypt_bytes(&data, &key).unwrap();

    let nonces: Vec<&[u8]> = first
        .chunks(RECORD_LENGTH)
        .chain(second.chunks(RECORD_LENGTH))
        .map(|record| &record[..NONCE_LENGTH])
        .collect();
    for (i, a) in nonces.iter().enumerate() {
        for b in &nonces[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

#[test]
fn io_preconditions_have_their_own_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let key = DataKey::generate();
    let missing = dir.path().join("missing");
    let err = cipher::encrypt_file(&missing, dir.path().join("x.enc"), &key).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InputMissing);

    let plain = dir.path().join("db");
    fs::write(&plain, b"data").unwrap();
    let occupied = dir.path().join("db.enc");
    fs::write(&occupied, b"already here").unwrap();
    let err = cipher::encrypt_file(&plain, &occupied, &key).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutputExists);
    assert_eq!(fs::read(&occupied).unwrap(), b"already here");
}
