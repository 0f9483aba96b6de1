//! Cipher properties over the public payload API.

use destring::payload::decrypt_in_place;

fn encrypt(plaintext: &[u8]) -> Vec<u8> {
    plaintext
        .iter()
        .enumerate()
        .map(|(index, byte)| byte ^ (index % 256) as u8 ^ 0xAA)
        .collect()
}

#[test]
fn decrypt_recovers_known_plaintext() {
    let mut buffer = encrypt(b"Hello, world!");
    decrypt_in_place(&mut buffer);
    assert_eq!(&buffer, b"Hello, world!");
}

#[test]
fn double_application_restores_ciphertext() {
    let ciphertext: Vec<u8> = (0..70_000u32).map(|i| (i % 256) as u8 ^ 0x5C).collect();
    let mut buffer = ciphertext.clone();

    decrypt_in_place(&mut buffer);
    decrypt_in_place(&mut buffer);

    assert_eq!(buffer, ciphertext);
}

#[test]
fn keystream_wraps_at_256_bytes() {
    // Bytes 0 and 256 share the index key; bytes 0 and 1 do not.
    let mut buffer = vec![0u8; 257];
    decrypt_in_place(&mut buffer);

    assert_eq!(buffer[0], buffer[256]);
    assert_ne!(buffer[0], buffer[1]);
}

#[test]
fn payload_shorter_than_one_period_is_fully_covered() {
    let plaintext: Vec<u8> = (0..100u8).collect();
    let mut buffer = encrypt(&plaintext);
    decrypt_in_place(&mut buffer);
    assert_eq!(buffer, plaintext);
}
