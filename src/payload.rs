//! Payload extraction and decryption.
//!
//! The extractor lifts an owned copy of the encrypted blob out of the image;
//! the decryptor inverts the stream cipher on that copy. The on-disk bytes
//! are never rewritten: the decoder type stays in the output, unreferenced,
//! with its payload stored exactly as the obfuscator wrote it.

use crate::{locator::DecoderBinding, module::Module, Error, Result};

/// Key byte folded into the index-keyed XOR stream.
const STREAM_KEY: u8 = 0xAA;

/// Acquires a mutable owned copy of the payload blob.
///
/// # Errors
///
/// Returns [`Error::Payload`] when the blob location recorded in the binding
/// cannot be read back from the image (bad RVA, truncated file). The decoder
/// was already located at that point, so this is fatal.
pub fn extract_payload(module: &Module, binding: &DecoderBinding) -> Result<Vec<u8>> {
    let bytes = module
        .bytes_at_rva(binding.payload_rva, binding.payload_size)
        .map_err(|source| {
            Error::Payload(format!(
                "payload blob of {} at RVA 0x{:08x} ({} bytes) is unreachable: {source}",
                binding.type_fullname, binding.payload_rva, binding.payload_size
            ))
        })?;

    Ok(bytes.to_vec())
}

/// Inverts the stream cipher in place.
///
/// The keystream depends only on the byte index, so the transform is an
/// involution; callers apply it exactly once. Total and infallible for any
/// buffer length.
pub fn decrypt_in_place(payload: &mut [u8]) {
    for (index, byte) in payload.iter_mut().enumerate() {
        *byte ^= (index % 256) as u8 ^ STREAM_KEY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystream(index: usize) -> u8 {
        (index % 256) as u8 ^ STREAM_KEY
    }

    #[test]
    fn decrypt_is_an_involution() {
        let original: Vec<u8> = (0..1024u32).map(|i| (i.wrapping_mul(31) % 251) as u8).collect();
        let mut buffer = original.clone();

        decrypt_in_place(&mut buffer);
        assert_ne!(buffer, original);

        decrypt_in_place(&mut buffer);
        assert_eq!(buffer, original);
    }

    #[test]
    fn every_byte_is_covered_for_non_multiple_lengths() {
        // 300 bytes wraps the index key once without completing two periods.
        let mut buffer = vec![0u8; 300];
        decrypt_in_place(&mut buffer);

        for (index, byte) in buffer.iter().enumerate() {
            assert_eq!(*byte, keystream(index), "byte {index} not transformed");
        }
    }

    #[test]
    fn known_plaintext_round_trips() {
        let text = b"Hello, world!";
        let mut encrypted: Vec<u8> = text
            .iter()
            .enumerate()
            .map(|(index, byte)| byte ^ keystream(index))
            .collect();

        decrypt_in_place(&mut encrypted);
        assert_eq!(&encrypted, text);
    }
}
