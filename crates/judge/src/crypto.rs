//! AES-128-GCM sealing and gzip wrapping for the encrypted test archive (C1).
//!
//! Every non-JSON entry in a [`crate::store::TestStore`] archive is stored as
//! `aes128gcm_seal(gzip(raw), key)`; this module is the only place that
//! touches either primitive.

use std::io::{Read, Write};

use aes_gcm::aead::{generic_array::GenericArray, Aead, KeyInit};
use aes_gcm::Aes128Gcm;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 16;

/// Alphabet used by [`new_key`]. 63 code points; `1` intentionally appears
/// twice so that the modulo-reduction below is slightly biased towards it.
/// This is a quirk of the format this crate is compatible with, not a typo:
/// reproduce it verbatim or existing archives and transcribed keys stop
/// working.
const KEY_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz1";

#[derive(Debug, Error)]
pub enum Error {
    #[error("key must be exactly {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("malformed ciphertext")]
    MalformedCiphertext,
    #[error("malformed gzip stream")]
    MalformedGzip,
}

fn cipher(key: &[u8]) -> Result<Aes128Gcm, Error> {
    if key.len() != KEY_LEN {
        return Err(Error::InvalidKeyLength(key.len()));
    }
    Ok(Aes128Gcm::new(GenericArray::from_slice(key)))
}

/// Seals `plain` under `key`, returning `nonce(12) ‖ ciphertext ‖ tag(16)`.
///
/// A fresh random nonce is drawn for every call.
pub fn encrypt(plain: &[u8], key: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = cipher(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = GenericArray::from_slice(&nonce_bytes);

    let ct = cipher
        .encrypt(nonce, plain)
        .map_err(|_| Error::MalformedCiphertext)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Opens a blob produced by [`encrypt`], verifying the GCM tag.
pub fn decrypt(blob: &[u8], key: &[u8]) -> Result<Vec<u8>, Error> {
    let cipher = cipher(key)?;

    if blob.len() < NONCE_LEN {
        return Err(Error::MalformedCiphertext);
    }
    let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);
    let nonce = GenericArray::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ct)
        .map_err(|_| Error::MalformedCiphertext)
}

/// Gzips `data` at the default compression level.
pub fn compress(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)
        .expect("writing to an in-memory buffer never fails");
    enc.finish()
        .expect("writing to an in-memory buffer never fails")
}

/// Reverses [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut dec = GzDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out).map_err(|_| Error::MalformedGzip)?;
    Ok(out)
}

/// Draws a fresh `len`-byte AES key, mapped into [`KEY_ALPHABET`].
///
/// Intended for `len == 16` (AES-128); the function is generic over the
/// length only so callers don't hardcode the constant twice.
pub fn new_key(len: usize) -> Vec<u8> {
    let mut raw = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.into_iter()
        .map(|b| KEY_ALPHABET[b as usize % KEY_ALPHABET.len()])
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips() {
        let key = new_key(16);
        let plain = b"the quick brown fox".to_vec();
        let sealed = encrypt(&plain, &key).unwrap();
        assert_eq!(decrypt(&sealed, &key).unwrap(), plain);
    }

    #[test]
    fn rejects_wrong_key() {
        let key = new_key(16);
        let other = new_key(16);
        let sealed = encrypt(b"secret", &key).unwrap();
        assert!(decrypt(&sealed, &other).is_err());
    }

    #[test]
    fn rejects_bit_flip() {
        let key = new_key(16);
        let mut sealed = encrypt(b"secret", &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 1;
        assert!(decrypt(&sealed, &key).is_err());
    }

    #[test]
    fn rejects_short_ciphertext() {
        let key = new_key(16);
        assert!(decrypt(&[0u8; 4], &key).is_err());
    }

    #[test]
    fn rejects_bad_key_length() {
        assert!(matches!(
            encrypt(b"x", &[0u8; 15]),
            Err(Error::InvalidKeyLength(15))
        ));
    }

    #[test]
    fn gzip_round_trips() {
        let data = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        assert_eq!(decompress(&compress(&data)).unwrap(), data);
    }

    #[test]
    fn new_key_alphabet_has_doubled_one() {
        assert_eq!(KEY_ALPHABET.len(), 63);
        assert_eq!(KEY_ALPHABET.iter().filter(|&&b| b == b'1').count(), 2);
    }
}
