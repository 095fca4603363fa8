//! AES-128-CBC segment decryption.
//!
//! The manifest rewriter fetches key material at rewrite time and embeds it
//! URL-safe-base64 encoded in each segment URL, together with a decimal IV
//! derived from the media sequence. This module is the other half of that
//! contract: the segment handler hands the raw bytes plus both query
//! parameters here before responding.

use aes::Aes128;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

use crate::error::{RelayrError, Result};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Decrypt an AES-128-CBC segment.
///
/// `key` is URL-safe base64 (16 bytes once decoded); `iv` is a decimal
/// integer rendered into a 16-byte big-endian block per RFC 8216 §5.2.
/// PKCS#7 padding is stripped from the output.
///
/// # Errors
///
/// Returns [`RelayrError::Decryption`] for malformed key or IV input, and
/// for ciphertext that is not block-aligned or fails to unpad.
pub fn decrypt_segment(data: &[u8], key: &str, iv: &str) -> Result<Vec<u8>> {
    let key = URL_SAFE
        .decode(key)
        .map_err(|e| RelayrError::Decryption(format!("invalid key encoding: {e}")))?;
    if key.len() != 16 {
        return Err(RelayrError::Decryption(format!(
            "expected 16-byte key, got {}",
            key.len()
        )));
    }

    let iv = parse_iv(iv)?;

    let mut buf = data.to_vec();
    let decryptor = Aes128CbcDec::new_from_slices(&key, &iv)
        .map_err(|e| RelayrError::Decryption(format!("cipher init: {e}")))?;
    let plaintext_len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|e| RelayrError::Decryption(format!("cbc decrypt: {e}")))?
        .len();

    buf.truncate(plaintext_len);
    Ok(buf)
}

/// Render the decimal IV query parameter into a 16-byte big-endian block.
/// An absent parameter means IV zero.
fn parse_iv(iv: &str) -> Result<[u8; 16]> {
    if iv.is_empty() {
        return Ok([0u8; 16]);
    }
    let value: u128 = iv
        .parse()
        .map_err(|_| RelayrError::Decryption(format!("invalid IV {iv:?}")))?;
    Ok(value.to_be_bytes())
}
