// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Symmetric envelope encryption for env binding values at rest.
//!
//! AES-256-CBC with PKCS7 padding and a random IV prepended to the
//! ciphertext, base64-encoded for storage in a TEXT column. Plaintext only
//! exists transiently while a worker assembles a child environment; nothing
//! in this module ever logs values or key material.
//!
//! Key material comes from `ENCRYPTION_KEY`: a base64 or hex encoding of
//! exactly 32 bytes, or any other string which is run through SHA-256.

use aes::Aes256;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, generic_array::GenericArray};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CoreError;

const BLOCK_SIZE: usize = 16;

/// Envelope cipher for secret env values.
#[derive(Clone)]
pub struct Cipher {
    key: [u8; 32],
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material must never appear in debug output.
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    /// Build a cipher from the raw `ENCRYPTION_KEY` value.
    ///
    /// Fails on an empty key; components that need the cipher treat that
    /// as a fatal startup error.
    pub fn new(key_material: &str) -> Result<Self, CoreError> {
        let trimmed = key_material.trim();
        if trimmed.is_empty() {
            return Err(CoreError::CipherError {
                reason: "ENCRYPTION_KEY is not configured".to_string(),
            });
        }
        Ok(Self {
            key: derive_key(trimmed),
        })
    }

    /// Build a cipher from the `ENCRYPTION_KEY` environment variable.
    pub fn from_env() -> Result<Self, CoreError> {
        let raw = std::env::var("ENCRYPTION_KEY").map_err(|_| CoreError::CipherError {
            reason: "ENCRYPTION_KEY is not configured".to_string(),
        })?;
        Self::new(&raw)
    }

    /// Encrypt a plaintext value into the base64 envelope form.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let cipher = Aes256::new(GenericArray::from_slice(&self.key));

        let mut iv = [0u8; BLOCK_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        // PKCS7 padding
        let data = plaintext.as_bytes();
        let padding_len = BLOCK_SIZE - (data.len() % BLOCK_SIZE);
        let mut padded = data.to_vec();
        padded.extend(std::iter::repeat(padding_len as u8).take(padding_len));

        let mut out = Vec::with_capacity(BLOCK_SIZE + padded.len());
        out.extend_from_slice(&iv);

        let mut prev = iv;
        for chunk in padded.chunks(BLOCK_SIZE) {
            let mut block = [0u8; BLOCK_SIZE];
            for (i, byte) in chunk.iter().enumerate() {
                block[i] = byte ^ prev[i];
            }
            let mut ga = GenericArray::clone_from_slice(&block);
            cipher.encrypt_block(&mut ga);
            prev.copy_from_slice(&ga);
            out.extend_from_slice(&ga);
        }

        BASE64.encode(&out)
    }

    /// Decrypt a base64 envelope back into the plaintext value.
    pub fn decrypt(&self, envelope: &str) -> Result<String, CoreError> {
        let bad = |reason: &str| CoreError::CipherError {
            reason: reason.to_string(),
        };

        let raw = BASE64
            .decode(envelope.trim())
            .map_err(|_| bad("envelope is not valid base64"))?;
        if raw.len() < 2 * BLOCK_SIZE || raw.len() % BLOCK_SIZE != 0 {
            return Err(bad("envelope has invalid length"));
        }

        let cipher = Aes256::new(GenericArray::from_slice(&self.key));
        let (iv, body) = raw.split_at(BLOCK_SIZE);

        let mut plain = Vec::with_capacity(body.len());
        let mut prev: [u8; BLOCK_SIZE] = iv.try_into().expect("iv is one block");
        for chunk in body.chunks(BLOCK_SIZE) {
            let mut ga = GenericArray::clone_from_slice(chunk);
            cipher.decrypt_block(&mut ga);
            for (i, byte) in ga.iter().enumerate() {
                plain.push(byte ^ prev[i]);
            }
            prev.copy_from_slice(chunk);
        }

        // Strip PKCS7 padding.
        let pad_len = *plain.last().ok_or_else(|| bad("empty envelope body"))? as usize;
        if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > plain.len() {
            return Err(bad("invalid padding"));
        }
        if !plain[plain.len() - pad_len..].iter().all(|&b| b == pad_len as u8) {
            return Err(bad("invalid padding"));
        }
        plain.truncate(plain.len() - pad_len);

        String::from_utf8(plain).map_err(|_| bad("decrypted value is not valid UTF-8"))
    }
}

/// Derive the AES-256 key: exact 32 bytes of base64/hex pass through,
/// anything else is hashed.
fn derive_key(material: &str) -> [u8; 32] {
    if let Ok(decoded) = BASE64.decode(material) {
        if decoded.len() == 32 {
            return decoded.try_into().expect("length checked");
        }
    }
    if material.len() == 64 {
        if let Ok(decoded) = hex_decode(material) {
            return decoded;
        }
    }

    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hasher.finalize().into()
}

fn hex_decode(s: &str) -> Result<[u8; 32], ()> {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        let pair = s.get(i * 2..i * 2 + 2).ok_or(())?;
        *byte = u8::from_str_radix(pair, 16).map_err(|_| ())?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let cipher = Cipher::new("test-passphrase").unwrap();
        let plain = "postgres://user:hunter2@db/prod";
        let envelope = cipher.encrypt(plain);
        assert_ne!(envelope, plain);
        assert_eq!(cipher.decrypt(&envelope).unwrap(), plain);
    }

    #[test]
    fn test_roundtrip_empty_and_block_aligned() {
        let cipher = Cipher::new("k").unwrap();
        for plain in ["", "0123456789abcdef", "x"] {
            let envelope = cipher.encrypt(plain);
            assert_eq!(cipher.decrypt(&envelope).unwrap(), plain);
        }
    }

    #[test]
    fn test_ciphertexts_differ_per_encryption() {
        let cipher = Cipher::new("k").unwrap();
        // Random IV means equal plaintexts produce distinct envelopes.
        assert_ne!(cipher.encrypt("same"), cipher.encrypt("same"));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Cipher::new("key-a").unwrap();
        let b = Cipher::new("key-b").unwrap();
        let envelope = a.encrypt("secret");
        // Padding or UTF-8 validation rejects it; a freak pass must still
        // not yield the plaintext.
        assert_ne!(b.decrypt(&envelope).ok().as_deref(), Some("secret"));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(Cipher::new("  ").is_err());
    }

    #[test]
    fn test_garbage_envelope_rejected() {
        let cipher = Cipher::new("k").unwrap();
        assert!(cipher.decrypt("not base64 !!!").is_err());
        assert!(cipher.decrypt("c2hvcnQ=").is_err());
    }

    #[test]
    fn test_key_forms_equivalent() {
        let raw = [7u8; 32];
        let from_b64 = Cipher::new(&BASE64.encode(raw)).unwrap();
        let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
        let from_hex = Cipher::new(&hex).unwrap();
        let envelope = from_b64.encrypt("value");
        assert_eq!(from_hex.decrypt(&envelope).unwrap(), "value");
    }
}
