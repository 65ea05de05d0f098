// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! AES-GCM packet encryption for the secure channel
//!
//! One [`SessionCipher`] lives per session. It owns the random session key,
//! the session-constant 16-byte AAD, and the per-packet IV. A fresh IV is
//! derived for every sent packet; the device encrypts its reply under the IV
//! it received, so decryption always uses the most recently minted IV rather
//! than anything carried in the response header.
//!
//! IV layout (12 bytes): `u32_le(unix_seconds) ‖ u32_le(serial) ‖ rnd32`.
//! The serial counter starts at a random value and wraps; combined with the
//! seconds field it keeps IVs unique across any realistic session lifetime.

use crate::error::{Error, Result};
use crate::protocol::KeySize;
use crate::token::unix_seconds;
use aes_gcm::{aead::AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit, Nonce, Tag};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroize;

enum Aead {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
}

/// Per-session AEAD state.
pub struct SessionCipher {
    aead: Aead,
    key: Vec<u8>,
    aad: [u8; 16],
    iv: [u8; 12],
    iv_serial: u32,
}

impl SessionCipher {
    /// Mint a new session cipher with a random key, AAD, and IV serial.
    pub fn new(key_size: KeySize) -> Result<Self> {
        let key_len = key_size.byte_len();
        if key_len == 0 {
            return Err(Error::Config(
                "cannot create a session cipher without a key size".to_string(),
            ));
        }
        let mut key = vec![0u8; key_len];
        OsRng.fill_bytes(&mut key);
        let mut aad = [0u8; 16];
        OsRng.fill_bytes(&mut aad);

        let aead = match key_size {
            KeySize::K128 => Aead::Aes128(Box::new(
                Aes128Gcm::new_from_slice(&key)
                    .map_err(|e| Error::Crypto(format!("AES-128-GCM init failed: {e}")))?,
            )),
            KeySize::K256 => Aead::Aes256(Box::new(
                Aes256Gcm::new_from_slice(&key)
                    .map_err(|e| Error::Crypto(format!("AES-256-GCM init failed: {e}")))?,
            )),
            KeySize::None => unreachable!("key length checked above"),
        };

        Ok(Self {
            aead,
            key,
            aad,
            iv: [0u8; 12],
            iv_serial: OsRng.next_u32(),
        })
    }

    /// Session key bytes, needed for the handshake record.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Session AAD, needed for the handshake record.
    pub fn aad(&self) -> &[u8; 16] {
        &self.aad
    }

    /// IV used by the last encryption.
    pub fn iv(&self) -> &[u8; 12] {
        &self.iv
    }

    /// Derive the IV for the next packet and make it current.
    pub fn fresh_iv(&mut self) -> [u8; 12] {
        let secs = (unix_seconds() & 0xFFFF_FFFF) as u32;
        self.iv[0..4].copy_from_slice(&secs.to_le_bytes());
        self.iv[4..8].copy_from_slice(&self.iv_serial.to_le_bytes());
        self.iv_serial = self.iv_serial.wrapping_add(1);
        OsRng.fill_bytes(&mut self.iv[8..12]);
        self.iv
    }

    /// Encrypt `buf` in place under the current IV, returning the GCM tag.
    pub fn encrypt(&self, buf: &mut [u8]) -> Result<[u8; 16]> {
        let nonce = Nonce::from_slice(&self.iv);
        let tag = match &self.aead {
            Aead::Aes128(aead) => aead.encrypt_in_place_detached(nonce, &self.aad, buf),
            Aead::Aes256(aead) => aead.encrypt_in_place_detached(nonce, &self.aad, buf),
        }
        .map_err(|_| Error::Crypto("AES-GCM encryption failed".to_string()))?;
        let mut out = [0u8; 16];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Decrypt `buf` in place under the current IV, verifying the tag.
    pub fn decrypt(&self, buf: &mut [u8], tag: &[u8; 16]) -> Result<()> {
        let nonce = Nonce::from_slice(&self.iv);
        let tag = Tag::from_slice(tag);
        match &self.aead {
            Aead::Aes128(aead) => aead.decrypt_in_place_detached(nonce, &self.aad, buf, tag),
            Aead::Aes256(aead) => aead.decrypt_in_place_detached(nonce, &self.aad, buf, tag),
        }
        .map_err(|_| Error::Protocol("AES-GCM tag verification failed".to_string()))
    }
}

impl Drop for SessionCipher {
    fn drop(&mut self) {
        self.key.zeroize();
        self.aad.zeroize();
        self.iv.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_disabled_key_size() {
        assert!(SessionCipher::new(KeySize::None).is_err());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        for key_size in [KeySize::K128, KeySize::K256] {
            let mut cipher = SessionCipher::new(key_size).unwrap();
            cipher.fresh_iv();
            let plain = b"0123456789abcdef0123456789abcdef".to_vec();
            let mut buf = plain.clone();
            let tag = cipher.encrypt(&mut buf).unwrap();
            assert_ne!(buf, plain);
            cipher.decrypt(&mut buf, &tag).unwrap();
            assert_eq!(buf, plain);
        }
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let mut cipher = SessionCipher::new(KeySize::K256).unwrap();
        cipher.fresh_iv();
        let mut buf = vec![0u8; 64];
        let tag = cipher.encrypt(&mut buf).unwrap();
        buf[0] ^= 1;
        assert!(matches!(
            cipher.decrypt(&mut buf, &tag),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_iv_layout_and_serial() {
        let mut cipher = SessionCipher::new(KeySize::K256).unwrap();
        let first = cipher.fresh_iv();
        let second = cipher.fresh_iv();

        let secs = (unix_seconds() & 0xFFFF_FFFF) as u32;
        let iv_secs = u32::from_le_bytes(first[0..4].try_into().unwrap());
        assert!(iv_secs.abs_diff(secs) <= 1);

        let serial_1 = u32::from_le_bytes(first[4..8].try_into().unwrap());
        let serial_2 = u32::from_le_bytes(second[4..8].try_into().unwrap());
        assert_eq!(serial_2, serial_1.wrapping_add(1));
        assert_ne!(first, second);
    }

    #[test]
    fn test_ivs_distinct_across_packets() {
        let mut cipher = SessionCipher::new(KeySize::K128).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(cipher.fresh_iv()));
        }
    }

    #[test]
    fn test_key_and_aad_are_random_per_session() {
        let a = SessionCipher::new(KeySize::K256).unwrap();
        let b = SessionCipher::new(KeySize::K256).unwrap();
        assert_ne!(a.key(), b.key());
        assert_ne!(a.aad(), b.aad());
    }
}
