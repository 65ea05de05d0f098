// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! HMAC authentication of commands and responses
//!
//! Wraps HMAC with the configured digest (MD5, SHA-1, or SHA-256). The MAC
//! key length always equals the digest length and a fresh key is generated
//! for every session. With `MacType::None` nothing is computed or verified,
//! but a key is still minted because the session record carries the field.

use crate::error::{Error, Result};
use crate::protocol::MacType;
use hmac::{Hmac, Mac};
use md5::Md5;
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroize;

type HmacMd5 = Hmac<Md5>;
type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Session MAC state: algorithm plus the current key.
pub struct SessionAuth {
    mac_type: MacType,
    key: Vec<u8>,
}

impl SessionAuth {
    pub fn new(mac_type: MacType) -> Self {
        let mut auth = Self {
            mac_type,
            key: Vec::new(),
        };
        auth.regenerate();
        auth
    }

    /// Generate a fresh uniformly random key for a new session.
    pub fn regenerate(&mut self) {
        self.key.zeroize();
        // None still carries a 32-byte key field in the session record
        let len = match self.mac_type {
            MacType::None => 32,
            mt => mt.tag_len(),
        };
        self.key = vec![0u8; len];
        OsRng.fill_bytes(&mut self.key);
    }

    pub fn mac_type(&self) -> MacType {
        self.mac_type
    }

    /// Current session MAC key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Compute the full-length tag over `span`.
    pub fn compute(&self, span: &[u8]) -> Result<Vec<u8>> {
        match self.mac_type {
            MacType::None => Err(Error::Crypto(
                "MAC requested while authentication is disabled".to_string(),
            )),
            MacType::HmacMd5 => {
                let mut mac = new_mac::<HmacMd5>(&self.key)?;
                mac.update(span);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            MacType::HmacSha1 => {
                let mut mac = new_mac::<HmacSha1>(&self.key)?;
                mac.update(span);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            MacType::HmacSha256 => {
                let mut mac = new_mac::<HmacSha256>(&self.key)?;
                mac.update(span);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    /// Compute the tag over `span` and write it at the start of a fixed-width
    /// MAC field, leaving the tail untouched.
    pub fn fill(&self, span: &[u8], field: &mut [u8; 32]) -> Result<()> {
        let tag = self.compute(span)?;
        field[..tag.len()].copy_from_slice(&tag);
        Ok(())
    }

    /// Verify the first `tag_len` bytes of a fixed-width MAC field against
    /// `span` in constant time.
    pub fn verify(&self, span: &[u8], field: &[u8; 32]) -> Result<()> {
        let ok = match self.mac_type {
            MacType::None => true,
            MacType::HmacMd5 => {
                let mut mac = new_mac::<HmacMd5>(&self.key)?;
                mac.update(span);
                mac.verify_slice(&field[..16]).is_ok()
            }
            MacType::HmacSha1 => {
                let mut mac = new_mac::<HmacSha1>(&self.key)?;
                mac.update(span);
                mac.verify_slice(&field[..20]).is_ok()
            }
            MacType::HmacSha256 => {
                let mut mac = new_mac::<HmacSha256>(&self.key)?;
                mac.update(span);
                mac.verify_slice(&field[..32]).is_ok()
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Protocol("MAC verification failed".to_string()))
        }
    }
}

impl Drop for SessionAuth {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

fn new_mac<M: Mac + hmac::digest::KeyInit>(key: &[u8]) -> Result<M> {
    <M as Mac>::new_from_slice(key).map_err(|e| Error::Crypto(format!("invalid MAC key length: {e}")))
}
