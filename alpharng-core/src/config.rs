// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Configuration for the secure channel

use crate::error::{Error, Result};
use crate::protocol::{KeySize, MacType, RsaKeySize};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Secure-channel configuration.
///
/// The defaults select the strongest supported settings: HMAC-SHA-256
/// payload authentication, AES-256-GCM packet encryption, and the embedded
/// RSA-2048 public key for the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RngConfig {
    /// MAC algorithm for command and response authentication
    #[serde(default)]
    pub mac_type: MacType,

    /// AES-GCM session key size; `None` disables packet encryption
    #[serde(default)]
    pub key_size: KeySize,

    /// RSA key size used when wrapping the session record
    #[serde(default)]
    pub rsa_key_size: RsaKeySize,

    /// Optional PEM file with an alternative RSA public key.
    /// When set, the handshake declares the alternative-key packet type.
    #[serde(default)]
    pub pub_key_file: Option<PathBuf>,
}

impl Default for RngConfig {
    fn default() -> Self {
        Self {
            mac_type: MacType::HmacSha256,
            key_size: KeySize::K256,
            rsa_key_size: RsaKeySize::Rsa2048,
            pub_key_file: None,
        }
    }
}

impl RngConfig {
    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if let Some(path) = &self.pub_key_file {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("public key file path is empty".to_string()));
            }
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "public key file not found: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// True when both authentication and encryption are disabled, which
    /// switches bulk transfers to the unframed single-byte-opcode path.
    pub fn is_unsecured(&self) -> bool {
        self.mac_type == MacType::None && self.key_size == KeySize::None
    }
}
