// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! RSA wrapping of the session record
//!
//! The device firmware expects the session record encrypted with a raw,
//! unpadded RSA public-key operation: the modulus-length input block is
//! interpreted as a big-endian integer and exponentiated directly. The block
//! is pre-filled with random bytes before the record is written at its head,
//! and the record's leading byte (the session key type, 0x01) keeps the
//! integer below the modulus.
//!
//! Two public keys matching the device firmware are embedded; an alternative
//! key may be loaded from a PEM file, in which case the handshake packet
//! declares the alternative-key packet type.

use crate::error::{Error, Result};
use crate::protocol::{PacketType, RsaKeySize};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use std::path::Path;

/// Factory-installed 2048-bit device public key (PKCS#1 PEM).
pub const RSA_PUB_2048_PEM: &str = "-----BEGIN RSA PUBLIC KEY-----
MIIBCgKCAQEAwWGfEYmvhLQfwZOfanwRcItSosXynYBdBy9NQXwj0xww2bJwQtAv
CnT0nOT3d2WM69Apu5OK/2uC0y0jc8YfQPnfUYs8nM/xaXywDOrdEkBSGL9YNmzg
Cw2Nbo1u6/CDcH3UtL8iobhSf1shNdhlwXMAl0OHaOKYrojQQDF/Elw/UNRYMzWS
EJb/rjYIoS2oYDrVU5mUVdxr3nYNpNDi+bggJYavfmev/3O4pqyxw6k2LMNZa4wA
zTikKrB8c8ovup9O5ODupasfoBCZEHjt51wuetrvXm6QXLsH5tenwJ7QzwJZjOBX
QYlZnS6HvW/d7PLWNyfD20WZg2vahcXpswIDAQAB
-----END RSA PUBLIC KEY-----
";

/// Factory-installed 1024-bit device public key (PKCS#1 PEM).
pub const RSA_PUB_1024_PEM: &str = "-----BEGIN RSA PUBLIC KEY-----
MIGJAoGBANmS3dat1Mc36N3qst3Jgo7EAiazed9w5LPSCVqDc8HTXkiK9EGscSxO
4e2buw2s4ik1ZqGCvyjYpTWq/y5XZAka846oN4DSAq8npPrCqUj+CWzG1Y93h7TW
vp/QEJpoyEkjznhifrS3xi20+s1IL9a85Bn6AbT9c7CuFFnokXZ/AgMBAAE=
-----END RSA PUBLIC KEY-----
";

/// Public-key side of the handshake.
pub struct RsaSealer {
    key: RsaPublicKey,
    from_key_file: bool,
    rsa_key_size: RsaKeySize,
}

impl RsaSealer {
    /// Use one of the embedded factory keys.
    pub fn embedded(rsa_key_size: RsaKeySize) -> Result<Self> {
        let pem = match rsa_key_size {
            RsaKeySize::Rsa2048 => RSA_PUB_2048_PEM,
            RsaKeySize::Rsa1024 => RSA_PUB_1024_PEM,
        };
        let key = RsaPublicKey::from_pkcs1_pem(pem)
            .map_err(|e| Error::Crypto(format!("embedded RSA key unreadable: {e}")))?;
        Ok(Self {
            key,
            from_key_file: false,
            rsa_key_size,
        })
    }

    /// Load an alternative public key from a PEM file (PKCS#1 or SPKI).
    pub fn from_pem_file(path: &Path, rsa_key_size: RsaKeySize) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read RSA key file {}: {e}", path.display()))
        })?;
        let key = RsaPublicKey::from_pkcs1_pem(&pem)
            .or_else(|_| RsaPublicKey::from_public_key_pem(&pem))
            .map_err(|e| {
                Error::Config(format!("invalid RSA key file {}: {e}", path.display()))
            })?;
        let sealer = Self {
            key,
            from_key_file: true,
            rsa_key_size,
        };
        if sealer.modulus_len() != rsa_key_size.modulus_len() {
            return Err(Error::Config(format!(
                "RSA key file {} has a {}-byte modulus, expected {}",
                path.display(),
                sealer.modulus_len(),
                rsa_key_size.modulus_len()
            )));
        }
        Ok(sealer)
    }

    /// Modulus length in bytes, which is also the sealed output length.
    pub fn modulus_len(&self) -> usize {
        self.key.size()
    }

    /// Packet type the handshake must declare for this key.
    pub fn packet_type(&self) -> PacketType {
        if self.from_key_file {
            return PacketType::AltRsa2048;
        }
        match self.rsa_key_size {
            RsaKeySize::Rsa2048 => PacketType::Rsa2048,
            RsaKeySize::Rsa1024 => PacketType::Rsa1024,
        }
    }

    /// Raw, unpadded public-key operation over a modulus-length block.
    pub fn seal_raw(&self, block: &[u8]) -> Result<Vec<u8>> {
        let modulus_len = self.modulus_len();
        if block.len() != modulus_len {
            return Err(Error::Crypto(format!(
                "raw RSA input must be exactly {modulus_len} bytes, got {}",
                block.len()
            )));
        }
        let m = BigUint::from_bytes_be(block);
        if m >= *self.key.n() {
            return Err(Error::Crypto(
                "raw RSA input is not reducible by the modulus".to_string(),
            ));
        }
        let c = m.modpow(self.key.e(), self.key.n());
        let mut out = c.to_bytes_be();
        // left-pad to the modulus length
        if out.len() < modulus_len {
            let mut padded = vec![0u8; modulus_len - out.len()];
            padded.extend_from_slice(&out);
            out = padded;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_keys_parse() {
        let sealer = RsaSealer::embedded(RsaKeySize::Rsa2048).unwrap();
        assert_eq!(sealer.modulus_len(), 256);
        assert_eq!(sealer.packet_type(), PacketType::Rsa2048);

        let sealer = RsaSealer::embedded(RsaKeySize::Rsa1024).unwrap();
        assert_eq!(sealer.modulus_len(), 128);
        assert_eq!(sealer.packet_type(), PacketType::Rsa1024);
    }

    #[test]
    fn test_seal_raw_output_length_and_determinism() {
        let sealer = RsaSealer::embedded(RsaKeySize::Rsa1024).unwrap();
        let mut block = vec![0u8; 128];
        block[0] = 0x01;
        for (i, b) in block.iter_mut().enumerate().skip(1) {
            *b = i as u8;
        }
        let sealed = sealer.seal_raw(&block).unwrap();
        assert_eq!(sealed.len(), 128);
        // raw RSA is deterministic
        assert_eq!(sealed, sealer.seal_raw(&block).unwrap());
        assert_ne!(sealed, block);
    }

    #[test]
    fn test_seal_raw_rejects_wrong_length() {
        let sealer = RsaSealer::embedded(RsaKeySize::Rsa1024).unwrap();
        assert!(sealer.seal_raw(&[0u8; 127]).is_err());
        assert!(sealer.seal_raw(&[0u8; 256]).is_err());
    }

    #[test]
    fn test_seal_raw_rejects_irreducible_input() {
        let sealer = RsaSealer::embedded(RsaKeySize::Rsa1024).unwrap();
        // all-ones exceeds any real modulus
        assert!(sealer.seal_raw(&[0xFF; 128]).is_err());
    }

    #[test]
    fn test_key_file_round_trip() {
        use rand::rngs::OsRng;
        use rsa::pkcs1::EncodeRsaPublicKey;
        use rsa::RsaPrivateKey;

        let private = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        let pem = public.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();

        let path = std::env::temp_dir().join(format!("alpharng-test-{}.pem", std::process::id()));
        std::fs::write(&path, pem).unwrap();
        let sealer = RsaSealer::from_pem_file(&path, RsaKeySize::Rsa1024).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(sealer.packet_type(), PacketType::AltRsa2048);
        assert_eq!(sealer.modulus_len(), 128);

        // a size mismatch between the file and the declared size is rejected
        let pem2 = public.to_pkcs1_pem(rsa::pkcs1::LineEnding::LF).unwrap();
        let path2 = std::env::temp_dir().join(format!("alpharng-test2-{}.pem", std::process::id()));
        std::fs::write(&path2, pem2).unwrap();
        assert!(RsaSealer::from_pem_file(&path2, RsaKeySize::Rsa2048).is_err());
        std::fs::remove_file(&path2).ok();
    }
}
