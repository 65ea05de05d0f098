// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Host-side SHA entropy extraction
//!
//! Conditions raw noise from both device sources into output entropy by
//! hashing fixed windows: every `hash_size × ratio` input bytes produce one
//! `hash_size`-byte digest. With the default ratio of 2 the extractor
//! consumes exactly twice as much noise as it emits, giving a comfortable
//! margin over the per-byte min-entropy of the raw stream.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256, Sha512};

/// Provider of raw device noise for the extractor.
pub trait NoiseSource {
    /// Fill `out` completely with raw noise bytes.
    fn fill_noise(&mut self, out: &mut [u8]) -> Result<()>;
}

/// Digest used for conditioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorHash {
    Sha256,
    Sha512,
}

impl ExtractorHash {
    /// Digest output length in bytes.
    pub fn hash_len(self) -> usize {
        match self {
            ExtractorHash::Sha256 => 32,
            ExtractorHash::Sha512 => 64,
        }
    }

    fn digest_into(self, input: &[u8], out: &mut [u8; 64]) -> usize {
        match self {
            ExtractorHash::Sha256 => {
                out[..32].copy_from_slice(&Sha256::digest(input));
                32
            }
            ExtractorHash::Sha512 => {
                out[..64].copy_from_slice(&Sha512::digest(input));
                64
            }
        }
    }
}

/// Windowed SHA conditioner over a noise source.
pub struct ShaEntropyExtractor {
    hash: ExtractorHash,
    in_out_ratio: usize,
    noise_buf: Vec<u8>,
}

impl ShaEntropyExtractor {
    /// Default noise-in to entropy-out ratio.
    pub const DEFAULT_RATIO: usize = 2;

    pub fn new(hash: ExtractorHash, in_out_ratio: usize) -> Result<Self> {
        if in_out_ratio < 1 {
            return Err(Error::Config(format!(
                "invalid input/output ratio {in_out_ratio}, must be 1 or greater"
            )));
        }
        Ok(Self {
            hash,
            in_out_ratio,
            noise_buf: vec![0u8; in_out_ratio * hash.hash_len() * 1000],
        })
    }

    pub fn hash_len(&self) -> usize {
        self.hash.hash_len()
    }

    /// Fill `out` with conditioned entropy.
    ///
    /// Consumes exactly `ceil(out.len() / hash_len) × hash_len × ratio` noise
    /// bytes from `source`, buffering requests so the device is asked for
    /// large blocks.
    pub fn extract<S: NoiseSource>(&mut self, source: &mut S, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Err(Error::Config(
                "requested byte count must be at least 1".to_string(),
            ));
        }

        let hash_len = self.hash.hash_len();
        let digests_needed = out.len().div_ceil(hash_len);
        let in_per_digest = hash_len * self.in_out_ratio;
        let total_in = digests_needed * in_per_digest;

        let buf_len = self.noise_buf.len();
        let full_requests = total_in / buf_len;
        let last_request = total_in % buf_len;
        let digests_per_buf = buf_len / in_per_digest;

        let mut written = 0;
        for _ in 0..full_requests {
            source.fill_noise(&mut self.noise_buf)?;
            written = self.hash_windows(digests_per_buf, in_per_digest, out, written);
        }
        if last_request > 0 && written < out.len() {
            source.fill_noise(&mut self.noise_buf[..last_request])?;
            let digests = last_request / in_per_digest;
            written = self.hash_windows(digests, in_per_digest, out, written);
        }
        debug_assert_eq!(written, out.len());
        Ok(())
    }

    fn hash_windows(
        &mut self,
        digests: usize,
        in_per_digest: usize,
        out: &mut [u8],
        mut written: usize,
    ) -> usize {
        let mut digest_buf = [0u8; 64];
        for window in self.noise_buf.chunks_exact(in_per_digest).take(digests) {
            if written >= out.len() {
                break;
            }
            let produced = self.hash.digest_into(window, &mut digest_buf);
            let take = produced.min(out.len() - written);
            out[written..written + take].copy_from_slice(&digest_buf[..take]);
            written += take;
        }
        written
    }
}
