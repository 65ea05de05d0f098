// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! AlphaRNG Core Library
//!
//! This crate is the host-side driver for AlphaRNG USB true random number
//! generators. The device carries two independent physical noise sources and
//! an internal conditioner; the driver retrieves raw noise, device-conditioned
//! entropy, or host-extracted entropy over a cryptographically protected
//! serial channel, with continuous SP 800-90B health testing of everything
//! it receives.
//!
//! # Architecture
//!
//! The library is organized into modules representing core concerns:
//! - `protocol`: wire records, numeric enumerations, and payload sizing
//! - `transport`: raw-mode USB CDC serial link with exclusive device locking
//! - `cipher` / `auth` / `seal` / `token`: AES-GCM packets, HMAC integrity,
//!   RSA session wrapping, and request correlation
//! - `engine`: command execution, retries, TTL re-keying, bulk transfers
//! - `health`: repetition-count and adaptive-proportion tests
//! - `extractor`: SHA-256/512 conditioning of raw noise
//! - `sequence`: duplicate-free random integer sequences
//! - `api`: the public facade
//! - `config` / `error` / `stats`: ambient concerns
//!
//! # Example
//!
//! ```no_run
//! use alpharng_core::{AlphaRngApi, RngConfig};
//!
//! let mut rng = AlphaRngApi::new(RngConfig::default())?;
//! rng.connect(0)?;
//! let mut entropy = [0u8; 64];
//! rng.get_entropy(&mut entropy)?;
//! # Ok::<(), alpharng_core::Error>(())
//! ```

pub mod api;
pub mod auth;
pub mod cipher;
pub mod config;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod health;
pub mod protocol;
pub mod seal;
pub mod sequence;
pub mod stats;
pub mod token;
pub mod transport;

pub use api::AlphaRngApi;
pub use config::RngConfig;
pub use error::{Error, Result};
pub use extractor::{ExtractorHash, NoiseSource, ShaEntropyExtractor};
pub use health::HealthTests;
pub use protocol::{DeviceInfo, FrequencyTables, KeySize, MacType, RsaKeySize};
pub use sequence::{EntropySource, RangeSequence};
pub use transport::Transport;

#[cfg(unix)]
pub use transport::UsbSerialPort;

/// Library version for diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Bulk block length for entropy and noise commands.
pub const RND_DATA_BLOCK_LEN: usize = 16000;

/// Bulk block length for the communication self-test pattern.
pub const TEST_DATA_BLOCK_LEN: usize = 256;

/// Chunk length used by the file sinks.
pub const FILE_OUTPUT_CHUNK_LEN: usize = 100_000;

/// Upper bound for byte-counted file output.
pub const MAX_FILE_OUTPUT_BYTES: u64 = 200_000_000_000;
