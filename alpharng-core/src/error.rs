// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Error types for the AlphaRNG driver
//!
//! Provides a unified error taxonomy using `thiserror` for ergonomic error handling.

pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for AlphaRNG operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration or parameter validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation requires an established device connection
    #[error("Device is not connected")]
    NotConnected,

    /// Transport read or write failed with an OS error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport read deadline expired before all bytes arrived
    #[error("Operation timed out")]
    Timeout,

    /// Wire-level violation: packet type, size, tag, MAC, or token mismatch
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bulk command returned a non-zero device RNG status byte
    /// (1 = RCT, 2 = APT, 4 = frequency distribution)
    #[error("Device reported RNG status {0}")]
    DeviceRngStatus(u8),

    /// Host-side continuous health test latched a failure
    /// (1 = repetition count, 2 = adaptive proportion)
    #[error("Health test failure, status {0}")]
    HealthTest(u8),

    /// Cryptographic primitive reported an internal failure
    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl Error {
    /// Check if error is transient and worth another attempt on the wire.
    ///
    /// Health-test and device-status failures are deliberately excluded:
    /// retrying would re-read suspect entropy and mask a failing noise source.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout | Error::Protocol(_))
    }
}
