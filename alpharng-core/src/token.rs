// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Request/response correlation tokens
//!
//! Every outbound command, and the session record itself, carries a fresh
//! 64-bit token. The device echoes the token in its response; equality is the
//! only correlation check the channel performs.

use rand::{rngs::OsRng, Rng};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock seconds since the Unix epoch.
pub(crate) fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Mints tokens of the form `secs << 32 | serial << 16 | rnd16`.
///
/// The serial counter is seeded randomly per instance and increments with
/// every mint, so tokens minted within the same second remain distinct and
/// ordered.
#[derive(Debug)]
pub struct TokenSource {
    serial: u16,
}

impl TokenSource {
    pub fn new() -> Self {
        Self {
            serial: OsRng.gen(),
        }
    }

    pub fn mint(&mut self) -> u64 {
        let serial = self.serial;
        self.serial = self.serial.wrapping_add(1);
        let rnd: u16 = OsRng.gen();
        (unix_seconds() & 0xFFFF_FFFF) << 32 | u64::from(serial) << 16 | u64::from(rnd)
    }
}

impl Default for TokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_subfield_increments() {
        let mut source = TokenSource::new();
        let first = (source.mint() >> 16) as u16;
        let second = (source.mint() >> 16) as u16;
        let third = (source.mint() >> 16) as u16;
        assert_eq!(second, first.wrapping_add(1));
        assert_eq!(third, first.wrapping_add(2));
    }

    #[test]
    fn test_seconds_subfield_matches_clock() {
        let mut source = TokenSource::new();
        let token = source.mint();
        let secs = unix_seconds() & 0xFFFF_FFFF;
        // allow a tick between mint and the assertion
        assert!((token >> 32).abs_diff(secs) <= 1);
    }

    #[test]
    fn test_tokens_are_unique() {
        let mut source = TokenSource::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(source.mint()));
        }
    }
}
