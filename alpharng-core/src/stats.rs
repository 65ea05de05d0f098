// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Per-instance operation statistics
//!
//! The driver is single-threaded per API instance, so these are plain
//! counters rather than shared atomics. Retry and session counts accumulate
//! for the lifetime of the instance; transfer measurements cover the most
//! recent bulk transfer window.

use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct Stats {
    retries: u64,
    sessions: u64,
    bytes_delivered: u64,
    window_bytes: u64,
    window_started: Option<Instant>,
    window_elapsed: Duration,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total command retries since the instance was created.
    pub fn retries(&self) -> u64 {
        self.retries
    }

    /// Sessions successfully established since the instance was created.
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    /// Total payload bytes delivered to callers.
    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }

    /// Download speed of the last measured transfer window in KB/s.
    pub fn download_speed_kbs(&self) -> u64 {
        let elapsed = match self.window_started {
            Some(started) => started.elapsed(),
            None => self.window_elapsed,
        };
        let millis = elapsed.as_millis() as u64;
        if millis == 0 {
            return 0;
        }
        self.window_bytes / millis
    }

    pub(crate) fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub(crate) fn record_session(&mut self) {
        self.sessions += 1;
    }

    pub(crate) fn record_bytes(&mut self, count: u64) {
        self.bytes_delivered += count;
        if self.window_started.is_some() {
            self.window_bytes += count;
        }
    }

    pub(crate) fn begin_transfer(&mut self) {
        self.window_bytes = 0;
        self.window_elapsed = Duration::ZERO;
        self.window_started = Some(Instant::now());
    }

    pub(crate) fn end_transfer(&mut self) {
        if let Some(started) = self.window_started.take() {
            self.window_elapsed = started.elapsed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let mut stats = Stats::new();
        stats.record_retry();
        stats.record_retry();
        stats.record_session();
        stats.record_bytes(100);
        stats.record_bytes(50);
        assert_eq!(stats.retries(), 2);
        assert_eq!(stats.sessions(), 1);
        assert_eq!(stats.bytes_delivered(), 150);
    }

    #[test]
    fn test_transfer_window_scopes_speed() {
        let mut stats = Stats::new();
        stats.record_bytes(1_000_000);
        // bytes outside a window do not count toward speed
        assert_eq!(stats.download_speed_kbs(), 0);

        stats.begin_transfer();
        stats.record_bytes(500_000);
        std::thread::sleep(Duration::from_millis(20));
        stats.end_transfer();
        assert!(stats.download_speed_kbs() > 0);
        assert_eq!(stats.bytes_delivered(), 1_500_000);
    }
}
