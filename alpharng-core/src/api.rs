// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Public driver facade
//!
//! [`AlphaRngApi`] is the surface applications talk to: connect to a device,
//! pull entropy, raw noise, or conditioned output, query device identity and
//! health, stream to files, and tune the session. One instance owns one
//! device; everything underneath is single-threaded and blocking.

use crate::config::RngConfig;
use crate::engine::CommandEngine;
use crate::error::{Error, Result};
use crate::extractor::{ExtractorHash, NoiseSource, ShaEntropyExtractor};
use crate::health::HealthTests;
use crate::protocol::{CommandType, FrequencyTables, FREQUENCY_TABLES_LEN};
use crate::sequence::{EntropySource, RangeSequence};
use crate::stats::Stats;
use crate::transport::Transport;
use crate::{FILE_OUTPUT_CHUNK_LEN, MAX_FILE_OUTPUT_BYTES};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use tracing::debug;

#[cfg(unix)]
use crate::transport::UsbSerialPort;

/// Which stream a file sink drains.
#[derive(Debug, Clone, Copy)]
enum FileSource {
    Entropy,
    Noise,
    NoiseSourceOne,
    NoiseSourceTwo,
    Sha256Entropy,
    Sha512Entropy,
}

/// Driver facade for one AlphaRNG device.
pub struct AlphaRngApi<D: Transport> {
    engine: CommandEngine<D>,
    sha256_extractor: ShaEntropyExtractor,
    sha512_extractor: ShaEntropyExtractor,
}

#[cfg(unix)]
impl AlphaRngApi<UsbSerialPort> {
    /// Create a driver over the platform USB serial transport.
    pub fn new(cfg: RngConfig) -> Result<Self> {
        Self::with_transport(cfg, UsbSerialPort::new())
    }

    /// Create a driver with the strongest default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(RngConfig::default())
    }
}

impl<D: Transport> AlphaRngApi<D> {
    /// Create a driver over a caller-supplied transport.
    pub fn with_transport(cfg: RngConfig, transport: D) -> Result<Self> {
        Ok(Self {
            engine: CommandEngine::new(cfg, transport)?,
            sha256_extractor: ShaEntropyExtractor::new(
                ExtractorHash::Sha256,
                ShaEntropyExtractor::DEFAULT_RATIO,
            )?,
            sha512_extractor: ShaEntropyExtractor::new(
                ExtractorHash::Sha512,
                ShaEntropyExtractor::DEFAULT_RATIO,
            )?,
        })
    }

    /// Number of attached AlphaRNG devices.
    pub fn device_count(&mut self) -> Result<usize> {
        self.engine.device_count()
    }

    /// Connect to the device with the given number (0 for the first) and
    /// establish a secure session.
    pub fn connect(&mut self, device_number: usize) -> Result<()> {
        self.engine.connect(device_number)
    }

    /// Close the device and invalidate the session.
    pub fn disconnect(&mut self) -> Result<()> {
        self.engine.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.engine.is_connected()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.engine.is_connected() {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    // ------------------------------------------------------------------
    // Bulk reads
    // ------------------------------------------------------------------

    /// Retrieve device-conditioned entropy, health-tested block by block.
    pub fn get_entropy(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        self.engine.get_entropy(out)
    }

    /// Retrieve concatenated raw bytes of both noise sources.
    pub fn get_noise(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        self.engine.get_noise(out)
    }

    /// Retrieve raw bytes from the first noise source.
    pub fn get_noise_source_1(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        self.engine.get_noise_source_one(out)
    }

    /// Retrieve raw bytes from the second noise source.
    pub fn get_noise_source_2(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        self.engine.get_noise_source_two(out)
    }

    /// Retrieve the transport self-test pattern: bytes incrementing from 0.
    pub fn get_test_data(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        self.engine.get_test_data(out)
    }

    /// Extract entropy by SHA-256 conditioning of raw noise.
    pub fn extract_sha256_entropy(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        self.sha256_extractor.extract(&mut self.engine, out)
    }

    /// Extract entropy by SHA-512 conditioning of raw noise.
    pub fn extract_sha512_entropy(&mut self, out: &mut [u8]) -> Result<()> {
        self.ensure_connected()?;
        self.sha512_extractor.extract(&mut self.engine, out)
    }

    /// Generate `size` distinct random integers from `[min..=max]` using
    /// device entropy.
    pub fn generate_range_sequence(&mut self, min: i32, max: i32, size: u32) -> Result<Vec<i32>> {
        self.ensure_connected()?;
        let mut sequence = RangeSequence::new(min, max)?;
        sequence.generate(&mut self.engine, size)
    }

    // ------------------------------------------------------------------
    // Device queries
    // ------------------------------------------------------------------

    /// Run the device-internal health test suite.
    pub fn run_health_test(&mut self) -> Result<()> {
        self.ensure_connected()?;
        let resp = self.engine.execute_command(CommandType::HealthTest, &[], 1)?;
        match resp.payload[0] {
            0 => Ok(()),
            status => Err(Error::DeviceRngStatus(status)),
        }
    }

    /// Retrieve the device-internal RNG health status byte.
    pub fn retrieve_rng_status(&mut self) -> Result<u8> {
        self.ensure_connected()?;
        let resp = self
            .engine
            .execute_command(CommandType::DeviceHealthStatus, &[], 1)?;
        Ok(resp.payload[0])
    }

    /// Retrieve the per-value frequency histograms of both noise sources.
    pub fn retrieve_frequency_tables(&mut self) -> Result<FrequencyTables> {
        self.ensure_connected()?;
        let resp = self.engine.execute_command(
            CommandType::FrequencyTables,
            &[],
            FREQUENCY_TABLES_LEN + 1,
        )?;
        let rng_status = resp.payload[FREQUENCY_TABLES_LEN];
        if rng_status != 0 {
            return Err(Error::DeviceRngStatus(rng_status));
        }
        FrequencyTables::decode(&resp.payload)
    }

    /// Device serial number, cached at connect time.
    pub fn retrieve_device_id(&self) -> Result<String> {
        self.device_info_field(|info| info.identifier_string())
    }

    /// Device model, cached at connect time.
    pub fn retrieve_device_model(&self) -> Result<String> {
        self.device_info_field(|info| info.model_string())
    }

    pub fn retrieve_device_major_version(&self) -> Result<u8> {
        self.device_info_field(|info| info.major_version)
    }

    pub fn retrieve_device_minor_version(&self) -> Result<u8> {
        self.device_info_field(|info| info.minor_version)
    }

    fn device_info_field<T>(&self, f: impl Fn(&crate::protocol::DeviceInfo) -> T) -> Result<T> {
        self.ensure_connected()?;
        self.engine.device_info().map(f).ok_or(Error::NotConnected)
    }

    // ------------------------------------------------------------------
    // Session and health tuning
    // ------------------------------------------------------------------

    /// Set the session time-to-live in minutes; zero disables it. An expired
    /// session is re-keyed transparently before the next command.
    pub fn set_session_ttl(&mut self, minutes: u64) {
        self.engine.set_session_ttl(minutes);
    }

    /// Expire the current session now, forcing a re-key on the next command.
    pub fn force_rekey(&mut self) {
        self.engine.force_rekey();
    }

    /// Disable the host-side RCT/APT statistical tests.
    pub fn disable_stat_tests(&mut self) {
        self.engine.health_tests_mut().disable();
    }

    /// Re-enable the host-side RCT/APT statistical tests.
    pub fn enable_stat_tests(&mut self) {
        self.engine.health_tests_mut().enable();
    }

    /// Raise the health-test failure threshold (minimum 6).
    pub fn set_num_failures_threshold(&mut self, threshold: u8) -> Result<()> {
        self.engine
            .health_tests_mut()
            .set_failures_threshold(threshold)
    }

    /// Host-side health test state and per-block failure maxima.
    pub fn health_tests(&self) -> &HealthTests {
        self.engine.health_tests()
    }

    /// Retry, session, and throughput counters.
    pub fn stats(&self) -> &Stats {
        self.engine.stats()
    }

    // ------------------------------------------------------------------
    // File sinks
    // ------------------------------------------------------------------

    /// Stream device-conditioned entropy to a file.
    /// `num_bytes == 0` streams until an error occurs.
    pub fn entropy_to_file(&mut self, path: impl AsRef<Path>, num_bytes: u64) -> Result<()> {
        self.to_file(FileSource::Entropy, path.as_ref(), num_bytes)
    }

    /// Stream raw noise of both sources to a file.
    pub fn noise_to_file(&mut self, path: impl AsRef<Path>, num_bytes: u64) -> Result<()> {
        self.to_file(FileSource::Noise, path.as_ref(), num_bytes)
    }

    /// Stream the first noise source to a file.
    pub fn noise_source_one_to_file(
        &mut self,
        path: impl AsRef<Path>,
        num_bytes: u64,
    ) -> Result<()> {
        self.to_file(FileSource::NoiseSourceOne, path.as_ref(), num_bytes)
    }

    /// Stream the second noise source to a file.
    pub fn noise_source_two_to_file(
        &mut self,
        path: impl AsRef<Path>,
        num_bytes: u64,
    ) -> Result<()> {
        self.to_file(FileSource::NoiseSourceTwo, path.as_ref(), num_bytes)
    }

    /// Stream SHA-256-extracted entropy to a file.
    pub fn extract_sha256_entropy_to_file(
        &mut self,
        path: impl AsRef<Path>,
        num_bytes: u64,
    ) -> Result<()> {
        self.to_file(FileSource::Sha256Entropy, path.as_ref(), num_bytes)
    }

    /// Stream SHA-512-extracted entropy to a file.
    pub fn extract_sha512_entropy_to_file(
        &mut self,
        path: impl AsRef<Path>,
        num_bytes: u64,
    ) -> Result<()> {
        self.to_file(FileSource::Sha512Entropy, path.as_ref(), num_bytes)
    }

    fn to_file(&mut self, source: FileSource, path: &Path, num_bytes: u64) -> Result<()> {
        self.ensure_connected()?;
        if num_bytes > MAX_FILE_OUTPUT_BYTES {
            return Err(Error::Config(format!(
                "amount of bytes cannot exceed {MAX_FILE_OUTPUT_BYTES}"
            )));
        }

        let mut file = File::create(path)?;
        let mut buf = vec![0u8; FILE_OUTPUT_CHUNK_LEN];
        self.engine.stats_mut().begin_transfer();
        let result = self.stream_to_file(source, &mut file, &mut buf, num_bytes);
        self.engine.stats_mut().end_transfer();
        result?;
        file.flush()?;
        debug!(path = %path.display(), num_bytes, "file output complete");
        Ok(())
    }

    fn stream_to_file(
        &mut self,
        source: FileSource,
        file: &mut File,
        buf: &mut [u8],
        num_bytes: u64,
    ) -> Result<()> {
        if num_bytes == 0 {
            // continuous mode runs until an I/O or device error stops it
            loop {
                self.read_source(source, buf)?;
                file.write_all(buf)?;
            }
        }
        let mut remaining = num_bytes;
        while remaining > 0 {
            let chunk = (buf.len() as u64).min(remaining) as usize;
            self.read_source(source, &mut buf[..chunk])?;
            file.write_all(&buf[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }

    fn read_source(&mut self, source: FileSource, out: &mut [u8]) -> Result<()> {
        match source {
            FileSource::Entropy => self.engine.get_entropy(out),
            FileSource::Noise => self.engine.get_noise(out),
            FileSource::NoiseSourceOne => self.engine.get_noise_source_one(out),
            FileSource::NoiseSourceTwo => self.engine.get_noise_source_two(out),
            FileSource::Sha256Entropy => self.sha256_extractor.extract(&mut self.engine, out),
            FileSource::Sha512Entropy => self.sha512_extractor.extract(&mut self.engine, out),
        }
    }
}

impl<D: Transport> EntropySource for AlphaRngApi<D> {
    fn fill_entropy(&mut self, out: &mut [u8]) -> Result<()> {
        self.get_entropy(out)
    }
}

impl<D: Transport> NoiseSource for AlphaRngApi<D> {
    fn fill_noise(&mut self, out: &mut [u8]) -> Result<()> {
        self.get_noise(out)
    }
}
