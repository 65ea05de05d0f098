// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Command/response engine for the secure channel
//!
//! Owns the transport and the per-session cryptographic state, and drives the
//! request/response state machine: session-key upload under RSA, AES-GCM
//! framing with a fresh IV per packet, HMAC-covered commands and responses,
//! token correlation, bounded retries with receiver draining, TTL-triggered
//! rekey, and chunked bulk transfers with continuous health testing.
//!
//! Two read deadlines are used: a slow one while the device may still be
//! initializing (handshake), and a fast one for steady-state traffic. The
//! switch happens right after the session key upload is acknowledged.

use crate::auth::SessionAuth;
use crate::cipher::SessionCipher;
use crate::config::RngConfig;
use crate::error::{Error, Result};
use crate::extractor::NoiseSource;
use crate::health::HealthTests;
use crate::protocol::{
    command_packet_payload_len, response_packet_payload_len, Command, CommandType, DeviceInfo,
    KeySize, MacType, PacketHeader, PacketType, Response, SessionKeyType, SessionRecord,
    COMMAND_MAC_SPAN_OFFSET, DEVICE_INFO_LEN, MAX_COMMAND_PAYLOAD_LEN, PACKET_HEADER_LEN,
    SESSION_MAC_SPAN,
};
use crate::seal::RsaSealer;
use crate::sequence::EntropySource;
use crate::stats::Stats;
use crate::token::{unix_seconds, TokenSource};
use crate::transport::Transport;
use crate::{RND_DATA_BLOCK_LEN, TEST_DATA_BLOCK_LEN};
use rand::{rngs::OsRng, RngCore};
use std::time::Duration;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Read deadline while the device may be initializing.
const SLOW_TIMEOUT: Duration = Duration::from_millis(4000);

/// Read deadline for steady-state operations.
const FAST_TIMEOUT: Duration = Duration::from_millis(300);

/// Attempts per logical command, and per connect.
const MAX_RETRIES: u32 = 3;

/// Pause before and after draining the receiver between attempts.
const RETRY_PAUSE: Duration = Duration::from_millis(100);

const DRAIN_BUF_LEN: usize = 128;

// Single-byte bulk opcodes for the unframed path (MAC and cipher both off).
const OP_NOISE_SOURCE_ONE: u8 = b'1';
const OP_NOISE_SOURCE_TWO: u8 = b'2';
const OP_NOISE: u8 = b'n';
const OP_ENTROPY: u8 = b'x';

/// Request/response orchestrator over one device.
pub struct CommandEngine<D: Transport> {
    device: D,
    cfg: RngConfig,
    rsa: RsaSealer,
    cipher: Option<SessionCipher>,
    auth: SessionAuth,
    tokens: TokenSource,
    health: HealthTests,
    stats: Stats,
    device_info: Option<DeviceInfo>,
    device_number: Option<usize>,
    ttl: Option<u64>,
    session_expires_at: Option<u64>,
}

impl<D: Transport> CommandEngine<D> {
    pub fn new(cfg: RngConfig, device: D) -> Result<Self> {
        cfg.validate()?;
        let rsa = match &cfg.pub_key_file {
            Some(path) => RsaSealer::from_pem_file(path, cfg.rsa_key_size)?,
            None => RsaSealer::embedded(cfg.rsa_key_size)?,
        };
        Ok(Self {
            auth: SessionAuth::new(cfg.mac_type),
            tokens: TokenSource::new(),
            health: HealthTests::new(),
            stats: Stats::new(),
            device,
            cfg,
            rsa,
            cipher: None,
            device_info: None,
            device_number: None,
            ttl: None,
            session_expires_at: None,
        })
    }

    pub fn config(&self) -> &RngConfig {
        &self.cfg
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_connected()
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    pub fn health_tests(&self) -> &HealthTests {
        &self.health
    }

    pub fn health_tests_mut(&mut self) -> &mut HealthTests {
        &mut self.health
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    /// Number of attached devices.
    pub fn device_count(&mut self) -> Result<usize> {
        Ok(self.device.scan_devices()?.len())
    }

    /// Session time-to-live in minutes; zero disables the TTL.
    pub fn set_session_ttl(&mut self, minutes: u64) {
        self.ttl = (minutes > 0).then_some(minutes * 60);
        if let Some(ttl) = self.ttl {
            if self.session_expires_at.is_some() {
                self.session_expires_at = Some(unix_seconds() + ttl);
            }
        } else {
            self.session_expires_at = None;
        }
    }

    /// Mark the current session expired; the next command re-keys first.
    pub fn force_rekey(&mut self) {
        if self.is_connected() {
            self.session_expires_at = Some(unix_seconds());
        }
    }

    /// Establish a connection and a fresh session with the numbered device.
    pub fn connect(&mut self, device_number: usize) -> Result<()> {
        if self.is_connected() {
            return Err(Error::Config("already connected".to_string()));
        }
        let mut last = None;
        for attempt in 1..=MAX_RETRIES {
            if self.is_connected() {
                let _ = self.disconnect();
            }
            match self.connect_internal(device_number) {
                Ok(()) => {
                    self.device_number = Some(device_number);
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "connect attempt failed");
                    std::thread::sleep(RETRY_PAUSE);
                    let _ = self.drain_receiver();
                    self.stats.record_retry();
                    last = Some(e);
                }
            }
        }
        if self.is_connected() {
            let _ = self.disconnect();
        }
        Err(last.unwrap_or(Error::NotConnected))
    }

    fn connect_internal(&mut self, device_number: usize) -> Result<()> {
        let devices = self.device.scan_devices()?;
        if devices.is_empty() {
            return Err(Error::Config(format!(
                "device number {device_number} could not be found"
            )));
        }
        let path = devices
            .get(device_number)
            .ok_or_else(|| {
                Error::Config(format!(
                    "device number {device_number} could not be found, {} present",
                    devices.len()
                ))
            })?
            .clone();
        self.device.connect(&path)?;
        let _ = self.drain_receiver();
        self.device.set_timeout(SLOW_TIMEOUT)?;

        // fresh session material on every connect
        self.auth.regenerate();
        self.cipher = match self.cfg.key_size {
            KeySize::None => None,
            key_size => Some(SessionCipher::new(key_size)?),
        };

        self.upload_session_key()?;
        self.device.set_timeout(FAST_TIMEOUT)?;

        let info = self.fetch_device_info()?;
        debug!(
            model = %info.model_string(),
            id = %info.identifier_string(),
            "connected to AlphaRNG device"
        );
        self.device_info = Some(info);
        Ok(())
    }

    /// Close the transport and invalidate the session.
    pub fn disconnect(&mut self) -> Result<()> {
        self.cipher = None;
        self.device_info = None;
        self.session_expires_at = None;
        self.device.disconnect()
    }

    /// Upload the RSA-wrapped session record and verify the one-byte ack.
    fn upload_session_key(&mut self) -> Result<()> {
        let token = self.tokens.mint();
        let mut record = SessionRecord {
            key_type: SessionKeyType::Aes,
            key_size: self.cfg.key_size,
            key: [0u8; 32],
            token,
            aad: [0u8; 16],
            mac_type: self.cfg.mac_type,
            mac_key: [0u8; 32],
            mac: [0u8; 32],
        };
        if let Some(cipher) = &self.cipher {
            record.key[..cipher.key().len()].copy_from_slice(cipher.key());
            record.aad = *cipher.aad();
        }
        record.mac_key[..self.auth.key().len()].copy_from_slice(self.auth.key());

        let mut record_bytes = record.encode();
        if self.cfg.mac_type != MacType::None {
            let tag = self.auth.compute(&record_bytes[..SESSION_MAC_SPAN])?;
            record_bytes[SESSION_MAC_SPAN..SESSION_MAC_SPAN + tag.len()].copy_from_slice(&tag);
        }

        // the record rides at the head of a random-filled modulus-size block
        let modulus_len = self.rsa.modulus_len();
        let mut block = vec![0u8; modulus_len];
        OsRng.fill_bytes(&mut block[record_bytes.len()..]);
        block[..record_bytes.len()].copy_from_slice(&record_bytes);
        let sealed = self.rsa.seal_raw(&block);
        record.key.zeroize();
        record.mac_key.zeroize();
        record_bytes.zeroize();
        block.zeroize();
        let sealed = sealed?;

        let mut header = PacketHeader {
            packet_type: self.rsa.packet_type(),
            key_size: KeySize::None,
            iv: [0u8; 12],
            tag: [0u8; 16],
            payload_size: modulus_len as u16,
        };
        if let Some(cipher) = self.cipher.as_mut() {
            // the device answers under the IV it receives here
            header.iv = cipher.fresh_iv();
        }

        let mut frame = Vec::with_capacity(PACKET_HEADER_LEN + sealed.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&sealed);
        self.device.send(&frame)?;

        let resp = self.read_response(1)?;
        if resp.token != token {
            return Err(Error::Protocol(
                "handshake response token does not match session token".to_string(),
            ));
        }
        if resp.payload[0] != 0 {
            return Err(Error::Protocol(format!(
                "handshake rejected with device status {}",
                resp.payload[0]
            )));
        }

        self.stats.record_session();
        self.session_expires_at = self.ttl.map(|ttl| unix_seconds() + ttl);
        debug!(sessions = self.stats.sessions(), "session key installed");
        Ok(())
    }

    /// Execute one command with retries, returning its validated response.
    pub fn execute_command(
        &mut self,
        cmd_type: CommandType,
        payload: &[u8],
        expected_payload_len: usize,
    ) -> Result<Response> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if payload.len() > MAX_COMMAND_PAYLOAD_LEN {
            return Err(Error::Config(format!(
                "command payload size invalid: {}",
                payload.len()
            )));
        }
        self.rekey_if_expired()?;

        let mut last = None;
        for attempt in 1..=MAX_RETRIES {
            match self.execute_once(cmd_type, payload, expected_payload_len) {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, command = cmd_type.value(), error = %e, "command failed, retrying");
                    self.stats.record_retry();
                    std::thread::sleep(RETRY_PAUSE);
                    let _ = self.drain_receiver();
                    std::thread::sleep(RETRY_PAUSE);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(Error::Timeout))
    }

    fn execute_once(
        &mut self,
        cmd_type: CommandType,
        payload: &[u8],
        expected_payload_len: usize,
    ) -> Result<Response> {
        let token = self.tokens.mint();
        let cmd = Command {
            mac_type: self.cfg.mac_type,
            cmd_type,
            token,
            payload: payload.to_vec(),
        };
        let mut plain = cmd.encode()?;
        if self.cfg.mac_type != MacType::None {
            let tag = self.auth.compute(&plain[COMMAND_MAC_SPAN_OFFSET..])?;
            plain[1..1 + tag.len()].copy_from_slice(&tag);
        }

        let packet_payload_len = command_packet_payload_len(plain.len(), self.cfg.key_size);
        plain.resize(packet_payload_len, 0);

        let mut header = PacketHeader {
            packet_type: PacketType::Aes,
            key_size: self.cfg.key_size,
            iv: [0u8; 12],
            tag: [0u8; 16],
            payload_size: packet_payload_len as u16,
        };
        if let Some(cipher) = self.cipher.as_mut() {
            header.iv = cipher.fresh_iv();
            header.tag = cipher.encrypt(&mut plain)?;
        }

        let mut frame = Vec::with_capacity(PACKET_HEADER_LEN + plain.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(&plain);
        plain.zeroize();
        self.device.send(&frame)?;

        let resp = self.read_response(expected_payload_len)?;
        if resp.token != token {
            return Err(Error::Protocol(
                "response token does not match command token".to_string(),
            ));
        }
        Ok(resp)
    }

    /// Receive, decrypt, and validate one response packet.
    fn read_response(&mut self, expected_payload_len: usize) -> Result<Response> {
        let packet_payload_len = response_packet_payload_len(expected_payload_len, self.cfg.key_size);
        let total = PACKET_HEADER_LEN + packet_payload_len;
        let mut frame = vec![0u8; total];
        let received = self.device.receive(&mut frame)?;
        if received < total {
            return Err(Error::Timeout);
        }

        let header = PacketHeader::decode(&frame[..PACKET_HEADER_LEN])?;
        if header.packet_type != PacketType::Aes {
            return Err(Error::Protocol(format!(
                "received packet type {} is not AES",
                header.packet_type as u8
            )));
        }
        if header.key_size != self.cfg.key_size {
            return Err(Error::Protocol(format!(
                "received packet key size {} does not match configuration",
                header.key_size as u8
            )));
        }
        if header.payload_size as usize != packet_payload_len {
            return Err(Error::Protocol(format!(
                "received packet payload size {} does not match expected {packet_payload_len}",
                header.payload_size
            )));
        }

        let mut payload = frame[PACKET_HEADER_LEN..].to_vec();
        if let Some(cipher) = &self.cipher {
            cipher.decrypt(&mut payload, &header.tag)?;
        }
        let resp = Response::decode(&payload);
        payload.zeroize();
        let resp = resp?;

        if resp.mac_type != self.cfg.mac_type {
            return Err(Error::Protocol(format!(
                "response mac type {} does not match configuration",
                resp.mac_type as u8
            )));
        }
        if resp.payload.len() != expected_payload_len {
            return Err(Error::Protocol(format!(
                "response payload size {} does not match expected {expected_payload_len}",
                resp.payload.len()
            )));
        }
        if self.cfg.mac_type != MacType::None {
            self.auth.verify(&resp.integrity_bytes(), &resp.mac)?;
        }
        Ok(resp)
    }

    fn rekey_if_expired(&mut self) -> Result<()> {
        let Some(expires_at) = self.session_expires_at else {
            return Ok(());
        };
        if unix_seconds() < expires_at {
            return Ok(());
        }
        debug!("session expired, re-keying");
        let device_number = self.device_number.unwrap_or(0);
        let _ = self.disconnect();
        self.connect(device_number)
    }

    /// Read with the fast deadline until the line is idle.
    pub fn drain_receiver(&mut self) -> Result<()> {
        if !self.device.is_connected() {
            return Ok(());
        }
        self.device.set_timeout(FAST_TIMEOUT)?;
        let mut junk = [0u8; DRAIN_BUF_LEN];
        while self.device.receive(&mut junk)? > 0 {}
        Ok(())
    }

    fn fetch_device_info(&mut self) -> Result<DeviceInfo> {
        let resp = self.execute_command(CommandType::DeviceInfo, &[], DEVICE_INFO_LEN)?;
        DeviceInfo::decode(&resp.payload)
    }

    /// Chunked bulk read through the framed secure channel.
    pub fn get_bulk(
        &mut self,
        cmd_type: CommandType,
        out: &mut [u8],
        block_len: usize,
        run_health_tests: bool,
    ) -> Result<()> {
        if out.is_empty() {
            return Err(Error::Config(
                "requested byte count must be at least 1".to_string(),
            ));
        }
        let mut offset = 0;
        while offset < out.len() {
            let chunk = block_len.min(out.len() - offset);
            self.read_block(cmd_type, &mut out[offset..offset + chunk], block_len, run_health_tests)?;
            offset += chunk;
        }
        self.stats.record_bytes(out.len() as u64);
        Ok(())
    }

    fn read_block(
        &mut self,
        cmd_type: CommandType,
        dest: &mut [u8],
        block_len: usize,
        run_health_tests: bool,
    ) -> Result<()> {
        if run_health_tests {
            self.health.restart();
        }
        let resp = self.execute_command(cmd_type, &[], block_len + 1)?;
        let rng_status = resp.payload[block_len];
        if rng_status != 0 {
            return Err(Error::DeviceRngStatus(rng_status));
        }
        dest.copy_from_slice(&resp.payload[..dest.len()]);
        if run_health_tests {
            self.health.test(&resp.payload[..dest.len()]);
            if self.health.is_error() {
                return Err(Error::HealthTest(self.health.health_status()));
            }
        }
        Ok(())
    }

    /// Chunked bulk read over the unframed single-byte-opcode path.
    ///
    /// Only valid when both the MAC and the cipher are disabled; the device
    /// then answers a one-byte opcode with `block_len` data bytes plus its
    /// RNG status byte, with no packet or response structure around them.
    pub fn get_bulk_unpacked(
        &mut self,
        opcode: u8,
        out: &mut [u8],
        block_len: usize,
        run_health_tests: bool,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if out.is_empty() {
            return Err(Error::Config(
                "requested byte count must be at least 1".to_string(),
            ));
        }
        self.rekey_if_expired()?;

        let mut block = vec![0u8; block_len + 1];
        let mut offset = 0;
        while offset < out.len() {
            let chunk = block_len.min(out.len() - offset);
            if run_health_tests {
                self.health.restart();
            }
            self.unpacked_exchange(opcode, &mut block)?;
            let rng_status = block[block_len];
            if rng_status != 0 {
                return Err(Error::DeviceRngStatus(rng_status));
            }
            out[offset..offset + chunk].copy_from_slice(&block[..chunk]);
            if run_health_tests {
                self.health.test(&block[..chunk]);
                if self.health.is_error() {
                    return Err(Error::HealthTest(self.health.health_status()));
                }
            }
            offset += chunk;
        }
        self.stats.record_bytes(out.len() as u64);
        Ok(())
    }

    fn unpacked_exchange(&mut self, opcode: u8, block: &mut [u8]) -> Result<()> {
        let mut last = None;
        for attempt in 1..=MAX_RETRIES {
            match self.unpacked_exchange_once(opcode, block) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, opcode, error = %e, "unframed read failed, retrying");
                    self.stats.record_retry();
                    std::thread::sleep(RETRY_PAUSE);
                    let _ = self.drain_receiver();
                    std::thread::sleep(RETRY_PAUSE);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or(Error::Timeout))
    }

    fn unpacked_exchange_once(&mut self, opcode: u8, block: &mut [u8]) -> Result<()> {
        self.device.send(&[opcode])?;
        let received = self.device.receive(block)?;
        if received < block.len() {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    // Bulk entry points. Raw and entropy reads are health-tested; the
    // communication self-test pattern is not.

    pub fn get_entropy(&mut self, out: &mut [u8]) -> Result<()> {
        if self.cfg.is_unsecured() {
            self.get_bulk_unpacked(OP_ENTROPY, out, RND_DATA_BLOCK_LEN, true)
        } else {
            self.get_bulk(CommandType::Entropy, out, RND_DATA_BLOCK_LEN, true)
        }
    }

    pub fn get_noise(&mut self, out: &mut [u8]) -> Result<()> {
        if self.cfg.is_unsecured() {
            self.get_bulk_unpacked(OP_NOISE, out, RND_DATA_BLOCK_LEN, true)
        } else {
            self.get_bulk(CommandType::Noise, out, RND_DATA_BLOCK_LEN, true)
        }
    }

    pub fn get_noise_source_one(&mut self, out: &mut [u8]) -> Result<()> {
        if self.cfg.is_unsecured() {
            self.get_bulk_unpacked(OP_NOISE_SOURCE_ONE, out, RND_DATA_BLOCK_LEN, true)
        } else {
            self.get_bulk(CommandType::NoiseSourceOne, out, RND_DATA_BLOCK_LEN, true)
        }
    }

    pub fn get_noise_source_two(&mut self, out: &mut [u8]) -> Result<()> {
        if self.cfg.is_unsecured() {
            self.get_bulk_unpacked(OP_NOISE_SOURCE_TWO, out, RND_DATA_BLOCK_LEN, true)
        } else {
            self.get_bulk(CommandType::NoiseSourceTwo, out, RND_DATA_BLOCK_LEN, true)
        }
    }

    pub fn get_test_data(&mut self, out: &mut [u8]) -> Result<()> {
        self.get_bulk(CommandType::TestData, out, TEST_DATA_BLOCK_LEN, false)
    }
}

impl<D: Transport> NoiseSource for CommandEngine<D> {
    fn fill_noise(&mut self, out: &mut [u8]) -> Result<()> {
        self.get_noise(out)
    }
}

impl<D: Transport> EntropySource for CommandEngine<D> {
    fn fill_entropy(&mut self, out: &mut [u8]) -> Result<()> {
        self.get_entropy(out)
    }
}
