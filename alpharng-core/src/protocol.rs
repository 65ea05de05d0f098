// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Wire protocol for the AlphaRNG secure channel
//!
//! Defines the packet, command, response, and session records exchanged with
//! the device over the USB CDC link, plus the payload-size arithmetic that
//! accounts for AES block padding.
//!
//! All records travel packed and little-endian. Enumerations travel as their
//! numeric values; every value below is part of the device firmware contract
//! and must not change. Records are serialized through explicit encode/decode
//! helpers rather than struct casts so the layout is identical on every
//! platform.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Fixed packet header length: type + key size + IV + tag + payload size.
pub const PACKET_HEADER_LEN: usize = 32;

/// Largest payload a packet can carry.
pub const MAX_PACKET_PAYLOAD_LEN: usize = 16096;

/// Largest payload a command can carry.
pub const MAX_COMMAND_PAYLOAD_LEN: usize = 256;

/// Command bytes preceding the integrity-covered span: mac type + mac.
pub const COMMAND_MAC_SPAN_OFFSET: usize = 33;

/// Response bytes preceding the payload: mac type + mac + token + payload size.
pub const RESPONSE_HEADER_LEN: usize = 43;

/// Serialized session record width.
pub const SESSION_RECORD_LEN: usize = 123;

/// Session record bytes covered by the trailing MAC field.
pub const SESSION_MAC_SPAN: usize = SESSION_RECORD_LEN - 32;

/// Serialized device-information record width.
pub const DEVICE_INFO_LEN: usize = 32;

/// Serialized frequency-tables record width (two 256-entry u16 histograms).
pub const FREQUENCY_TABLES_LEN: usize = 1024;

/// Device operations understood by the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandType {
    DeviceHealthStatus = 300,
    DeviceInfo = 301,
    HealthTest = 302,
    FrequencyTables = 303,
    NoiseSourceOne = 304,
    NoiseSourceTwo = 305,
    Entropy = 306,
    TestData = 307,
    Noise = 308,
}

impl CommandType {
    pub fn value(self) -> u16 {
        self as u16
    }
}

/// AES session key size. The numeric value equals the key length in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum KeySize {
    None = 0,
    K128 = 16,
    #[default]
    K256 = 32,
}

impl KeySize {
    /// Key length in bytes; zero when the cipher is disabled.
    pub fn byte_len(self) -> usize {
        self as usize
    }

    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KeySize::None),
            16 => Ok(KeySize::K128),
            32 => Ok(KeySize::K256),
            other => Err(Error::Protocol(format!("unknown key size value {other}"))),
        }
    }
}

/// MAC algorithm. The numeric value equals the MAC tag length in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MacType {
    None = 0,
    HmacMd5 = 16,
    HmacSha1 = 20,
    #[default]
    HmacSha256 = 32,
}

impl MacType {
    /// Tag length in bytes; zero when authentication is disabled.
    pub fn tag_len(self) -> usize {
        self as usize
    }

    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MacType::None),
            16 => Ok(MacType::HmacMd5),
            20 => Ok(MacType::HmacSha1),
            32 => Ok(MacType::HmacSha256),
            other => Err(Error::Protocol(format!("unknown mac type value {other}"))),
        }
    }
}

/// Discriminates handshake packets from steady-state AES packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Rsa2048 = 1,
    AltRsa2048 = 2,
    Rsa1024 = 20,
    Aes = 40,
}

impl PacketType {
    pub fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PacketType::Rsa2048),
            2 => Ok(PacketType::AltRsa2048),
            20 => Ok(PacketType::Rsa1024),
            40 => Ok(PacketType::Aes),
            other => Err(Error::Protocol(format!("unknown packet type value {other}"))),
        }
    }
}

/// Session key algorithm declared inside the handshake record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionKeyType {
    Aes = 1,
}

/// RSA public key size. The numeric value equals the modulus length in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum RsaKeySize {
    Rsa1024 = 128,
    #[default]
    Rsa2048 = 256,
}

impl RsaKeySize {
    /// Modulus length in bytes.
    pub fn modulus_len(self) -> usize {
        self as usize
    }
}

/// Packet header as it appears on the wire.
///
/// A full packet is this header followed by `payload_size` payload bytes; the
/// trailing space of the nominal 16096-byte payload area is never sent.
#[derive(Debug, Clone)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub key_size: KeySize,
    pub iv: [u8; 12],
    pub tag: [u8; 16],
    pub payload_size: u16,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; PACKET_HEADER_LEN] {
        let mut out = [0u8; PACKET_HEADER_LEN];
        out[0] = self.packet_type as u8;
        out[1] = self.key_size as u8;
        out[2..14].copy_from_slice(&self.iv);
        out[14..30].copy_from_slice(&self.tag);
        out[30..32].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PACKET_HEADER_LEN {
            return Err(Error::Protocol(format!(
                "packet header truncated: {} bytes",
                bytes.len()
            )));
        }
        let mut iv = [0u8; 12];
        iv.copy_from_slice(&bytes[2..14]);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&bytes[14..30]);
        let payload_size = u16::from_le_bytes([bytes[30], bytes[31]]);
        if payload_size as usize > MAX_PACKET_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "packet payload size {payload_size} exceeds {MAX_PACKET_PAYLOAD_LEN}"
            )));
        }
        Ok(Self {
            packet_type: PacketType::from_wire(bytes[0])?,
            key_size: KeySize::from_wire(bytes[1])?,
            iv,
            tag,
            payload_size,
        })
    }
}

/// Request record carried inside a packet payload.
///
/// The MAC field is emitted zeroed; the caller computes the MAC over the
/// integrity span (`cmd_type ‖ token ‖ payload_size ‖ payload`, i.e. every
/// byte from [`COMMAND_MAC_SPAN_OFFSET`] on) and writes it at offset 1.
#[derive(Debug, Clone)]
pub struct Command {
    pub mac_type: MacType,
    pub cmd_type: CommandType,
    pub token: u64,
    pub payload: Vec<u8>,
}

impl Command {
    /// Serialized length: mac type + mac + cmd type + token + size + payload.
    pub fn wire_len(&self) -> usize {
        COMMAND_MAC_SPAN_OFFSET + 12 + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_COMMAND_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "command payload size {} exceeds {MAX_COMMAND_PAYLOAD_LEN}",
                self.payload.len()
            )));
        }
        let mut out = Vec::with_capacity(self.wire_len());
        out.push(self.mac_type as u8);
        out.extend_from_slice(&[0u8; 32]);
        out.extend_from_slice(&self.cmd_type.value().to_le_bytes());
        out.extend_from_slice(&self.token.to_le_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

/// Reply record recovered from a packet payload.
#[derive(Debug, Clone)]
pub struct Response {
    pub mac_type: MacType,
    pub mac: [u8; 32],
    pub token: u64,
    pub payload: Vec<u8>,
}

impl Response {
    /// Decode from decrypted payload bytes. Trailing cipher padding beyond
    /// the declared payload size is ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < RESPONSE_HEADER_LEN {
            return Err(Error::Protocol(format!(
                "response truncated: {} bytes",
                bytes.len()
            )));
        }
        let mac_type = MacType::from_wire(bytes[0])?;
        let mut mac = [0u8; 32];
        mac.copy_from_slice(&bytes[1..33]);
        let token = u64::from_le_bytes([
            bytes[33], bytes[34], bytes[35], bytes[36], bytes[37], bytes[38], bytes[39], bytes[40],
        ]);
        let payload_size = u16::from_le_bytes([bytes[41], bytes[42]]) as usize;
        if payload_size > MAX_PACKET_PAYLOAD_LEN {
            return Err(Error::Protocol(format!(
                "response payload size {payload_size} exceeds {MAX_PACKET_PAYLOAD_LEN}"
            )));
        }
        if payload_size > bytes.len() - RESPONSE_HEADER_LEN {
            return Err(Error::Protocol(format!(
                "response payload size {payload_size} exceeds received {} bytes",
                bytes.len() - RESPONSE_HEADER_LEN
            )));
        }
        Ok(Self {
            mac_type,
            mac,
            token,
            payload: bytes[RESPONSE_HEADER_LEN..RESPONSE_HEADER_LEN + payload_size].to_vec(),
        })
    }

    /// Bytes covered by the response MAC: `token ‖ payload_size ‖ payload`.
    pub fn integrity_bytes(&self) -> Vec<u8> {
        let mut span = Vec::with_capacity(10 + self.payload.len());
        span.extend_from_slice(&self.token.to_le_bytes());
        span.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        span.extend_from_slice(&self.payload);
        span
    }
}

/// Handshake record installed on the device under RSA wrapping.
///
/// Unused trailing bytes of `key` and `mac_key` stay zero when the configured
/// key or MAC is shorter than the field.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub key_type: SessionKeyType,
    pub key_size: KeySize,
    pub key: [u8; 32],
    pub token: u64,
    pub aad: [u8; 16],
    pub mac_type: MacType,
    pub mac_key: [u8; 32],
    pub mac: [u8; 32],
}

impl SessionRecord {
    pub fn encode(&self) -> [u8; SESSION_RECORD_LEN] {
        let mut out = [0u8; SESSION_RECORD_LEN];
        out[0] = self.key_type as u8;
        out[1] = self.key_size as u8;
        out[2..34].copy_from_slice(&self.key);
        out[34..42].copy_from_slice(&self.token.to_le_bytes());
        out[42..58].copy_from_slice(&self.aad);
        out[58] = self.mac_type as u8;
        out[59..91].copy_from_slice(&self.mac_key);
        out[91..123].copy_from_slice(&self.mac);
        out
    }
}

/// Device identification returned by [`CommandType::DeviceInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub major_version: u8,
    pub minor_version: u8,
    pub identifier: [u8; 15],
    pub model: [u8; 15],
}

impl DeviceInfo {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DEVICE_INFO_LEN {
            return Err(Error::Protocol(format!(
                "device info truncated: {} bytes",
                bytes.len()
            )));
        }
        let mut identifier = [0u8; 15];
        identifier.copy_from_slice(&bytes[2..17]);
        let mut model = [0u8; 15];
        model.copy_from_slice(&bytes[17..32]);
        Ok(Self {
            major_version: bytes[0],
            minor_version: bytes[1],
            identifier,
            model,
        })
    }

    /// Serial number as text, trailing NULs stripped.
    pub fn identifier_string(&self) -> String {
        bytes_to_string(&self.identifier)
    }

    /// Model name as text, trailing NULs stripped.
    pub fn model_string(&self) -> String {
        bytes_to_string(&self.model)
    }
}

fn bytes_to_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

/// Per-value frequency histograms for both noise sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrequencyTables {
    pub table_1: [u16; 256],
    pub table_2: [u16; 256],
}

impl FrequencyTables {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FREQUENCY_TABLES_LEN {
            return Err(Error::Protocol(format!(
                "frequency tables truncated: {} bytes",
                bytes.len()
            )));
        }
        let mut table_1 = [0u16; 256];
        let mut table_2 = [0u16; 256];
        for (i, entry) in table_1.iter_mut().enumerate() {
            *entry = u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        }
        for (i, entry) in table_2.iter_mut().enumerate() {
            *entry = u16::from_le_bytes([bytes[512 + 2 * i], bytes[512 + 2 * i + 1]]);
        }
        Ok(Self { table_1, table_2 })
    }
}

/// Round `len` up to a whole number of cipher blocks.
///
/// With the cipher disabled no padding is applied.
pub fn padded_len(len: usize, key_size: KeySize) -> usize {
    match key_size.byte_len() {
        0 => len,
        block => len.div_ceil(block) * block,
    }
}

/// Packet payload length for a serialized command of `command_len` bytes.
pub fn command_packet_payload_len(command_len: usize, key_size: KeySize) -> usize {
    padded_len(command_len, key_size)
}

/// Packet payload length for a response carrying `payload_len` visible bytes.
pub fn response_packet_payload_len(payload_len: usize, key_size: KeySize) -> usize {
    padded_len(RESPONSE_HEADER_LEN + payload_len, key_size)
}
