//! In-process mock of the AlphaRNG device
//!
//! Implements the device side of the secure channel behind the [`Transport`]
//! trait: it unwraps the RSA handshake with a test-generated private key,
//! installs the session, and answers commands under AES-GCM with the IV each
//! request carries, exactly as the hardware does. Fault injection covers
//! dropped responses, corrupted MACs, and a dead noise source, controlled
//! through a shared handle that stays usable after the device moves into the
//! driver.

use aes_gcm::{aead::AeadInPlace, Aes128Gcm, Aes256Gcm, KeyInit, Nonce, Tag};
use alpharng_core::protocol::{
    response_packet_payload_len, KeySize, MacType, PacketHeader, PacketType,
    FREQUENCY_TABLES_LEN, PACKET_HEADER_LEN, RESPONSE_HEADER_LEN, SESSION_MAC_SPAN,
    SESSION_RECORD_LEN,
};
use alpharng_core::{Error, Result, Transport, RND_DATA_BLOCK_LEN, TEST_DATA_BLOCK_LEN};
use hmac::{Hmac, Mac};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use std::cell::Cell;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::OnceLock;
use std::time::Duration;

pub const MOCK_DEVICE_ID: &str = "ALPHA-MOCK-0001";
pub const MOCK_DEVICE_MODEL: &str = "AlphaRNG sim";

/// One shared test keypair; RSA generation is too slow to repeat per test.
pub fn test_keypair() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::rngs::OsRng, 1024).expect("RSA keygen failed")
    })
}

/// Write the public half of the test keypair to a temp PEM file.
pub fn write_public_key_pem(tag: &str) -> PathBuf {
    use rsa::pkcs1::EncodeRsaPublicKey;
    let public = RsaPublicKey::from(test_keypair());
    let pem = public
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .expect("PEM encoding failed");
    let path = std::env::temp_dir().join(format!(
        "alpharng-mock-{}-{}.pem",
        std::process::id(),
        tag
    ));
    std::fs::write(&path, pem).expect("cannot write PEM file");
    path
}

/// Fault-injection and observation handle, shared with the test body.
#[derive(Default)]
pub struct MockControls {
    /// Respond with all-zero noise bytes (kills the RCT immediately).
    pub zero_noise: Cell<bool>,
    /// Swallow this many requests before answering again.
    pub drop_requests: Cell<u32>,
    /// Corrupt the MAC field of every response.
    pub corrupt_response_mac: Cell<bool>,
    /// Unframed single-byte-opcode reads served.
    pub unpacked_reads: Cell<u64>,
    /// Handshakes completed.
    pub handshakes: Cell<u64>,
}

struct MockSession {
    key_size: KeySize,
    key: Vec<u8>,
    aad: [u8; 16],
    mac_type: MacType,
    mac_key: Vec<u8>,
}

/// Scriptable device-side endpoint of the secure channel.
pub struct MockAlphaDevice {
    connected: bool,
    rx: VecDeque<u8>,
    session: Option<MockSession>,
    noise_state: u64,
    controls: Rc<MockControls>,
}

impl MockAlphaDevice {
    pub fn new() -> Self {
        Self {
            connected: false,
            rx: VecDeque::new(),
            session: None,
            noise_state: 0x9E37_79B9_7F4A_7C15,
            controls: Rc::new(MockControls::default()),
        }
    }

    /// Clone the control handle before moving the device into the driver.
    pub fn controls(&self) -> Rc<MockControls> {
        Rc::clone(&self.controls)
    }

    fn noise_byte(&mut self) -> u8 {
        if self.controls.zero_noise.get() {
            return 0;
        }
        // xorshift64*, high byte
        self.noise_state ^= self.noise_state >> 12;
        self.noise_state ^= self.noise_state << 25;
        self.noise_state ^= self.noise_state >> 27;
        (self.noise_state.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 56) as u8
    }

    fn noise_block(&mut self, len: usize) -> Vec<u8> {
        (0..len).map(|_| self.noise_byte()).collect()
    }

    fn handle_frame(&mut self, frame: &[u8]) {
        let drops = self.controls.drop_requests.get();
        if drops > 0 {
            self.controls.drop_requests.set(drops - 1);
            return;
        }
        if frame.len() == 1 {
            self.handle_unpacked(frame[0]);
            return;
        }
        let header = PacketHeader::decode(frame).expect("mock received a malformed header");
        let payload = &frame[PACKET_HEADER_LEN..];
        assert_eq!(payload.len(), header.payload_size as usize);
        match header.packet_type {
            PacketType::Rsa2048 | PacketType::AltRsa2048 | PacketType::Rsa1024 => {
                self.handle_handshake(&header, payload)
            }
            PacketType::Aes => self.handle_command(&header, payload),
        }
    }

    fn handle_unpacked(&mut self, opcode: u8) {
        assert!(
            matches!(opcode, b'1' | b'2' | b'n' | b'x'),
            "unexpected opcode {opcode:#x}"
        );
        self.controls
            .unpacked_reads
            .set(self.controls.unpacked_reads.get() + 1);
        let mut block = self.noise_block(RND_DATA_BLOCK_LEN);
        block.push(0); // healthy RNG status
        self.rx.extend(block);
    }

    fn handle_handshake(&mut self, header: &PacketHeader, payload: &[u8]) {
        let private = test_keypair();
        let c = BigUint::from_bytes_be(payload);
        let m = c.modpow(private.d(), private.n());
        let mut record = m.to_bytes_be();
        while record.len() < private.size() {
            record.insert(0, 0);
        }
        assert!(record.len() >= SESSION_RECORD_LEN);

        assert_eq!(record[0], 1, "session key type must be aes");
        let key_size = KeySize::from_wire(record[1]).expect("bad session key size");
        let mac_type = MacType::from_wire(record[58]).expect("bad session mac type");
        let token = u64::from_le_bytes(record[34..42].try_into().unwrap());
        let mut aad = [0u8; 16];
        aad.copy_from_slice(&record[42..58]);
        let key = record[2..2 + key_size.byte_len()].to_vec();
        let mac_key_len = match mac_type {
            MacType::None => 32,
            mt => mt.tag_len(),
        };
        let mac_key = record[59..59 + mac_key_len].to_vec();

        // unused key tails must stay zero on the wire
        assert!(record[2 + key_size.byte_len()..34].iter().all(|&b| b == 0));

        if mac_type != MacType::None {
            let expected = mock_hmac(mac_type, &mac_key, &record[..SESSION_MAC_SPAN]);
            assert_eq!(
                &record[SESSION_MAC_SPAN..SESSION_MAC_SPAN + expected.len()],
                &expected[..],
                "session record MAC mismatch"
            );
        }

        self.session = Some(MockSession {
            key_size,
            key,
            aad,
            mac_type,
            mac_key,
        });
        self.controls.handshakes.set(self.controls.handshakes.get() + 1);
        self.respond(token, &[0], &header.iv);
    }

    fn handle_command(&mut self, header: &PacketHeader, payload: &[u8]) {
        let session = self.session.as_ref().expect("command before handshake");
        let mut plain = payload.to_vec();
        if session.key_size != KeySize::None {
            decrypt_in_place(session, &header.iv, &header.tag, &mut plain);
        }

        let mac_type = MacType::from_wire(plain[0]).expect("bad command mac type");
        assert_eq!(mac_type, session.mac_type, "command mac type drifted");
        let cmd_type = u16::from_le_bytes([plain[33], plain[34]]);
        let token = u64::from_le_bytes(plain[35..43].try_into().unwrap());
        let payload_size = u16::from_le_bytes([plain[43], plain[44]]) as usize;

        if mac_type != MacType::None {
            let span = &plain[33..45 + payload_size];
            let expected = mock_hmac(mac_type, &session.mac_key, span);
            assert_eq!(
                &plain[1..1 + expected.len()],
                &expected[..],
                "command MAC mismatch"
            );
        }

        let body = match cmd_type {
            300 | 302 => vec![0u8],
            301 => {
                let mut info = vec![0u8; 32];
                info[0] = 1;
                info[1] = 4;
                info[2..2 + MOCK_DEVICE_ID.len()].copy_from_slice(MOCK_DEVICE_ID.as_bytes());
                info[17..17 + MOCK_DEVICE_MODEL.len()]
                    .copy_from_slice(MOCK_DEVICE_MODEL.as_bytes());
                info
            }
            303 => {
                let mut tables = vec![0u8; FREQUENCY_TABLES_LEN + 1];
                for i in 0..256 {
                    tables[2 * i..2 * i + 2].copy_from_slice(&(1000 + i as u16).to_le_bytes());
                    tables[512 + 2 * i..512 + 2 * i + 2]
                        .copy_from_slice(&(2000 + i as u16).to_le_bytes());
                }
                tables
            }
            304 | 305 | 306 | 308 => {
                let mut block = self.noise_block(RND_DATA_BLOCK_LEN);
                block.push(0);
                block
            }
            307 => {
                let mut block: Vec<u8> = (0..TEST_DATA_BLOCK_LEN).map(|i| i as u8).collect();
                block.push(0);
                block
            }
            other => panic!("mock received unknown command {other}"),
        };
        self.respond(token, &body, &header.iv);
    }

    /// Frame, authenticate, encrypt, and queue one response.
    fn respond(&mut self, token: u64, body: &[u8], iv: &[u8; 12]) {
        let session = self.session.as_ref().expect("responding without a session");

        let mut plain = vec![0u8; RESPONSE_HEADER_LEN + body.len()];
        plain[0] = session.mac_type as u8;
        plain[33..41].copy_from_slice(&token.to_le_bytes());
        plain[41..43].copy_from_slice(&(body.len() as u16).to_le_bytes());
        plain[RESPONSE_HEADER_LEN..].copy_from_slice(body);
        if session.mac_type != MacType::None {
            let tag = mock_hmac(session.mac_type, &session.mac_key, &plain[33..]);
            plain[1..1 + tag.len()].copy_from_slice(&tag);
        }
        if self.controls.corrupt_response_mac.get() {
            plain[1] ^= 0xFF;
        }

        let padded = response_packet_payload_len(body.len(), session.key_size);
        plain.resize(padded, 0);

        let mut tag = [0u8; 16];
        if session.key_size != KeySize::None {
            tag = encrypt_in_place(session, iv, &mut plain);
        }

        let header = PacketHeader {
            packet_type: PacketType::Aes,
            key_size: session.key_size,
            iv: *iv,
            tag,
            payload_size: padded as u16,
        };
        self.rx.extend(header.encode());
        self.rx.extend(plain);
    }
}

impl Default for MockAlphaDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MockAlphaDevice {
    fn scan_devices(&mut self) -> Result<Vec<String>> {
        Ok(vec!["/dev/mockACM0".to_string()])
    }

    fn connect(&mut self, path: &str) -> Result<()> {
        assert_eq!(path, "/dev/mockACM0");
        self.connected = true;
        self.rx.clear();
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        self.connected = false;
        self.session = None;
        self.rx.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        self.handle_frame(data);
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }
        let mut received = 0;
        while received < buf.len() {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[received] = b;
                    received += 1;
                }
                None => break,
            }
        }
        Ok(received)
    }
}

fn mock_hmac(mac_type: MacType, key: &[u8], span: &[u8]) -> Vec<u8> {
    match mac_type {
        MacType::None => Vec::new(),
        MacType::HmacMd5 => {
            let mut mac = <Hmac<md5::Md5> as Mac>::new_from_slice(key).unwrap();
            mac.update(span);
            mac.finalize().into_bytes().to_vec()
        }
        MacType::HmacSha1 => {
            let mut mac = <Hmac<sha1::Sha1> as Mac>::new_from_slice(key).unwrap();
            mac.update(span);
            mac.finalize().into_bytes().to_vec()
        }
        MacType::HmacSha256 => {
            let mut mac = <Hmac<sha2::Sha256> as Mac>::new_from_slice(key).unwrap();
            mac.update(span);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn encrypt_in_place(session: &MockSession, iv: &[u8; 12], buf: &mut [u8]) -> [u8; 16] {
    let nonce = Nonce::from_slice(iv);
    let tag = match session.key_size {
        KeySize::K128 => Aes128Gcm::new_from_slice(&session.key)
            .unwrap()
            .encrypt_in_place_detached(nonce, &session.aad, buf)
            .unwrap(),
        KeySize::K256 => Aes256Gcm::new_from_slice(&session.key)
            .unwrap()
            .encrypt_in_place_detached(nonce, &session.aad, buf)
            .unwrap(),
        KeySize::None => unreachable!(),
    };
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

fn decrypt_in_place(session: &MockSession, iv: &[u8; 12], tag: &[u8; 16], buf: &mut [u8]) {
    let nonce = Nonce::from_slice(iv);
    let tag = Tag::from_slice(tag);
    match session.key_size {
        KeySize::K128 => Aes128Gcm::new_from_slice(&session.key)
            .unwrap()
            .decrypt_in_place_detached(nonce, &session.aad, buf, tag)
            .expect("mock failed to authenticate a command"),
        KeySize::K256 => Aes256Gcm::new_from_slice(&session.key)
            .unwrap()
            .decrypt_in_place_detached(nonce, &session.aad, buf, tag)
            .expect("mock failed to authenticate a command"),
        KeySize::None => unreachable!(),
    }
}
