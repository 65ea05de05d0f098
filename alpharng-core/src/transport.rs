// SPDX-License-Identifier: MIT
//
// AlphaRNG Host Bridge
// Secure driver for AlphaRNG USB true random number generators

//! Byte-level transport to the device
//!
//! The AlphaRNG enumerates as a USB CDC terminal device. [`UsbSerialPort`]
//! opens it uncooked (no echo, no newline translation, no signals), holds an
//! exclusive `flock` so two processes cannot interleave packets, and reads
//! with a millisecond deadline expressed through `VMIN`/`VTIME`.
//!
//! The [`Transport`] trait is the seam the rest of the driver talks through;
//! tests substitute an in-process mock device behind it.

use crate::error::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Full-duplex byte link to an AlphaRNG device. No framing, no retries.
pub trait Transport {
    /// List device paths for all attached AlphaRNG devices, stable order.
    fn scan_devices(&mut self) -> Result<Vec<String>>;

    /// Open and lock the device at `path`, leaving the line uncooked.
    fn connect(&mut self, path: &str) -> Result<()>;

    /// Close the device and release the lock.
    fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Set the per-read deadline.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Write all of `data`; partial writes surface as I/O errors.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Read into `buf` until it is full or the deadline passes. Returns the
    /// number of bytes read; fewer than `buf.len()` means the deadline hit.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize>;
}

#[cfg(unix)]
pub use posix::UsbSerialPort;

#[cfg(unix)]
mod posix {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;

    const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

    /// POSIX serial transport over `/dev/ttyACM*` (Linux) or
    /// `/dev/cu.usbmodem*` (macOS).
    pub struct UsbSerialPort {
        file: Option<File>,
        timeout: Duration,
    }

    impl UsbSerialPort {
        pub fn new() -> Self {
            Self {
                file: None,
                timeout: DEFAULT_TIMEOUT,
            }
        }

        fn file(&mut self) -> Result<&mut File> {
            self.file.as_mut().ok_or(Error::NotConnected)
        }

        /// Apply raw line discipline and the current timeout to the open fd.
        fn configure_line(&mut self, timeout: Duration) -> Result<()> {
            let fd = self.file()?.as_raw_fd();
            let mut tio = std::mem::MaybeUninit::<libc::termios>::uninit();
            if unsafe { libc::tcgetattr(fd, tio.as_mut_ptr()) } != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let mut tio = unsafe { tio.assume_init() };

            tio.c_lflag &=
                !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::ISIG | libc::IEXTEN);
            tio.c_iflag &=
                !(libc::INLCR | libc::IGNCR | libc::ICRNL | libc::IXON | libc::IXOFF);
            tio.c_oflag &= !(libc::ONLCR | libc::OCRNL);

            // VTIME is in deciseconds; anything under 100 ms rounds up to one
            let millis = timeout.as_millis() as u64;
            let vtime = if millis < 100 { 1 } else { millis / 100 };
            tio.c_cc[libc::VMIN] = 0;
            tio.c_cc[libc::VTIME] = vtime.min(255) as libc::cc_t;

            if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        }
    }

    impl Default for UsbSerialPort {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Transport for UsbSerialPort {
        #[cfg(target_os = "linux")]
        fn scan_devices(&mut self) -> Result<Vec<String>> {
            // USB CDC devices show up under /dev/serial/by-id as symlinks to
            // the underlying ttyACM node
            let mut devices = Vec::new();
            let entries = match std::fs::read_dir("/dev/serial/by-id") {
                Ok(entries) => entries,
                Err(_) => return Ok(devices),
            };
            for entry in entries.flatten() {
                if !entry.file_name().to_string_lossy().contains("TectroLabs_Alpha_RNG") {
                    continue;
                }
                let Ok(target) = std::fs::canonicalize(entry.path()) else {
                    continue;
                };
                let target = target.to_string_lossy().to_string();
                if target.contains("ttyACM") {
                    devices.push(target);
                }
            }
            devices.sort();
            Ok(devices)
        }

        #[cfg(target_os = "macos")]
        fn scan_devices(&mut self) -> Result<Vec<String>> {
            let mut devices = Vec::new();
            let entries = match std::fs::read_dir("/dev") {
                Ok(entries) => entries,
                Err(_) => return Ok(devices),
            };
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with("cu.usbmodemALPHARNG") || name.starts_with("cu.usbmodemFD") {
                    devices.push(format!("/dev/{name}"));
                }
            }
            devices.sort();
            Ok(devices)
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        fn scan_devices(&mut self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn connect(&mut self, path: &str) -> Result<()> {
            if self.is_connected() {
                return Err(Error::Config(format!(
                    "transport already connected, cannot open {path}"
                )));
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NOCTTY)
                .open(path)?;
            let fd = file.as_raw_fd();

            // exclusive, non-blocking: a second process gets an error instead
            // of a hung open
            if unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) } != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }

            // discard anything a previous session left in the buffers
            unsafe { libc::tcflush(fd, libc::TCIOFLUSH) };

            self.file = Some(file);
            if let Err(e) = self.configure_line(self.timeout) {
                self.file = None;
                return Err(e);
            }
            debug!(path, "serial device opened");
            Ok(())
        }

        fn disconnect(&mut self) -> Result<()> {
            let file = self.file.take().ok_or(Error::NotConnected)?;
            unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
            drop(file);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.file.is_some()
        }

        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout;
            if self.file.is_some() {
                self.configure_line(timeout)?;
            }
            Ok(())
        }

        fn send(&mut self, data: &[u8]) -> Result<()> {
            let file = self.file()?;
            file.write_all(data)?;
            Ok(())
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<usize> {
            let file = self.file()?;
            let mut received = 0;
            while received < buf.len() {
                let n = file.read(&mut buf[received..])?;
                if n == 0 {
                    // VTIME deadline expired with the line idle
                    break;
                }
                received += n;
            }
            Ok(received)
        }
    }

    impl Drop for UsbSerialPort {
        fn drop(&mut self) {
            if self.is_connected() {
                let _ = self.disconnect();
            }
        }
    }
}
