//! Test utilities for usb-pty-bridge
//!
//! Provides a scripted [`UsbPort`] mock, terminal provisioners for failure and
//! inspection scenarios, and helpers for talking to the slave side of a
//! pseudo-terminal with a deadline.
//!
//! # Example
//!
//! ```
//! use bridge::test_utils::{MockPort, printer_with};
//!
//! let port = MockPort::new(printer_with(Some(0x81), Some(0x02)));
//! port.push_read(b"status".to_vec());
//! assert_eq!(port.reads(), 0);
//! ```

use crate::pty::{OpenPty, TerminalPair, TerminalProvisioner};
use crate::session::SessionOptions;
use crate::usb::{Endpoint, EndpointInfo, InterfaceInfo, PRINTER_CLASS, UsbPort};
use common::{BridgeError, Result};
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Session options with short timeouts so tests stop quickly
pub fn test_options() -> SessionOptions {
    SessionOptions {
        read_timeout: Duration::from_millis(20),
        write_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(20),
        ..SessionOptions::default()
    }
}

/// A single printer-class interface 0 with the given endpoint addresses
///
/// Pass the full address (`0x81` for IN, `0x02` for OUT).
pub fn printer_with(inbound: Option<u8>, outbound: Option<u8>) -> Vec<InterfaceInfo> {
    let endpoints = inbound
        .into_iter()
        .chain(outbound)
        .map(|address| EndpointInfo {
            address,
            max_packet_size: 64,
            transfer_type: rusb::TransferType::Bulk,
        })
        .collect();

    vec![InterfaceInfo {
        number: 0,
        alt_setting: 0,
        class_code: PRINTER_CLASS,
        endpoints,
    }]
}

#[derive(Default)]
struct MockState {
    kernel_driver: Option<std::result::Result<bool, rusb::Error>>,
    detach_error: Option<rusb::Error>,
    attach_error: Option<rusb::Error>,
    claim_error: Option<rusb::Error>,
    release_error: Option<rusb::Error>,
    read_script: VecDeque<std::result::Result<Vec<u8>, rusb::Error>>,
    write_errors: VecDeque<rusb::Error>,
    written: Vec<Vec<u8>>,
    reads: usize,
    packets_served: usize,
    write_attempts: usize,
    claims: usize,
    releases: usize,
    detaches: usize,
    attaches: usize,
}

/// Scripted USB device
///
/// Reads replay queued packets and errors in order, then time out. Writes
/// are recorded. Every claim-related call is counted.
pub struct MockPort {
    interfaces: Vec<InterfaceInfo>,
    state: Mutex<MockState>,
}

impl MockPort {
    pub fn new(interfaces: Vec<InterfaceInfo>) -> Self {
        Self {
            interfaces,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Result of the kernel driver query (default `Ok(false)`)
    pub fn set_kernel_driver(&self, result: std::result::Result<bool, rusb::Error>) {
        self.state().kernel_driver = Some(result);
    }

    pub fn fail_detach(&self, err: rusb::Error) {
        self.state().detach_error = Some(err);
    }

    pub fn fail_attach(&self, err: rusb::Error) {
        self.state().attach_error = Some(err);
    }

    pub fn fail_claim(&self, err: rusb::Error) {
        self.state().claim_error = Some(err);
    }

    pub fn fail_release(&self, err: rusb::Error) {
        self.state().release_error = Some(err);
    }

    pub fn fail_next_write(&self, err: rusb::Error) {
        self.state().write_errors.push_back(err);
    }

    /// Queue a packet for the inbound endpoint
    pub fn push_read(&self, packet: Vec<u8>) {
        self.state().read_script.push_back(Ok(packet));
    }

    pub fn push_read_error(&self, err: rusb::Error) {
        self.state().read_script.push_back(Err(err));
    }

    /// Every read call, including timeouts
    pub fn reads(&self) -> usize {
        self.state().reads
    }

    /// Read calls that returned a packet
    pub fn packets_served(&self) -> usize {
        self.state().packets_served
    }

    /// Successful writes, one entry per write call
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state().written.clone()
    }

    pub fn write_attempts(&self) -> usize {
        self.state().write_attempts
    }

    pub fn claims(&self) -> usize {
        self.state().claims
    }

    pub fn releases(&self) -> usize {
        self.state().releases
    }

    pub fn detaches(&self) -> usize {
        self.state().detaches
    }

    pub fn attaches(&self) -> usize {
        self.state().attaches
    }

    /// Poll until `check` holds or the timeout expires
    fn wait_until(&self, timeout: Duration, check: impl Fn(&MockState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if check(&*self.state()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    pub fn wait_for_write_attempts(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.write_attempts >= count)
    }

    pub fn wait_for_written_bytes(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| {
            s.written.iter().map(Vec::len).sum::<usize>() >= count
        })
    }

    pub fn wait_for_packets_served(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, |s| s.packets_served >= count)
    }
}

impl UsbPort for MockPort {
    fn active_interfaces(&self) -> std::result::Result<Vec<InterfaceInfo>, rusb::Error> {
        Ok(self.interfaces.clone())
    }

    fn kernel_driver_active(&self, _interface: u8) -> std::result::Result<bool, rusb::Error> {
        self.state().kernel_driver.unwrap_or(Ok(false))
    }

    fn detach_kernel_driver(&self, _interface: u8) -> std::result::Result<(), rusb::Error> {
        let mut state = self.state();
        state.detaches += 1;
        state.detach_error.map_or(Ok(()), Err)
    }

    fn attach_kernel_driver(&self, _interface: u8) -> std::result::Result<(), rusb::Error> {
        let mut state = self.state();
        state.attaches += 1;
        state.attach_error.map_or(Ok(()), Err)
    }

    fn claim_interface(&self, _interface: u8) -> std::result::Result<(), rusb::Error> {
        let mut state = self.state();
        state.claims += 1;
        state.claim_error.map_or(Ok(()), Err)
    }

    fn release_interface(&self, _interface: u8) -> std::result::Result<(), rusb::Error> {
        let mut state = self.state();
        state.releases += 1;
        state.release_error.map_or(Ok(()), Err)
    }

    fn read(
        &self,
        _endpoint: &Endpoint,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error> {
        let next = {
            let mut state = self.state();
            state.reads += 1;
            state.read_script.pop_front()
        };

        match next {
            Some(Ok(packet)) => {
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                self.state().packets_served += 1;
                Ok(len)
            }
            Some(Err(e)) => Err(e),
            None => {
                std::thread::sleep(timeout.min(Duration::from_millis(5)));
                Err(rusb::Error::Timeout)
            }
        }
    }

    fn write(
        &self,
        _endpoint: &Endpoint,
        data: &[u8],
        _timeout: Duration,
    ) -> std::result::Result<usize, rusb::Error> {
        let mut state = self.state();
        state.write_attempts += 1;
        if let Some(err) = state.write_errors.pop_front() {
            return Err(err);
        }
        state.written.push(data.to_vec());
        Ok(data.len())
    }
}

/// Provisioner that always fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingPty;

impl TerminalProvisioner for FailingPty {
    fn provision(&self) -> Result<TerminalPair> {
        Err(BridgeError::PtyAllocationFailed(std::io::Error::other(
            "no pseudo-terminals left",
        )))
    }
}

/// Provisioner that keeps a duplicate of the master descriptor
///
/// The duplicate keeps the terminal alive after the session drops its own
/// references, so data already written can still be read from the slave.
#[derive(Default)]
pub struct RetainingPty {
    retained: Mutex<Option<File>>,
}

impl RetainingPty {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TerminalProvisioner for RetainingPty {
    fn provision(&self) -> Result<TerminalPair> {
        let pair = OpenPty.provision()?;
        let duplicate = pair.master.try_clone()?;
        *self.retained.lock().unwrap_or_else(|p| p.into_inner()) = Some(duplicate);
        Ok(pair)
    }
}

/// Open the slave side the way an application would
pub fn open_slave(path: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(OFlag::O_NOCTTY.bits())
        .open(path)
        .expect("Failed to open pseudo-terminal slave")
}

/// Read up to `len` bytes, giving up at the deadline
///
/// Returns what arrived; also stops early on end-of-file or error.
pub fn read_exact_timeout(file: &mut File, len: usize, timeout: Duration) -> Vec<u8> {
    let deadline = Instant::now() + timeout;
    let mut out = Vec::with_capacity(len);
    let mut buf = [0u8; 4096];

    while out.len() < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let millis = remaining.as_millis().min(u16::MAX as u128) as u16;
        let ready = {
            let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
            poll(&mut fds, PollTimeout::from(millis)).unwrap_or(0)
        };
        if ready == 0 {
            continue;
        }
        let want = (len - out.len()).min(buf.len());
        match file.read(&mut buf[..want]) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}
