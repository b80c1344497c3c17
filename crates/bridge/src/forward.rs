//! Byte forwarding loops
//!
//! Two independent paths run on their own threads:
//! - USB to terminal: bounded reads from the inbound endpoint, written to the
//!   master descriptor
//! - Terminal to USB: readiness wait on the master descriptor, chunks written
//!   to the outbound endpoint
//!
//! Both check the shared stop flag at least once per timeout interval. The
//! master is non-blocking, so no call on it can outlive the stop signal by
//! more than one poll interval.

use crate::session::SessionOptions;
use crate::usb::{Endpoint, UsbPort};
use common::BridgeError;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Why a forwarding loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Stop flag observed
    Stopped,
    /// Terminal peer closed (zero-byte read)
    PeerClosed,
    /// Master descriptor closed underneath the loop
    DescriptorClosed,
    /// Unrecoverable USB error on the inbound endpoint
    UsbFailed,
    /// Unexpected terminal error
    TerminalFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    Idle,
    HangUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Complete,
    NoPeer,
    Abandoned,
}

fn poll_timeout(interval: Duration) -> PollTimeout {
    let millis = interval.as_millis().min(u16::MAX as u128) as u16;
    PollTimeout::from(millis)
}

fn wait_ready(master: &File, events: PollFlags, interval: Duration) -> io::Result<Readiness> {
    let mut fds = [PollFd::new(master.as_fd(), events)];
    match poll(&mut fds, poll_timeout(interval)) {
        Ok(0) | Err(Errno::EINTR) => return Ok(Readiness::Idle),
        Ok(_) => {}
        Err(errno) => return Err(errno.into()),
    }

    let revents = fds[0].revents().unwrap_or(PollFlags::empty());
    if revents.intersects(events) {
        Ok(Readiness::Ready)
    } else if revents.contains(PollFlags::POLLNVAL) {
        Err(Errno::EBADF.into())
    } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
        Ok(Readiness::HangUp)
    } else {
        Ok(Readiness::Idle)
    }
}

fn is_closed(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::EBADF as i32)
}

/// EIO on a master means no process currently holds the slave open
fn is_no_peer(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::EIO as i32)
}

/// Write a whole packet to the master
///
/// Waits for writability in `interval` slices. Gives up only when the stop
/// flag is set while the terminal buffer is full.
fn write_packet(
    master: &File,
    mut data: &[u8],
    stop: &AtomicBool,
    interval: Duration,
) -> io::Result<WriteOutcome> {
    let mut writer = master;
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if stop.load(Ordering::Acquire) {
                    return Ok(WriteOutcome::Abandoned);
                }
                if wait_ready(master, PollFlags::POLLOUT, interval)? == Readiness::HangUp {
                    return Ok(WriteOutcome::NoPeer);
                }
            }
            Err(e) if is_no_peer(&e) => return Ok(WriteOutcome::NoPeer),
            Err(e) => return Err(e),
        }
    }
    Ok(WriteOutcome::Complete)
}

/// USB to terminal path
pub fn usb_to_pty<P: UsbPort + ?Sized>(
    port: &P,
    endpoint: Endpoint,
    master: &File,
    stop: &AtomicBool,
    options: &SessionOptions,
) -> LoopExit {
    let mut buf = vec![0u8; endpoint.buffer_size(options.fallback_packet_size)];
    debug!(
        "USB->PTY loop started on endpoint {:#04x} ({} byte buffer)",
        endpoint.address,
        buf.len()
    );

    while !stop.load(Ordering::Acquire) {
        let len = match port.read(&endpoint, &mut buf, options.read_timeout) {
            Ok(0) => continue,
            Ok(len) => len,
            Err(rusb::Error::Timeout) | Err(rusb::Error::Interrupted) => continue,
            Err(e) => {
                let err = BridgeError::from_transfer(endpoint.address, e);
                error!("USB read failed, device to terminal path ends: {}", err);
                return LoopExit::UsbFailed;
            }
        };

        match write_packet(master, &buf[..len], stop, options.poll_interval) {
            Ok(WriteOutcome::Complete) => debug!("USB->PTY {} bytes", len),
            Ok(WriteOutcome::NoPeer) => {
                debug!("No terminal peer attached, dropped {} bytes", len)
            }
            Ok(WriteOutcome::Abandoned) => {
                warn!("Terminal buffer full at shutdown, dropped {} bytes", len);
                return LoopExit::Stopped;
            }
            Err(e) if is_closed(&e) => return LoopExit::DescriptorClosed,
            Err(e) => {
                warn!("Terminal write failed: {}", e);
                return LoopExit::TerminalFailed;
            }
        }
    }

    LoopExit::Stopped
}

/// Terminal to USB path
///
/// Bytes are discarded with a warning when there is no outbound endpoint.
pub fn pty_to_usb<P: UsbPort + ?Sized>(
    port: &P,
    outbound: Option<Endpoint>,
    master: &File,
    stop: &AtomicBool,
    options: &SessionOptions,
) -> LoopExit {
    let mut buf = vec![0u8; options.terminal_chunk];
    let mut reader = master;
    debug!("PTY->USB loop started");

    while !stop.load(Ordering::Acquire) {
        match wait_ready(master, PollFlags::POLLIN, options.poll_interval) {
            Ok(Readiness::Ready) => {}
            Ok(Readiness::Idle) => continue,
            Ok(Readiness::HangUp) => {
                std::thread::sleep(options.poll_interval);
                continue;
            }
            Err(e) if is_closed(&e) => return LoopExit::DescriptorClosed,
            Err(e) => {
                warn!("Terminal poll failed: {}", e);
                return LoopExit::TerminalFailed;
            }
        }

        let len = match reader.read(&mut buf) {
            Ok(0) => {
                debug!("Terminal peer closed");
                return LoopExit::PeerClosed;
            }
            Ok(len) => len,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(e) if is_no_peer(&e) => {
                std::thread::sleep(options.poll_interval);
                continue;
            }
            Err(e) if is_closed(&e) => return LoopExit::DescriptorClosed,
            Err(e) => {
                warn!("Terminal read failed: {}", e);
                return LoopExit::TerminalFailed;
            }
        };

        let Some(endpoint) = outbound else {
            warn!(
                "Application wrote {} bytes but there is no OUT endpoint; discarding",
                len
            );
            continue;
        };

        match port.write(&endpoint, &buf[..len], options.write_timeout) {
            Ok(written) if written < len => {
                warn!("Short USB write: {} of {} bytes", written, len)
            }
            Ok(_) => debug!("PTY->USB {} bytes", len),
            Err(e) => {
                let err = BridgeError::from_transfer(endpoint.address, e);
                warn!("USB write failed: {}", err);
            }
        }
    }

    LoopExit::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::{OpenPty, TerminalProvisioner};
    use crate::test_utils::{MockPort, open_slave, printer_with, read_exact_timeout, test_options};
    use crate::usb::TransferKind;
    use std::sync::Arc;
    use std::thread;

    fn endpoint(address: u8) -> Endpoint {
        Endpoint {
            address,
            max_packet_size: 64,
            kind: TransferKind::Bulk,
        }
    }

    #[test]
    fn test_usb_to_pty_stops_on_flag() {
        let port = MockPort::new(printer_with(Some(0x81), None));
        let pair = OpenPty.provision().unwrap();
        let stop = AtomicBool::new(true);

        let exit = usb_to_pty(&port, endpoint(0x81), &pair.master, &stop, &test_options());
        assert_eq!(exit, LoopExit::Stopped);
        assert_eq!(port.reads(), 0);
    }

    #[test]
    fn test_usb_to_pty_ends_on_transfer_error() {
        let port = MockPort::new(printer_with(Some(0x81), None));
        port.push_read_error(rusb::Error::NoDevice);
        let pair = OpenPty.provision().unwrap();
        let stop = AtomicBool::new(false);

        let exit = usb_to_pty(&port, endpoint(0x81), &pair.master, &stop, &test_options());
        assert_eq!(exit, LoopExit::UsbFailed);
    }

    #[test]
    fn test_usb_to_pty_retries_timeouts() {
        let port = MockPort::new(printer_with(Some(0x81), None));
        port.push_read_error(rusb::Error::Timeout);
        port.push_read_error(rusb::Error::Timeout);
        port.push_read(b"ok".to_vec());
        port.push_read_error(rusb::Error::Pipe);

        let pair = OpenPty.provision().unwrap();
        let mut slave = open_slave(&pair.slave_path);
        let stop = AtomicBool::new(false);

        let exit = usb_to_pty(&port, endpoint(0x81), &pair.master, &stop, &test_options());
        assert_eq!(exit, LoopExit::UsbFailed);
        assert_eq!(port.reads(), 4);
        assert_eq!(
            read_exact_timeout(&mut slave, 2, Duration::from_secs(2)),
            b"ok".to_vec()
        );
    }

    #[test]
    fn test_pty_to_usb_discards_without_outbound() {
        let port = Arc::new(MockPort::new(printer_with(Some(0x81), None)));
        let pair = OpenPty.provision().unwrap();
        let mut slave = open_slave(&pair.slave_path);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let port = port.clone();
            let stop = stop.clone();
            let master = pair.master.try_clone().unwrap();
            thread::spawn(move || pty_to_usb(&*port, None, &master, &stop, &test_options()))
        };

        slave.write_all(b"nowhere to go").unwrap();
        thread::sleep(Duration::from_millis(100));
        stop.store(true, Ordering::Release);

        assert_eq!(worker.join().unwrap(), LoopExit::Stopped);
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_pty_to_usb_continues_after_write_error() {
        let port = Arc::new(MockPort::new(printer_with(None, Some(0x02))));
        port.fail_next_write(rusb::Error::Pipe);
        let pair = OpenPty.provision().unwrap();
        let mut slave = open_slave(&pair.slave_path);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let port = port.clone();
            let stop = stop.clone();
            let master = pair.master.try_clone().unwrap();
            thread::spawn(move || {
                pty_to_usb(&*port, Some(endpoint(0x02)), &master, &stop, &test_options())
            })
        };

        slave.write_all(b"first").unwrap();
        assert!(port.wait_for_write_attempts(1, Duration::from_secs(2)));
        slave.write_all(b"second").unwrap();
        assert!(port.wait_for_written_bytes(6, Duration::from_secs(2)));
        stop.store(true, Ordering::Release);

        assert_eq!(worker.join().unwrap(), LoopExit::Stopped);
        assert_eq!(port.written().concat(), b"second".to_vec());
    }
}
