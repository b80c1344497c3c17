//! Pseudo-terminal provisioning
//!
//! Allocates the master/slave pair the bridge relays through. Only the slave
//! *path* leaves this module; the slave descriptor itself is closed before
//! [`TerminalProvisioner::provision`] returns.

use common::{BridgeError, Result};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{OpenptyResult, openpty};
use nix::sys::termios::{SetArg, cfmakeraw, tcgetattr, tcsetattr};
use nix::unistd::ttyname;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use tracing::debug;

/// Master side of the terminal plus the published slave path
#[derive(Debug)]
pub struct TerminalPair {
    /// Non-blocking master descriptor
    pub master: File,
    /// Path applications open to talk to the device
    pub slave_path: PathBuf,
}

/// Source of terminal pairs for a session
pub trait TerminalProvisioner: Send + Sync {
    fn provision(&self) -> Result<TerminalPair>;
}

/// Provisioner backed by the OS `openpty`
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenPty;

impl TerminalProvisioner for OpenPty {
    fn provision(&self) -> Result<TerminalPair> {
        let OpenptyResult { master, slave } = openpty(None, None).map_err(pty_error)?;

        // Relay bytes untouched: no echo, no CR/LF translation, no signals
        let mut termios = tcgetattr(&slave).map_err(pty_error)?;
        cfmakeraw(&mut termios);
        tcsetattr(&slave, SetArg::TCSANOW, &termios).map_err(pty_error)?;

        let slave_path = ttyname(&slave).map_err(pty_error)?;
        drop(slave);

        set_nonblocking(&master)?;

        debug!("Allocated pseudo-terminal {}", slave_path.display());
        Ok(TerminalPair {
            master: File::from(master),
            slave_path,
        })
    }
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(pty_error)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(pty_error)?;
    Ok(())
}

fn pty_error(errno: nix::Error) -> BridgeError {
    BridgeError::PtyAllocationFailed(std::io::Error::from(errno))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::open_slave;
    use std::io::{Read, Write};

    #[test]
    fn test_provision_publishes_slave_path() {
        let pair = OpenPty.provision().unwrap();
        assert!(pair.slave_path.starts_with("/dev"));
        assert!(pair.slave_path.exists());
    }

    #[test]
    fn test_master_is_nonblocking() {
        let pair = OpenPty.provision().unwrap();
        let mut master = &pair.master;
        let mut buf = [0u8; 16];

        // Nothing written and no slave holder: must not block
        match master.read(&mut buf) {
            Ok(n) => panic!("unexpected {} bytes", n),
            Err(e) => assert!(
                e.kind() == std::io::ErrorKind::WouldBlock
                    || e.raw_os_error() == Some(nix::errno::Errno::EIO as i32),
                "unexpected error: {}",
                e
            ),
        }
    }

    #[test]
    fn test_raw_mode_passes_bytes_unchanged() {
        let pair = OpenPty.provision().unwrap();
        let mut slave = open_slave(&pair.slave_path);

        slave.write_all(b"line\n\x03\r").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));

        let mut master = &pair.master;
        let mut buf = [0u8; 16];
        let n = master.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"line\n\x03\r");
    }
}
