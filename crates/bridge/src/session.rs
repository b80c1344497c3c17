//! Bridge session
//!
//! Owns one device, one interface claim and one terminal pair for its whole
//! lifetime:
//!
//! ```text
//! Idle --start()--> Running --stop() / peer closed--> Stopping --> Stopped
//! ```
//!
//! The lifecycle is one-way. A stopped (or failed) session cannot be started
//! again; build a new one instead.

use crate::forward::{LoopExit, pty_to_usb, usb_to_pty};
use crate::pty::{OpenPty, TerminalProvisioner};
use crate::usb::{EndpointPair, InterfaceClaim, ResolvedInterface, UsbPort, claim, resolve_port};
use common::{BridgeError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Running,
            2 => SessionState::Stopping,
            _ => SessionState::Stopped,
        }
    }
}

/// Timeouts and buffer sizes used by the forwarding loops
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Bounded wait for each inbound USB read
    pub read_timeout: Duration,
    /// Bounded wait for each outbound USB write
    pub write_timeout: Duration,
    /// Readiness wait on the master descriptor
    pub poll_interval: Duration,
    /// Largest chunk read from the terminal at once
    pub terminal_chunk: usize,
    /// Inbound buffer size when the endpoint reports no max packet size
    pub fallback_packet_size: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(200),
            terminal_chunk: 4096,
            fallback_packet_size: 512,
        }
    }
}

/// State shared with the forwarding threads
struct Inner<P: UsbPort> {
    port: Arc<P>,
    state: AtomicU8,
    stop_flag: Arc<AtomicBool>,
    master: Mutex<Option<Arc<File>>>,
    claim: Mutex<Option<InterfaceClaim>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<P: UsbPort> Inner<P> {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn stop(&self) {
        if !self.transition(SessionState::Running, SessionState::Stopping) {
            // An idle session has nothing to tear down but still may not start
            self.transition(SessionState::Idle, SessionState::Stopped);
            return;
        }

        info!("Stopping bridge session...");
        self.stop_flag.store(true, Ordering::Release);

        // The loops hold their own references and drop them within one
        // poll interval of seeing the flag.
        drop(lock(&self.master).take());

        if let Some(claim) = lock(&self.claim).take() {
            debug!("Releasing interface {}", claim.interface());
            claim.release(&*self.port);
        }

        self.state
            .store(SessionState::Stopped as u8, Ordering::Release);
        info!("Bridge session stopped");
    }
}

/// A USB to pseudo-terminal bridge session
pub struct BridgeSession<P: UsbPort> {
    inner: Arc<Inner<P>>,
    provisioner: Box<dyn TerminalProvisioner>,
    options: SessionOptions,
    resolved: OnceLock<ResolvedInterface>,
    slave_path: OnceLock<PathBuf>,
    workers: Mutex<Vec<JoinHandle<LoopExit>>>,
}

impl<P: UsbPort> BridgeSession<P> {
    /// Create an idle session over an opened device
    pub fn new(port: P) -> Self {
        Self::with_options(port, SessionOptions::default())
    }

    pub fn with_options(port: P, options: SessionOptions) -> Self {
        Self::with_provisioner(port, options, Box::new(OpenPty))
    }

    /// Create a session with a custom terminal source
    pub fn with_provisioner(
        port: P,
        options: SessionOptions,
        provisioner: Box<dyn TerminalProvisioner>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                port: Arc::new(port),
                state: AtomicU8::new(SessionState::Idle as u8),
                stop_flag: Arc::new(AtomicBool::new(false)),
                master: Mutex::new(None),
                claim: Mutex::new(None),
            }),
            provisioner,
            options,
            resolved: OnceLock::new(),
            slave_path: OnceLock::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// The device this session bridges
    pub fn port(&self) -> &P {
        &self.inner.port
    }

    /// Published slave path, once started
    pub fn slave_path(&self) -> Option<&Path> {
        self.slave_path.get().map(PathBuf::as_path)
    }

    /// Resolved endpoints, once started
    pub fn endpoints(&self) -> Option<EndpointPair> {
        self.resolved.get().map(|r| r.endpoints)
    }

    /// Claimed interface number, once started
    pub fn interface(&self) -> Option<u8> {
        self.resolved.get().map(|r| r.number)
    }

    /// Resolve, claim and provision, then start forwarding
    ///
    /// Returns the slave path applications should open. On any failure
    /// nothing stays claimed and the session ends up `Stopped`.
    pub fn start(&mut self) -> Result<PathBuf> {
        if self.state() != SessionState::Idle {
            return Err(BridgeError::SessionNotIdle);
        }

        match self.try_start() {
            Ok(path) => Ok(path),
            Err(e) => {
                error!("Failed to start bridge session: {}", e);
                self.inner
                    .state
                    .store(SessionState::Stopped as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    fn try_start(&mut self) -> Result<PathBuf> {
        let port = &*self.inner.port;

        let resolved = resolve_port(port)?;
        let claim = claim(port, resolved.number)?;

        let pair = match self.provisioner.provision() {
            Ok(pair) => pair,
            Err(e) => {
                claim.release(port);
                return Err(e);
            }
        };

        let master = Arc::new(pair.master);
        *lock(&self.inner.master) = Some(master.clone());
        *lock(&self.inner.claim) = Some(claim);
        let _ = self.resolved.set(resolved);
        let _ = self.slave_path.set(pair.slave_path.clone());

        self.inner
            .state
            .store(SessionState::Running as u8, Ordering::Release);
        info!("PTY slave device: {}", pair.slave_path.display());

        if let Err(e) = self.spawn_workers(resolved.endpoints, master) {
            self.inner.stop();
            return Err(e);
        }

        Ok(pair.slave_path)
    }

    fn spawn_workers(&self, endpoints: EndpointPair, master: Arc<File>) -> Result<()> {
        let mut workers = lock(&self.workers);

        if let Some(inbound) = endpoints.inbound {
            let port = self.inner.port.clone();
            let master = master.clone();
            let stop = self.inner.stop_flag.clone();
            let options = self.options.clone();

            let handle = std::thread::Builder::new()
                .name("usb-to-pty".to_string())
                .spawn(move || {
                    let exit = usb_to_pty(&*port, inbound, &master, &stop, &options);
                    debug!("USB->PTY loop exited: {:?}", exit);
                    exit
                })?;
            workers.push(handle);
        } else {
            info!("No IN endpoint; device to terminal path disabled");
        }

        if endpoints.outbound.is_none() {
            warn!("No OUT endpoint; terminal writes will be discarded");
        }

        let inner = self.inner.clone();
        let options = self.options.clone();
        let handle = std::thread::Builder::new()
            .name("pty-to-usb".to_string())
            .spawn(move || {
                let exit = pty_to_usb(
                    &*inner.port,
                    endpoints.outbound,
                    &master,
                    &inner.stop_flag,
                    &options,
                );
                debug!("PTY->USB loop exited: {:?}", exit);
                drop(master);
                if exit != LoopExit::Stopped {
                    inner.stop();
                }
                exit
            })?;
        workers.push(handle);

        Ok(())
    }

    /// Request shutdown
    ///
    /// Idempotent and non-blocking: sets the stop flag, drops the session's
    /// master descriptor and releases the interface claim. The loops notice
    /// within one timeout interval; use [`BridgeSession::wait`] to join them.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Block until both forwarding loops have exited
    pub fn wait(&self) -> Vec<LoopExit> {
        let workers: Vec<_> = lock(&self.workers).drain(..).collect();
        workers
            .into_iter()
            .filter_map(|handle| match handle.join() {
                Ok(exit) => Some(exit),
                Err(e) => {
                    error!("Forwarding thread panicked: {:?}", e);
                    None
                }
            })
            .collect()
    }
}

impl<P: UsbPort> Drop for BridgeSession<P> {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingPty, MockPort, printer_with, test_options};

    #[test]
    fn test_state_roundtrip() {
        for state in [
            SessionState::Idle,
            SessionState::Running,
            SessionState::Stopping,
            SessionState::Stopped,
        ] {
            assert_eq!(SessionState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_default_options() {
        let options = SessionOptions::default();
        assert_eq!(options.read_timeout, Duration::from_millis(200));
        assert_eq!(options.write_timeout, Duration::from_millis(5000));
        assert_eq!(options.terminal_chunk, 4096);
        assert_eq!(options.fallback_packet_size, 512);
    }

    #[test]
    fn test_stop_before_start_prevents_start() {
        let mut session = BridgeSession::with_options(
            MockPort::new(printer_with(Some(0x81), Some(0x02))),
            test_options(),
        );
        session.stop();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(matches!(session.start(), Err(BridgeError::SessionNotIdle)));
        assert_eq!(session.port().claims(), 0);
    }

    #[test]
    fn test_no_endpoints_leaves_nothing_claimed() {
        let mut session =
            BridgeSession::with_options(MockPort::new(printer_with(None, None)), test_options());

        assert!(matches!(
            session.start(),
            Err(BridgeError::NoEndpointsFound { .. })
        ));
        assert_eq!(session.port().claims(), 0);
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn test_claim_failure_propagates() {
        let port = MockPort::new(printer_with(Some(0x81), Some(0x02)));
        port.fail_claim(rusb::Error::Busy);
        let mut session = BridgeSession::with_options(port, test_options());

        assert!(matches!(
            session.start(),
            Err(BridgeError::InterfaceClaimFailed { interface: 0, .. })
        ));
        assert_eq!(session.port().releases(), 0);
    }

    #[test]
    fn test_provision_failure_releases_claim() {
        let port = MockPort::new(printer_with(Some(0x81), Some(0x02)));
        port.set_kernel_driver(Ok(true));
        let mut session =
            BridgeSession::with_provisioner(port, test_options(), Box::new(FailingPty));

        assert!(matches!(
            session.start(),
            Err(BridgeError::PtyAllocationFailed(_))
        ));
        assert_eq!(session.port().claims(), 1);
        assert_eq!(session.port().releases(), 1);
        assert_eq!(session.port().attaches(), 1);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.slave_path().is_none());

        // A later stop must not release a second time
        let port_releases = session.port().releases();
        session.stop();
        assert_eq!(session.port().releases(), port_releases);
    }
}
