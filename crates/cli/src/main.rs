//! usb-pty-bridge
//!
//! Exposes a USB printer (or any device with bulk/interrupt endpoints) as a
//! pseudo-terminal so serial-oriented applications can talk to it.

mod config;

use anyhow::{Context, Result};
use bridge::BridgeSession;
use bridge::usb::{list_devices, locator, open_device, usb_context};
use clap::Parser;
use common::error::{EXIT_OK, EXIT_START_FAILED};
use common::logging::effective_level;
use common::{BridgeError, setup_logging};
use config::{BridgeConfig, ConfigSource};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{Signal, SignalKind, signal as unix_signal};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-pty-bridge")]
#[command(
    author,
    version,
    about = "Bridge a USB printer to a pseudo-terminal"
)]
#[command(long_about = "
Claims a USB device's printer interface and relays bytes between its
bulk/interrupt endpoints and a freshly allocated pseudo-terminal.
The slave path is printed on startup; point your application at it.

EXAMPLES:
    # Bridge the first attached printer
    usb-pty-bridge

    # Bridge a specific device
    usb-pty-bridge --vid 0x04b8 --pid 0x0202

    # List attached USB devices and exit
    usb-pty-bridge --list

CONFIGURATION:
    The bridge looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-pty-bridge/bridge.toml
    3. /etc/usb-pty-bridge/bridge.toml
    4. Built-in defaults

EXIT CODES:
    0  Clean shutdown
    1  USB backend unavailable
    2  No matching USB device
    3  Bridge failed to start
")]
struct Args {
    /// USB vendor ID (e.g. 0x04b8)
    #[arg(long, value_name = "ID", value_parser = parse_id)]
    vid: Option<u16>,

    /// USB product ID (e.g. 0x0202)
    #[arg(long, value_name = "ID", value_parser = parse_id)]
    pid: Option<u16>,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List USB devices and exit
    #[arg(long)]
    list: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    debug: bool,
}

/// Parse a USB ID with an optional `0x`, `0o` or `0b` radix prefix
fn parse_id(s: &str) -> std::result::Result<u16, String> {
    let s = s.trim();
    let (digits, radix) = match s.get(..2).map(str::to_ascii_lowercase).as_deref() {
        Some("0x") => (&s[2..], 16),
        Some("0o") => (&s[2..], 8),
        Some("0b") => (&s[2..], 2),
        _ => (s, 10),
    };

    let digits = digits.replace('_', "");
    if digits.is_empty() {
        return Err(format!("'{}' is not a valid USB ID", s));
    }
    u16::from_str_radix(&digits, radix)
        .map_err(|e| format!("'{}' is not a valid USB ID: {}", s, e))
}

/// SIGINT and SIGTERM streams
///
/// Once installed, either signal is queued for [`ShutdownSignals::recv`]
/// instead of killing the process.
struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: unix_signal(SignalKind::interrupt())
                .context("Failed to install SIGINT handler")?,
            terminate: unix_signal(SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?,
        })
    }

    /// Wait for either signal and return its name
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Exit code for a failure, taken from the bridge error when there is one
fn failure_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<BridgeError>()
        .map(BridgeError::exit_code)
        .unwrap_or(EXIT_START_FAILED)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => exit_code(EXIT_OK),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            if matches!(
                e.downcast_ref::<BridgeError>(),
                Some(BridgeError::DeviceNotFound { .. })
            ) {
                eprintln!("Check `lsusb` for the device, or pass --vid and --pid explicitly.");
            }
            exit_code(failure_code(&e))
        }
    }
}

async fn run(args: Args) -> Result<()> {
    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = BridgeConfig::default();
        let path = BridgeConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        BridgeConfig::load(Some(config::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        BridgeConfig::load_or_default()
    };

    let log_level = effective_level(
        args.debug,
        args.log_level.as_deref(),
        &config.bridge.log_level,
    );
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-pty-bridge v{}", env!("CARGO_PKG_VERSION"));
    debug!("Log level: {}", log_level);
    match &config.source {
        ConfigSource::File(path) => info!("Loaded configuration from: {}", path.display()),
        ConfigSource::Fallback(reason) => warn!("{}, using defaults", reason),
        ConfigSource::Defaults => debug!("No configuration file found, using defaults"),
    }

    let context = usb_context()?;

    if args.list {
        return list_devices_mode(&context);
    }

    // CLI flags override the config file
    let vendor_id = args.vid.or_else(|| config.usb.vendor_id());
    let product_id = args.pid.or_else(|| config.usb.product_id());

    // Signals are caught from here on, before anything is claimed
    let signals = ShutdownSignals::install()?;

    let handle = open_device(&context, vendor_id, product_id)?;
    locator::ensure_configured(&handle);

    let mut session = BridgeSession::with_options(handle, config.session_options());
    let slave_path = session.start().context("Failed to start bridge")?;
    println!("PTY slave device: {}", slave_path.display());
    if let Some(interface) = session.interface() {
        info!("Bridging interface {}", interface);
    }

    run_until_shutdown(Arc::new(session), signals).await
}

/// List USB devices and exit
fn list_devices_mode(context: &rusb::Context) -> Result<()> {
    let devices = list_devices(context)?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  Bus {:03} Device {:03}: {:04x}:{:04x}{}",
            device.bus_number,
            device.address,
            device.vendor_id,
            device.product_id,
            if device.is_printer { " [printer]" } else { "" }
        );
    }
    Ok(())
}

/// Relay until a signal arrives or the terminal side ends the session
async fn run_until_shutdown<P: bridge::UsbPort>(
    session: Arc<BridgeSession<P>>,
    mut signals: ShutdownSignals,
) -> Result<()> {
    let mut waiter = {
        let session = Arc::clone(&session);
        tokio::task::spawn_blocking(move || session.wait())
    };

    info!("Press Ctrl+C to shutdown");

    tokio::select! {
        name = signals.recv() => info!("Received {}, shutting down gracefully...", name),
        exits = &mut waiter => {
            debug!("Forwarding threads exited: {:?}", exits);
            session.stop();
            info!("Bridge closed");
            return Ok(());
        }
    }

    session.stop();
    match waiter.await {
        Ok(exits) => debug!("Forwarding threads exited: {:?}", exits),
        Err(e) => error!("Forwarding threads did not shut down cleanly: {}", e),
    }

    info!("Bridge shutdown complete");
    Ok(())
}
