//! Bridge configuration management

use anyhow::{Context, Result, anyhow};
use bridge::SessionOptions;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge: BridgeSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    /// Where the values came from, reported once logging is up
    #[serde(skip)]
    pub source: ConfigSource,
}

/// Origin of a loaded configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConfigSource {
    /// Built-in defaults, no file involved
    #[default]
    Defaults,
    /// Parsed from this file
    File(PathBuf),
    /// Defaults used because loading failed for this reason
    Fallback(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Vendor ID in `0x` hex form; omit to scan for a printer
    #[serde(default)]
    pub vendor_id: Option<String>,
    /// Product ID in `0x` hex form
    #[serde(default)]
    pub product_id: Option<String>,
    /// Bounded wait for each inbound USB read
    #[serde(default = "UsbSettings::default_read_timeout")]
    pub read_timeout_ms: u64,
    /// Bounded wait for each outbound USB write
    #[serde(default = "UsbSettings::default_write_timeout")]
    pub write_timeout_ms: u64,
    /// Terminal readiness wait, also the shutdown latency
    #[serde(default = "UsbSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            vendor_id: None,
            product_id: None,
            read_timeout_ms: Self::default_read_timeout(),
            write_timeout_ms: Self::default_write_timeout(),
            poll_interval_ms: Self::default_poll_interval(),
        }
    }
}

impl UsbSettings {
    fn default_read_timeout() -> u64 {
        200
    }

    fn default_write_timeout() -> u64 {
        5000
    }

    fn default_poll_interval() -> u64 {
        200
    }

    pub fn vendor_id(&self) -> Option<u16> {
        self.vendor_id.as_deref().and_then(parse_hex_id)
    }

    pub fn product_id(&self) -> Option<u16> {
        self.product_id.as_deref().and_then(parse_hex_id)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeSettings {
                log_level: "info".to_string(),
            },
            usb: UsbSettings::default(),
            source: ConfigSource::Defaults,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            Self::find_existing().ok_or_else(|| anyhow!("No configuration file found"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        config.source = ConfigSource::File(config_path);
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    ///
    /// Runs before logging is set up, so the outcome is kept in `source`.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::find_existing() else {
            return Self::default();
        };

        match Self::load(Some(path)) {
            Ok(config) => config,
            Err(e) => Self {
                source: ConfigSource::Fallback(format!("{:#}", e)),
                ..Self::default()
            },
        }
    }

    /// First configuration file present in the standard locations
    fn find_existing() -> Option<PathBuf> {
        let candidates = vec![
            Self::default_path(),
            PathBuf::from("/etc/usb-pty-bridge/bridge.toml"),
        ];

        candidates.into_iter().find(|p| p.exists())
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-pty-bridge").join("bridge.toml")
        } else {
            PathBuf::from(".config/usb-pty-bridge/bridge.toml")
        }
    }

    /// Timeouts for the forwarding loops
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_timeout: Duration::from_millis(self.usb.read_timeout_ms),
            write_timeout: Duration::from_millis(self.usb.write_timeout_ms),
            poll_interval: Duration::from_millis(self.usb.poll_interval_ms),
            ..SessionOptions::default()
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.bridge.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.bridge.log_level,
                valid_levels.join(", ")
            ));
        }

        if let Some(vid) = &self.usb.vendor_id {
            Self::validate_hex_id(vid, "VID")?;
        }
        if let Some(pid) = &self.usb.product_id {
            Self::validate_hex_id(pid, "PID")?;
        }

        let timeouts = [
            ("read_timeout_ms", self.usb.read_timeout_ms),
            ("write_timeout_ms", self.usb.write_timeout_ms),
            ("poll_interval_ms", self.usb.poll_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(anyhow!("Invalid {} '0', must be greater than 0", name));
            }
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x04b8')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}

fn parse_hex_id(id: &str) -> Option<u16> {
    let hex = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X"))?;
    u16::from_str_radix(hex, 16).ok()
}

/// Expand `~` in a user-supplied config path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
