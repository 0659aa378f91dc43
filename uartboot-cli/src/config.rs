//! Configuration file support for uartboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (UARTBOOT_*)
//! 3. Local config file (./uartboot.toml)
//! 4. Global config file (~/.config/uartboot/config.toml)
//!
//! ```toml
//! [connection]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//! timeout_ms = 1000
//!
//! [[connection.usb_device]]
//! vid = 0x1A86
//! pid = 0x7523
//!
//! [flash]
//! address = 0x08008000
//! verify = true
//! ```

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "uartboot.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Base read timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// Adapters selected automatically when they are the only candidate.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usb_device: Vec<UsbDevice>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Default flash address.
    pub address: Option<u32>,
    /// Verify every flash write by default.
    #[serde(default)]
    pub verify: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "uartboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        let connection = other.connection;
        if connection.port.is_some() {
            self.connection.port = connection.port;
        }
        if connection.baud.is_some() {
            self.connection.baud = connection.baud;
        }
        if connection.timeout_ms.is_some() {
            self.connection.timeout_ms = connection.timeout_ms;
        }
        for device in connection.usb_device {
            if !self.connection.usb_device.contains(&device) {
                self.connection.usb_device.push(device);
            }
        }

        if other.flash.address.is_some() {
            self.flash.address = other.flash.address;
        }
        if other.flash.verify {
            self.flash.verify = true;
        }
    }

    /// Where remembered settings are written: the local file when one
    /// exists, otherwise the global one.
    fn save_path() -> anyhow::Result<PathBuf> {
        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            return Ok(local.to_path_buf());
        }
        match Self::global_config_dir() {
            Some(dir) => {
                fs::create_dir_all(&dir)?;
                Ok(dir.join("config.toml"))
            },
            None => Ok(local.to_path_buf()),
        }
    }

    /// Save the USB adapter for future auto-selection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        // Don't add duplicates
        if self.connection.usb_device.contains(&device) {
            return Ok(());
        }

        let path = Self::save_path()?;
        let mut stored = Self::load_from_file(&path).unwrap_or_default();
        if !stored.connection.usb_device.contains(&device) {
            stored.connection.usb_device.push(device.clone());
        }
        self.connection.usb_device.push(device);

        let content = toml::to_string_pretty(&stored)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}
