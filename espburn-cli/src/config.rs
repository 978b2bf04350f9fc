//! Configuration file support for espburn.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ESPBURN_*)
//! 3. Local config file (./espburn.toml, ports in ./espburn_ports.toml)
//! 4. Global config file (~/.config/espburn/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fs;
use std::path::{Path, PathBuf};

const LOCAL_CONFIG: &str = "espburn.toml";
const LOCAL_PORTS_CONFIG: &str = "espburn_ports.toml";

/// Parse a TOML file. Missing files are silent, broken ones warn.
fn read_toml<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Failed to read config file {}: {e}", path.display());
            return None;
        },
    };
    match toml::from_str(&content) {
        Ok(value) => {
            debug!("Loaded {}", path.display());
            Some(value)
        },
        Err(e) => {
            warn!("Failed to parse config file {}: {e}", path.display());
            None
        },
    }
}

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
    pub serial: Option<String>,
    /// ROM loader baud rate.
    pub baud: Option<u32>,
}

/// Port-specific configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Known USB devices for auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Baud rate requested once the stub runs.
    pub baud: Option<u32>,
    /// Compress data on the wire.
    pub compress: Option<bool>,
    /// Directory holding `stub_flasher_*.json` files.
    pub stub_dir: Option<PathBuf>,
    /// Default `--flash-mode`.
    pub flash_mode: Option<String>,
    /// Default `--flash-freq`.
    pub flash_freq: Option<String>,
    /// Default `--flash-size`.
    pub flash_size: Option<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_config) = Self::global_config_path().and_then(|path| read_toml(&path)) {
            config.merge(global_config);
        }

        if let Some(local_config) = read_toml(Path::new(LOCAL_CONFIG)) {
            config.merge(local_config);
        }

        if let Some(ports_config) = Self::load_ports_config() {
            config.port = ports_config;
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        read_toml(path).unwrap_or_else(|| {
            warn!("Could not load config from {}, using defaults", path.display());
            Self::default()
        })
    }

    /// Remembered ports: local file first, then the global one.
    fn load_ports_config() -> Option<PortConfig> {
        read_toml(Path::new(LOCAL_PORTS_CONFIG))
            .or_else(|| Self::global_config_dir().and_then(|dir| read_toml(&dir.join("ports.toml"))))
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "espburn").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        let Self { port, flash } = other;

        if port.connection.serial.is_some() {
            self.port.connection.serial = port.connection.serial;
        }
        if port.connection.baud.is_some() {
            self.port.connection.baud = port.connection.baud;
        }
        self.port.usb_device.extend(port.usb_device);

        let current = &mut self.flash;
        current.baud = flash.baud.or(current.baud);
        current.compress = flash.compress.or(current.compress);
        current.stub_dir = flash.stub_dir.or(current.stub_dir.take());
        current.flash_mode = flash.flash_mode.or(current.flash_mode.take());
        current.flash_freq = flash.flash_freq.or(current.flash_freq.take());
        current.flash_size = flash.flash_size.or(current.flash_size.take());
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        let device = UsbDevice { vid, pid };

        if self.port.usb_device.contains(&device) {
            return Ok(());
        }

        // prefer a local file when the project already has one
        let path = if Path::new(LOCAL_PORTS_CONFIG).exists() || Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_PORTS_CONFIG)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("ports.toml")
        } else {
            PathBuf::from(LOCAL_PORTS_CONFIG)
        };

        self.port.usb_device.push(device);

        let content = toml::to_string_pretty(&self.port)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.port.connection.serial.is_none());
        assert!(config.port.connection.baud.is_none());
        assert!(config.port.usb_device.is_empty());
        assert!(config.flash.baud.is_none());
        assert!(config.flash.compress.is_none());
        assert!(config.flash.stub_dir.is_none());
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x10C4,
            pid: 0xEA60,
        };
        assert!(device.matches(0x10C4, 0xEA60));
        assert!(!device.matches(0x10C4, 0xEA70));
        assert!(!device.matches(0x1A86, 0xEA60));
    }

    #[test]
    fn test_config_merge_overrides_set_values() {
        let mut base = Config::default();
        base.port.connection.baud = Some(115200);
        base.flash.baud = Some(460800);
        base.flash.flash_mode = Some("qio".to_string());

        let mut other = Config::default();
        other.port.connection.serial = Some("/dev/ttyUSB0".to_string());
        other.flash.baud = Some(921600);
        other.flash.compress = Some(false);

        base.merge(other);

        assert_eq!(base.port.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.port.connection.baud, Some(115200));
        assert_eq!(base.flash.baud, Some(921600));
        assert_eq!(base.flash.compress, Some(false));
        assert_eq!(base.flash.flash_mode.as_deref(), Some("qio"));
    }

    #[test]
    fn test_config_merge_usb_devices_extend() {
        let mut base = Config::default();
        base.port.usb_device.push(UsbDevice { vid: 0x1A86, pid: 0x7523 });

        let mut other = Config::default();
        other.port.usb_device.push(UsbDevice { vid: 0x303A, pid: 0x1001 });

        base.merge(other);
        assert_eq!(base.port.usb_device.len(), 2);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[port.connection]
serial = "/dev/ttyACM0"
baud = 115200

[[port.usb_device]]
vid = 12346
pid = 4097

[flash]
baud = 921600
compress = false
stub_dir = "stubs"
flash_mode = "dio"
flash_freq = "40m"
flash_size = "4MB"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.port.usb_device[0], UsbDevice { vid: 0x303A, pid: 0x1001 });
        assert_eq!(config.flash.baud, Some(921600));
        assert_eq!(config.flash.compress, Some(false));
        assert_eq!(config.flash.stub_dir, Some(PathBuf::from("stubs")));
        assert_eq!(config.flash.flash_mode.as_deref(), Some("dio"));
        assert_eq!(config.flash.flash_freq.as_deref(), Some("40m"));
        assert_eq!(config.flash.flash_size.as_deref(), Some("4MB"));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.port.connection.serial.is_none());
        assert!(config.flash.flash_size.is_none());
    }

    #[test]
    fn test_port_config_toml_roundtrip() {
        let mut port = PortConfig::default();
        port.connection.serial = Some("COM3".to_string());
        port.usb_device.push(UsbDevice { vid: 0x10C4, pid: 0xEA60 });

        let serialized = toml::to_string_pretty(&port).unwrap();
        let deserialized: PortConfig = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.connection.serial.as_deref(), Some("COM3"));
        assert_eq!(deserialized.usb_device, port.usb_device);
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("espburn.toml");
        fs::write(&path, "[flash]\nstub_dir = \"/opt/stubs\"\n").unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.flash.stub_dir, Some(PathBuf::from("/opt/stubs")));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[flash\nbaud = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.flash.baud.is_none());

        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.port.connection.serial.is_none());
    }

    #[test]
    fn test_global_config_path_names_project() {
        if let Some(p) = Config::global_config_path() {
            let p = p.to_string_lossy();
            assert!(p.contains("espburn"));
            assert!(p.ends_with("config.toml"));
        }
    }
}
