//! TOML-based configuration for the VCLU server.
//!
//! Reads and writes `ServerConfig` to the platform-appropriate config file:
//! - Windows:  `%APPDATA%\CluLink\server.toml`
//! - Linux:    `~/.config/clulink/server.toml`
//! - macOS:    `~/Library/Application Support/CluLink/server.toml`
//!
//! Fields annotated with `#[serde(default = "...")]` fall back to defaults
//! when absent, so the server starts on first run and survives upgrades from
//! older config files. Key material is stored as uppercase hex strings,
//! matching the wire representation.
//!
//! # What is TOML? (for beginners)
//!
//! TOML (Tom's Obvious Minimal Language) is a configuration format that
//! reads like an INI file with real data types.  Example:
//!
//! ```toml
//! [device]
//! serial = 193
//! address = "192.168.1.7"
//!
//! [network]
//! command_port = 1234
//! broadcast_bind = "192.168.1.255"
//! ```
//!
//! The `serde` derive macros generate the mapping between these tables and
//! the structs below at compile time; the `toml` crate does the text
//! parsing.  A field with `#[serde(default = "some_fn")]` takes the return
//! value of `some_fn` when the file omits it, which is what lets a config
//! written by an older version load cleanly after new fields are added.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clu_core::CipherKey;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field parsed as TOML but does not hold a usable value.
    #[error("invalid config value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration stored on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    pub device: DeviceConfig,
    pub network: NetworkConfig,
    pub server: RuntimeConfig,
}

/// Identity of the CLU this server impersonates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    /// Device serial number.
    #[serde(default = "default_serial")]
    pub serial: u64,
    /// MAC address as colon-separated uppercase hex.
    #[serde(default = "default_mac")]
    pub mac: String,
    /// The device's fixed IPv4 address.
    #[serde(default = "default_address")]
    pub address: String,
    /// Manufacturing secret, 32 hex chars. The project key is derived from
    /// this and `default_iv`; it is never used on the wire directly.
    #[serde(default = "default_secret")]
    pub secret: String,
    /// Factory default IV, 32 hex chars.
    #[serde(default = "default_iv")]
    pub default_iv: String,
    /// Device PIN, persisted alongside rotated keys.
    #[serde(default = "default_pin")]
    pub pin: String,
}

/// Listener bind settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// UDP command port shared by both listeners.
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    /// Address the broadcast listener binds: the subnet broadcast address of
    /// the device's network. Must differ from the unicast bind, since both
    /// listeners share the command port.
    #[serde(default = "default_broadcast_bind")]
    pub broadcast_bind: String,
    /// Address the unicast listener binds. Defaults to the device address.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unicast_bind: Option<String>,
}

/// General runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Path the key store writes rotated keys to.
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_serial() -> u64 {
    1
}
fn default_mac() -> String {
    "00:00:00:00:00:01".to_string()
}
fn default_address() -> String {
    "127.0.0.1".to_string()
}
fn default_secret() -> String {
    "00".repeat(16)
}
fn default_iv() -> String {
    "00".repeat(16)
}
fn default_pin() -> String {
    "0000".to_string()
}
fn default_command_port() -> u16 {
    1234
}
fn default_broadcast_bind() -> String {
    // Subnet broadcast of the default loopback device address. A wildcard
    // here would collide with the unicast listener on the shared port.
    "127.255.255.255".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_key_file() -> String {
    "keys.toml".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            network: NetworkConfig::default(),
            server: RuntimeConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: default_serial(),
            mac: default_mac(),
            address: default_address(),
            secret: default_secret(),
            default_iv: default_iv(),
            pin: default_pin(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            command_port: default_command_port(),
            broadcast_bind: default_broadcast_bind(),
            unicast_bind: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            key_file: default_key_file(),
        }
    }
}

// ── Parsed accessors ──────────────────────────────────────────────────────────

impl ServerConfig {
    /// Decodes the manufacturing secret.
    pub fn secret_bytes(&self) -> Result<[u8; 16], ConfigError> {
        hex_field("device.secret", &self.device.secret)
    }

    /// Decodes the factory default IV.
    pub fn default_iv_bytes(&self) -> Result<[u8; 16], ConfigError> {
        hex_field("device.default_iv", &self.device.default_iv)
    }

    /// Derives the project key from the secret and the default IV. This
    /// derivation is the only way a fresh device key exists before a
    /// `SetKey` command arrives.
    pub fn project_key(&self) -> Result<CipherKey, ConfigError> {
        Ok(CipherKey::derive(
            &self.secret_bytes()?,
            &self.default_iv_bytes()?,
        ))
    }

    /// Parses the MAC into its 6 raw bytes.
    pub fn mac_bytes(&self) -> Result<[u8; 6], ConfigError> {
        let parts: Vec<&str> = self.device.mac.split(':').collect();
        if parts.len() != 6 {
            return Err(ConfigError::InvalidValue {
                field: "device.mac",
                reason: format!("expected 6 colon-separated octets, got {}", parts.len()),
            });
        }
        let mut out = [0u8; 6];
        for (slot, part) in out.iter_mut().zip(parts) {
            *slot = u8::from_str_radix(part, 16).map_err(|e| ConfigError::InvalidValue {
                field: "device.mac",
                reason: e.to_string(),
            })?;
        }
        Ok(out)
    }

    /// The device's fixed IPv4 address.
    pub fn device_address(&self) -> Result<Ipv4Addr, ConfigError> {
        self.device
            .address
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                field: "device.address",
                reason: format!("not an IPv4 address: {}", self.device.address),
            })
    }

    /// Bind target of the broadcast listener.
    pub fn broadcast_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: Ipv4Addr =
            self.network
                .broadcast_bind
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    field: "network.broadcast_bind",
                    reason: format!("not an IPv4 address: {}", self.network.broadcast_bind),
                })?;
        Ok(SocketAddr::new(ip.into(), self.network.command_port))
    }

    /// Bind target of the unicast listener; the device address unless
    /// overridden.
    pub fn unicast_bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: Ipv4Addr = match &self.network.unicast_bind {
            Some(bind) => bind.parse().map_err(|_| ConfigError::InvalidValue {
                field: "network.unicast_bind",
                reason: format!("not an IPv4 address: {bind}"),
            })?,
            None => self.device_address()?,
        };
        Ok(SocketAddr::new(ip.into(), self.network.command_port))
    }
}

fn hex_field(field: &'static str, value: &str) -> Result<[u8; 16], ConfigError> {
    let mut out = [0u8; 16];
    hex::decode_to_slice(value, &mut out).map_err(|e| ConfigError::InvalidValue {
        field,
        reason: e.to_string(),
    })?;
    Ok(out)
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Resolves the full path to the config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    let dir = platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)?;
    Ok(dir.join("server.toml"))
}

/// Loads `ServerConfig` from disk, returning `ServerConfig::default()` if the
/// file does not yet exist.
pub fn load_config() -> Result<ServerConfig, ConfigError> {
    load_config_from(&config_file_path()?)
}

/// Loads a config from an explicit path, defaulting when the file is absent.
pub fn load_config_from(path: &std::path::Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Persists `config` to disk, creating the config directory if needed.
pub fn save_config(config: &ServerConfig) -> Result<(), ConfigError> {
    let path = config_file_path()?;
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(())
}

/// Resolves the platform config base directory.
fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("CluLink"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("clulink"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("CluLink")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
