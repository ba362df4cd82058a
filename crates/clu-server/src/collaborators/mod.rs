//! External-collaborator seams of the dispatch loop.
//!
//! The protocol engine only triggers these subsystems; their real semantics
//! (script execution, key persistence formats, file transfer) live outside
//! it. Each seam is a trait so dispatch tests can mock it with `mockall`,
//! plus the production implementation the VCLU binary wires in.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

/// Executes device logic scripts. The engine's health is exposed back only
/// as a boolean.
#[cfg_attr(test, automock)]
pub trait ScriptEngine: Send {
    /// Runs `script` and returns its result string.
    fn call(&mut self, script: &str) -> String;
    /// Tears the executing context down and rebuilds it.
    fn restart(&mut self);
    fn is_alive(&self) -> bool;
}

/// Persists rotated key material.
#[cfg_attr(test, automock)]
pub trait KeyStore: Send {
    fn write_keys(
        &mut self,
        secret_key: &[u8; 16],
        iv: &[u8; 16],
        device_default_iv: &[u8; 16],
        device_pin: &str,
    ) -> Result<(), KeyStoreError>;
}

/// The file-transfer subsystem. This engine only (re)starts it.
#[cfg_attr(test, automock)]
pub trait FileTransfer: Send {
    /// Starts (or restarts) the file server; returns whether it is running.
    fn start_file_server(&mut self) -> bool;
    fn stop_file_server(&mut self);
}

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("I/O error writing key file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize key file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Built-in script engine ────────────────────────────────────────────────────

/// Minimal script engine for the VCLU binary. It answers the alive-check
/// with the device serial and everything else with `nil`; a real scripting
/// runtime is out of scope.
pub struct BuiltinScriptEngine {
    serial: u64,
    alive: bool,
}

impl BuiltinScriptEngine {
    pub fn new(serial: u64) -> Self {
        Self {
            serial,
            alive: true,
        }
    }
}

impl ScriptEngine for BuiltinScriptEngine {
    fn call(&mut self, script: &str) -> String {
        if self.alive && script == "CHECK_ALIVE" {
            format!("{:016X}", self.serial)
        } else {
            "nil".to_string()
        }
    }

    fn restart(&mut self) {
        debug!("script engine restarted");
        self.alive = true;
    }

    fn is_alive(&self) -> bool {
        self.alive
    }
}

// ── TOML key store ────────────────────────────────────────────────────────────

/// On-disk key file schema. Key material is stored as uppercase hex, matching
/// the wire representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct KeyFile {
    secret_key: String,
    iv: String,
    default_iv: String,
    pin: String,
}

/// Persists rotated keys as a small TOML file.
pub struct TomlKeyStore {
    path: PathBuf,
}

impl TomlKeyStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl KeyStore for TomlKeyStore {
    fn write_keys(
        &mut self,
        secret_key: &[u8; 16],
        iv: &[u8; 16],
        device_default_iv: &[u8; 16],
        device_pin: &str,
    ) -> Result<(), KeyStoreError> {
        let file = KeyFile {
            secret_key: hex::encode_upper(secret_key),
            iv: hex::encode_upper(iv),
            default_iv: hex::encode_upper(device_default_iv),
            pin: device_pin.to_string(),
        };
        let content = toml::to_string_pretty(&file)?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| KeyStoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&self.path, content).map_err(|source| KeyStoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!(path = %self.path.display(), "key file written");
        Ok(())
    }
}

// ── Local TFTP trigger ────────────────────────────────────────────────────────

/// Stand-in file-transfer collaborator: tracks running state and logs the
/// triggers. Transfer semantics are outside the protocol engine.
pub struct LocalTftpd {
    running: bool,
}

impl LocalTftpd {
    pub fn new() -> Self {
        Self { running: false }
    }
}

impl Default for LocalTftpd {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTransfer for LocalTftpd {
    fn start_file_server(&mut self) -> bool {
        if self.running {
            warn!("file server restart requested while running");
        }
        self.running = true;
        info!("file server started");
        true
    }

    fn stop_file_server(&mut self) {
        self.running = false;
        debug!("file server stopped");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_engine_answers_check_alive_with_serial_hex() {
        // Arrange
        let mut engine = BuiltinScriptEngine::new(0xC1);

        // Act / Assert
        assert_eq!(engine.call("CHECK_ALIVE"), "00000000000000C1");
        assert!(engine.is_alive());
    }

    #[test]
    fn test_builtin_engine_answers_unknown_scripts_with_nil() {
        let mut engine = BuiltinScriptEngine::new(0xC1);
        assert_eq!(engine.call("print('hi')"), "nil");
        assert_eq!(engine.call(""), "nil");
    }

    #[test]
    fn test_builtin_engine_restart_keeps_it_alive() {
        let mut engine = BuiltinScriptEngine::new(0xC1);
        engine.restart();
        assert!(engine.is_alive());
        assert_eq!(engine.call("CHECK_ALIVE"), "00000000000000C1");
    }

    #[test]
    fn test_toml_key_store_writes_hex_key_material() {
        // Arrange
        let dir = std::env::temp_dir().join(format!("clu_keys_{}", std::process::id()));
        let path = dir.join("keys.toml");
        let mut store = TomlKeyStore::new(path.clone());

        // Act
        store
            .write_keys(&[0xAB; 16], &[0xCD; 16], &[0xEF; 16], "1234")
            .unwrap();

        // Assert
        let content = std::fs::read_to_string(&path).unwrap();
        let file: KeyFile = toml::from_str(&content).unwrap();
        assert_eq!(file.secret_key, "AB".repeat(16));
        assert_eq!(file.iv, "CD".repeat(16));
        assert_eq!(file.default_iv, "EF".repeat(16));
        assert_eq!(file.pin, "1234");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_local_tftpd_tracks_running_state() {
        let mut tftpd = LocalTftpd::new();
        assert!(tftpd.start_file_server());
        tftpd.stop_file_server();
        assert!(tftpd.start_file_server());
    }
}
