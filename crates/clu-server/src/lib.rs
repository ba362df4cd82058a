//! clu-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.

pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod keyring;
pub mod listener;

pub use config::ServerConfig;
pub use listener::CluServer;
