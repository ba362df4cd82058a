//! Command frame module: typed commands and the fixed-width ASCII codec.

pub mod commands;
pub(crate) mod frame;

pub use commands::{CluCommand, CommandKind};
