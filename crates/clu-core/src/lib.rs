//! # clu-core
//!
//! Shared library for CLU-Link containing the symmetric command cipher, the
//! fixed-width ASCII command frame codec, the UDP transport wrapper, and the
//! controller-side client machinery (request/response and broadcast
//! discovery).
//!
//! This crate is used by both the controller tooling and the VCLU server.
//! It has no dependency on configuration formats or the embedded script
//! runtime; those are collaborators of the server application.
//!
//! # Protocol overview
//!
//! A CLU (the embedded controller device) speaks a text-over-UDP protocol:
//! every datagram is one AES-128-CBC encrypted ASCII command frame terminated
//! by CRLF. There is no session layer. A receiver decides what a packet is by
//! trying to decrypt it under each currently-valid key and then probing the
//! plaintext against every known command shape; both steps report "no value"
//! on failure rather than erroring, which is what makes the multi-key trial
//! cheap.
//!
//! - **`cipher`** – [`CipherKey`]: key + IV pairs, encrypt/decrypt, key
//!   derivation, and the well-known default broadcast key.
//! - **`protocol`** – typed command frames and the strict parse/serialize
//!   codec.
//! - **`transport`** – [`CluSocket`]: UDP send/receive with a hard timeout.
//! - **`device`** – [`CluDevice`]: the identity record for one CLU.
//! - **`client`** – [`CluClient`]: one-shot requests, broadcast reply
//!   streaming, and the discovery handshake.

pub mod cipher;
pub mod client;
pub mod device;
pub mod protocol;
pub mod transport;

// Re-export the most-used types at the crate root so callers can write
// `clu_core::CipherKey` instead of `clu_core::cipher::CipherKey`.
pub use cipher::CipherKey;
pub use client::CluClient;
pub use device::CluDevice;
pub use protocol::commands::CluCommand;
pub use transport::{CluSocket, Payload, TransportError};
