//! Broadcast discovery: find CLUs on the LAN knowing only the project secret.
//!
//! The handshake nests two encryption layers. The controller draws a random
//! 16-byte nonce, encrypts it under the project key (the inner challenge),
//! and wraps the whole frame for transport under the default broadcast key
//! re-IV'd with the project key's IV. Only a device holding the project key
//! can open the inner challenge. The device answers with a freshly granted
//! temporary key IV and a proof: the first half of `SHA-256(nonce)` encrypted
//! under that temporary key. A reply whose proof does not match is ignored,
//! so a rogue responder cannot inject a phantom device.

use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cipher::{CipherKey, BLOCK_LEN};
use crate::client::stream::BroadcastStream;
use crate::device::CluDevice;
use crate::protocol::commands::{DiscoverRequest, CHALLENGE_LEN};
use crate::protocol::CluCommand;
use crate::transport::TransportError;

/// Broadcasts a discovery challenge and returns every device that proved
/// knowledge of `project_key`, up to `limit` replies within `timeout`.
///
/// Each returned [`CluDevice`] carries the temporary key granted by that
/// device, ready for follow-up unicast commands.
pub fn discover(
    project_key: &CipherKey,
    target: SocketAddr,
    timeout: Duration,
    limit: usize,
) -> Result<Vec<CluDevice>, TransportError> {
    let mut nonce = [0u8; BLOCK_LEN];
    let mut response_iv = [0u8; BLOCK_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    rand::rngs::OsRng.fill_bytes(&mut response_iv);

    let challenge = encrypted_nonce(project_key, &nonce);
    let command = CluCommand::Discover(DiscoverRequest {
        response_iv,
        challenge,
    });

    // Transport wrapping: out under the default key carrying the project IV,
    // back under the default key carrying the fresh response IV.
    let request_key = CipherKey::default_broadcast().with_iv(project_key.iv());
    let response_key = CipherKey::default_broadcast().with_iv(response_iv);

    let expected_proof = nonce_digest(&nonce);
    let stream = BroadcastStream::open(
        &request_key,
        &response_key,
        &command,
        target,
        timeout,
        limit,
    )?;

    let mut devices = Vec::new();
    for reply in stream {
        let Some(CluCommand::DiscoverReply(resp)) = CluCommand::parse_any(&reply.bytes) else {
            debug!(from = %reply.address, "non-discovery broadcast reply ignored");
            continue;
        };
        let temporary_key = project_key.with_iv(resp.temporary_iv);
        let proof_ok = temporary_key
            .decrypt(&resp.proof)
            .is_some_and(|digest| digest == expected_proof);
        if !proof_ok {
            debug!(
                from = %reply.address,
                serial = resp.serial,
                "discovery reply failed the challenge proof, ignoring"
            );
            continue;
        }
        info!(serial = resp.serial, address = %reply.address, "discovered CLU");
        devices.push(CluDevice::new(
            resp.serial,
            resp.mac,
            reply.address,
            temporary_key,
        ));
    }
    Ok(devices)
}

/// Encrypts the 16-byte nonce into the fixed-width challenge field.
pub fn encrypted_nonce(key: &CipherKey, nonce: &[u8; BLOCK_LEN]) -> [u8; CHALLENGE_LEN] {
    let ct = key.encrypt(nonce);
    let mut out = [0u8; CHALLENGE_LEN];
    out.copy_from_slice(&ct);
    out
}

/// The proof plaintext both sides compute: the first 16 bytes of
/// `SHA-256(nonce)`.
pub fn nonce_digest(nonce: &[u8; BLOCK_LEN]) -> Vec<u8> {
    Sha256::digest(nonce)[..BLOCK_LEN].to_vec()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::DiscoverResponse;
    use crate::transport::{CluSocket, Payload};
    use std::net::Ipv4Addr;
    use std::thread;

    /// Minimal in-test device: answers one discovery request the way a CLU
    /// holding `device_key` would, or with a deliberately bad proof.
    fn spawn_device(device_key: CipherKey, serial: u64, honest: bool) -> (u16, thread::JoinHandle<()>) {
        let socket = CluSocket::bind("127.0.0.1:0".parse().unwrap(), false).unwrap();
        let port = socket.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let raw = match socket.try_receive(Duration::from_secs(5)) {
                Ok(Some(p)) => p,
                _ => return,
            };
            let unwrap_key = CipherKey::default_broadcast().with_iv(device_key.iv());
            let plain = unwrap_key.decrypt(&raw.bytes).expect("transport unwrap");
            let Some(CluCommand::Discover(req)) = CluCommand::parse_any(&plain) else {
                panic!("expected a discovery request");
            };
            let nonce_ct = &req.challenge[..];
            let nonce: [u8; BLOCK_LEN] = device_key
                .decrypt(nonce_ct)
                .expect("inner challenge")
                .try_into()
                .unwrap();

            let mut temporary_iv = [0u8; BLOCK_LEN];
            rand::rngs::OsRng.fill_bytes(&mut temporary_iv);
            let temporary_key = device_key.with_iv(temporary_iv);
            let mut digest = nonce_digest(&nonce);
            if !honest {
                digest[0] ^= 0xFF;
            }
            let proof = encrypted_nonce(&temporary_key, &digest.try_into().unwrap());

            let frame = CluCommand::DiscoverReply(DiscoverResponse {
                serial,
                mac: [0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03],
                temporary_iv,
                proof,
            })
            .serialize();
            let wrap = CipherKey::default_broadcast().with_iv(req.response_iv);
            socket
                .send(&Payload::new(raw.address, raw.port, wrap.encrypt(&frame)))
                .unwrap();
        });
        (port, handle)
    }

    #[test]
    fn test_discover_returns_device_with_usable_temporary_key() {
        // Arrange
        let project_key = CipherKey::new([0x55; BLOCK_LEN], [0x66; BLOCK_LEN]);
        let (port, device) = spawn_device(project_key.clone(), 0xC1, true);
        let target = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);

        // Act
        let devices = discover(&project_key, target, Duration::from_secs(2), 1).unwrap();

        // Assert
        assert_eq!(devices.len(), 1);
        let found = &devices[0];
        assert_eq!(found.serial_number, 0xC1);
        assert_eq!(found.mac_address, "AA:BB:CC:01:02:03");
        assert_eq!(found.address, Ipv4Addr::LOCALHOST);
        // The granted key shares the project secret under a new IV.
        assert_ne!(found.cipher_key, project_key);
        let probe = found.cipher_key.encrypt(b"probe");
        assert_eq!(found.cipher_key.decrypt(&probe).as_deref(), Some(&b"probe"[..]));
        device.join().unwrap();
    }

    #[test]
    fn test_discover_rejects_a_reply_with_a_bad_proof() {
        // Arrange
        let project_key = CipherKey::new([0x55; BLOCK_LEN], [0x66; BLOCK_LEN]);
        let (port, device) = spawn_device(project_key.clone(), 0xC2, false);
        let target = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port);

        // Act
        let devices = discover(&project_key, target, Duration::from_millis(500), 1).unwrap();

        // Assert
        assert!(devices.is_empty(), "a failed proof must not yield a device");
        device.join().unwrap();
    }

    #[test]
    fn test_nonce_digest_is_the_first_half_of_sha256() {
        let nonce = [7u8; BLOCK_LEN];
        let digest = nonce_digest(&nonce);
        assert_eq!(digest.len(), BLOCK_LEN);
        assert_eq!(digest, Sha256::digest(nonce)[..BLOCK_LEN].to_vec());
    }
}
