//! Command dispatch: one thread owning the device record and the keyring.
//!
//! Both listener loops forward raw datagrams here over a channel, so every
//! mutation of the key state happens on a single thread; nothing else holds
//! a reference to the [`Keyring`] or the device record. Each inbound packet
//! produces at most one reply, and the reply is sent only after the full
//! decrypt, dispatch and encrypt cycle for that packet completes.
//!
//! Failure policy per scope: a broadcast packet that fails any stage is
//! dropped silently (broadcast noise must never echo on the wire); a unicast
//! packet that no candidate key turns into a valid frame is answered with
//! `Error` under the project key, and one whose handler refuses it is
//! answered with `Error` under its own key.

use std::net::Ipv4Addr;
use std::sync::Arc;

use clu_core::cipher::BLOCK_LEN;
use clu_core::protocol::commands::{
    DiscoverRequest, DiscoverResponse, LuaScriptRequest, LuaScriptResponse, ResetRequest,
    SetIpRequest, SetIpResponse, SetKeyRequest, CHALLENGE_LEN,
};
use clu_core::protocol::CluCommand;
use clu_core::{CipherKey, CluSocket, Payload};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::collaborators::{FileTransfer, KeyStore, ScriptEngine};
use crate::keyring::{try_decrypt_any, Keyring};

/// Which listener a packet arrived on. Broadcast and unicast traffic accept
/// different candidate keys and different command subsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Broadcast,
    Unicast,
}

/// A raw datagram forwarded from a listener, with the socket to answer on.
pub struct Inbound {
    pub scope: Scope,
    pub payload: Payload,
    pub socket: Arc<CluSocket>,
}

/// One outbound reply: the key to encrypt under and the frame to send.
#[derive(Debug, PartialEq, Eq)]
pub struct Reply {
    pub key: CipherKey,
    pub command: CluCommand,
}

/// Identity of the device this server impersonates. Owned by the dispatcher;
/// the address never changes at runtime (`SetIp` only acknowledges it).
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub serial: u64,
    pub mac: [u8; 6],
    pub address: Ipv4Addr,
    pub default_iv: [u8; BLOCK_LEN],
    pub pin: String,
}

/// The dispatch loop state: device record, key state, and the external
/// collaborators commands trigger.
pub struct Dispatcher {
    device: DeviceIdentity,
    keyring: Keyring,
    script_engine: Box<dyn ScriptEngine>,
    key_store: Box<dyn KeyStore>,
    file_transfer: Box<dyn FileTransfer>,
}

impl Dispatcher {
    pub fn new(
        device: DeviceIdentity,
        project_key: CipherKey,
        script_engine: Box<dyn ScriptEngine>,
        key_store: Box<dyn KeyStore>,
        file_transfer: Box<dyn FileTransfer>,
    ) -> Self {
        Self {
            device,
            keyring: Keyring::new(project_key),
            script_engine,
            key_store,
            file_transfer,
        }
    }

    /// Blocking dispatch loop. Exits when every listener has dropped its
    /// channel sender.
    pub fn run(mut self, mut rx: mpsc::Receiver<Inbound>) {
        while let Some(inbound) = rx.blocking_recv() {
            let Some(reply) = self.process(inbound.scope, &inbound.payload.bytes) else {
                continue;
            };
            let bytes = reply.key.encrypt(&reply.command.serialize());
            let out = Payload::new(inbound.payload.address, inbound.payload.port, bytes);
            if let Err(e) = inbound.socket.send(&out) {
                error!(error = %e, to = %out.address, "failed to send reply");
            }
        }
        info!("dispatcher stopped");
    }

    /// Decrypts, parses and dispatches one raw datagram. Returns the reply
    /// to send, if any.
    pub fn process(&mut self, scope: Scope, ciphertext: &[u8]) -> Option<Reply> {
        let candidates = match scope {
            Scope::Broadcast => self.keyring.broadcast_candidates(),
            Scope::Unicast => self.keyring.unicast_candidates(),
        };
        let Some((key, command)) = try_decrypt_any(&candidates, ciphertext) else {
            debug!(?scope, "no candidate key yielded a valid frame");
            return self.reject(scope, self.keyring.project().clone());
        };

        match scope {
            Scope::Broadcast => match command {
                CluCommand::Discover(req) => self.handle_discover(&req),
                CluCommand::SetIp(req) => self.handle_set_ip(&req, key),
                other => {
                    debug!(kind = ?other.kind(), "broadcast command dropped");
                    None
                }
            },
            Scope::Unicast => {
                let reply = match command {
                    CluCommand::Discover(req) => self.handle_discover(&req),
                    CluCommand::SetIp(req) => self.handle_set_ip(&req, key.clone()),
                    CluCommand::SetKey(req) => self.handle_set_key(&req, key.clone()),
                    CluCommand::Reset(req) => self.handle_reset(&req, key.clone()),
                    CluCommand::LuaScript(req) => Some(self.handle_lua(req, key.clone())),
                    CluCommand::StartTftpd => self.handle_start_tftpd(&key),
                    CluCommand::GenerateMeasurements => self.handle_generate_measurements(&key),
                    other => {
                        warn!(kind = ?other.kind(), "unexpected unicast frame");
                        None
                    }
                };
                // Every accepted unicast packet gets exactly one reply.
                reply.or_else(|| self.reject(Scope::Unicast, key))
            }
        }
    }

    /// Scope-appropriate failure outcome: silence on broadcast, `Error` on
    /// unicast.
    fn reject(&self, scope: Scope, key: CipherKey) -> Option<Reply> {
        match scope {
            Scope::Broadcast => None,
            Scope::Unicast => Some(Reply {
                key,
                command: CluCommand::Error,
            }),
        }
    }

    /// Discovery: open the inner challenge under the project key, grant a
    /// fresh temporary key, and prove the challenge was read by sending back
    /// the nonce hash encrypted under that temporary key. The reply travels
    /// under the default broadcast key re-IV'd with the IV the requester
    /// chose.
    fn handle_discover(&mut self, req: &DiscoverRequest) -> Option<Reply> {
        let nonce: [u8; BLOCK_LEN] = self
            .keyring
            .project()
            .decrypt(&req.challenge)?
            .try_into()
            .ok()?;

        let mut temporary_iv = [0u8; BLOCK_LEN];
        rand::rngs::OsRng.fill_bytes(&mut temporary_iv);
        let temporary = self.keyring.project().with_iv(temporary_iv);

        let digest = Sha256::digest(nonce);
        let proof_ct = temporary.encrypt(&digest[..BLOCK_LEN]);
        let mut proof = [0u8; CHALLENGE_LEN];
        proof.copy_from_slice(&proof_ct);

        info!(key = ?temporary, "discovery challenge answered, temporary key granted");
        self.keyring.grant_temporary(temporary);

        Some(Reply {
            key: CipherKey::default_broadcast().with_iv(req.response_iv),
            command: CluCommand::DiscoverReply(DiscoverResponse {
                serial: self.device.serial,
                mac: self.device.mac,
                temporary_iv,
                proof,
            }),
        })
    }

    /// Acknowledges the fixed address when the serial matches; the address
    /// itself never changes.
    fn handle_set_ip(&self, req: &SetIpRequest, key: CipherKey) -> Option<Reply> {
        if req.serial != self.device.serial {
            debug!(
                requested = req.serial,
                ours = self.device.serial,
                "set_ip for a different serial"
            );
            return None;
        }
        Some(Reply {
            key,
            command: CluCommand::SetIpReply(SetIpResponse {
                address: self.device.address,
            }),
        })
    }

    /// Installs a new project key, persisting it first. The request's proof
    /// field is carried on the wire but not verified.
    fn handle_set_key(&mut self, req: &SetKeyRequest, key: CipherKey) -> Option<Reply> {
        if let Err(e) = self.key_store.write_keys(
            &req.key,
            &req.iv,
            &self.device.default_iv,
            &self.device.pin,
        ) {
            error!(error = %e, "key persistence failed, rotation aborted");
            return None;
        }
        self.keyring.install(CipherKey::new(req.key, req.iv));
        // The requester still encrypts this exchange under the old key.
        Some(Reply {
            key,
            command: CluCommand::SetKeyReply,
        })
    }

    /// Restarts the executing logic. The reply is sent immediately; restart
    /// success is not awaited. Rebuilding the context invalidates any
    /// in-progress discovery grants.
    fn handle_reset(&mut self, req: &ResetRequest, key: CipherKey) -> Option<Reply> {
        if req.serial != self.device.serial {
            debug!(requested = req.serial, "reset for a different serial");
            return None;
        }
        self.script_engine.restart();
        self.keyring.narrow();
        Some(Reply {
            key,
            command: CluCommand::ResetReply,
        })
    }

    fn handle_lua(&mut self, req: LuaScriptRequest, key: CipherKey) -> Reply {
        let result = self.script_engine.call(&req.script);
        Reply {
            key,
            command: CluCommand::LuaScriptReply(LuaScriptResponse {
                session: req.session,
                result,
            }),
        }
    }

    /// Project-key-only: restarts the file-transfer subsystem.
    fn handle_start_tftpd(&mut self, key: &CipherKey) -> Option<Reply> {
        if !self.keyring.is_project(key) {
            warn!("start_tftpd rejected under a non-project key");
            return None;
        }
        self.file_transfer.stop_file_server();
        self.file_transfer.start_file_server();
        Some(Reply {
            key: key.clone(),
            command: CluCommand::StartTftpdReply,
        })
    }

    /// Project-key-only: triggers measurement generation, which also
    /// restarts the file server that exposes the results.
    fn handle_generate_measurements(&mut self, key: &CipherKey) -> Option<Reply> {
        if !self.keyring.is_project(key) {
            warn!("generate_measurements rejected under a non-project key");
            return None;
        }
        self.file_transfer.stop_file_server();
        self.file_transfer.start_file_server();
        Some(Reply {
            key: key.clone(),
            command: CluCommand::GenerateMeasurementsReply,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
