//! Controller-side client: one-shot requests and broadcast discovery.
//!
//! [`CluClient`] talks to a single CLU over one lock-protected socket, which
//! makes "one in-flight request at a time" a structural invariant rather than
//! a convention. Reply matching keys off decrypt success alone (there is no
//! request id on the wire), so pipelining would misattribute replies.

mod discovery;
mod stream;

pub use discovery::discover;
pub use stream::BroadcastStream;

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, trace};

use crate::cipher::{CipherKey, BLOCK_LEN};
use crate::protocol::commands::{
    LuaScriptRequest, ResetRequest, SetIpRequest, SetKeyRequest,
};
use crate::protocol::CluCommand;
use crate::transport::{CluSocket, Payload, TransportError};

/// Session id used for alive-checks.
const ALIVE_SESSION: u32 = 0x1;
/// Script a CLU answers with its serial number when healthy.
const ALIVE_SCRIPT: &str = "CHECK_ALIVE";
/// The script engine's result for anything it cannot answer.
const NIL_RESULT: &str = "nil";

/// Client bound to one CLU endpoint.
pub struct CluClient {
    socket: CluSocket,
    address: Ipv4Addr,
    port: u16,
}

impl CluClient {
    /// Binds an ephemeral local socket for talking to the CLU at
    /// `address:port`.
    pub fn new(address: Ipv4Addr, port: u16) -> Result<Self, TransportError> {
        let socket = CluSocket::bind("0.0.0.0:0".parse().expect("static addr"), false)?;
        Ok(Self {
            socket,
            address,
            port,
        })
    }

    /// Sends `command` encrypted under `key` and waits up to `timeout` for a
    /// reply that decrypts under the same key. Returns the decrypted reply
    /// payload, or `Ok(None)` when the budget runs out.
    ///
    /// Queued stale datagrams are drained before sending so a late reply to
    /// a previous request can never be matched to this one.
    pub fn request(
        &self,
        key: &CipherKey,
        command: &CluCommand,
        timeout: Duration,
    ) -> Result<Option<Payload>, TransportError> {
        self.socket.discard()?;
        self.socket.send(&Payload::new(
            self.address,
            self.port,
            key.encrypt(&command.serialize()),
        ))?;

        let deadline = Instant::now() + timeout;
        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                trace!(target = %self.address, "request timed out");
                return Ok(None);
            };
            let Some(raw) = self.socket.try_receive(remaining)? else {
                trace!(target = %self.address, "request timed out");
                return Ok(None);
            };
            match key.decrypt(&raw.bytes) {
                Some(plain) => return Ok(Some(Payload::new(raw.address, raw.port, plain))),
                None => {
                    debug!(from = %raw.address, "reply did not decrypt, still waiting");
                }
            }
        }
    }

    /// Sends a request and parses the decrypted reply, if any.
    fn request_command(
        &self,
        key: &CipherKey,
        command: &CluCommand,
        timeout: Duration,
    ) -> Result<Option<CluCommand>, TransportError> {
        let Some(reply) = self.request(key, command, timeout)? else {
            return Ok(None);
        };
        Ok(CluCommand::parse_any(&reply.bytes))
    }

    /// Health probe: runs the alive-check script and expects a non-nil
    /// result on the same session.
    pub fn check_alive(&self, key: &CipherKey, timeout: Duration) -> Result<bool, TransportError> {
        let result = self.execute_lua(key, ALIVE_SESSION, ALIVE_SCRIPT, timeout)?;
        Ok(matches!(result, Some(r) if r != NIL_RESULT))
    }

    /// Runs `script` on the CLU; returns the result string when the reply
    /// carries the same session id.
    pub fn execute_lua(
        &self,
        key: &CipherKey,
        session: u32,
        script: &str,
        timeout: Duration,
    ) -> Result<Option<String>, TransportError> {
        let command = CluCommand::LuaScript(LuaScriptRequest {
            session,
            script: script.to_string(),
        });
        let reply = self.request_command(key, &command, timeout)?;
        Ok(match reply {
            Some(CluCommand::LuaScriptReply(r)) if r.session == session => Some(r.result),
            _ => None,
        })
    }

    /// Installs a new project key on the CLU. The request travels under the
    /// currently accepted `key`; the proof is a random nonce encrypted under
    /// the new key (carried but not verified by devices).
    pub fn set_key(
        &self,
        key: &CipherKey,
        new_key: [u8; BLOCK_LEN],
        new_iv: [u8; BLOCK_LEN],
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        let mut nonce = [0u8; BLOCK_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let proof = discovery::encrypted_nonce(&CipherKey::new(new_key, new_iv), &nonce);
        let command = CluCommand::SetKey(SetKeyRequest {
            key: new_key,
            iv: new_iv,
            proof,
        });
        let reply = self.request_command(key, &command, timeout)?;
        Ok(matches!(reply, Some(CluCommand::SetKeyReply)))
    }

    /// Asks the CLU with `serial` to confirm its fixed address; returns the
    /// address it acknowledged.
    pub fn set_ip(
        &self,
        key: &CipherKey,
        serial: u64,
        address: Ipv4Addr,
        timeout: Duration,
    ) -> Result<Option<Ipv4Addr>, TransportError> {
        let command = CluCommand::SetIp(SetIpRequest { serial, address });
        let reply = self.request_command(key, &command, timeout)?;
        Ok(match reply {
            Some(CluCommand::SetIpReply(r)) => Some(r.address),
            _ => None,
        })
    }

    /// Restarts the CLU's executing logic.
    pub fn reset(
        &self,
        key: &CipherKey,
        serial: u64,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        let command = CluCommand::Reset(ResetRequest { serial });
        let reply = self.request_command(key, &command, timeout)?;
        Ok(matches!(reply, Some(CluCommand::ResetReply)))
    }

    /// Triggers the CLU's file-transfer subsystem. Accepted only under the
    /// project key.
    pub fn start_tftpd(&self, key: &CipherKey, timeout: Duration) -> Result<bool, TransportError> {
        let reply = self.request_command(key, &CluCommand::StartTftpd, timeout)?;
        Ok(matches!(reply, Some(CluCommand::StartTftpdReply)))
    }

    /// Triggers measurement generation. Accepted only under the project key.
    pub fn generate_measurements(
        &self,
        key: &CipherKey,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        let reply = self.request_command(key, &CluCommand::GenerateMeasurements, timeout)?;
        Ok(matches!(reply, Some(CluCommand::GenerateMeasurementsReply)))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
