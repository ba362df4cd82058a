//! Typed CLU command frames and the strict parse/serialize contract.
//!
//! Each command kind owns a literal ASCII prefix and a fixed field layout
//! (see `frame`). Parsing verifies, in order: minimum length, the literal
//! prefix at offset 0, a `:` at every delimiter offset, each fixed-width
//! field, and the terminating CRLF. Any violation yields `None` so a
//! receiver can cheaply probe an unknown buffer against every kind.
//!
//! Serialization is the exact inverse and injective:
//! `parse(serialize(x)) == x` and re-serializing the parse result is
//! byte-identical.

use std::net::Ipv4Addr;

use crate::cipher::BLOCK_LEN;
use crate::protocol::frame;

/// Width of a serial-number field in hex chars.
const SERIAL_WIDTH: usize = 16;
/// Width of a session-id field in hex chars.
const SESSION_WIDTH: usize = 8;
/// Width of a MAC field in hex chars (no separators).
const MAC_WIDTH: usize = 12;

/// Byte length of a discovery challenge / proof field (one padded AES
/// encryption of a 16-byte value).
pub const CHALLENGE_LEN: usize = 2 * BLOCK_LEN;

// ── Discover ──────────────────────────────────────────────────────────────────

/// Broadcast discovery challenge. `challenge` is the random nonce encrypted
/// under the project key; `response_iv` is a fresh transport IV the device
/// must use (together with the default broadcast key) to wrap its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverRequest {
    pub response_iv: [u8; BLOCK_LEN],
    pub challenge: [u8; CHALLENGE_LEN],
}

impl DiscoverRequest {
    pub const PREFIX: &'static [u8] = b"req_discover";

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let p = Self::PREFIX.len();
        let expected = p + 1 + 2 * BLOCK_LEN + 1 + 2 * CHALLENGE_LEN + frame::CRLF.len();
        if buf.len() != expected
            || !frame::has_prefix(buf, Self::PREFIX)
            || !frame::colon_at(buf, p)
            || !frame::colon_at(buf, p + 1 + 2 * BLOCK_LEN)
            || !frame::ends_with_crlf(buf)
        {
            return None;
        }
        Some(Self {
            response_iv: frame::hex_array(buf, p + 1)?,
            challenge: frame::hex_array(buf, p + 1 + 2 * BLOCK_LEN + 1)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::from(Self::PREFIX);
        out.push(b':');
        frame::push_hex_bytes(&mut out, &self.response_iv);
        out.push(b':');
        frame::push_hex_bytes(&mut out, &self.challenge);
        out.extend_from_slice(frame::CRLF);
        out
    }
}

/// Discovery reply: identity plus the freshly granted temporary key IV and
/// the encrypted challenge-hash proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverResponse {
    pub serial: u64,
    pub mac: [u8; 6],
    pub temporary_iv: [u8; BLOCK_LEN],
    pub proof: [u8; CHALLENGE_LEN],
}

impl DiscoverResponse {
    pub const PREFIX: &'static [u8] = b"resp_discover";

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let p = Self::PREFIX.len();
        let iv_off = p + 1 + SERIAL_WIDTH + 1 + MAC_WIDTH + 1;
        let proof_off = iv_off + 2 * BLOCK_LEN + 1;
        let expected = proof_off + 2 * CHALLENGE_LEN + frame::CRLF.len();
        if buf.len() != expected
            || !frame::has_prefix(buf, Self::PREFIX)
            || !frame::colon_at(buf, p)
            || !frame::colon_at(buf, p + 1 + SERIAL_WIDTH)
            || !frame::colon_at(buf, p + 1 + SERIAL_WIDTH + 1 + MAC_WIDTH)
            || !frame::colon_at(buf, iv_off + 2 * BLOCK_LEN)
            || !frame::ends_with_crlf(buf)
        {
            return None;
        }
        Some(Self {
            serial: frame::hex_u64(buf, p + 1, SERIAL_WIDTH)?,
            mac: frame::hex_array(buf, p + 1 + SERIAL_WIDTH + 1)?,
            temporary_iv: frame::hex_array(buf, iv_off)?,
            proof: frame::hex_array(buf, proof_off)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::from(Self::PREFIX);
        out.push(b':');
        frame::push_hex_u64(&mut out, self.serial, SERIAL_WIDTH);
        out.push(b':');
        frame::push_hex_bytes(&mut out, &self.mac);
        out.push(b':');
        frame::push_hex_bytes(&mut out, &self.temporary_iv);
        out.push(b':');
        frame::push_hex_bytes(&mut out, &self.proof);
        out.extend_from_slice(frame::CRLF);
        out
    }
}

// ── SetIp ─────────────────────────────────────────────────────────────────────

/// Asks the device with `serial` to confirm its fixed address. Devices never
/// change address through this command; they only acknowledge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetIpRequest {
    pub serial: u64,
    pub address: Ipv4Addr,
}

impl SetIpRequest {
    pub const PREFIX: &'static [u8] = b"req_set_ip";

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let p = Self::PREFIX.len();
        let expected = p + 1 + SERIAL_WIDTH + 1 + frame::IP_WIDTH + frame::CRLF.len();
        if buf.len() != expected
            || !frame::has_prefix(buf, Self::PREFIX)
            || !frame::colon_at(buf, p)
            || !frame::colon_at(buf, p + 1 + SERIAL_WIDTH)
            || !frame::ends_with_crlf(buf)
        {
            return None;
        }
        Some(Self {
            serial: frame::hex_u64(buf, p + 1, SERIAL_WIDTH)?,
            address: frame::ip(buf, p + 1 + SERIAL_WIDTH + 1)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::from(Self::PREFIX);
        out.push(b':');
        frame::push_hex_u64(&mut out, self.serial, SERIAL_WIDTH);
        out.push(b':');
        frame::push_ip(&mut out, self.address);
        out.extend_from_slice(frame::CRLF);
        out
    }
}

/// Device acknowledgement carrying its (unchanged) fixed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetIpResponse {
    pub address: Ipv4Addr,
}

impl SetIpResponse {
    pub const PREFIX: &'static [u8] = b"resp_set_ip";

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let p = Self::PREFIX.len();
        let expected = p + 1 + frame::IP_WIDTH + frame::CRLF.len();
        if buf.len() != expected
            || !frame::has_prefix(buf, Self::PREFIX)
            || !frame::colon_at(buf, p)
            || !frame::ends_with_crlf(buf)
        {
            return None;
        }
        Some(Self {
            address: frame::ip(buf, p + 1)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::from(Self::PREFIX);
        out.push(b':');
        frame::push_ip(&mut out, self.address);
        out.extend_from_slice(frame::CRLF);
        out
    }
}

// ── SetKey ────────────────────────────────────────────────────────────────────

/// Installs a new persistent project key, delivered as raw key + IV.
///
/// `proof` is an encrypted random nonce. It is carried on the wire but the
/// device does not verify it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKeyRequest {
    pub key: [u8; BLOCK_LEN],
    pub iv: [u8; BLOCK_LEN],
    pub proof: [u8; CHALLENGE_LEN],
}

impl SetKeyRequest {
    pub const PREFIX: &'static [u8] = b"req_set_key";

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let p = Self::PREFIX.len();
        let iv_off = p + 1 + 2 * BLOCK_LEN + 1;
        let proof_off = iv_off + 2 * BLOCK_LEN + 1;
        let expected = proof_off + 2 * CHALLENGE_LEN + frame::CRLF.len();
        if buf.len() != expected
            || !frame::has_prefix(buf, Self::PREFIX)
            || !frame::colon_at(buf, p)
            || !frame::colon_at(buf, p + 1 + 2 * BLOCK_LEN)
            || !frame::colon_at(buf, iv_off + 2 * BLOCK_LEN)
            || !frame::ends_with_crlf(buf)
        {
            return None;
        }
        Some(Self {
            key: frame::hex_array(buf, p + 1)?,
            iv: frame::hex_array(buf, iv_off)?,
            proof: frame::hex_array(buf, proof_off)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::from(Self::PREFIX);
        out.push(b':');
        frame::push_hex_bytes(&mut out, &self.key);
        out.push(b':');
        frame::push_hex_bytes(&mut out, &self.iv);
        out.push(b':');
        frame::push_hex_bytes(&mut out, &self.proof);
        out.extend_from_slice(frame::CRLF);
        out
    }
}

// ── Reset ─────────────────────────────────────────────────────────────────────

/// Asks the device to restart its executing logic. The reply is sent
/// immediately, independent of restart success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetRequest {
    pub serial: u64,
}

impl ResetRequest {
    pub const PREFIX: &'static [u8] = b"req_reset";

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let p = Self::PREFIX.len();
        let expected = p + 1 + SERIAL_WIDTH + frame::CRLF.len();
        if buf.len() != expected
            || !frame::has_prefix(buf, Self::PREFIX)
            || !frame::colon_at(buf, p)
            || !frame::ends_with_crlf(buf)
        {
            return None;
        }
        Some(Self {
            serial: frame::hex_u64(buf, p + 1, SERIAL_WIDTH)?,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::from(Self::PREFIX);
        out.push(b':');
        frame::push_hex_u64(&mut out, self.serial, SERIAL_WIDTH);
        out.extend_from_slice(frame::CRLF);
        out
    }
}

// ── LuaScript ─────────────────────────────────────────────────────────────────

/// Carries a session id and a script string; used both for command execution
/// and alive-checks. The script is the only variable-width field in the
/// protocol and always comes last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuaScriptRequest {
    pub session: u32,
    pub script: String,
}

impl LuaScriptRequest {
    pub const PREFIX: &'static [u8] = b"req_lua";

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let p = Self::PREFIX.len();
        let min = p + 1 + SESSION_WIDTH + 1 + frame::CRLF.len();
        if buf.len() < min
            || !frame::has_prefix(buf, Self::PREFIX)
            || !frame::colon_at(buf, p)
            || !frame::colon_at(buf, p + 1 + SESSION_WIDTH)
        {
            return None;
        }
        Some(Self {
            session: frame::hex_u64(buf, p + 1, SESSION_WIDTH)? as u32,
            script: frame::tail_str(buf, p + 1 + SESSION_WIDTH + 1)?.to_string(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::from(Self::PREFIX);
        out.push(b':');
        frame::push_hex_u64(&mut out, u64::from(self.session), SESSION_WIDTH);
        out.push(b':');
        out.extend_from_slice(self.script.as_bytes());
        out.extend_from_slice(frame::CRLF);
        out
    }
}

/// Script execution result for the matching session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LuaScriptResponse {
    pub session: u32,
    pub result: String,
}

impl LuaScriptResponse {
    pub const PREFIX: &'static [u8] = b"resp_lua";

    pub fn parse(buf: &[u8]) -> Option<Self> {
        let p = Self::PREFIX.len();
        let min = p + 1 + SESSION_WIDTH + 1 + frame::CRLF.len();
        if buf.len() < min
            || !frame::has_prefix(buf, Self::PREFIX)
            || !frame::colon_at(buf, p)
            || !frame::colon_at(buf, p + 1 + SESSION_WIDTH)
        {
            return None;
        }
        Some(Self {
            session: frame::hex_u64(buf, p + 1, SESSION_WIDTH)? as u32,
            result: frame::tail_str(buf, p + 1 + SESSION_WIDTH + 1)?.to_string(),
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::from(Self::PREFIX);
        out.push(b':');
        frame::push_hex_u64(&mut out, u64::from(self.session), SESSION_WIDTH);
        out.push(b':');
        out.extend_from_slice(self.result.as_bytes());
        out.extend_from_slice(frame::CRLF);
        out
    }
}

// ── Field-less frames ─────────────────────────────────────────────────────────

/// Parses a frame that is nothing but `PREFIX CRLF`.
fn parse_bare(buf: &[u8], prefix: &[u8]) -> Option<()> {
    let expected = prefix.len() + frame::CRLF.len();
    if buf.len() == expected && frame::has_prefix(buf, prefix) && frame::ends_with_crlf(buf) {
        Some(())
    } else {
        None
    }
}

fn serialize_bare(prefix: &[u8]) -> Vec<u8> {
    let mut out = Vec::from(prefix);
    out.extend_from_slice(frame::CRLF);
    out
}

/// `resp_set_key` — plain acknowledgement.
pub const SET_KEY_RESPONSE_PREFIX: &[u8] = b"resp_set_key";
/// `resp_reset` — plain acknowledgement.
pub const RESET_RESPONSE_PREFIX: &[u8] = b"resp_reset";
/// `req_start_ftp` / `resp_start_ftp` — file-transfer trigger.
pub const START_TFTPD_REQUEST_PREFIX: &[u8] = b"req_start_ftp";
pub const START_TFTPD_RESPONSE_PREFIX: &[u8] = b"resp_start_ftp";
/// `req_measure` / `resp_measure` — measurement generation trigger.
pub const GENERATE_MEASUREMENTS_REQUEST_PREFIX: &[u8] = b"req_measure";
pub const GENERATE_MEASUREMENTS_RESPONSE_PREFIX: &[u8] = b"resp_measure";
/// `resp_err` — generic negative acknowledgement, no payload semantics.
pub const ERROR_PREFIX: &[u8] = b"resp_err";

// ── Top-level command enum ────────────────────────────────────────────────────

/// Command kinds, shared by the request and response shape of each kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Discover,
    SetIp,
    SetKey,
    Reset,
    LuaScript,
    StartTftpd,
    GenerateMeasurements,
    Error,
}

/// All valid CLU frames, discriminated by kind and direction.
///
/// [`CluCommand::parse_any`] is the tagged-variant replacement for prefix
/// sniffing: it probes the buffer against each kind's `parse` in a fixed
/// priority order and the caller dispatches on the resulting variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CluCommand {
    Discover(DiscoverRequest),
    DiscoverReply(DiscoverResponse),
    SetIp(SetIpRequest),
    SetIpReply(SetIpResponse),
    SetKey(SetKeyRequest),
    SetKeyReply,
    Reset(ResetRequest),
    ResetReply,
    LuaScript(LuaScriptRequest),
    LuaScriptReply(LuaScriptResponse),
    StartTftpd,
    StartTftpdReply,
    GenerateMeasurements,
    GenerateMeasurementsReply,
    Error,
}

impl CluCommand {
    /// Probes `buf` against every known frame shape, in priority order.
    /// Returns `None` for malformed or foreign buffers.
    pub fn parse_any(buf: &[u8]) -> Option<CluCommand> {
        if let Some(c) = DiscoverRequest::parse(buf) {
            return Some(CluCommand::Discover(c));
        }
        if let Some(c) = SetIpRequest::parse(buf) {
            return Some(CluCommand::SetIp(c));
        }
        if let Some(c) = SetKeyRequest::parse(buf) {
            return Some(CluCommand::SetKey(c));
        }
        if let Some(c) = ResetRequest::parse(buf) {
            return Some(CluCommand::Reset(c));
        }
        if let Some(c) = LuaScriptRequest::parse(buf) {
            return Some(CluCommand::LuaScript(c));
        }
        if parse_bare(buf, START_TFTPD_REQUEST_PREFIX).is_some() {
            return Some(CluCommand::StartTftpd);
        }
        if parse_bare(buf, GENERATE_MEASUREMENTS_REQUEST_PREFIX).is_some() {
            return Some(CluCommand::GenerateMeasurements);
        }
        if let Some(c) = DiscoverResponse::parse(buf) {
            return Some(CluCommand::DiscoverReply(c));
        }
        if let Some(c) = SetIpResponse::parse(buf) {
            return Some(CluCommand::SetIpReply(c));
        }
        if parse_bare(buf, SET_KEY_RESPONSE_PREFIX).is_some() {
            return Some(CluCommand::SetKeyReply);
        }
        if parse_bare(buf, RESET_RESPONSE_PREFIX).is_some() {
            return Some(CluCommand::ResetReply);
        }
        if let Some(c) = LuaScriptResponse::parse(buf) {
            return Some(CluCommand::LuaScriptReply(c));
        }
        if parse_bare(buf, START_TFTPD_RESPONSE_PREFIX).is_some() {
            return Some(CluCommand::StartTftpdReply);
        }
        if parse_bare(buf, GENERATE_MEASUREMENTS_RESPONSE_PREFIX).is_some() {
            return Some(CluCommand::GenerateMeasurementsReply);
        }
        if parse_bare(buf, ERROR_PREFIX).is_some() {
            return Some(CluCommand::Error);
        }
        None
    }

    /// Serializes this command to its wire frame.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            CluCommand::Discover(c) => c.serialize(),
            CluCommand::DiscoverReply(c) => c.serialize(),
            CluCommand::SetIp(c) => c.serialize(),
            CluCommand::SetIpReply(c) => c.serialize(),
            CluCommand::SetKey(c) => c.serialize(),
            CluCommand::SetKeyReply => serialize_bare(SET_KEY_RESPONSE_PREFIX),
            CluCommand::Reset(c) => c.serialize(),
            CluCommand::ResetReply => serialize_bare(RESET_RESPONSE_PREFIX),
            CluCommand::LuaScript(c) => c.serialize(),
            CluCommand::LuaScriptReply(c) => c.serialize(),
            CluCommand::StartTftpd => serialize_bare(START_TFTPD_REQUEST_PREFIX),
            CluCommand::StartTftpdReply => serialize_bare(START_TFTPD_RESPONSE_PREFIX),
            CluCommand::GenerateMeasurements => {
                serialize_bare(GENERATE_MEASUREMENTS_REQUEST_PREFIX)
            }
            CluCommand::GenerateMeasurementsReply => {
                serialize_bare(GENERATE_MEASUREMENTS_RESPONSE_PREFIX)
            }
            CluCommand::Error => serialize_bare(ERROR_PREFIX),
        }
    }

    /// Returns the [`CommandKind`] discriminant for this frame.
    pub fn kind(&self) -> CommandKind {
        match self {
            CluCommand::Discover(_) | CluCommand::DiscoverReply(_) => CommandKind::Discover,
            CluCommand::SetIp(_) | CluCommand::SetIpReply(_) => CommandKind::SetIp,
            CluCommand::SetKey(_) | CluCommand::SetKeyReply => CommandKind::SetKey,
            CluCommand::Reset(_) | CluCommand::ResetReply => CommandKind::Reset,
            CluCommand::LuaScript(_) | CluCommand::LuaScriptReply(_) => CommandKind::LuaScript,
            CluCommand::StartTftpd | CluCommand::StartTftpdReply => CommandKind::StartTftpd,
            CluCommand::GenerateMeasurements | CluCommand::GenerateMeasurementsReply => {
                CommandKind::GenerateMeasurements
            }
            CluCommand::Error => CommandKind::Error,
        }
    }

    /// True for request-direction frames (the shapes a server dispatches).
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            CluCommand::Discover(_)
                | CluCommand::SetIp(_)
                | CluCommand::SetKey(_)
                | CluCommand::Reset(_)
                | CluCommand::LuaScript(_)
                | CluCommand::StartTftpd
                | CluCommand::GenerateMeasurements
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
