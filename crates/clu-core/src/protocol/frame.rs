//! Low-level field codecs for the fixed-width ASCII frame format.
//!
//! A frame is `PREFIX ':' field ':' field … CRLF`. Every field has a fixed
//! character width for its command kind: integers are uppercase zero-padded
//! hex, IPv4 addresses are dotted decimal with zero-padded octets (exactly
//! [`IP_WIDTH`] chars). Only the trailing script/result field of the Lua
//! command is variable width.
//!
//! All readers return `Option`: a violation anywhere means "this buffer is
//! not that frame", which callers treat as a failed probe, not a fault.

use std::net::Ipv4Addr;

/// Frame terminator.
pub(crate) const CRLF: &[u8] = b"\r\n";

/// Fixed character width of a dotted-decimal IPv4 field, e.g. `192.168.001.100`.
pub(crate) const IP_WIDTH: usize = 15;

/// True if `buf` starts with the literal `prefix` at offset 0.
pub(crate) fn has_prefix(buf: &[u8], prefix: &[u8]) -> bool {
    buf.len() >= prefix.len() && &buf[..prefix.len()] == prefix
}

/// True if the byte at `offset` is the `:` delimiter.
pub(crate) fn colon_at(buf: &[u8], offset: usize) -> bool {
    buf.get(offset) == Some(&b':')
}

/// True if the buffer ends with CRLF.
pub(crate) fn ends_with_crlf(buf: &[u8]) -> bool {
    buf.len() >= CRLF.len() && &buf[buf.len() - CRLF.len()..] == CRLF
}

fn is_upper_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'A'..=b'F').contains(&b)
}

/// Reads a fixed-width uppercase-hex integer field.
pub(crate) fn hex_u64(buf: &[u8], offset: usize, width: usize) -> Option<u64> {
    let field = buf.get(offset..offset + width)?;
    if !field.iter().all(|&b| is_upper_hex(b)) {
        return None;
    }
    let text = std::str::from_utf8(field).ok()?;
    u64::from_str_radix(text, 16).ok()
}

/// Reads a fixed-width uppercase-hex byte-array field (`2 * N` chars).
pub(crate) fn hex_array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let field = buf.get(offset..offset + 2 * N)?;
    if !field.iter().all(|&b| is_upper_hex(b)) {
        return None;
    }
    let mut out = [0u8; N];
    hex::decode_to_slice(field, &mut out).ok()?;
    Some(out)
}

/// Reads a fixed-width dotted-decimal IPv4 field with zero-padded octets.
pub(crate) fn ip(buf: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let field = buf.get(offset..offset + IP_WIDTH)?;
    if field[3] != b'.' || field[7] != b'.' || field[11] != b'.' {
        return None;
    }
    let mut octets = [0u8; 4];
    let chunks = [&field[0..3], &field[4..7], &field[8..11], &field[12..15]];
    for (slot, chunk) in octets.iter_mut().zip(chunks) {
        if !chunk.iter().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u16 = std::str::from_utf8(chunk).ok()?.parse().ok()?;
        if value > 255 {
            return None;
        }
        *slot = value as u8;
    }
    Some(Ipv4Addr::from(octets))
}

/// Reads the variable-width trailing field: everything from `offset` up to
/// the terminating CRLF, as UTF-8.
pub(crate) fn tail_str(buf: &[u8], offset: usize) -> Option<&str> {
    if buf.len() < offset + CRLF.len() || !ends_with_crlf(buf) {
        return None;
    }
    std::str::from_utf8(&buf[offset..buf.len() - CRLF.len()]).ok()
}

/// Writes an uppercase zero-padded hex integer of exactly `width` chars.
pub(crate) fn push_hex_u64(out: &mut Vec<u8>, value: u64, width: usize) {
    out.extend_from_slice(format!("{value:0width$X}").as_bytes());
}

/// Writes bytes as uppercase hex.
pub(crate) fn push_hex_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(hex::encode_upper(bytes).as_bytes());
}

/// Writes a dotted-decimal IPv4 field with zero-padded octets.
pub(crate) fn push_ip(out: &mut Vec<u8>, address: Ipv4Addr) {
    let o = address.octets();
    out.extend_from_slice(format!("{:03}.{:03}.{:03}.{:03}", o[0], o[1], o[2], o[3]).as_bytes());
}

// ── Tests ─────────────────────────────────────────────────────────────────────
