//! Identity record for one discovered CLU.

use std::net::Ipv4Addr;

use crate::cipher::CipherKey;

/// Everything the controller side knows about a CLU after discovery: its
/// identity, where to reach it, and the temporary key granted for the rest
/// of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CluDevice {
    pub serial_number: u64,
    /// Colon-separated uppercase hex, e.g. `00:1A:2B:3C:4D:5E`.
    pub mac_address: String,
    pub address: Ipv4Addr,
    /// Temporary session key granted by the discovery handshake.
    pub cipher_key: CipherKey,
}

impl CluDevice {
    pub fn new(
        serial_number: u64,
        mac: [u8; 6],
        address: Ipv4Addr,
        cipher_key: CipherKey,
    ) -> Self {
        let mac_address = mac
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");
        Self {
            serial_number,
            mac_address,
            address,
            cipher_key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_address_formats_as_colon_separated_hex() {
        let device = CluDevice::new(
            7,
            [0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E],
            Ipv4Addr::new(192, 168, 1, 100),
            CipherKey::default_broadcast(),
        );
        assert_eq!(device.mac_address, "00:1A:2B:3C:4D:5E");
    }
}
