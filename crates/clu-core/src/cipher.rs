//! Symmetric command cipher: AES-128-CBC with PKCS#7 padding.
//!
//! Every datagram on the wire is one command frame encrypted under a
//! [`CipherKey`]. Decryption is deliberately infallible in the API sense:
//! a wrong key, a foreign packet, or a truncated ciphertext all yield `None`,
//! never an error. The server leans on this to try an ordered list of
//! candidate keys against a single inbound packet.
//!
//! Encryption and decryption stream the input through a fixed 256-byte
//! working buffer, so arbitrarily large payloads never require a second
//! full-size allocation beyond the output itself. The result is byte-identical
//! to processing the whole buffer at once.

use aes::cipher::{Block, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

/// AES-128 block and key length in bytes.
pub const BLOCK_LEN: usize = 16;

/// Size of the bounded working buffer used while streaming blocks.
/// Must be a multiple of [`BLOCK_LEN`].
const WORK_LEN: usize = 256;

/// The well-known key half of the default broadcast key.
///
/// Factory-fresh devices and controllers that have not yet exchanged a
/// project secret wrap discovery traffic under this key. It provides no
/// confidentiality against anyone who has read this source; it only keeps
/// unrelated LAN noise from parsing as commands.
const DEFAULT_BROADCAST_KEY: [u8; BLOCK_LEN] = [
    0x13, 0x41, 0xA6, 0x96, 0x08, 0xD6, 0xFA, 0x33, 0x39, 0xC6, 0x5C, 0xB2, 0x4A, 0x91, 0x0F,
    0x7C,
];

/// The well-known IV half of the default broadcast key.
const DEFAULT_BROADCAST_IV: [u8; BLOCK_LEN] = [
    0x92, 0xC6, 0x02, 0xD9, 0x4D, 0x1E, 0x7A, 0x25, 0xBE, 0x55, 0x8E, 0x51, 0x36, 0xDA, 0x63,
    0x07,
];

/// A symmetric key + initialization vector pair.
///
/// Immutable: [`CipherKey::with_iv`] produces a new key reusing the same
/// secret. Equality is structural (key bytes + IV bytes) and is used only for
/// logging and candidate-list dedup, never for security decisions.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey {
    key: [u8; BLOCK_LEN],
    iv: [u8; BLOCK_LEN],
}

impl CipherKey {
    /// Creates a key from explicit key and IV bytes.
    pub fn new(key: [u8; BLOCK_LEN], iv: [u8; BLOCK_LEN]) -> Self {
        Self { key, iv }
    }

    /// The fixed, publicly known key used to wrap discovery traffic before
    /// any project key exchange.
    pub fn default_broadcast() -> Self {
        Self {
            key: DEFAULT_BROADCAST_KEY,
            iv: DEFAULT_BROADCAST_IV,
        }
    }

    /// Derives a device-specific key by XOR-folding a private secret against
    /// an IV: the first half of the secret is XORed with the IV in forward
    /// order, the second half with the IV in reverse order.
    ///
    /// This is the only way a fresh device key is ever produced without an
    /// explicit `SetKey` command.
    pub fn derive(secret: &[u8; BLOCK_LEN], iv: &[u8; BLOCK_LEN]) -> Self {
        let mut key = [0u8; BLOCK_LEN];
        let half = BLOCK_LEN / 2;
        for i in 0..half {
            key[i] = secret[i] ^ iv[i];
        }
        for i in half..BLOCK_LEN {
            key[i] = secret[i] ^ iv[BLOCK_LEN - 1 - (i - half)];
        }
        Self { key, iv: *iv }
    }

    /// Returns a new key with the same secret but a different IV.
    pub fn with_iv(&self, iv: [u8; BLOCK_LEN]) -> Self {
        Self { key: self.key, iv }
    }

    /// The IV half of this key.
    pub fn iv(&self) -> [u8; BLOCK_LEN] {
        self.iv
    }

    /// Encrypts `plaintext` with AES-128-CBC and PKCS#7 padding.
    ///
    /// Total function: any input length (including zero) produces a
    /// ciphertext whose length is the next multiple of [`BLOCK_LEN`]
    /// strictly greater than the input length.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes128::new(&self.key.into());
        let mut out = Vec::with_capacity(plaintext.len() + BLOCK_LEN);
        let mut chain = self.iv;
        let mut work = [0u8; WORK_LEN];

        // Whole blocks first; the remainder joins the padding block below.
        let body_len = (plaintext.len() / BLOCK_LEN) * BLOCK_LEN;
        for chunk in plaintext[..body_len].chunks(WORK_LEN) {
            work[..chunk.len()].copy_from_slice(chunk);
            encrypt_blocks(&cipher, &mut chain, &mut work[..chunk.len()], &mut out);
        }

        // Final block: remainder bytes plus PKCS#7 padding. A full extra
        // padding block is emitted when the input is block-aligned.
        let rem = &plaintext[body_len..];
        let pad = (BLOCK_LEN - rem.len()) as u8;
        work[..rem.len()].copy_from_slice(rem);
        for slot in &mut work[rem.len()..BLOCK_LEN] {
            *slot = pad;
        }
        encrypt_blocks(&cipher, &mut chain, &mut work[..BLOCK_LEN], &mut out);

        out
    }

    /// Decrypts `ciphertext`, returning `None` on any length or padding
    /// violation. A wrong key surfaces as invalid padding with overwhelming
    /// probability, so `None` here is the expected outcome of a failed
    /// candidate-key trial, not an error.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Option<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_LEN != 0 {
            return None;
        }

        let cipher = Aes128::new(&self.key.into());
        let mut out = Vec::with_capacity(ciphertext.len());
        let mut chain = self.iv;
        let mut work = [0u8; WORK_LEN];

        for chunk in ciphertext.chunks(WORK_LEN) {
            work[..chunk.len()].copy_from_slice(chunk);
            let mut offset = 0;
            while offset < chunk.len() {
                let mut next_chain = [0u8; BLOCK_LEN];
                next_chain.copy_from_slice(&work[offset..offset + BLOCK_LEN]);

                let block = Block::<Aes128>::from_mut_slice(&mut work[offset..offset + BLOCK_LEN]);
                cipher.decrypt_block(block);
                for (b, c) in work[offset..offset + BLOCK_LEN].iter_mut().zip(chain.iter()) {
                    *b ^= c;
                }

                out.extend_from_slice(&work[offset..offset + BLOCK_LEN]);
                chain = next_chain;
                offset += BLOCK_LEN;
            }
        }

        strip_padding(out)
    }
}

/// CBC-encrypts `work` (a multiple of [`BLOCK_LEN`] bytes) in place,
/// appending the ciphertext to `out` and advancing the chaining block.
fn encrypt_blocks(cipher: &Aes128, chain: &mut [u8; BLOCK_LEN], work: &mut [u8], out: &mut Vec<u8>) {
    debug_assert_eq!(work.len() % BLOCK_LEN, 0);
    let mut offset = 0;
    while offset < work.len() {
        for (b, c) in work[offset..offset + BLOCK_LEN].iter_mut().zip(chain.iter()) {
            *b ^= c;
        }
        let block = Block::<Aes128>::from_mut_slice(&mut work[offset..offset + BLOCK_LEN]);
        cipher.encrypt_block(block);
        chain.copy_from_slice(&work[offset..offset + BLOCK_LEN]);
        out.extend_from_slice(&work[offset..offset + BLOCK_LEN]);
        offset += BLOCK_LEN;
    }
}

/// Validates and removes PKCS#7 padding. The padding bytes are compared
/// without early exit so a wrong-key trial costs the same regardless of
/// where the mismatch sits.
fn strip_padding(mut plain: Vec<u8>) -> Option<Vec<u8>> {
    let pad = *plain.last()? as usize;
    if pad == 0 || pad > BLOCK_LEN || pad > plain.len() {
        return None;
    }
    let start = plain.len() - pad;
    let mut mismatched: u8 = 0;
    for &byte in &plain[start..] {
        mismatched |= byte ^ pad as u8;
    }
    if mismatched != 0 {
        return None;
    }
    plain.truncate(start);
    Some(plain)
}

impl std::fmt::Debug for CipherKey {
    /// Shows only a short fingerprint of the key so full key material never
    /// lands in logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CipherKey({}../{}..)",
            hex::encode_upper(&self.key[..2]),
            hex::encode_upper(&self.iv[..2])
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_key() -> CipherKey {
        let mut key = [0u8; BLOCK_LEN];
        let mut iv = [0u8; BLOCK_LEN];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut iv);
        CipherKey::new(key, iv)
    }

    #[test]
    fn test_encrypt_decrypt_round_trip_for_various_lengths() {
        let key = random_key();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 255, 256, 257, 4096] {
            let mut plain = vec![0u8; len];
            rand::rngs::OsRng.fill_bytes(&mut plain);

            let ct = key.encrypt(&plain);
            let decrypted = key.decrypt(&ct);

            assert_eq!(decrypted.as_deref(), Some(plain.as_slice()), "len={len}");
        }
    }

    #[test]
    fn test_ciphertext_length_is_next_block_multiple() {
        let key = random_key();
        for len in [0usize, 1, 15, 16, 17, 240, 256] {
            let ct = key.encrypt(&vec![0xA5; len]);
            assert_eq!(ct.len(), (len / BLOCK_LEN + 1) * BLOCK_LEN, "len={len}");
        }
    }

    #[test]
    fn test_decrypt_with_wrong_key_returns_none_or_garbage_never_plaintext() {
        // Wrong-key decryption hits the padding check, which fails with
        // overwhelming probability. Accidental padding survival is possible
        // (~0.4% per sample), so assert that it is rare and that a surviving
        // plaintext never equals the original.
        let key_a = random_key();
        let key_b = random_key();
        let mut survived = 0;
        for _ in 0..8 {
            let mut plain = vec![0u8; 48];
            rand::rngs::OsRng.fill_bytes(&mut plain);
            let ct = key_a.encrypt(&plain);
            if let Some(recovered) = key_b.decrypt(&ct) {
                assert_ne!(recovered, plain, "wrong key must never recover the plaintext");
                survived += 1;
            }
        }
        assert!(survived <= 2, "wrong-key decrypt succeeded {survived}/8 times");
    }

    #[test]
    fn test_decrypt_rejects_empty_and_non_block_aligned_input() {
        let key = random_key();
        assert_eq!(key.decrypt(&[]), None);
        assert_eq!(key.decrypt(&[0u8; 15]), None);
        assert_eq!(key.decrypt(&[0u8; 17]), None);
    }

    #[test]
    fn test_decrypt_rejects_truncated_ciphertext() {
        let key = random_key();
        let ct = key.encrypt(b"a frame that spans multiple cipher blocks for sure");
        // Dropping the last block invalidates the padding.
        let truncated = &ct[..ct.len() - BLOCK_LEN];
        assert_eq!(key.decrypt(truncated), None);
    }

    #[test]
    fn test_with_iv_keeps_secret_but_changes_output() {
        let key = random_key();
        let mut other_iv = [0u8; BLOCK_LEN];
        rand::rngs::OsRng.fill_bytes(&mut other_iv);
        let rekeyed = key.with_iv(other_iv);

        let plain = b"same secret, different chaining";
        let ct_a = key.encrypt(plain);
        let ct_b = rekeyed.encrypt(plain);

        assert_ne!(ct_a, ct_b, "a different IV must change the ciphertext");
        assert_eq!(rekeyed.decrypt(&ct_b).as_deref(), Some(plain.as_slice()));
        assert_eq!(rekeyed.iv(), other_iv);
    }

    #[test]
    fn test_derive_is_deterministic() {
        let secret = [0x42u8; BLOCK_LEN];
        let iv = DEFAULT_BROADCAST_IV;
        assert_eq!(CipherKey::derive(&secret, &iv), CipherKey::derive(&secret, &iv));
    }

    #[test]
    fn test_derive_folds_halves_in_opposite_directions() {
        // With a secret of all zeroes the derived key is the IV folded onto
        // itself: first half forward, second half mirrored.
        let secret = [0u8; BLOCK_LEN];
        let mut iv = [0u8; BLOCK_LEN];
        for (i, b) in iv.iter_mut().enumerate() {
            *b = i as u8;
        }
        let derived = CipherKey::derive(&secret, &iv);
        let plain = b"probe";
        // Construct the expected key by hand and compare behaviourally.
        let mut expected = [0u8; BLOCK_LEN];
        for i in 0..8 {
            expected[i] = iv[i];
        }
        for i in 8..BLOCK_LEN {
            expected[i] = iv[BLOCK_LEN - 1 - (i - 8)];
        }
        let reference = CipherKey::new(expected, iv);
        assert_eq!(reference.encrypt(plain), derived.encrypt(plain));
    }

    #[test]
    fn test_default_broadcast_key_is_stable() {
        let a = CipherKey::default_broadcast();
        let b = CipherKey::default_broadcast();
        assert_eq!(a, b);
        assert_eq!(a.iv(), DEFAULT_BROADCAST_IV);
    }

    #[test]
    fn test_streaming_matches_across_work_buffer_boundary() {
        // Inputs straddling the internal chunk size must still round-trip;
        // this is the regression guard for the chaining hand-off between
        // working-buffer refills.
        let key = random_key();
        for len in [WORK_LEN - 1, WORK_LEN, WORK_LEN + 1, 3 * WORK_LEN + 5] {
            let mut plain = vec![0u8; len];
            rand::rngs::OsRng.fill_bytes(&mut plain);
            assert_eq!(key.decrypt(&key.encrypt(&plain)).as_deref(), Some(plain.as_slice()));
        }
    }

    #[test]
    fn test_debug_does_not_leak_full_key() {
        let key = CipherKey::new([0xAB; BLOCK_LEN], [0xCD; BLOCK_LEN]);
        let rendered = format!("{key:?}");
        assert!(rendered.contains("ABAB"));
        assert!(!rendered.contains("ABABABABABABABAB"));
    }
}
