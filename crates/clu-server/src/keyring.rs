//! Candidate-key lists and the key-rotation state machine.
//!
//! The protocol has no session layer; a server decides which key a packet
//! was encrypted with by trying an ordered candidate list until one yields a
//! valid frame. Decryption success alone cannot identify the key: the project
//! key and every temporary key share the same AES secret and differ only in
//! IV, and under CBC a wrong IV corrupts only the first plaintext block while
//! the padding at the tail still validates. The frame parse is therefore part
//! of the trial, not a separate stage.
//!
//! The [`Keyring`] owns the candidate list. It is mutated only by the
//! dispatcher thread; everything else sees snapshots returned by the
//! candidate methods.
//!
//! State transitions:
//! - steady state: unicast accepts only the project key, broadcast also
//!   accepts the default broadcast key (re-IV'd with the project IV, which is
//!   the IV discovery senders wrap under);
//! - a successful `Discover` grants a temporary key, added to both lists;
//! - `SetKey` installs a new project key and discards every temporary key;
//! - `Reset` narrows back to the project key alone.

use clu_core::protocol::CluCommand;
use clu_core::CipherKey;
use tracing::{debug, info};

/// Ordered set of keys the server currently accepts.
#[derive(Debug)]
pub struct Keyring {
    project: CipherKey,
    temporaries: Vec<CipherKey>,
}

impl Keyring {
    pub fn new(project: CipherKey) -> Self {
        Self {
            project,
            temporaries: Vec::new(),
        }
    }

    /// The long-lived installation key.
    pub fn project(&self) -> &CipherKey {
        &self.project
    }

    /// True when `key` is the project key itself (not a temporary). Used by
    /// project-only commands.
    pub fn is_project(&self, key: &CipherKey) -> bool {
        *key == self.project
    }

    /// Candidates for broadcast traffic, most likely first: the default
    /// broadcast key carrying the project IV, then the project key, then any
    /// temporaries from in-progress discoveries.
    pub fn broadcast_candidates(&self) -> Vec<CipherKey> {
        let mut keys = Vec::with_capacity(2 + self.temporaries.len());
        keys.push(CipherKey::default_broadcast().with_iv(self.project.iv()));
        keys.push(self.project.clone());
        keys.extend(self.temporaries.iter().cloned());
        keys
    }

    /// Candidates for unicast traffic: the project key, then temporaries.
    /// The default broadcast key is never valid for unicast commands.
    pub fn unicast_candidates(&self) -> Vec<CipherKey> {
        let mut keys = Vec::with_capacity(1 + self.temporaries.len());
        keys.push(self.project.clone());
        keys.extend(self.temporaries.iter().cloned());
        keys
    }

    /// Adds a temporary key granted by a discovery handshake. Granting the
    /// same key twice is a no-op.
    pub fn grant_temporary(&mut self, key: CipherKey) {
        if self.temporaries.contains(&key) || key == self.project {
            return;
        }
        debug!(key = ?key, "temporary key granted");
        self.temporaries.push(key);
    }

    /// Installs a new project key and discards every temporary key.
    pub fn install(&mut self, new_project: CipherKey) {
        info!(key = ?new_project, "project key rotated");
        self.project = new_project;
        self.temporaries.clear();
    }

    /// Drops all temporary keys, keeping the project key. Side effect of
    /// `Reset`: the executing context is rebuilt, so in-progress discovery
    /// grants die with it.
    pub fn narrow(&mut self) {
        if !self.temporaries.is_empty() {
            debug!(count = self.temporaries.len(), "temporary keys discarded");
        }
        self.temporaries.clear();
    }
}

/// Tries each candidate key in order against `ciphertext`; returns the first
/// key whose plaintext parses as a known frame, along with the command.
///
/// A candidate whose decryption succeeds but does not parse is treated the
/// same as one that does not decrypt: with same-secret keys in the list a
/// wrong-IV candidate decrypts to a garbled first block, and only the parse
/// tells it apart from the right key.
///
/// Pure function: failed trials are the expected case, not errors.
pub fn try_decrypt_any(
    candidates: &[CipherKey],
    ciphertext: &[u8],
) -> Option<(CipherKey, CluCommand)> {
    candidates.iter().find_map(|key| {
        let plain = key.decrypt(ciphertext)?;
        let command = CluCommand::parse_any(&plain)?;
        Some((key.clone(), command))
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> CipherKey {
        CipherKey::new([0xA1; 16], [0xB2; 16])
    }

    #[test]
    fn test_steady_state_candidate_lists() {
        // Arrange
        let ring = Keyring::new(project());

        // Act / Assert
        let broadcast = ring.broadcast_candidates();
        assert_eq!(broadcast.len(), 2);
        assert_eq!(broadcast[0], CipherKey::default_broadcast().with_iv(project().iv()));
        assert_eq!(broadcast[1], project());
        assert_eq!(ring.unicast_candidates(), vec![project()]);
    }

    #[test]
    fn test_grant_temporary_extends_both_lists() {
        // Arrange
        let mut ring = Keyring::new(project());
        let temp = project().with_iv([0xC3; 16]);

        // Act
        ring.grant_temporary(temp.clone());

        // Assert
        assert_eq!(ring.unicast_candidates(), vec![project(), temp.clone()]);
        assert_eq!(ring.broadcast_candidates().last(), Some(&temp));
    }

    #[test]
    fn test_grant_temporary_deduplicates() {
        let mut ring = Keyring::new(project());
        let temp = project().with_iv([0xC3; 16]);
        ring.grant_temporary(temp.clone());
        ring.grant_temporary(temp.clone());
        ring.grant_temporary(project());

        assert_eq!(ring.unicast_candidates().len(), 2);
    }

    #[test]
    fn test_install_collapses_to_the_new_project_key() {
        // Arrange
        let mut ring = Keyring::new(project());
        ring.grant_temporary(project().with_iv([0xC3; 16]));
        ring.grant_temporary(project().with_iv([0xC4; 16]));
        let new_key = CipherKey::new([0x0D; 16], [0x0E; 16]);

        // Act
        ring.install(new_key.clone());

        // Assert
        assert_eq!(ring.unicast_candidates(), vec![new_key.clone()]);
        assert!(ring.is_project(&new_key));
        assert!(!ring.is_project(&project()));
    }

    #[test]
    fn test_narrow_keeps_only_the_project_key() {
        let mut ring = Keyring::new(project());
        ring.grant_temporary(project().with_iv([0xC3; 16]));

        ring.narrow();

        assert_eq!(ring.unicast_candidates(), vec![project()]);
    }

    fn reset_frame() -> Vec<u8> {
        use clu_core::protocol::commands::ResetRequest;
        CluCommand::Reset(ResetRequest { serial: 1 }).serialize()
    }

    #[test]
    fn test_try_decrypt_any_returns_the_matching_key_and_command() {
        // Arrange
        let key_a = CipherKey::new([1; 16], [2; 16]);
        let key_b = CipherKey::new([3; 16], [4; 16]);
        let ciphertext = key_b.encrypt(&reset_frame());

        // Act
        let hit = try_decrypt_any(&[key_a, key_b.clone()], &ciphertext);

        // Assert
        let (key, command) = hit.expect("second candidate must match");
        assert_eq!(key, key_b);
        assert!(matches!(command, CluCommand::Reset(_)));
    }

    #[test]
    fn test_try_decrypt_any_fails_when_no_candidate_matches() {
        let key_a = CipherKey::new([1; 16], [2; 16]);
        let foreign = CipherKey::new([9; 16], [9; 16]);
        let ciphertext = foreign.encrypt(&reset_frame());

        assert!(try_decrypt_any(&[key_a], &ciphertext).is_none());
        assert!(try_decrypt_any(&[], &ciphertext).is_none());
    }

    #[test]
    fn test_try_decrypt_any_is_not_fooled_by_a_same_secret_wrong_iv_key() {
        // A temporary key is the project key under a new IV. Decrypting its
        // traffic with the project key corrupts only the first block and the
        // padding still validates, so decryption alone always picks the
        // earlier project key. The trial must fall through to the key whose
        // plaintext actually parses.
        let temporary = project().with_iv([0xC3; 16]);
        let ciphertext = temporary.encrypt(&reset_frame());
        assert!(
            project().decrypt(&ciphertext).is_some(),
            "the wrong-IV decryption is expected to succeed"
        );

        let (hit, command) =
            try_decrypt_any(&[project(), temporary.clone()], &ciphertext).unwrap();

        assert_eq!(hit, temporary);
        assert!(matches!(command, CluCommand::Reset(_)));
    }
}
