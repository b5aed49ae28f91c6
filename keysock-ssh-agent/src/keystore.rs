//! In-memory keyring.
//!
//! The [`Keyring`] holds every identity added to the embedded agent.  It is
//! created empty when the server starts and dropped with the process; nothing
//! is persisted.
//!
//! Thread safety: the keyring is only ever reached through
//! `Arc<RwLock<Keyring>>`, so each agent request observes and mutates it
//! atomically.

use std::sync::{Arc, RwLock};

use ssh_key::{HashAlg, PrivateKey};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

/// Failures of keyring operations.  Each maps to an agent `FAILURE` reply.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum KeyringError {
    #[error("keyring is locked")]
    Locked,
    #[error("keyring is not locked")]
    NotLocked,
    #[error("incorrect passphrase")]
    BadPassphrase,
    #[error("key not found: {0}")]
    UnknownKey(String),
}

/// One identity held by the agent.
#[derive(Clone)]
pub struct KeyEntry {
    /// Comment supplied by the client when the key was added.
    pub comment: String,

    /// The private key (zeroized on drop via `ssh_key::PrivateKey`).
    pub private_key: PrivateKey,

    /// SHA-256 fingerprint string (e.g. `"SHA256:abc123…"`).
    pub fingerprint: String,
}

impl KeyEntry {
    pub fn new(private_key: PrivateKey) -> Self {
        let fingerprint = private_key
            .public_key()
            .fingerprint(HashAlg::Sha256)
            .to_string();
        Self {
            comment: private_key.comment().to_string(),
            private_key,
            fingerprint,
        }
    }
}

impl std::fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyEntry")
            .field("comment", &self.comment)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Drop for KeyEntry {
    fn drop(&mut self) {
        self.comment.zeroize();
    }
}

/// The embedded agent's set of identities.
///
/// Entries are unique by fingerprint and kept in insertion order, which is
/// the order `request_identities` reports them in.
#[derive(Default)]
pub struct Keyring {
    entries: Vec<KeyEntry>,
    /// Set while the agent is locked.
    passphrase: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keyring")
            .field("entries", &self.entries)
            .field("locked", &self.is_locked())
            .finish()
    }
}

impl Keyring {
    /// Create an empty, shareable keyring.
    pub fn new() -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Add a key.  A key whose fingerprint is already present replaces the
    /// existing entry in place, picking up the new comment.
    pub fn insert(&mut self, entry: KeyEntry) -> Result<(), KeyringError> {
        self.ensure_unlocked()?;
        debug!(
            fingerprint = %entry.fingerprint,
            comment = %entry.comment,
            "keyring: adding key"
        );
        match self
            .entries
            .iter_mut()
            .find(|e| e.fingerprint == entry.fingerprint)
        {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        Ok(())
    }

    /// Remove the key with the given fingerprint.
    pub fn remove(&mut self, fingerprint: &str) -> Result<(), KeyringError> {
        self.ensure_unlocked()?;
        let before = self.entries.len();
        self.entries.retain(|e| e.fingerprint != fingerprint);
        if self.entries.len() == before {
            return Err(KeyringError::UnknownKey(fingerprint.to_string()));
        }
        debug!(fingerprint = %fingerprint, "keyring: removed key");
        Ok(())
    }

    /// Remove all keys.
    pub fn clear(&mut self) -> Result<(), KeyringError> {
        self.ensure_unlocked()?;
        let removed = self.entries.len();
        self.entries.clear();
        debug!(removed, "keyring: cleared");
        Ok(())
    }

    /// Look up a key for signing.
    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Result<&KeyEntry, KeyringError> {
        self.ensure_unlocked()?;
        self.entries
            .iter()
            .find(|e| e.fingerprint == fingerprint)
            .ok_or_else(|| KeyringError::UnknownKey(fingerprint.to_string()))
    }

    /// Identities visible to clients.  A locked keyring advertises nothing.
    pub fn identities(&self) -> impl Iterator<Item = &KeyEntry> {
        let visible = if self.is_locked() { &[][..] } else { &self.entries[..] };
        visible.iter()
    }

    /// Number of stored keys, including while locked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.passphrase.is_some()
    }

    /// Lock the keyring with `passphrase`.
    pub fn lock(&mut self, passphrase: Zeroizing<String>) -> Result<(), KeyringError> {
        self.ensure_unlocked()?;
        self.passphrase = Some(passphrase);
        debug!("keyring: locked");
        Ok(())
    }

    /// Unlock a keyring previously locked with the same passphrase.
    pub fn unlock(&mut self, passphrase: &str) -> Result<(), KeyringError> {
        match &self.passphrase {
            None => Err(KeyringError::NotLocked),
            Some(expected) if expected.as_str() != passphrase => Err(KeyringError::BadPassphrase),
            Some(_) => {
                self.passphrase = None;
                debug!("keyring: unlocked");
                Ok(())
            }
        }
    }

    fn ensure_unlocked(&self) -> Result<(), KeyringError> {
        if self.is_locked() {
            return Err(KeyringError::Locked);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::OsRng;
    use ssh_key::Algorithm;

    fn ed25519(comment: &str) -> PrivateKey {
        let mut key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).expect("keygen");
        key.set_comment(comment);
        key
    }

    #[test]
    fn insert_and_list_in_order() {
        let mut ring = Keyring::default();
        ring.insert(KeyEntry::new(ed25519("first"))).expect("insert");
        ring.insert(KeyEntry::new(ed25519("second"))).expect("insert");

        let comments: Vec<&str> = ring.identities().map(|e| e.comment.as_str()).collect();
        assert_eq!(comments, ["first", "second"]);
    }

    #[test]
    fn same_key_twice_is_stored_once() {
        let key = ed25519("original");
        let mut again = key.clone();
        again.set_comment("renamed");

        let mut ring = Keyring::default();
        ring.insert(KeyEntry::new(key)).expect("insert");
        ring.insert(KeyEntry::new(again)).expect("insert");

        assert_eq!(ring.len(), 1);
        let entry = ring.identities().next().expect("one identity");
        assert_eq!(entry.comment, "renamed");
    }

    #[test]
    fn remove_by_fingerprint() {
        let entry = KeyEntry::new(ed25519("k"));
        let fingerprint = entry.fingerprint.clone();
        let mut ring = Keyring::default();
        ring.insert(entry).expect("insert");

        ring.remove(&fingerprint).expect("remove");
        assert!(ring.is_empty());
        assert_eq!(
            ring.remove(&fingerprint),
            Err(KeyringError::UnknownKey(fingerprint))
        );
    }

    #[test]
    fn clear_removes_everything() {
        let mut ring = Keyring::default();
        ring.insert(KeyEntry::new(ed25519("a"))).expect("insert");
        ring.insert(KeyEntry::new(ed25519("b"))).expect("insert");
        ring.clear().expect("clear");
        assert!(ring.is_empty());
    }

    #[test]
    fn locked_keyring_hides_and_refuses() {
        let entry = KeyEntry::new(ed25519("k"));
        let fingerprint = entry.fingerprint.clone();
        let mut ring = Keyring::default();
        ring.insert(entry).expect("insert");

        ring.lock(Zeroizing::new("hunter2".to_string())).expect("lock");
        assert!(ring.is_locked());
        assert_eq!(ring.identities().count(), 0);
        assert_eq!(ring.len(), 1);
        assert_eq!(
            ring.insert(KeyEntry::new(ed25519("x"))),
            Err(KeyringError::Locked)
        );
        assert!(matches!(
            ring.get_by_fingerprint(&fingerprint),
            Err(KeyringError::Locked)
        ));
        assert_eq!(
            ring.lock(Zeroizing::new("again".to_string())),
            Err(KeyringError::Locked)
        );

        assert_eq!(ring.unlock("wrong"), Err(KeyringError::BadPassphrase));
        ring.unlock("hunter2").expect("unlock");
        assert_eq!(ring.identities().count(), 1);
        assert_eq!(ring.unlock("hunter2"), Err(KeyringError::NotLocked));
    }
}
