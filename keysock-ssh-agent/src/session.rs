//! Embedded SSH agent session.

use std::io;
use std::sync::{Arc, RwLock};

use signature::Signer as _;
use ssh_agent_lib::agent::Session;
use ssh_agent_lib::error::AgentError;
use ssh_agent_lib::proto::{AddIdentity, Credential, Identity, RemoveIdentity, SignRequest};
use ssh_key::{HashAlg, PrivateKey, Signature};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::keystore::{KeyEntry, Keyring, KeyringError};

/// In-process agent.  Cloned per incoming connection by `ssh_agent_lib`; all
/// clones share one [`Keyring`].
#[derive(Clone, Debug)]
pub struct SshAgent {
    keyring: Arc<RwLock<Keyring>>,
}

impl SshAgent {
    pub fn new(keyring: Arc<RwLock<Keyring>>) -> Self {
        Self { keyring }
    }

    pub fn keyring(&self) -> &Arc<RwLock<Keyring>> {
        &self.keyring
    }

    fn with_keyring<T>(
        &self,
        f: impl FnOnce(&mut Keyring) -> Result<T, KeyringError>,
    ) -> Result<T, AgentError> {
        let mut keyring = self
            .keyring
            .write()
            .map_err(|_| other_err("keyring lock poisoned"))?;
        f(&mut keyring).map_err(keyring_err)
    }
}

fn other_err(msg: impl Into<String>) -> AgentError {
    AgentError::other(io::Error::other(msg.into()))
}

fn keyring_err(e: KeyringError) -> AgentError {
    other_err(e.to_string())
}

#[ssh_agent_lib::async_trait]
impl Session for SshAgent {
    async fn request_identities(&mut self) -> Result<Vec<Identity>, AgentError> {
        let keyring = self
            .keyring
            .read()
            .map_err(|_| other_err("keyring lock poisoned"))?;

        let identities: Vec<Identity> = keyring
            .identities()
            .map(|entry| Identity {
                pubkey: entry.private_key.public_key().key_data().clone().into(),
                comment: entry.comment.clone(),
            })
            .collect();

        debug!(count = identities.len(), "request_identities");
        Ok(identities)
    }

    async fn sign(&mut self, request: SignRequest) -> Result<Signature, AgentError> {
        let fingerprint = request.pubkey.fingerprint(HashAlg::Sha256).to_string();

        let keyring = self
            .keyring
            .read()
            .map_err(|_| other_err("keyring lock poisoned"))?;

        let entry = keyring
            .get_by_fingerprint(&fingerprint)
            .map_err(keyring_err)?;

        debug!(
            fingerprint = %fingerprint,
            comment = %entry.comment,
            data_len = request.data.len(),
            "sign"
        );

        entry
            .private_key
            .try_sign(&request.data)
            .map_err(|e| other_err(format!("signing failed: {e}")))
    }

    async fn add_identity(&mut self, identity: AddIdentity) -> Result<(), AgentError> {
        let Credential::Key { privkey, comment } = identity.credential else {
            return Err(other_err("certificate identities are not supported"));
        };
        let private_key = PrivateKey::new(privkey, comment)
            .map_err(|e| other_err(format!("invalid private key: {e}")))?;
        let entry = KeyEntry::new(private_key);
        let fingerprint = entry.fingerprint.clone();

        self.with_keyring(|keyring| keyring.insert(entry))?;
        info!(fingerprint = %fingerprint, "identity added");
        Ok(())
    }

    async fn remove_identity(&mut self, identity: RemoveIdentity) -> Result<(), AgentError> {
        let fingerprint = identity.pubkey.fingerprint(HashAlg::Sha256).to_string();
        self.with_keyring(|keyring| keyring.remove(&fingerprint))?;
        info!(fingerprint = %fingerprint, "identity removed");
        Ok(())
    }

    async fn remove_all_identities(&mut self) -> Result<(), AgentError> {
        self.with_keyring(Keyring::clear)?;
        info!("all identities removed");
        Ok(())
    }

    async fn lock(&mut self, key: String) -> Result<(), AgentError> {
        self.with_keyring(|keyring| keyring.lock(Zeroizing::new(key)))?;
        info!("agent locked");
        Ok(())
    }

    async fn unlock(&mut self, key: String) -> Result<(), AgentError> {
        let key = Zeroizing::new(key);
        self.with_keyring(|keyring| keyring.unlock(&key))?;
        info!("agent unlocked");
        Ok(())
    }
}
