//! Key provisioning client.
//!
//! Dials a principal's agent socket and installs freshly generated keys into
//! whichever agent answers, embedded or supervised.  The client only speaks
//! the standard agent protocol, so it cannot tell the two apart.

use std::path::{Path, PathBuf};

use keysock_core::{KeyAlgorithm, KeysockError, socket_path};
use rand::rngs::OsRng;
use ssh_agent_lib::agent::Session as _;
use ssh_agent_lib::client::Client;
use ssh_agent_lib::proto::{AddIdentity, Credential};
use ssh_key::private::{Ed25519Keypair, KeypairData, RsaKeypair};
use ssh_key::{HashAlg, PrivateKey};
use tokio::net::UnixStream;
use tracing::{debug, info};

/// One identity reported by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedKey {
    /// SHA-256 fingerprint, e.g. `SHA256:…`.
    pub fingerprint: String,
    pub comment: String,
}

impl std::fmt::Display for ListedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.fingerprint, self.comment)
    }
}

/// Resolve the socket for `principal`, failing if no agent has created it.
pub fn locate_agent_socket(root: &Path, principal: &str) -> Result<PathBuf, KeysockError> {
    let path = socket_path(root, principal);
    if !path.exists() {
        return Err(KeysockError::NotFound(format!(
            "no agent socket for principal '{principal}' at {}",
            path.display()
        )));
    }
    Ok(path)
}

/// Locate and dial the agent for `principal`.
pub async fn connect(root: &Path, principal: &str) -> Result<AgentConnection, KeysockError> {
    let path = locate_agent_socket(root, principal)?;
    AgentConnection::connect(&path).await
}

/// Generate a fresh key pair carrying `comment`.
///
/// RSA keys use a `bits`-bit modulus; `bits` is ignored for Ed25519.
pub fn generate_key_pair(
    algorithm: KeyAlgorithm,
    bits: usize,
    comment: &str,
) -> Result<PrivateKey, KeysockError> {
    let keypair = match algorithm {
        KeyAlgorithm::Rsa => RsaKeypair::random(&mut OsRng, bits)
            .map(KeypairData::from)
            .map_err(|e| KeysockError::KeyGeneration(format!("RSA-{bits}: {e}")))?,
        KeyAlgorithm::Ed25519 => KeypairData::from(Ed25519Keypair::random(&mut OsRng)),
    };
    let key = PrivateKey::new(keypair, comment)
        .map_err(|e| KeysockError::KeyGeneration(e.to_string()))?;
    debug!(algorithm = %key.algorithm(), "generated key pair");
    Ok(key)
}

/// An open agent protocol connection.
pub struct AgentConnection {
    path: PathBuf,
    client: Client<UnixStream>,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl AgentConnection {
    /// Dial the agent socket at `path`.
    pub async fn connect(path: &Path) -> Result<Self, KeysockError> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(|source| KeysockError::Connection {
                path: path.to_path_buf(),
                source,
            })?;
        debug!(path = %path.display(), "connected to agent");
        Ok(Self {
            path: path.to_path_buf(),
            client: Client::new(stream),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand `key` to the agent.  The key is dropped (and zeroized) once the
    /// request has been sent.  Returns the installed key's fingerprint.
    pub async fn install_key(&mut self, key: PrivateKey) -> Result<String, KeysockError> {
        let fingerprint = key.public_key().fingerprint(HashAlg::Sha256).to_string();
        let request = AddIdentity {
            credential: Credential::Key {
                privkey: key.key_data().clone(),
                comment: key.comment().to_string(),
            },
        };
        drop(key);

        self.client
            .add_identity(request)
            .await
            .map_err(|e| KeysockError::AgentRejectedKey(e.to_string()))?;
        info!(fingerprint = %fingerprint, agent = %self.path.display(), "key installed");
        Ok(fingerprint)
    }

    /// Identities currently held by the agent.
    pub async fn list_keys(&mut self) -> Result<Vec<ListedKey>, KeysockError> {
        let identities = self.client.request_identities().await.map_err(|e| {
            KeysockError::ProtocolMismatch(format!("list identities failed: {e}"))
        })?;
        Ok(identities
            .into_iter()
            .map(|identity| ListedKey {
                fingerprint: identity.pubkey.fingerprint(HashAlg::Sha256).to_string(),
                comment: identity.comment,
            })
            .collect())
    }

    /// Remove every identity from the agent.
    pub async fn remove_all(&mut self) -> Result<(), KeysockError> {
        self.client
            .remove_all_identities()
            .await
            .map_err(|e| KeysockError::AgentRejectedKey(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_fails_without_socket() {
        let tmp = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            locate_agent_socket(tmp.path(), "alice"),
            Err(KeysockError::NotFound(_))
        ));
    }

    #[test]
    fn locate_finds_existing_socket() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = socket_path(tmp.path(), "alice");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        let _listener = std::os::unix::net::UnixListener::bind(&path).expect("bind");

        assert_eq!(locate_agent_socket(tmp.path(), "alice").expect("found"), path);
    }

    #[tokio::test]
    async fn connect_fails_when_nothing_listens() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = socket_path(tmp.path(), "alice");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        // A plain file: present, but nobody answers.
        std::fs::write(&path, b"").expect("write");

        let result = connect(tmp.path(), "alice").await;
        assert!(matches!(result, Err(KeysockError::Connection { .. })));
    }

    #[test]
    fn generates_rsa_2048() {
        let key = generate_key_pair(KeyAlgorithm::Rsa, 2048, "private key").expect("keygen");
        assert_eq!(key.comment(), "private key");
        let rsa = key.key_data().rsa().expect("rsa key");
        assert_eq!(rsa.public.n.as_positive_bytes().map(<[u8]>::len), Some(256));
    }

    #[test]
    fn rejects_undersized_rsa() {
        assert!(matches!(
            generate_key_pair(KeyAlgorithm::Rsa, 512, "tiny"),
            Err(KeysockError::KeyGeneration(_))
        ));
    }

    #[test]
    fn generates_ed25519() {
        let key = generate_key_pair(KeyAlgorithm::Ed25519, 0, "ed").expect("keygen");
        assert_eq!(key.algorithm(), ssh_key::Algorithm::Ed25519);
    }
}
