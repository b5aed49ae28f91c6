use std::io;
use std::path::PathBuf;

/// Errors surfaced by keysock operations.
///
/// Setup-time errors (`Bind`, `NotFound`, `KeyGeneration`) are fatal to the
/// invoking process.  Errors on an individual agent connection never reach
/// this type; they are logged and confined to that connection.
#[derive(thiserror::Error, Debug)]
pub enum KeysockError {
    /// A required executable or an agent socket does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The socket path could not be bound, or its parent directory could not
    /// be created.
    #[error("failed to bind {}: {source}", path.display())]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A collaborator did not honour its textual or wire contract.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Dialling the agent socket failed.
    #[error("failed to connect to {}: {source}", path.display())]
    Connection {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// The agent refused an operation.
    #[error("agent rejected request: {0}")]
    AgentRejectedKey(String),

    #[error("invalid principal {0:?}")]
    InvalidPrincipal(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
