//! Shared building blocks for keysock.
//!
//! - [`paths`]: per-principal socket path derivation and socket directory
//!   preparation.
//! - [`config`]: the optional TOML configuration file.
//! - [`KeysockError`]: the error taxonomy shared by the agent library and the
//!   binaries.

pub mod config;
pub mod paths;

mod error;

pub use config::{AgentBackendKind, Config, KeyAlgorithm};
pub use error::KeysockError;
pub use paths::{
    SOCKET_DIR_NAME, prepare_socket_path, restrict_socket_permissions, socket_path,
    validate_principal,
};
