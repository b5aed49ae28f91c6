//! Optional TOML configuration.
//!
//! Every key has a default, so a missing file and an empty file behave the
//! same way.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::KeysockError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub key: KeyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Directory under which `.ssh_socks/` is created.  Defaults to the
    /// system temp directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl SocketConfig {
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Which agent serves a principal's socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentBackendKind {
    /// In-process agent with an in-memory keyring.
    #[default]
    Embedded,
    /// External `ssh-agent` process bound to the socket.
    Supervised,
}

impl std::str::FromStr for AgentBackendKind {
    type Err = KeysockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(Self::Embedded),
            "supervised" => Ok(Self::Supervised),
            other => Err(KeysockError::Config(format!(
                "unknown backend '{other}' (expected 'embedded' or 'supervised')"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub backend: AgentBackendKind,
    /// Executable launched by the supervised backend.
    #[serde(default = "default_agent_program")]
    pub program: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: AgentBackendKind::default(),
            program: default_agent_program(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Rsa,
    Ed25519,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    #[serde(default)]
    pub algorithm: KeyAlgorithm,
    /// RSA modulus size; ignored for Ed25519.
    #[serde(default = "default_key_bits")]
    pub bits: usize,
    #[serde(default = "default_key_comment")]
    pub comment: String,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            algorithm: KeyAlgorithm::default(),
            bits: default_key_bits(),
            comment: default_key_comment(),
        }
    }
}

fn default_agent_program() -> String {
    "ssh-agent".to_string()
}

fn default_key_bits() -> usize {
    2048
}

fn default_key_comment() -> String {
    "private key".to_string()
}

/// `$XDG_CONFIG_HOME/keysock/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
        .unwrap_or_else(|| {
            tracing::warn!(
                "neither XDG_CONFIG_HOME nor HOME are set; using current directory for config"
            );
            PathBuf::from(".")
        });
    base.join("keysock").join("config.toml")
}

/// Load the config at `path`, or defaults if the file does not exist.
pub fn load_config(path: &Path) -> Result<Config, KeysockError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }

    {
        use std::os::unix::fs::MetadataExt as _;
        match std::fs::metadata(path) {
            Ok(meta) if meta.mode() & 0o077 != 0 => {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:o}", meta.mode() & 0o777),
                    "config file is readable by group or others"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("could not check config file permissions: {e}"),
        }
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| KeysockError::Config(format!("read {}: {e}", path.display())))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config, KeysockError> {
    toml::from_str(content).map_err(|e| KeysockError::Config(e.to_string()))
}
