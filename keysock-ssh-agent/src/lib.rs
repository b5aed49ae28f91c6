//! SSH agent plumbing for keysock.
//!
//! Two interchangeable backends can answer on a principal's socket:
//!
//! ```text
//!            embedded                                supervised
//!
//!   AgentServer ── UnixListener             SupervisedAgent ── AgentLauncher
//!        │                                        │                │
//!   per-connection                           spawn `ssh-agent -a <sock>`
//!   SshAgent (clone of Keyring)              scan stdout for SSH_AGENT_PID
//!        │                                        │
//!   Arc<RwLock<Keyring>>                     AgentProcess (pid, supervisor)
//! ```
//!
//! [`client`] is the other side: it dials a principal's socket and installs
//! freshly generated keys into whichever agent answers.

pub mod backend;
pub mod client;
pub mod keystore;
pub mod server;
pub mod session;
pub mod supervised;

pub use backend::AgentBackend;
pub use client::{AgentConnection, ListedKey};
pub use keystore::{KeyEntry, Keyring};
pub use server::{AgentServer, ServerState};
pub use session::SshAgent;
pub use supervised::{AgentLauncher, AgentProcess, SshAgentLauncher, SupervisedAgent};
