//! Backend selection.

use std::io;
use std::path::Path;

use keysock_core::{AgentBackendKind, Config, KeysockError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::keystore::Keyring;
use crate::server::AgentServer;
use crate::session::SshAgent;
use crate::supervised::{AgentLauncher, SshAgentLauncher, SupervisedAgent};

/// The agent answering on a principal's socket.
#[derive(Debug)]
pub enum AgentBackend<L = SshAgentLauncher> {
    /// Serve the protocol in-process from an in-memory keyring.
    Embedded(SshAgent),
    /// Launch and supervise an external agent bound to the socket.
    Supervised(SupervisedAgent<L>),
}

impl AgentBackend {
    pub fn from_config(config: &Config) -> Self {
        match config.agent.backend {
            AgentBackendKind::Embedded => Self::Embedded(SshAgent::new(Keyring::new())),
            AgentBackendKind::Supervised => Self::Supervised(SupervisedAgent::new(
                SshAgentLauncher::new(config.agent.program.clone()),
            )),
        }
    }
}

impl<L: AgentLauncher> AgentBackend<L> {
    pub fn kind(&self) -> AgentBackendKind {
        match self {
            Self::Embedded(_) => AgentBackendKind::Embedded,
            Self::Supervised(_) => AgentBackendKind::Supervised,
        }
    }

    /// Bring the agent up on `socket_path` and keep it there until `shutdown`
    /// is cancelled.  Returns once the socket file has been removed.
    pub async fn run(
        self,
        socket_path: &Path,
        shutdown: CancellationToken,
    ) -> Result<(), KeysockError> {
        match self {
            Self::Embedded(agent) => {
                let mut server = AgentServer::new(socket_path);
                server.start()?;
                server.run(agent, shutdown).await
            }
            Self::Supervised(supervised) => {
                let process = supervised.start(socket_path, shutdown.clone()).await?;
                info!(
                    pid = process.pid(),
                    socket = %socket_path.display(),
                    "supervised agent running"
                );
                if !process.is_alive() {
                    warn!(pid = process.pid(), "supervised agent exited right after start");
                }
                shutdown.cancelled().await;
                debug!(
                    pid = process.pid(),
                    alive = process.is_alive(),
                    "stopping supervised agent"
                );
                process.wait().await;
                match std::fs::remove_file(socket_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(
                        path = %socket_path.display(),
                        "failed to remove agent socket: {e}"
                    ),
                }
                Ok(())
            }
        }
    }
}
