//! Agent socket server.
//!
//! [`AgentServer`] owns the listening socket for one principal:
//!
//! ```text
//! Idle ──start()──► Listening ──shutdown token──► ShuttingDown ──► Closed
//! ```
//!
//! Each accepted connection is served on its own task by `ssh_agent_lib`, so
//! a stalled or misbehaving client never holds up the accept loop or other
//! connections.  `Closed` is published only after the socket file has been
//! removed.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keysock_core::{KeysockError, prepare_socket_path, restrict_socket_permissions};
use ssh_agent_lib::agent::{Agent, ListeningSocket, Session, listen};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::SshAgent;

/// Pause after an accept error so resource exhaustion (EMFILE) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    ShuttingDown,
    Closed,
}

/// Listening socket for one principal's embedded agent.
#[derive(Debug)]
pub struct AgentServer {
    socket_path: PathBuf,
    listener: Option<UnixListener>,
    state: watch::Sender<ServerState>,
}

impl AgentServer {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let (state, _) = watch::channel(ServerState::Idle);
        Self {
            socket_path: socket_path.into(),
            listener: None,
            state,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Observe state transitions.  Waiting for [`ServerState::Closed`]
    /// guarantees the socket file is gone.
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Bind the socket: `Idle → Listening`.
    ///
    /// A stale socket file is removed first.  A socket that still has a live
    /// listener behind it is left alone and reported as a bind error.
    pub fn start(&mut self) -> Result<(), KeysockError> {
        let path = self.socket_path.clone();
        let bind_err = |source: io::Error| KeysockError::Bind {
            path: path.clone(),
            source,
        };

        if self.state() != ServerState::Idle {
            return Err(bind_err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "server already started",
            )));
        }
        if std::os::unix::net::UnixStream::connect(&path).is_ok() {
            return Err(bind_err(io::Error::new(
                io::ErrorKind::AddrInUse,
                "another agent is listening on this socket",
            )));
        }

        prepare_socket_path(&path)?;
        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        restrict_socket_permissions(&path).map_err(bind_err)?;

        self.listener = Some(listener);
        self.state.send_replace(ServerState::Listening);
        info!(path = %path.display(), "agent socket listening");
        Ok(())
    }

    /// Serve connections with `agent` until `shutdown` is cancelled.
    ///
    /// Returns after the listener is closed and the socket file removed.
    pub async fn run<A>(mut self, agent: A, shutdown: CancellationToken) -> Result<(), KeysockError>
    where
        A: Agent<ShutdownListener>,
    {
        let Some(listener) = self.listener.take() else {
            return Err(KeysockError::Bind {
                path: self.socket_path.clone(),
                source: io::Error::new(io::ErrorKind::NotConnected, "server not started"),
            });
        };

        let socket = ShutdownListener {
            listener,
            shutdown: shutdown.clone(),
        };
        let result = listen(socket, agent).await;

        self.state.send_replace(ServerState::ShuttingDown);
        info!(path = %self.socket_path.display(), "closing agent socket");
        self.remove_socket_file();
        self.state.send_replace(ServerState::Closed);

        match result {
            Ok(()) => Ok(()),
            Err(_) if shutdown.is_cancelled() => Ok(()),
            Err(e) => Err(KeysockError::Io(io::Error::other(format!(
                "agent listener failed: {e}"
            )))),
        }
    }

    fn remove_socket_file(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.socket_path.display(),
                "failed to remove agent socket: {e}"
            ),
        }
    }
}

/// Unix listener whose accept loop ends when the shutdown token fires.
///
/// Transient accept errors are logged and retried; only shutdown or a dead
/// listener makes `accept` fail, which ends `ssh_agent_lib::agent::listen`.
#[derive(Debug)]
pub struct ShutdownListener {
    listener: UnixListener,
    shutdown: CancellationToken,
}

fn is_fatal_accept_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK)
    )
}

#[ssh_agent_lib::async_trait]
impl ListeningSocket for ShutdownListener {
    type Stream = UnixStream;

    async fn accept(&mut self) -> io::Result<UnixStream> {
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    return Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "agent server shutting down",
                    ));
                }
                res = self.listener.accept() => match res {
                    Ok((stream, _addr)) => {
                        debug!("accepted agent connection");
                        return Ok(stream);
                    }
                    Err(e) if is_fatal_accept_error(&e) => return Err(e),
                    Err(e) => {
                        warn!("failed to accept agent connection: {e}");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
            }
        }
    }
}

/// Every connection gets a clone of the agent, so all sessions share one
/// keyring.
impl Agent<ShutdownListener> for SshAgent {
    fn new_session(&mut self, _socket: &UnixStream) -> impl Session {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use keysock_core::{KeyAlgorithm, socket_path};
    use tokio::io::AsyncWriteExt as _;
    use tokio::task::JoinHandle;

    use crate::client::{self, AgentConnection};
    use crate::keystore::Keyring;

    struct Running {
        shutdown: CancellationToken,
        state: watch::Receiver<ServerState>,
        task: JoinHandle<Result<(), KeysockError>>,
    }

    impl Running {
        async fn stop(mut self) {
            self.shutdown.cancel();
            self.task.await.expect("join").expect("clean shutdown");
            self.state
                .wait_for(|s| *s == ServerState::Closed)
                .await
                .expect("state channel open");
        }
    }

    fn spawn_server(path: PathBuf) -> Running {
        let mut server = AgentServer::new(&path);
        server.start().expect("start");
        assert_eq!(server.state(), ServerState::Listening);
        let state = server.subscribe();
        let shutdown = CancellationToken::new();
        let agent = SshAgent::new(Keyring::new());
        let task = tokio::spawn(server.run(agent, shutdown.clone()));
        Running {
            shutdown,
            state,
            task,
        }
    }

    fn ed25519(comment: &str) -> ssh_key::PrivateKey {
        client::generate_key_pair(KeyAlgorithm::Ed25519, 0, comment).expect("keygen")
    }

    #[tokio::test]
    async fn sessions_share_the_keyring() {
        use ssh_agent_lib::proto::{AddIdentity, Credential};

        let mut agent = SshAgent::new(Keyring::new());
        let (stream, _peer) = UnixStream::pair().expect("socket pair");
        let mut session = Agent::<ShutdownListener>::new_session(&mut agent, &stream);

        let key = ed25519("via session");
        session
            .add_identity(AddIdentity {
                credential: Credential::Key {
                    privkey: key.key_data().clone(),
                    comment: key.comment().to_string(),
                },
            })
            .await
            .expect("add");

        let keyring = agent.keyring().read().expect("keyring lock");
        assert_eq!(keyring.len(), 1);
        assert_eq!(
            keyring.identities().next().map(|e| e.comment.as_str()),
            Some("via session")
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn provisioned_key_is_listed() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let running = spawn_server(socket_path(tmp.path(), "alice"));

        let mut conn = client::connect(tmp.path(), "alice").await.expect("connect");
        let key = client::generate_key_pair(KeyAlgorithm::Rsa, 2048, "private key")
            .expect("keygen");
        let fingerprint = conn.install_key(key).await.expect("install");

        let keys = conn.list_keys().await.expect("list");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment, "private key");
        assert_eq!(keys[0].fingerprint, fingerprint);

        running.stop().await;
    }

    #[tokio::test]
    async fn installing_same_key_twice_lists_it() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let running = spawn_server(socket_path(tmp.path(), "alice"));

        let key = ed25519("twice");
        let mut conn = client::connect(tmp.path(), "alice").await.expect("connect");
        let first = conn.install_key(key.clone()).await.expect("install");
        let second = conn.install_key(key).await.expect("install again");
        assert_eq!(first, second);

        let keys = conn.list_keys().await.expect("list");
        assert!(keys.iter().any(|k| k.fingerprint == first));

        running.stop().await;
    }

    #[tokio::test]
    async fn start_tolerates_stale_socket_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = socket_path(tmp.path(), "bob");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, b"left over").expect("stale file");

        let running = spawn_server(path.clone());
        AgentConnection::connect(&path).await.expect("connect");
        running.stop().await;
    }

    #[tokio::test]
    async fn start_refuses_live_socket() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = socket_path(tmp.path(), "bob");
        let running = spawn_server(path.clone());

        let mut second = AgentServer::new(&path);
        assert!(matches!(second.start(), Err(KeysockError::Bind { .. })));
        assert_eq!(second.state(), ServerState::Idle);

        // The first server is untouched.
        AgentConnection::connect(&path).await.expect("connect");
        running.stop().await;
    }

    #[tokio::test]
    async fn run_without_start_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let server = AgentServer::new(socket_path(tmp.path(), "carol"));
        let result = server
            .run(SshAgent::new(Keyring::new()), CancellationToken::new())
            .await;
        assert!(matches!(result, Err(KeysockError::Bind { .. })));
    }

    #[tokio::test]
    async fn shutdown_removes_socket_and_allows_restart() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = socket_path(tmp.path(), "dave");

        let running = spawn_server(path.clone());
        assert!(path.exists());
        running.stop().await;
        assert!(!path.exists());

        let running = spawn_server(path.clone());
        let mut conn = AgentConnection::connect(&path).await.expect("connect");
        assert!(conn.list_keys().await.expect("list").is_empty());
        running.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_clients_see_every_key() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let running = spawn_server(socket_path(tmp.path(), "erin"));

        let mut tasks = Vec::new();
        for client_id in 0..2 {
            let root = tmp.path().to_path_buf();
            tasks.push(tokio::spawn(async move {
                let mut conn = client::connect(&root, "erin").await.expect("connect");
                let mut installed = Vec::new();
                for i in 0..5 {
                    let key = ed25519(&format!("client{client_id}-{i}"));
                    installed.push(conn.install_key(key).await.expect("install"));
                    conn.list_keys().await.expect("list");
                }
                installed
            }));
        }
        let mut expected = Vec::new();
        for task in tasks {
            expected.extend(task.await.expect("join"));
        }

        let mut conn = client::connect(tmp.path(), "erin").await.expect("connect");
        let mut listed: Vec<String> = conn
            .list_keys()
            .await
            .expect("list")
            .into_iter()
            .map(|k| k.fingerprint)
            .collect();
        listed.sort();
        expected.sort();
        assert_eq!(listed, expected);

        running.stop().await;
    }

    #[tokio::test]
    async fn malformed_client_does_not_affect_others() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = socket_path(tmp.path(), "frank");
        let running = spawn_server(path.clone());

        // A frame header claiming 4 bytes followed by an unknown message type.
        let mut rogue = UnixStream::connect(&path).await.expect("rogue connect");
        rogue
            .write_all(&[0, 0, 0, 4, 0xee, 0xff, 0xff, 0xff])
            .await
            .expect("write garbage");
        // A stalled client that never sends anything.
        let _stalled = UnixStream::connect(&path).await.expect("stalled connect");

        let mut conn = AgentConnection::connect(&path).await.expect("connect");
        conn.install_key(ed25519("survivor")).await.expect("install");
        let keys = conn.list_keys().await.expect("list");
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].comment, "survivor");

        running.stop().await;
    }
}
