//! Supervised external agent.
//!
//! Instead of serving the protocol in-process, launch the system `ssh-agent`
//! bound to the principal's socket:
//!
//! ```text
//! $ ssh-agent -a /tmp/.ssh_socks/alice.sock
//! SSH_AUTH_SOCK=/tmp/.ssh_socks/alice.sock; export SSH_AUTH_SOCK;
//! SSH_AGENT_PID=4242; export SSH_AGENT_PID;
//! echo Agent pid 4242;
//! ```
//!
//! `ssh-agent` daemonises, so the process we spawn is not the agent.  The
//! agent's PID is only available from the banner above, and the banner format
//! is treated as a hard contract: if no `SSH_AGENT_PID=<digits>;` line appears
//! before stdout closes, [`SupervisedAgent::start`] fails with
//! [`KeysockError::ProtocolMismatch`].

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use keysock_core::{KeysockError, prepare_socket_path};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Banner line announcing the daemonised agent's PID.
pub const AGENT_PID_PATTERN: &str = r"SSH_AGENT_PID=(\d+);";

/// Finds and starts the external agent executable.
///
/// [`SshAgentLauncher`] is the real implementation; tests substitute a
/// launcher that prints a scripted banner.
pub trait AgentLauncher: Send + Sync + std::fmt::Debug {
    /// Resolve the executable to run.
    fn locate(&self) -> Result<PathBuf, KeysockError>;

    /// Start `program` bound to `socket`, with stdout piped.
    fn spawn(&self, program: &Path, socket: &Path) -> io::Result<Child>;
}

/// Launches `ssh-agent -a <socket>`.
#[derive(Debug, Clone)]
pub struct SshAgentLauncher {
    program: String,
}

impl SshAgentLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SshAgentLauncher {
    fn default() -> Self {
        Self::new("ssh-agent")
    }
}

impl AgentLauncher for SshAgentLauncher {
    fn locate(&self) -> Result<PathBuf, KeysockError> {
        which::which(&self.program).map_err(|e| {
            KeysockError::NotFound(format!("agent executable '{}': {e}", self.program))
        })
    }

    fn spawn(&self, program: &Path, socket: &Path) -> io::Result<Child> {
        Command::new(program)
            .arg("-a")
            .arg(socket)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

/// Read one `\n`-terminated line, decoding invalid UTF-8 lossily.
///
/// Returns `None` at end of stream.
async fn read_output_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(&buf[..]);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

/// Read lines until the PID announcement appears.
///
/// Output that is not valid UTF-8 is tolerated; only the announcement line
/// itself has to match.
pub async fn scan_agent_pid<R>(reader: &mut R) -> Result<u32, KeysockError>
where
    R: AsyncBufRead + Unpin,
{
    let pattern = Regex::new(AGENT_PID_PATTERN)
        .map_err(|e| KeysockError::ProtocolMismatch(e.to_string()))?;

    let mut buf = Vec::new();
    while let Some(line) = read_output_line(reader, &mut buf).await? {
        let Some(caps) = pattern.captures(&line) else {
            debug!(%line, "agent output");
            continue;
        };
        let digits = &caps[1];
        return digits
            .parse::<libc::pid_t>()
            .ok()
            .and_then(|pid| u32::try_from(pid).ok())
            .filter(|pid| *pid > 0)
            .ok_or_else(|| {
                KeysockError::ProtocolMismatch(format!("invalid agent pid '{digits}'"))
            });
    }

    Err(KeysockError::ProtocolMismatch(
        "agent output ended without an SSH_AGENT_PID announcement".to_string(),
    ))
}

/// Delegates agent duties to an external program.
#[derive(Debug)]
pub struct SupervisedAgent<L = SshAgentLauncher> {
    launcher: L,
}

impl<L: AgentLauncher> SupervisedAgent<L> {
    pub fn new(launcher: L) -> Self {
        Self { launcher }
    }

    /// Launch the agent on `socket_path` and return once its PID is known.
    ///
    /// The agent is tied to `shutdown`: when the token is cancelled the
    /// launcher process is killed and the announced agent PID receives
    /// SIGTERM.
    pub async fn start(
        &self,
        socket_path: &Path,
        shutdown: CancellationToken,
    ) -> Result<AgentProcess, KeysockError> {
        let program = self.launcher.locate()?;
        prepare_socket_path(socket_path)?;

        let mut child = self.launcher.spawn(&program, socket_path)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            KeysockError::ProtocolMismatch("agent stdout was not captured".to_string())
        })?;
        let mut output = BufReader::new(stdout);

        let scanned = tokio::select! {
            res = scan_agent_pid(&mut output) => res,
            () = shutdown.cancelled() => Err(KeysockError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "cancelled while waiting for agent pid",
            ))),
        };
        let pid = match scanned {
            Ok(pid) => pid,
            Err(e) => {
                if let Err(kill_err) = child.start_kill() {
                    debug!("agent launcher already gone: {kill_err}");
                }
                return Err(e);
            }
        };

        info!(
            pid,
            program = %program.display(),
            socket = %socket_path.display(),
            "started agent"
        );

        let supervisor = tokio::spawn(supervise(child, output, pid, shutdown));
        Ok(AgentProcess { pid, supervisor })
    }
}

/// Handle to a running external agent.
#[derive(Debug)]
pub struct AgentProcess {
    pid: u32,
    supervisor: JoinHandle<()>,
}

impl AgentProcess {
    /// PID announced by the agent.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether a process with the agent's PID still exists.
    pub fn is_alive(&self) -> bool {
        // SAFETY: kill with signal 0 performs only the existence check.
        let ret = unsafe { libc::kill(self.pid as libc::pid_t, 0) };
        ret == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    /// Wait until the supervisor has finished tearing the agent down.
    ///
    /// Only returns after the shutdown token passed to
    /// [`SupervisedAgent::start`] has been cancelled.
    pub async fn wait(self) {
        if let Err(e) = self.supervisor.await {
            warn!(pid = self.pid, "agent supervisor task failed: {e}");
        }
    }
}

async fn supervise(
    mut child: Child,
    mut output: BufReader<ChildStdout>,
    pid: u32,
    shutdown: CancellationToken,
) {
    {
        let launcher_exit = async {
            let mut buf = Vec::new();
            while let Ok(Some(line)) = read_output_line(&mut output, &mut buf).await {
                debug!(%line, "agent output");
            }
            child.wait().await
        };
        tokio::select! {
            status = launcher_exit => debug!(?status, "agent launcher exited"),
            () = shutdown.cancelled() => {}
        }
    }

    shutdown.cancelled().await;

    if let Err(e) = child.start_kill() {
        debug!("agent launcher already exited: {e}");
    }
    if let Err(e) = child.wait().await {
        debug!("failed to reap agent launcher: {e}");
    }

    // SAFETY: kill is safe to call with any pid; a stale pid yields ESRCH.
    let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if ret == 0 {
        info!(pid, "terminated agent");
    } else {
        debug!(pid, "agent already gone: {}", io::Error::last_os_error());
    }
}
