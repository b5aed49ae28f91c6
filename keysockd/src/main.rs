use std::path::PathBuf;

use anyhow::{Context as _, Result};
use keysock_core::config::{default_config_path, load_config};
use keysock_core::{AgentBackendKind, socket_path, validate_principal};
use keysock_ssh_agent::AgentBackend;
use tokio_util::sync::CancellationToken;

struct Args {
    config_path: PathBuf,
    backend: Option<AgentBackendKind>,
    principal: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();
    validate_principal(&args.principal)?;

    let mut config = load_config(&args.config_path)
        .with_context(|| format!("load config {}", args.config_path.display()))?;
    if let Some(backend) = args.backend {
        config.agent.backend = backend;
    }

    let sock = socket_path(&config.socket.root(), &args.principal);
    tracing::info!(
        principal = %args.principal,
        socket = %sock.display(),
        backend = ?config.agent.backend,
        "starting agent"
    );

    if config.agent.backend == AgentBackendKind::Embedded {
        harden_process();
    }

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    AgentBackend::from_config(&config)
        .run(&sock, shutdown)
        .await
        .with_context(|| format!("agent on {}", sock.display()))?;

    tracing::info!("agent stopped");
    Ok(())
}

/// Keep keys held by the embedded agent out of core dumps and swap.
///
/// Failures are logged and startup continues.
fn harden_process() {
    if let Err(e) = disable_core_dumps() {
        tracing::warn!("could not disable core dumps: {e}");
    }
    if let Err(e) = lock_memory() {
        tracing::warn!("could not lock memory, keys may be swapped out: {e}");
    }
}

fn disable_core_dumps() -> std::io::Result<()> {
    let no_core = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: setrlimit reads a fully initialised rlimit.
    if unsafe { libc::setrlimit(libc::RLIMIT_CORE, &no_core) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    // Also blocks ptrace and /proc/<pid>/mem access from other processes.
    #[cfg(target_os = "linux")]
    {
        // SAFETY: PR_SET_DUMPABLE takes a single integer argument.
        if unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0 as libc::c_ulong) } != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn lock_memory() -> std::io::Result<()> {
    // SAFETY: mlockall has no memory-safety preconditions.
    if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    tracing::debug!("memory locked");
    Ok(())
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
            ctrl_c.await.ok();
        }
    }
}

/// Parse `[--config <path>] [--backend <kind>] <principal>`.
fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut backend = None;
    let mut principal = None;

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--config" | "-c" | "--backend" | "-b" => {
                let Some(value) = args.get(i + 1) else {
                    usage_error(&format!("{arg} requires an argument"));
                };
                if arg == "--config" || arg == "-c" {
                    config_path = Some(PathBuf::from(value));
                } else {
                    backend = Some(parse_backend(value));
                }
                i += 1;
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {
                if let Some(path) = arg.strip_prefix("--config=") {
                    config_path = Some(PathBuf::from(path));
                } else if let Some(kind) = arg.strip_prefix("--backend=") {
                    backend = Some(parse_backend(kind));
                } else if arg.starts_with('-') {
                    usage_error(&format!("unknown option {arg}"));
                } else if principal.is_some() {
                    usage_error("expected exactly one principal");
                } else {
                    principal = Some(arg.to_string());
                }
            }
        }
        i += 1;
    }

    let Some(principal) = principal else {
        usage_error("missing <principal>");
    };
    Args {
        config_path: config_path.unwrap_or_else(default_config_path),
        backend,
        principal,
    }
}

fn parse_backend(value: &str) -> AgentBackendKind {
    value.parse().unwrap_or_else(|e| usage_error(&format!("{e}")))
}

fn usage_error(msg: &str) -> ! {
    eprintln!("error: {msg}");
    print_help();
    std::process::exit(1);
}

fn print_help() {
    eprintln!("Usage: keysockd [--config <path>] [--backend <embedded|supervised>] <principal>");
    eprintln!();
    eprintln!("Serves an SSH agent on $TMPDIR/.ssh_socks/<principal>.sock until SIGINT/SIGTERM.");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <path>     Config file (default: $XDG_CONFIG_HOME/keysock/config.toml)");
    eprintln!("  -b, --backend <kind>    embedded (in-process agent) or supervised (ssh-agent)");
    eprintln!("  -h, --help              Show this help message");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_dumps_disabled() {
        disable_core_dumps().expect("disable core dumps");

        let mut limit = libc::rlimit {
            rlim_cur: 1,
            rlim_max: 1,
        };
        // SAFETY: getrlimit writes into the rlimit we own.
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_CORE, &mut limit) }, 0);
        assert_eq!(limit.rlim_cur, 0);

        #[cfg(target_os = "linux")]
        {
            // SAFETY: PR_GET_DUMPABLE takes no further arguments.
            assert_eq!(unsafe { libc::prctl(libc::PR_GET_DUMPABLE) }, 0);
        }
    }
}
