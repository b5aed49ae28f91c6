use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use keysock_core::config::{Config, default_config_path, load_config};
use keysock_core::validate_principal;
use keysock_ssh_agent::client::{self, AgentConnection};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_config_path(&mut args)?;

    let cmd = args.first().map(String::as_str).unwrap_or("help");
    match cmd {
        "add" => {
            let config = load(&config_path)?;
            cmd_add(&config, principal_arg(&args[1..])?).await
        }
        "list" => {
            let config = load(&config_path)?;
            cmd_list(&config, principal_arg(&args[1..])?).await
        }
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other if other.starts_with('-') => {
            eprintln!("unknown option: {other}");
            print_help();
            std::process::exit(1);
        }
        // A bare principal is shorthand for `add <principal>`.
        _ => {
            let config = load(&config_path)?;
            cmd_add(&config, principal_arg(&args)?).await
        }
    }
}

fn print_help() {
    println!(
        "\
keysock - load ephemeral keys into a principal's SSH agent

USAGE:
    keysock [--config <path>] <command> [args...]

COMMANDS:
    <principal>                 Same as `add <principal>`
    add <principal>             Generate a key, add it to the principal's agent, list keys
    list <principal>            List the keys held by the principal's agent
    help                        Show this help

The agent socket is $TMPDIR/.ssh_socks/<principal>.sock (see `keysockd`)."
    );
}

/// Remove `--config <path>` / `--config=<path>` from `args`.
fn take_config_path(args: &mut Vec<String>) -> Result<PathBuf> {
    if let Some(pos) = args.iter().position(|a| a == "--config" || a == "-c") {
        if pos + 1 >= args.len() {
            bail!("--config requires a path argument");
        }
        let path = args.remove(pos + 1);
        args.remove(pos);
        return Ok(PathBuf::from(path));
    }
    if let Some(pos) = args.iter().position(|a| a.starts_with("--config=")) {
        let arg = args.remove(pos);
        return Ok(PathBuf::from(&arg["--config=".len()..]));
    }
    Ok(default_config_path())
}

fn principal_arg(args: &[String]) -> Result<&str> {
    match args {
        [principal] => {
            validate_principal(principal)?;
            Ok(principal.as_str())
        }
        [] => bail!("missing <principal>"),
        _ => bail!("expected exactly one principal"),
    }
}

fn load(path: &Path) -> Result<Config> {
    load_config(path).with_context(|| format!("load config {}", path.display()))
}

async fn connect(config: &Config, principal: &str) -> Result<AgentConnection> {
    let conn = client::connect(&config.socket.root(), principal)
        .await
        .with_context(|| format!("agent for principal '{principal}'"))?;
    Ok(conn)
}

async fn cmd_add(config: &Config, principal: &str) -> Result<()> {
    let mut conn = connect(config, principal).await?;

    let key = client::generate_key_pair(config.key.algorithm, config.key.bits, &config.key.comment)?;
    tracing::info!("created keys, loading to agent");
    conn.install_key(key).await?;

    print_keys(&mut conn).await
}

async fn cmd_list(config: &Config, principal: &str) -> Result<()> {
    let mut conn = connect(config, principal).await?;
    print_keys(&mut conn).await
}

async fn print_keys(conn: &mut AgentConnection) -> Result<()> {
    let keys = conn.list_keys().await?;
    if keys.is_empty() {
        println!("The agent has no identities.");
    }
    for key in keys {
        println!("{key}");
    }
    Ok(())
}
