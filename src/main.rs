mod auth;
mod config;
mod console;
mod git;
mod logs;
mod registry;
mod ssh;
mod store;
mod watch;

use std::io::{BufRead, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;

use crate::auth::{AccessControl, Permission};
use crate::config::{ConfigHandle, GlobalConfig, StatePaths};
use crate::registry::UserRegistry;
use crate::ssh::ServerContext;
use crate::store::{JsonStore, SelfWrites};
use crate::watch::{FileWatcher, WatchTargets};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitport", about = "Serve a local Git repository over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the bare repository and server settings for the repository in
    /// the current directory.
    Init,
    /// Serve the repository in the current directory.
    Start {
        /// TCP port for the SSH listener.
        port: u16,
        /// Address to bind.
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,
    },
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

async fn run_init(worktree: &Path, paths: &StatePaths) -> Result<()> {
    logs::init(None)?;

    if !git::is_worktree(worktree) {
        bail!(
            "{} has no .git directory (repository not initialized)",
            worktree.display()
        );
    }

    git::git_clone_bare(worktree, &paths.bare_repo)
        .await
        .context("failed to create bare repository")?;

    std::fs::create_dir_all(&paths.state_dir)
        .with_context(|| format!("failed to create {}", paths.state_dir.display()))?;

    let store = JsonStore::new(Arc::new(SelfWrites::new()));
    let config = ConfigHandle::load(paths.config_file(), store.clone())
        .context("failed to load config")?;

    if config.exists() {
        println!(
            "gitport is already initialized. Run\n\n\tgitport start <port>\n\nto serve {}",
            paths.repo_name
        );
    } else {
        let stdin = std::io::stdin();
        let chosen = prompt_config(stdin.lock(), std::io::stdout())?;
        config.set(chosen).context("failed to write config")?;
    }

    let registry =
        UserRegistry::load(paths.users_file(), store).context("failed to load users")?;
    bootstrap_admin(&registry)?;

    tracing::info!(
        repo = %paths.repo_name,
        path = %paths.bare_repo.display(),
        "repository initialized"
    );
    Ok(())
}

/// Ask for the server's visibility and the default guest permission.
fn prompt_config<R: BufRead, W: Write>(input: R, mut output: W) -> Result<GlobalConfig> {
    let mut lines = input.lines();
    let mut ask = |question: &str| -> Result<String> {
        write!(output, "{question}")?;
        output.flush()?;
        let answer = lines.next().transpose()?.unwrap_or_default();
        Ok(answer.trim().to_ascii_lowercase())
    };

    let public = matches!(
        ask("Do you want the server to be public (allow guest users)? (y/n): ")?.as_str(),
        "y" | "yes"
    );
    let perm = Permission::parse(&ask(
        "What is the default permission of users (none, read, write, admin): ",
    )?)
    .unwrap_or(Permission::None);

    Ok(GlobalConfig {
        public,
        default_perm: Some(perm),
    })
}

fn bootstrap_admin(registry: &UserRegistry) -> Result<()> {
    match dirs::home_dir() {
        Some(home) => {
            registry
                .ensure_host_admin(&home)
                .context("failed to register host admin")?;
        }
        None => tracing::warn!("could not determine home directory; skipping host admin"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// start
// ---------------------------------------------------------------------------

async fn run_start(worktree: PathBuf, paths: &StatePaths, listen: SocketAddr) -> Result<()> {
    if !git::is_worktree(&worktree) {
        bail!(
            "{} has no .git directory (repository not initialized)",
            worktree.display()
        );
    }
    if !paths.state_dir.is_dir() {
        bail!("cannot start an uninitialized server; run `gitport init` first");
    }

    logs::init(Some(paths.log_file().as_path()))?;
    tracing::info!(repo = %paths.repo_name, "starting gitport");

    // ---- State ----
    let self_writes = Arc::new(SelfWrites::new());
    let store = JsonStore::new(Arc::clone(&self_writes));

    let config = ConfigHandle::load(paths.config_file(), store.clone())
        .context("failed to load config")?;
    if config.get().default_perm.is_none() {
        tracing::warn!("config has no default permission; guests will get none");
    }
    let registry =
        UserRegistry::load(paths.users_file(), store).context("failed to load users")?;
    bootstrap_admin(&registry)?;

    let access = Arc::new(AccessControl::new(
        paths.repo_name.clone(),
        Arc::new(registry),
        Arc::new(config),
    ));

    // ---- Watcher ----
    let watcher = FileWatcher::start(
        WatchTargets {
            users: paths.users_file(),
            config: paths.config_file(),
        },
        self_writes,
        Arc::clone(&access) as Arc<dyn watch::Reconcile>,
    )?;

    // ---- Local remote ----
    let uri = git::server_uri(&git::local_ip(), listen.port(), &paths.repo_name);
    tracing::info!(repo = %paths.repo_name, %uri, "serving repository");
    tokio::spawn(async move {
        // Give the listener a moment so the initial fetch can reach it.
        tokio::time::sleep(Duration::from_secs(1)).await;
        git::configure_local_remote(&worktree, &uri).await;
    });

    // ---- SSH ----
    let ctx = Arc::new(ServerContext {
        access,
        bare_repo: paths.bare_repo.clone(),
        log_file: paths.log_file(),
    });
    let result = ssh::run_ssh_server(ctx, listen, &paths.host_key(), shutdown_signal()).await;

    watcher.stop().await;
    result?;

    tracing::info!("gitport shut down cleanly");
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let worktree = std::env::current_dir().context("failed to read current directory")?;
    let paths = StatePaths::for_worktree(&worktree)?;

    match cli.command {
        Command::Init => run_init(&worktree, &paths).await,
        Command::Start { port, bind } => {
            run_start(worktree, &paths, SocketAddr::new(bind, port)).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(answers: &str) -> (GlobalConfig, String) {
        let mut out = Vec::new();
        let config = prompt_config(answers.as_bytes(), &mut out).unwrap();
        (config, String::from_utf8(out).unwrap())
    }

    #[test]
    fn prompt_public_with_read() {
        let (config, shown) = prompt("y\nread\n");
        assert!(config.public);
        assert_eq!(config.default_perm, Some(Permission::Read));
        assert!(shown.contains("public"));
        assert!(shown.contains("default permission"));
    }

    #[test]
    fn prompt_is_case_insensitive() {
        let (config, _) = prompt("YES\n  Admin \n");
        assert!(config.public);
        assert_eq!(config.default_perm, Some(Permission::Admin));
    }

    #[test]
    fn prompt_defaults_to_private_none() {
        let (config, _) = prompt("maybe\nowner\n");
        assert!(!config.public);
        assert_eq!(config.default_perm, Some(Permission::None));

        let (config, _) = prompt("");
        assert!(!config.public);
        assert_eq!(config.default_perm, Some(Permission::None));
    }

    #[test]
    fn cli_parses_start() {
        let cli = Cli::try_parse_from(["gitport", "start", "2222"]).unwrap();
        match cli.command {
            Command::Start { port, bind } => {
                assert_eq!(port, 2222);
                assert!(bind.is_unspecified());
            }
            other => panic!("unexpected command {other:?}"),
        }
        let cli =
            Cli::try_parse_from(["gitport", "start", "2222", "--bind", "127.0.0.1"]).unwrap();
        assert!(matches!(cli.command, Command::Start { bind, .. } if bind.is_loopback()));
        assert!(Cli::try_parse_from(["gitport", "start"]).is_err());
        assert!(Cli::try_parse_from(["gitport", "start", "http"]).is_err());
    }
}
