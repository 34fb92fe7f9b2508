//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::time::Instant;
use tracing::{info, warn};

use super::session::SshSession;
use crate::auth::AccessControl;

/// How long open sessions may keep running after a shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Everything a connection handler needs, shared by all connections.
#[derive(Debug)]
pub struct ServerContext {
    pub access: Arc<AccessControl>,
    /// Bare repository that Git services run against.
    pub bare_repo: PathBuf,
    /// JSON log file shown in the console's Logs tab.
    pub log_file: PathBuf,
}

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    ctx: Arc<ServerContext>,
    /// One clone per live session; the strong count tracks open connections.
    live: Arc<()>,
}

impl SshServer {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            live: Arc::new(()),
        }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.ctx), peer_addr, Arc::clone(&self.live))
    }

    fn handle_session_error(&mut self, error: <Self::Handler as server::Handler>::Error) {
        warn!(error = %error, "SSH session ended with error");
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the host key from `path`, generating and saving an Ed25519 key on
/// first start so clients see a stable host identity across restarts.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.is_file() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let key = KeyPair::generate_ed25519();
    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode SSH host key")?;
    std::fs::write(path, &pem)
        .with_context(|| format!("failed to write SSH host key {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict {}", path.display()))?;
    }

    info!(path = %path.display(), "generated new SSH host key");
    Ok(key)
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Serve on `listen_addr` until `shutdown` resolves, then give open sessions
/// up to [`SHUTDOWN_GRACE`] to finish.
pub async fn run_ssh_server<F>(
    ctx: Arc<ServerContext>,
    listen_addr: SocketAddr,
    host_key_path: &Path,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    // -- Build russh server config ----------------------------------------

    let host_key = load_or_generate_host_key(host_key_path)?;

    let config = Arc::new(server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        preferred: russh::Preferred::DEFAULT,
        inactivity_timeout: Some(Duration::from_secs(1800)),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        max_auth_attempts: 6,
        ..Default::default()
    });

    // -- Start serving ----------------------------------------------------

    info!(address = %listen_addr, "starting SSH server");

    let mut ssh_server = SshServer::new(ctx);
    let live = Arc::clone(&ssh_server.live);

    tokio::select! {
        res = ssh_server.run_on_address(config, listen_addr) => {
            res.context("SSH server exited with error")?;
        }
        () = shutdown => {
            info!("stopping SSH server");
        }
    }

    drop(ssh_server);
    wait_for_sessions(&live, SHUTDOWN_GRACE).await;
    Ok(())
}

/// Wait until `live` is the only reference left or `grace` runs out.
async fn wait_for_sessions(live: &Arc<()>, grace: Duration) {
    let deadline = Instant::now() + grace;
    loop {
        let open = Arc::strong_count(live) - 1;
        if open == 0 {
            info!("all sessions closed");
            return;
        }
        if Instant::now() >= deadline {
            warn!(open, "grace period expired with sessions still open");
            return;
        }
        info!(open, "waiting for sessions to close");
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}
