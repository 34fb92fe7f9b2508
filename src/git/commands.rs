//! Repository setup and transport subprocesses.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{debug, info, instrument};

use crate::auth::AccessLevel;

// ---------------------------------------------------------------------------
// Transport services
// ---------------------------------------------------------------------------

/// The two Git transport commands a client can run over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    /// `git-upload-pack`: clone and fetch.
    UploadPack,
    /// `git-receive-pack`: push.
    ReceivePack,
}

impl GitService {
    /// Name as it appears in the SSH exec request.
    pub fn exec_name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    fn subcommand(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    /// Capability a key must hold to run this service.
    pub fn required_access(self) -> AccessLevel {
        match self {
            Self::UploadPack => AccessLevel::ReadOnly,
            Self::ReceivePack => AccessLevel::ReadWrite,
        }
    }
}

/// Spawn `git <service> <repo>` with all three standard streams piped.
///
/// `git_protocol` is the client's `GIT_PROTOCOL` value, forwarded so the
/// service speaks the protocol version the client negotiated.
#[instrument(skip(repo), fields(repo = %repo.display()))]
pub fn spawn_service(service: GitService, repo: &Path, git_protocol: Option<&str>) -> Result<Child> {
    let mut cmd = Command::new("git");
    cmd.arg(service.subcommand());
    if service == GitService::UploadPack {
        cmd.arg("--strict");
    }
    cmd.arg(repo);

    if let Some(proto) = git_protocol {
        cmd.env("GIT_PROTOCOL", proto);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    cmd.spawn()
        .with_context(|| format!("failed to spawn git {}", service.subcommand()))
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

/// Whether `dir` is the top of a Git working tree.
pub fn is_worktree(dir: &Path) -> bool {
    dir.join(".git").exists()
}

/// Run `git clone --bare <src> <dest>`.
///
/// Returns `false` without touching anything when `dest` already exists.
#[instrument(fields(src = %src.display(), dest = %dest.display()))]
pub async fn git_clone_bare(src: &Path, dest: &Path) -> Result<bool> {
    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        info!("bare repository already exists, skipping clone");
        return Ok(false);
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    debug!("spawning git clone --bare");

    let output = Command::new("git")
        .arg("clone")
        .arg("--bare")
        .arg(src)
        .arg(dest)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git clone --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git clone --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    info!("bare repository created");
    Ok(true)
}
