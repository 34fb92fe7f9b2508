//! Pointing the local working tree at the running server.
//!
//! Failures here never stop the server: each step logs and the caller moves
//! on.

use std::net::{IpAddr, UdpSocket};
use std::path::Path;
use std::process::{Output, Stdio};

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{info, instrument, warn};

const REMOTE: &str = "origin";

/// Run `git <args>` inside `worktree` and capture its output.
async fn git(worktree: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .arg("-C")
        .arg(worktree)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn git {}", args.join(" ")))
}

/// `true` when the command ran and exited zero.
async fn git_ok(worktree: &Path, args: &[&str]) -> bool {
    matches!(git(worktree, args).await, Ok(out) if out.status.success())
}

/// Point `origin` at `uri`, fetch it, and track the current branch.
#[instrument(skip(worktree), fields(%uri))]
pub async fn configure_local_remote(worktree: &Path, uri: &str) {
    info!("configuring local git remote");

    if !git_ok(worktree, &["remote", "set-url", REMOTE, uri]).await {
        match git(worktree, &["remote", "add", REMOTE, uri]).await {
            Ok(out) if out.status.success() => {}
            Ok(out) => {
                warn!(
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "failed to set git remote"
                );
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to set git remote");
                return;
            }
        }
    }

    if !git_ok(worktree, &["fetch", REMOTE]).await {
        warn!("could not fetch from origin; expected for a new repository");
    }

    let branch = current_branch(worktree).await;
    let upstream = format!("{REMOTE}/{branch}");
    let set_upstream = format!("--set-upstream-to={upstream}");
    if git_ok(worktree, &["branch", &set_upstream, &branch]).await {
        info!(%upstream, "git remote configured, tracking upstream");
    } else {
        info!(
            command = %format!("git push -u {REMOTE} {branch}"),
            "remote branch not found yet; push to link it"
        );
    }
}

/// Checked-out branch, falling back to `init.defaultBranch` and then
/// `master` for a repository with no commits.
async fn current_branch(worktree: &Path) -> String {
    if let Some(branch) = stdout_of(worktree, &["rev-parse", "--abbrev-ref", "HEAD"]).await {
        return branch;
    }
    if let Some(branch) = stdout_of(worktree, &["config", "--get", "init.defaultBranch"]).await {
        info!(%branch, "empty repository, future commits will track the default branch");
        return branch;
    }
    "master".to_string()
}

async fn stdout_of(worktree: &Path, args: &[&str]) -> Option<String> {
    let out = git(worktree, args).await.ok()?;
    if !out.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

// ---------------------------------------------------------------------------
// Addressing
// ---------------------------------------------------------------------------

/// Address other machines on the LAN would use to reach this host.
///
/// Connecting a UDP socket sends nothing; it only asks the kernel which
/// interface would route outward.  Falls back to `localhost`.
pub fn local_ip() -> String {
    let discover = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("192.0.2.1:9")?;
        Ok(socket.local_addr()?.ip())
    };
    match discover() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip.to_string(),
        _ => "localhost".to_string(),
    }
}

/// `ssh://<host>:<port>/<repo>`.
pub fn server_uri(host: &str, port: u16, repo_name: &str) -> String {
    format!("ssh://{host}:{port}/{repo_name}")
}
