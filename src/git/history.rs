//! Read-only views of the served repository's history for the console.

use std::path::Path;
use std::process::{Output, Stdio};

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, instrument};

/// Number of commits the Commits tab lists.
pub const HISTORY_LIMIT: usize = 30;

const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

/// One entry of `git log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub hash: String,
    pub author: String,
    /// Author date, e.g. `Mar 01, 2026`.
    pub date: String,
    /// Full message, trimmed.
    pub message: String,
}

impl Commit {
    pub fn short_hash(&self) -> &str {
        self.hash.get(..7).unwrap_or(&self.hash)
    }

    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or_default()
    }
}

/// Run `git --git-dir <repo> <args>` and capture its output.
async fn git(repo: &Path, args: &[&str]) -> Result<Output> {
    Command::new("git")
        .arg("--git-dir")
        .arg(repo)
        .args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn git {}", args.join(" ")))
}

/// The newest `limit` commits reachable from `HEAD`, newest first.  A
/// repository without commits yields an empty list.
#[instrument(skip(repo), fields(repo = %repo.display()))]
pub async fn recent_commits(repo: &Path, limit: usize) -> Result<Vec<Commit>> {
    let head = git(repo, &["rev-parse", "--verify", "--quiet", "HEAD"]).await?;
    if !head.status.success() {
        debug!("repository has no commits yet");
        return Ok(Vec::new());
    }

    let count = format!("--max-count={limit}");
    let output = git(
        repo,
        &[
            "log",
            &count,
            "--date=format:%b %d, %Y",
            "--format=%H%x1f%an%x1f%ad%x1f%B%x1e",
            "HEAD",
        ],
    )
    .await?;

    if !output.status.success() {
        bail!(
            "git log failed (status {}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(parse_log(&String::from_utf8_lossy(&output.stdout)))
}

/// Patch introduced by `hash`; the first commit is shown against the empty
/// tree.
#[instrument(skip(repo), fields(repo = %repo.display()))]
pub async fn commit_diff(repo: &Path, hash: &str) -> Result<String> {
    if hash.len() < 4 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("not a commit hash: {hash:?}");
    }

    let output = git(
        repo,
        &["show", "--no-color", "--no-ext-diff", "--format=", "--patch", hash],
    )
    .await?;

    if !output.status.success() {
        bail!(
            "git show failed (status {}): {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let text = String::from_utf8_lossy(&output.stdout).trim_matches('\n').to_string();
    if text.is_empty() {
        return Ok("No changes found.".to_string());
    }
    Ok(text)
}

/// Parse `git log` output written with unit/record separators.
fn parse_log(text: &str) -> Vec<Commit> {
    text.split(RECORD_SEP)
        .filter_map(|record| {
            let mut fields = record.trim_start_matches('\n').splitn(4, FIELD_SEP);
            let hash = fields.next()?.trim();
            if hash.is_empty() {
                return None;
            }
            Some(Commit {
                hash: hash.to_string(),
                author: fields.next()?.to_string(),
                date: fields.next()?.to_string(),
                message: fields.next().unwrap_or_default().trim().to_string(),
            })
        })
        .collect()
}
