//! Git command wrappers.
//!
//! All operations shell out to the `git` binary using `tokio::process::Command`
//! for non-blocking execution.

pub mod commands;
pub mod history;
pub mod remote;

pub use commands::{git_clone_bare, is_worktree, spawn_service, GitService};
pub use history::{commit_diff, recent_commits, Commit, HISTORY_LIMIT};
pub use remote::{configure_local_remote, local_ip, server_uri};
