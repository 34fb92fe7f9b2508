//! SSH front end.
//!
//! Accepts SSH connections, admits them by public key through the user
//! registry, serves `git-upload-pack` / `git-receive-pack` against the bare
//! repository, and hosts the admin console for interactive admin sessions.

pub mod server;
pub mod session;

pub use server::{run_ssh_server, ServerContext};
