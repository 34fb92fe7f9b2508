//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Each inbound SSH connection is served by a dedicated [`SshSession`].  The
//! handler admits keys through [`AccessControl`](crate::auth::AccessControl),
//! runs `git-upload-pack` / `git-receive-pack` against the served bare
//! repository when the key's capability allows it, and hosts the admin
//! console for admin keys that open an interactive shell.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, Pty};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use super::server::ServerContext;
use crate::auth::{AccessControl, Fingerprint};
use crate::console::{self, ConsoleSession, Flow, GitRequest, Screen};
use crate::git::{self, GitService};

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Admin console attached to one channel.
struct ConsoleChannel {
    channel: ChannelId,
    session: ConsoleSession,
    screen: Screen,
}

/// Per-connection SSH session state.
pub struct SshSession {
    ctx: Arc<ServerContext>,
    peer_addr: Option<SocketAddr>,
    /// Held for the connection's lifetime so shutdown can count open sessions.
    _live: Arc<()>,
    fingerprint: Option<Fingerprint>,
    username: Option<String>,
    /// Stdin handle for a running Git service child process.
    /// Data received from the SSH client is forwarded here.
    child_stdin: Option<tokio::process::ChildStdin>,
    /// `GIT_PROTOCOL` value sent by the client via SSH env request.
    git_protocol: Option<String>,
    /// Terminal size from the client's PTY request, columns then rows.
    pty: Option<(u16, u16)>,
    console: Option<ConsoleChannel>,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(ctx: Arc<ServerContext>, peer_addr: Option<SocketAddr>, live: Arc<()>) -> Self {
        Self {
            ctx,
            peer_addr,
            _live: live,
            fingerprint: None,
            username: None,
            child_stdin: None,
            git_protocol: None,
            pty: None,
            console: None,
        }
    }

    fn remote_addr(&self) -> String {
        self.peer_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Draw the console and queue the bytes on its channel.
    fn redraw(console: &mut ConsoleChannel, session: &mut Session) -> Result<()> {
        let bytes = console.screen.draw(&console.session.view())?;
        session.data(console.channel, CryptoVec::from_slice(&bytes));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Channel helpers
// ---------------------------------------------------------------------------

/// Send exit-status, EOF, and close on a channel in the order required by
/// the SSH protocol (RFC 4254).  Git's SSH transport client expects all three
/// signals; omitting exit-status or EOF causes the client to treat the channel
/// close as a transport failure ("the remote end hung up unexpectedly").
fn finish_channel(session: &mut Session, channel_id: ChannelId, exit_status: u32) {
    session.exit_status_request(channel_id, exit_status);
    session.eof(channel_id);
    session.close(channel_id);
}

/// Write `msg` to the client's stderr and end the channel with status 1.
fn reject(session: &mut Session, channel_id: ChannelId, msg: &str) {
    session.extended_data(channel_id, 1, CryptoVec::from_slice(msg.as_bytes()));
    finish_channel(session, channel_id, 1);
}

/// Decide whether `fingerprint` may log in.  A first-contact guest is
/// written to users.json, so the decision runs on the blocking pool.
async fn admit(
    access: &Arc<AccessControl>,
    user: &str,
    remote_addr: String,
    fingerprint: &Fingerprint,
) -> Result<bool> {
    let access = Arc::clone(access);
    let (user, fingerprint) = (user.to_string(), fingerprint.clone());
    let admitted =
        tokio::task::spawn_blocking(move || access.authenticate(&user, &remote_addr, &fingerprint))
            .await?;
    Ok(admitted)
}

/// Run the history lookups the console's Commits tab is waiting on.
async fn serve_git_requests(console: &mut ConsoleSession, repo: &Path) {
    while let Some(request) = console.git_request() {
        match request {
            GitRequest::Log => {
                let commits = git::recent_commits(repo, git::HISTORY_LIMIT).await;
                console.apply_log(commits);
            }
            GitRequest::Show(hash) => {
                let diff = git::commit_diff(repo, &hash).await;
                console.apply_diff(hash, diff);
            }
        }
    }
}

fn clamp_dim(v: u32) -> u16 {
    u16::try_from(v).unwrap_or(u16::MAX)
}

// ---------------------------------------------------------------------------
// Git command parsing
// ---------------------------------------------------------------------------

/// Parse a Git SSH exec request such as:
///
/// ```text
/// git-upload-pack 'widgets.git'
/// git-receive-pack '/widgets'
/// ```
///
/// Returns the service and the repository name with surrounding quotes and
/// slashes removed and a `.git` suffix guaranteed.
fn parse_git_command(cmd: &str) -> Option<(GitService, String)> {
    let cmd = cmd.trim();
    let (service, rest) = [GitService::UploadPack, GitService::ReceivePack]
        .into_iter()
        .find_map(|s| cmd.strip_prefix(s.exec_name()).map(|rest| (s, rest)))?;

    // The command name must be followed by whitespace, not more letters.
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }

    let rest = rest.trim();
    let rest = rest.trim_matches('\'').trim_matches('"');
    let rest = rest.trim_start_matches('/');
    let rest = rest.trim_end_matches('/');

    if rest.is_empty() {
        return None;
    }

    let repo = if rest.ends_with(".git") {
        rest.to_string()
    } else {
        format!("{rest}.git")
    };
    Some((service, repo))
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Authenticate a client by public key.  Called only after the client
    /// has proven possession of the private key.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let fp = Fingerprint::from_public_key(key);
        info!(
            peer = ?self.peer_addr,
            user = %user,
            fingerprint = %fp.sha256(),
            "SSH public-key auth attempt"
        );

        let admitted = admit(&self.ctx.access, user, self.remote_addr(), &fp).await?;

        if admitted {
            self.fingerprint = Some(fp);
            self.username = Some(user.to_string());
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    /// Accept new channel-open requests for sessions.
    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    /// Capture environment variables sent by the client before the exec
    /// request.  Git clients send `GIT_PROTOCOL=version=2` here.
    async fn env_request(
        &mut self,
        _channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if variable_name == "GIT_PROTOCOL" {
            debug!(value = %variable_value, "captured GIT_PROTOCOL from client");
            self.git_protocol = Some(variable_value.to_string());
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        _channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(%term, cols = col_width, rows = row_height, "PTY requested");
        self.pty = Some((clamp_dim(col_width), clamp_dim(row_height)));
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let (cols, rows) = (clamp_dim(col_width), clamp_dim(row_height));
        self.pty = Some((cols, rows));
        if let Some(console) = self.console.as_mut().filter(|c| c.channel == channel) {
            console.screen.resize(cols, rows)?;
            Self::redraw(console, session)?;
        }
        Ok(())
    }

    /// An interactive shell opens the admin console for admin keys.
    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(fp) = self.fingerprint.clone() else {
            reject(session, channel_id, "Authentication required\r\n");
            return Ok(());
        };

        if !self.ctx.access.console_allowed(&fp) {
            warn!(
                username = ?self.username,
                fingerprint = %fp.sha256(),
                "console access denied"
            );
            reject(
                session,
                channel_id,
                "Access denied: admin permission required for the console\r\n",
            );
            return Ok(());
        }

        let Some((cols, rows)) = self.pty else {
            reject(
                session,
                channel_id,
                "No PTY requested; connect with `ssh -t` to use the console\r\n",
            );
            return Ok(());
        };

        let operator = self
            .ctx
            .access
            .registry()
            .get(&fp)
            .map(|u| u.name)
            .unwrap_or_else(|| fp.sha256());
        info!(operator = %operator, "admin console opened");

        let mut screen = Screen::new(cols, rows)?;
        let intro = screen.enter()?;
        session.data(channel_id, CryptoVec::from_slice(&intro));

        let mut console = ConsoleChannel {
            channel: channel_id,
            session: ConsoleSession::new(
                Arc::clone(&self.ctx.access),
                self.ctx.log_file.clone(),
                operator,
            ),
            screen,
        };
        Self::redraw(&mut console, session)?;
        self.console = Some(console);
        Ok(())
    }

    /// Route client input to the console, or to the running Git service's
    /// stdin.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(console) = self.console.as_mut().filter(|c| c.channel == channel) {
            let mut flow = Flow::Continue;
            for key in console::decode(data) {
                flow = console.session.handle_key(key);
                if flow == Flow::Quit {
                    break;
                }
            }

            if flow == Flow::Quit {
                let outro = console.screen.leave()?;
                session.data(channel, CryptoVec::from_slice(&outro));
                finish_channel(session, channel, 0);
                self.console = None;
                info!("admin console closed");
            } else {
                serve_git_requests(&mut console.session, &self.ctx.bare_repo).await;
                Self::redraw(console, session)?;
            }
            return Ok(());
        }

        if let Some(ref mut stdin) = self.child_stdin {
            if let Err(e) = stdin.write_all(data).await {
                debug!(error = %e, "failed to write to git stdin (process may have exited)");
                self.child_stdin.take();
            }
        }
        Ok(())
    }

    /// When the client signals EOF, close the child's stdin so it knows the
    /// negotiation is complete and can exit.
    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.child_stdin.take();
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.console.as_ref().is_some_and(|c| c.channel == channel) {
            self.console = None;
            info!("admin console disconnected");
        }
        Ok(())
    }

    /// Handle `exec` requests on an established channel.
    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let raw_cmd = String::from_utf8_lossy(data);
        info!(
            peer = ?self.peer_addr,
            username = ?self.username,
            command = %raw_cmd,
            "SSH exec request"
        );

        let Some((service, repo)) = parse_git_command(&raw_cmd) else {
            warn!(command = %raw_cmd, "unrecognised SSH exec command");
            reject(
                session,
                channel_id,
                "ERROR: Unknown command. Only git-upload-pack and git-receive-pack are supported.\n",
            );
            return Ok(());
        };

        // ── Per-repo authorization ────────────────────────────
        let level = match self.fingerprint {
            Some(ref fp) => self.ctx.access.authorize_repo(&repo, fp),
            None => crate::auth::AccessLevel::NoAccess,
        };
        if !level.allows(service.required_access()) {
            warn!(
                username = ?self.username,
                repo = %repo,
                service = service.exec_name(),
                access = %level,
                "SSH repo access denied"
            );
            reject(
                session,
                channel_id,
                &format!("ERROR: Access denied to repository {repo}\n"),
            );
            return Ok(());
        }

        match service {
            GitService::UploadPack => info!(repo = %repo, username = ?self.username, "fetch"),
            GitService::ReceivePack => info!(repo = %repo, username = ?self.username, "push"),
        }

        let mut child = match git::spawn_service(
            service,
            &self.ctx.bare_repo,
            self.git_protocol.as_deref(),
        ) {
            Ok(child) => child,
            Err(e) => {
                error!(repo = %repo, error = %e, "failed to start git service");
                reject(
                    session,
                    channel_id,
                    &format!("Failed to start {}: {e}\n", service.exec_name()),
                );
                return Ok(());
            }
        };

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            error!("git child is missing piped stdout/stderr");
            let _ = child.start_kill();
            reject(session, channel_id, "ERROR: internal error\n");
            return Ok(());
        };

        // Store stdin so the `data` and `channel_eof` callbacks can forward
        // client data / signal EOF.
        self.child_stdin = child.stdin.take();

        // Obtain an async Handle for sending data from the background task
        // (the sync Session methods cannot be used outside the handler call).
        let handle = session.handle();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];

            // Stream stdout → channel data.
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if handle
                            .data(channel_id, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "error reading git stdout");
                        break;
                    }
                }
            }

            let exit_code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(1) as u32,
                Err(_) => 1,
            };

            // Send any stderr on the extended-data channel.
            let mut stderr_buf = Vec::new();
            let _ = stderr.read_to_end(&mut stderr_buf).await;
            if !stderr_buf.is_empty() && exit_code != 0 {
                let msg = format!(
                    "{} error: {}\n",
                    service.exec_name(),
                    String::from_utf8_lossy(&stderr_buf).trim(),
                );
                let _ = handle
                    .extended_data(channel_id, 1, CryptoVec::from_slice(msg.as_bytes()))
                    .await;
            }

            debug!(exit_code, service = service.exec_name(), "git service finished");

            // RFC 4254: exit-status → EOF → close.
            let _ = handle.exit_status_request(channel_id, exit_code).await;
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;
        });

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::fingerprint::tests::ed25519_blob;
    use crate::auth::Permission;
    use crate::config::{ConfigHandle, GlobalConfig};
    use crate::console::{Key, Tab};
    use crate::registry::UserRegistry;
    use crate::store::{JsonStore, SelfWrites};

    fn control(dir: &Path, public: bool) -> Arc<AccessControl> {
        let store = JsonStore::new(Arc::new(SelfWrites::new()));
        let registry = UserRegistry::load(dir.join("users.json"), store.clone()).unwrap();
        let config = ConfigHandle::load(dir.join("config.json"), store).unwrap();
        config
            .set(GlobalConfig {
                public,
                default_perm: Some(Permission::Read),
            })
            .unwrap();
        Arc::new(AccessControl::new("widgets.git", Arc::new(registry), Arc::new(config)))
    }

    #[tokio::test(flavor = "current_thread")]
    async fn guest_admission_persists_from_current_thread_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let access = control(tmp.path(), true);
        let fp = Fingerprint::from_key_blob(&ed25519_blob(9)).unwrap();

        assert!(admit(&access, "git", "10.0.0.9:2222".into(), &fp).await.unwrap());
        let on_disk = std::fs::read_to_string(tmp.path().join("users.json")).unwrap();
        assert!(on_disk.contains("git@10.0.0.9:2222"));

        // The stored guest is admitted again without a second registration.
        assert!(admit(&access, "git", "10.0.0.10:1".into(), &fp).await.unwrap());
        assert_eq!(access.registry().get(&fp).unwrap().name, "git@10.0.0.9:2222");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn private_server_rejects_unknown_key() {
        let tmp = tempfile::tempdir().unwrap();
        let access = control(tmp.path(), false);
        let fp = Fingerprint::from_key_blob(&ed25519_blob(9)).unwrap();
        assert!(!admit(&access, "git", "10.0.0.9:2222".into(), &fp).await.unwrap());
        assert!(access.registry().get(&fp).is_none());
    }

    fn git(dir: &Path, args: &[&str]) -> bool {
        std::process::Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .env("GIT_AUTHOR_NAME", "Ada")
            .env("GIT_AUTHOR_EMAIL", "ada@example.com")
            .env("GIT_COMMITTER_NAME", "Ada")
            .env("GIT_COMMITTER_EMAIL", "ada@example.com")
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("HOME", dir)
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[tokio::test]
    async fn commits_tab_is_fed_from_bare_repo() {
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("widgets");
        std::fs::create_dir(&work).unwrap();
        if !git(&work, &["init", "-q"]) {
            return;
        }
        std::fs::write(work.join("README"), "hello\n").unwrap();
        assert!(git(&work, &["add", "README"]));
        assert!(git(&work, &["commit", "-q", "-m", "Initial commit"]));
        assert!(git(tmp.path(), &["clone", "-q", "--bare", "widgets", "widgets.git"]));
        let bare = tmp.path().join("widgets.git");

        let state = tmp.path().join("state");
        std::fs::create_dir(&state).unwrap();
        let mut console = ConsoleSession::new(control(&state, false), state.join("logs.jsonl"), "root");
        console.handle_key(Key::Tab);
        serve_git_requests(&mut console, &bare).await;

        let view = console.view();
        assert_eq!(view.tab, Tab::Commits);
        assert_eq!(view.history.commits.len(), 1);
        assert_eq!(view.history.commits[0].subject(), "Initial commit");

        console.handle_key(Key::Enter);
        serve_git_requests(&mut console, &bare).await;
        let diff = console.view().history.diff.clone().unwrap();
        assert!(diff.text.contains("+hello"));
    }

    #[test]
    fn parse_upload_pack_with_git_suffix() {
        let (svc, repo) = parse_git_command("git-upload-pack 'widgets.git'").unwrap();
        assert_eq!(svc, GitService::UploadPack);
        assert_eq!(repo, "widgets.git");
    }

    #[test]
    fn parse_appends_git_suffix_and_strips_slashes() {
        let (svc, repo) = parse_git_command("git-upload-pack '/widgets/'").unwrap();
        assert_eq!(svc, GitService::UploadPack);
        assert_eq!(repo, "widgets.git");
    }

    #[test]
    fn parse_receive_pack() {
        let (svc, repo) = parse_git_command("git-receive-pack 'widgets.git'").unwrap();
        assert_eq!(svc, GitService::ReceivePack);
        assert_eq!(repo, "widgets.git");
    }

    #[test]
    fn parse_double_quoted() {
        let (_, repo) = parse_git_command("git-upload-pack \"/widgets.git\"").unwrap();
        assert_eq!(repo, "widgets.git");
    }

    #[test]
    fn parse_invalid_returns_none() {
        assert!(parse_git_command("ls -la").is_none());
        assert!(parse_git_command("git-upload-pack ''").is_none());
        assert!(parse_git_command("git-upload-pack '/'").is_none());
        assert!(parse_git_command("git-upload-packx 'widgets.git'").is_none());
        assert!(parse_git_command("git-upload-pack").is_none());
    }

    #[test]
    fn pty_dimensions_saturate() {
        assert_eq!(clamp_dim(80), 80);
        assert_eq!(clamp_dim(u32::MAX), u16::MAX);
    }
}
