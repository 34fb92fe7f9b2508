//! Interactive admin console served over an SSH PTY.
//!
//! [`ConsoleSession`] is a plain state machine: the SSH handler feeds it
//! decoded [`Key`]s and asks [`Screen`] to draw it.  Every mutation goes
//! through the shared [`UserRegistry`](crate::registry::UserRegistry) or
//! [`ConfigHandle`](crate::config::ConfigHandle) write path, and the next
//! frame is built from fresh snapshots, so edits made by other sessions or
//! by hand on disk show up on the next redraw.

pub mod input;
pub mod render;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::auth::{AccessControl, Fingerprint, Permission};
use crate::config::GlobalConfig;
use crate::git::Commit;
use crate::logs::{self, LogEntry};
use crate::registry::User;

pub use input::{decode, Key};
pub use render::Screen;

const NAME_LIMIT: usize = 50;
const KEY_LIMIT: usize = 2048;
/// Log lines kept for the Logs tab.
const LOG_TAIL: usize = 200;
/// Lines moved by PageUp/PageDown in the diff pane.
const DIFF_PAGE: u16 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Users,
    Commits,
    Logs,
}

impl Tab {
    pub const ALL: [Tab; 3] = [Tab::Users, Tab::Commits, Tab::Logs];

    pub fn title(self) -> &'static str {
        match self {
            Tab::Users => "Users",
            Tab::Commits => "Commit History",
            Tab::Logs => "Logs",
        }
    }

    fn next(self) -> Self {
        match self {
            Tab::Users => Tab::Commits,
            Tab::Commits => Tab::Logs,
            Tab::Logs => Tab::Users,
        }
    }
}

/// Git lookup the Commits tab is waiting on.  The SSH handler runs it and
/// hands the result back through [`ConsoleSession::apply_log`] or
/// [`ConsoleSession::apply_diff`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitRequest {
    Log,
    Show(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diff {
    pub hash: String,
    pub text: String,
}

/// State of the Commits tab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct History {
    pub commits: Vec<Commit>,
    pub selected: usize,
    pub diff: Option<Diff>,
    /// Keys scroll the diff instead of moving through the list.
    pub diff_focus: bool,
    pub scroll: u16,
    pub error: Option<String>,
    pending: Option<GitRequest>,
}

impl History {
    fn current(&self) -> Option<&Commit> {
        self.commits.get(self.selected)
    }

    fn select(&mut self, index: usize) {
        self.selected = index.min(self.commits.len().saturating_sub(1));
        self.scroll = 0;
    }

    fn max_scroll(&self) -> u16 {
        let lines = self.diff.as_ref().map_or(0, |d| d.text.lines().count());
        u16::try_from(lines.saturating_sub(1)).unwrap_or(u16::MAX)
    }

    /// Enter on the list: show the selected commit's diff, fetching it first
    /// when what is loaded belongs to another commit.
    fn open_diff(&mut self) {
        let Some(hash) = self.current().map(|c| c.hash.clone()) else {
            return;
        };
        self.diff_focus = true;
        if self.diff.as_ref().map(|d| d.hash.as_str()) != Some(hash.as_str()) {
            self.pending = Some(GitRequest::Show(hash));
        }
    }
}

/// Field of the create-user form that receives typed characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Name,
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateForm {
    pub name: String,
    pub key: String,
    pub perm: Permission,
    pub focus: Field,
}

impl Default for CreateForm {
    fn default() -> Self {
        Self {
            name: String::new(),
            key: String::new(),
            perm: Permission::None,
            focus: Field::Name,
        }
    }
}

impl CreateForm {
    fn toggle_focus(&mut self) {
        self.focus = match self.focus {
            Field::Name => Field::Key,
            Field::Key => Field::Name,
        };
    }

    fn push(&mut self, c: char) {
        let (field, limit) = match self.focus {
            Field::Name => (&mut self.name, NAME_LIMIT),
            Field::Key => (&mut self.key, KEY_LIMIT),
        };
        if field.chars().count() < limit {
            field.push(c);
        }
    }

    fn pop(&mut self) {
        match self.focus {
            Field::Name => self.name.pop(),
            Field::Key => self.key.pop(),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Normal,
    Creating(CreateForm),
    Deleting { fingerprint: Fingerprint, name: String },
}

/// One-line feedback shown under the main view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub text: String,
    pub is_error: bool,
}

/// Whether the session should keep running after a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Everything one frame needs, captured at once.
#[derive(Debug, Clone)]
pub struct View<'a> {
    pub repo_name: &'a str,
    pub tab: Tab,
    pub mode: &'a Mode,
    pub users: Vec<(Fingerprint, User)>,
    pub selected: usize,
    pub config: GlobalConfig,
    pub logs: Vec<LogEntry>,
    pub history: &'a History,
    pub status: Option<&'a Status>,
}

pub struct ConsoleSession {
    access: Arc<AccessControl>,
    log_file: PathBuf,
    /// Who is at the keyboard, for the audit trail.
    operator: String,
    tab: Tab,
    mode: Mode,
    selected: usize,
    history: History,
    status: Option<Status>,
}

impl ConsoleSession {
    pub fn new(access: Arc<AccessControl>, log_file: PathBuf, operator: impl Into<String>) -> Self {
        Self {
            access,
            log_file,
            operator: operator.into(),
            tab: Tab::Users,
            mode: Mode::Normal,
            selected: 0,
            history: History::default(),
            status: None,
        }
    }

    /// Users ordered for display: by name, then key.
    pub fn rows(&self) -> Vec<(Fingerprint, User)> {
        let mut rows: Vec<_> = self.access.registry().get_all().into_iter().collect();
        rows.sort_by(|a, b| a.1.name.cmp(&b.1.name).then_with(|| a.0.cmp(&b.0)));
        rows
    }

    pub fn view(&self) -> View<'_> {
        let users = self.rows();
        let selected = self.selected.min(users.len().saturating_sub(1));
        let logs = match self.tab {
            Tab::Logs => logs::tail(&self.log_file, LOG_TAIL).unwrap_or_else(|e| {
                warn!(error = %e, "could not read log file");
                Vec::new()
            }),
            Tab::Users | Tab::Commits => Vec::new(),
        };
        View {
            repo_name: self.access.repo_name(),
            tab: self.tab,
            mode: &self.mode,
            users,
            selected,
            config: self.access.config().get(),
            logs,
            history: &self.history,
            status: self.status.as_ref(),
        }
    }

    // -- Input --------------------------------------------------------------

    pub fn handle_key(&mut self, key: Key) -> Flow {
        if key == Key::CtrlC {
            return Flow::Quit;
        }
        match std::mem::replace(&mut self.mode, Mode::Normal) {
            Mode::Normal => return self.on_normal(key),
            Mode::Creating(form) => self.on_creating(form, key),
            Mode::Deleting { fingerprint, name } => self.on_deleting(fingerprint, name, key),
        }
        Flow::Continue
    }

    fn on_normal(&mut self, key: Key) -> Flow {
        match key {
            Key::Char('q') => return Flow::Quit,
            Key::Tab => {
                self.tab = self.tab.next();
                if self.tab == Tab::Commits {
                    self.history.pending = Some(GitRequest::Log);
                }
            }
            Key::Char('t') => self.toggle_public(),
            Key::Char('P') => self.cycle_default_perm(),
            _ if self.tab == Tab::Commits => {
                self.on_history(key);
                return Flow::Continue;
            }
            _ if self.tab == Tab::Logs => {}
            Key::Up | Key::Char('k') => self.selected = self.selected.saturating_sub(1),
            Key::Down | Key::Char('j') => self.selected += 1,
            Key::Char('n') => {
                self.status = None;
                self.mode = Mode::Creating(CreateForm::default());
            }
            Key::Char('d') => {
                if let Some((fingerprint, user)) = self.current() {
                    self.mode = Mode::Deleting {
                        fingerprint,
                        name: user.name,
                    };
                }
            }
            Key::Char('p') => self.cycle_user_perm(),
            _ => {}
        }
        self.clamp_selection();
        Flow::Continue
    }

    fn on_history(&mut self, key: Key) {
        let h = &mut self.history;
        if h.diff_focus {
            match key {
                Key::Up | Key::Char('k') => h.scroll = h.scroll.saturating_sub(1),
                Key::Down | Key::Char('j') => h.scroll = h.scroll.saturating_add(1).min(h.max_scroll()),
                Key::PageUp => h.scroll = h.scroll.saturating_sub(DIFF_PAGE),
                Key::PageDown => h.scroll = h.scroll.saturating_add(DIFF_PAGE).min(h.max_scroll()),
                Key::Enter | Key::Esc => h.diff_focus = false,
                _ => {}
            }
            return;
        }
        match key {
            Key::Up | Key::Char('k') => h.select(h.selected.saturating_sub(1)),
            Key::Down | Key::Char('j') => h.select(h.selected + 1),
            Key::Enter => h.open_diff(),
            Key::Char('r') => h.pending = Some(GitRequest::Log),
            _ => {}
        }
    }

    // -- Git results --------------------------------------------------------

    /// The next lookup the Commits tab needs, if it is showing.
    pub fn git_request(&mut self) -> Option<GitRequest> {
        if self.tab != Tab::Commits {
            return None;
        }
        self.history.pending.take()
    }

    pub fn apply_log(&mut self, result: Result<Vec<Commit>>) {
        let h = &mut self.history;
        match result {
            Ok(commits) => {
                let keep = h.current().map(|c| c.hash.clone());
                h.commits = commits;
                h.error = None;
                let index = keep
                    .and_then(|hash| h.commits.iter().position(|c| c.hash == hash))
                    .unwrap_or(0);
                h.select(index);
                if h.diff.as_ref().is_some_and(|d| !h.commits.iter().any(|c| c.hash == d.hash)) {
                    h.diff = None;
                    h.diff_focus = false;
                }
            }
            Err(e) => {
                warn!(error = %e, "could not read commit history");
                h.error = Some(format!("could not read commit history: {e}"));
            }
        }
    }

    pub fn apply_diff(&mut self, hash: String, result: Result<String>) {
        match result {
            Ok(text) => {
                self.history.diff = Some(Diff { hash, text });
                self.history.scroll = 0;
            }
            Err(e) => {
                warn!(error = %e, commit = %hash, "could not read commit diff");
                self.history.diff_focus = false;
                self.set_status(format!("diff failed: {e}"), true);
            }
        }
    }

    fn on_creating(&mut self, mut form: CreateForm, key: Key) {
        match key {
            Key::Esc => return,
            Key::Tab => form.perm = form.perm.next(),
            Key::Up | Key::Down => form.toggle_focus(),
            Key::Backspace => form.pop(),
            Key::Char(c) => form.push(c),
            Key::Enter => {
                let name = form.name.trim();
                let key_text = form.key.trim();
                if !name.is_empty() && !key_text.is_empty() {
                    if self.create_user(name, key_text, form.perm.clone()) {
                        return;
                    }
                } else if form.focus == Field::Name && !name.is_empty() {
                    form.focus = Field::Key;
                }
            }
            Key::PageUp | Key::PageDown | Key::CtrlC => {}
        }
        self.mode = Mode::Creating(form);
    }

    fn on_deleting(&mut self, fingerprint: Fingerprint, name: String, key: Key) {
        match key {
            Key::Char('d') | Key::Char('y') => {
                match self.access.registry().delete(&fingerprint) {
                    Ok(Some(_)) => {
                        info!(operator = %self.operator, user = %name, "user deleted from console");
                        self.set_status(format!("deleted {name}"), false);
                    }
                    Ok(None) => self.set_status(format!("{name} was already removed"), false),
                    Err(e) => self.set_status(format!("delete failed: {e}"), true),
                }
                self.selected = 0;
            }
            Key::Esc | Key::Char('n') => {}
            _ => self.mode = Mode::Deleting { fingerprint, name },
        }
    }

    // -- Mutations ----------------------------------------------------------

    fn current(&self) -> Option<(Fingerprint, User)> {
        self.rows().into_iter().nth(self.selected)
    }

    fn clamp_selection(&mut self) {
        let len = self.access.registry().len();
        self.selected = self.selected.min(len.saturating_sub(1));
    }

    fn set_status(&mut self, text: String, is_error: bool) {
        self.status = Some(Status { text, is_error });
    }

    /// Returns `true` when the form is done.
    fn create_user(&mut self, name: &str, key_text: &str, perm: Permission) -> bool {
        let fingerprint = match Fingerprint::parse_openssh(key_text) {
            Ok(fp) => fp,
            Err(e) => {
                self.set_status(format!("invalid key: {e}"), true);
                return false;
            }
        };
        match self
            .access
            .registry()
            .upsert(fingerprint.clone(), User::new(name, perm.clone()))
        {
            Ok(()) => {
                info!(
                    operator = %self.operator,
                    user = %name,
                    %perm,
                    key = %fingerprint.sha256(),
                    "user created from console"
                );
                self.set_status(format!("created {name} ({perm})"), false);
                true
            }
            Err(e) => {
                self.set_status(format!("save failed: {e}"), true);
                false
            }
        }
    }

    fn cycle_user_perm(&mut self) {
        let Some((fingerprint, user)) = self.current() else {
            return;
        };
        match self.access.registry().cycle_permission(&fingerprint) {
            Ok(Some(perm)) => {
                info!(operator = %self.operator, user = %user.name, %perm, "permission changed from console");
                self.set_status(format!("{} is now {perm}", user.name), false);
            }
            Ok(None) => self.set_status(format!("{} no longer exists", user.name), true),
            Err(e) => self.set_status(format!("save failed: {e}"), true),
        }
    }

    fn cycle_default_perm(&mut self) {
        let result = self.access.config().update(|c| {
            c.default_perm = Some(c.default_perm.as_ref().map(Permission::next).unwrap_or_default());
        });
        match result {
            Ok(c) => {
                let perm = c.default_perm.unwrap_or_default();
                info!(operator = %self.operator, default_perm = %perm, "default permission changed from console");
                self.set_status(format!("default permission is now {perm}"), false);
            }
            Err(e) => self.set_status(format!("save failed: {e}"), true),
        }
    }

    fn toggle_public(&mut self) {
        match self.access.config().update(|c| c.public = !c.public) {
            Ok(c) => {
                info!(operator = %self.operator, public = c.public, "visibility changed from console");
                let text = if c.public { "server is now public" } else { "server is now private" };
                self.set_status(text.to_string(), false);
            }
            Err(e) => self.set_status(format!("save failed: {e}"), true),
        }
    }
}
