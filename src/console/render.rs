//! Drawing the console with ratatui into a byte buffer.
//!
//! The terminal lives on the far end of an SSH channel, so the backend writes
//! into a shared in-memory buffer that the session drains after each draw and
//! sends as channel data.  A fixed viewport keeps ratatui from querying the
//! local tty for its size; the PTY size comes from the client instead.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crossterm::cursor::{Hide, Show};
use crossterm::execute;
use crossterm::terminal::{EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{
    Block, Borders, Cell, Clear, List, ListItem, ListState, Paragraph, Row, Table, TableState, Tabs,
};
use ratatui::{Frame, Terminal, TerminalOptions, Viewport};

use super::{CreateForm, Field, History, Mode, Tab, View};
use crate::auth::Permission;
use crate::logs::LogEntry;

const ACCENT: Color = Color::Rgb(0x50, 0x00, 0xff);
const DANGER: Color = Color::Rgb(0xff, 0x1b, 0x1c);
const MUTED: Color = Color::DarkGray;
const ADDED: Color = Color::Rgb(0x6a, 0xb5, 0x47);

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

// ---------------------------------------------------------------------------
// Output plumbing
// ---------------------------------------------------------------------------

/// `Write` sink shared between the ratatui backend and its owner.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A remote terminal of a known size.
pub struct Screen {
    terminal: Terminal<CrosstermBackend<SharedBuf>>,
    out: SharedBuf,
}

fn area(cols: u16, rows: u16) -> Rect {
    let cols = if cols == 0 { DEFAULT_COLS } else { cols };
    let rows = if rows == 0 { DEFAULT_ROWS } else { rows };
    Rect::new(0, 0, cols, rows)
}

impl Screen {
    pub fn new(cols: u16, rows: u16) -> io::Result<Self> {
        let out = SharedBuf::default();
        let terminal = Terminal::with_options(
            CrosstermBackend::new(out.clone()),
            TerminalOptions {
                viewport: Viewport::Fixed(area(cols, rows)),
            },
        )?;
        Ok(Self { terminal, out })
    }

    /// Bytes that switch the client to the alternate screen.
    pub fn enter(&mut self) -> io::Result<Vec<u8>> {
        execute!(self.out, EnterAlternateScreen, Hide)?;
        self.terminal.clear()?;
        Ok(self.out.take())
    }

    /// Bytes that restore the client's normal screen.
    pub fn leave(&mut self) -> io::Result<Vec<u8>> {
        execute!(self.out, Show, LeaveAlternateScreen)?;
        Ok(self.out.take())
    }

    pub fn resize(&mut self, cols: u16, rows: u16) -> io::Result<()> {
        self.terminal.resize(area(cols, rows))
    }

    /// Render `view` and return the bytes to send.
    pub fn draw(&mut self, view: &View<'_>) -> io::Result<Vec<u8>> {
        self.terminal.draw(|frame| draw(frame, view))?;
        Ok(self.out.take())
    }
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

pub fn draw(frame: &mut Frame, view: &View<'_>) {
    let [header, body, footer] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
    ])
    .areas(frame.area());

    draw_header(frame, header, view);
    match view.tab {
        Tab::Users => draw_users(frame, body, view),
        Tab::Commits => draw_commits(frame, body, view.history),
        Tab::Logs => draw_logs(frame, body, &view.logs),
    }
    draw_footer(frame, footer, view);

    match view.mode {
        Mode::Normal => {}
        Mode::Creating(form) => draw_create_form(frame, body, form),
        Mode::Deleting { name, .. } => draw_delete_confirm(frame, body, name),
    }
}

fn draw_header(frame: &mut Frame, area: Rect, view: &View<'_>) {
    let [tabs_area, title_area] =
        Layout::horizontal([Constraint::Min(0), Constraint::Length(40)]).areas(area);

    let selected = Tab::ALL.iter().position(|t| *t == view.tab).unwrap_or(0);
    let tabs = Tabs::new(Tab::ALL.iter().map(|t| t.title()))
        .select(selected)
        .style(Style::default().fg(MUTED))
        .highlight_style(
            Style::default()
                .fg(Color::White)
                .bg(ACCENT)
                .add_modifier(Modifier::BOLD),
        );
    frame.render_widget(tabs, tabs_area);

    let title = Paragraph::new(Line::from(vec![
        Span::styled("gitport ", Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(view.repo_name.to_string(), Style::default().fg(ACCENT)),
    ]))
    .right_aligned();
    frame.render_widget(title, title_area);
}

fn draw_footer(frame: &mut Frame, area: Rect, view: &View<'_>) {
    let line = match (view.status, view.mode) {
        (Some(status), _) => {
            let color = if status.is_error { DANGER } else { Color::Green };
            Line::styled(status.text.clone(), Style::default().fg(color))
        }
        (None, Mode::Normal) => {
            let help = match view.tab {
                Tab::Users => {
                    "[n] new  [d] delete  [p] cycle perm  [t] toggle public  [P] cycle default  [tab] commits  [q] quit"
                }
                Tab::Commits if view.history.diff_focus => {
                    "[up/down] scroll  [pgup/pgdn] page  [esc] back to list  [q] quit"
                }
                Tab::Commits => "[up/down] select  [enter] view diff  [r] refresh  [tab] logs  [q] quit",
                Tab::Logs => "[t] toggle public  [P] cycle default  [tab] users  [q] quit",
            };
            Line::styled(help, Style::default().fg(MUTED))
        }
        (None, _) => Line::default(),
    };
    frame.render_widget(Paragraph::new(line), area);
}

// ---------------------------------------------------------------------------
// Users tab
// ---------------------------------------------------------------------------

fn perm_style(perm: &Permission) -> Style {
    match perm {
        Permission::Admin => Style::default().fg(ACCENT).add_modifier(Modifier::BOLD),
        Permission::Write => Style::default().fg(Color::Green),
        Permission::Read => Style::default().fg(Color::Cyan),
        Permission::None => Style::default().fg(MUTED),
        Permission::Unknown(_) => Style::default().fg(DANGER),
    }
}

fn draw_users(frame: &mut Frame, area: Rect, view: &View<'_>) {
    let [list_area, side_area] =
        Layout::horizontal([Constraint::Percentage(60), Constraint::Percentage(40)]).areas(area);

    let header = Row::new(vec![Cell::from("NAME"), Cell::from("PERM"), Cell::from("KEY")]).style(
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    );

    let rows = view.users.iter().map(|(fp, user)| {
        Row::new(vec![
            Cell::from(user.name.clone()),
            Cell::from(Span::styled(user.perm.as_str(), perm_style(&user.perm))),
            Cell::from(fp.algorithm().to_string()),
        ])
    });

    let table = Table::new(
        rows,
        [
            Constraint::Percentage(50),
            Constraint::Length(6),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .title(format!("Users ({})", view.users.len()))
            .borders(Borders::ALL),
    )
    .row_highlight_style(Style::default().bg(ACCENT).fg(Color::White))
    .highlight_symbol("> ")
    .column_spacing(1);

    let mut state = TableState::default();
    if !view.users.is_empty() {
        state.select(Some(view.selected));
    }
    frame.render_stateful_widget(table, list_area, &mut state);

    let [config_area, detail_area] =
        Layout::vertical([Constraint::Length(6), Constraint::Min(0)]).areas(side_area);

    let label = Style::default().fg(MUTED);
    let value = Style::default().fg(ACCENT).add_modifier(Modifier::BOLD);

    let visibility = if view.config.public { "Public" } else { "Private" };
    let default_perm = view
        .config
        .default_perm
        .as_ref()
        .map(Permission::as_str)
        .unwrap_or("unset");
    let config = Paragraph::new(vec![
        Line::from(Span::styled(visibility, value)),
        Line::from(vec![
            Span::styled("Default permission: ", label),
            Span::styled(default_perm, value),
        ]),
        Line::from(vec![
            Span::styled("Repository: ", label),
            Span::raw(view.repo_name.to_string()),
        ]),
    ])
    .block(Block::default().title("Config").borders(Borders::ALL));
    frame.render_widget(config, config_area);

    let detail = match view.users.get(view.selected) {
        Some((fp, user)) => vec![
            Line::from(Span::styled(
                user.name.clone(),
                Style::default().add_modifier(Modifier::BOLD),
            )),
            Line::from(vec![
                Span::styled("Permission: ", label),
                Span::styled(user.perm.as_str(), perm_style(&user.perm)),
            ]),
            Line::from(vec![
                Span::styled("Type: ", label),
                Span::raw(fp.algorithm().to_string()),
            ]),
            Line::from(Span::styled("Fingerprint:", label)),
            Line::from(fp.sha256()),
        ],
        None => vec![Line::from(Span::styled("No users yet. Press n to add one.", label))],
    };
    let detail = Paragraph::new(detail)
        .wrap(ratatui::widgets::Wrap { trim: false })
        .block(Block::default().title("Selected").borders(Borders::ALL));
    frame.render_widget(detail, detail_area);
}

// ---------------------------------------------------------------------------
// Commits tab
// ---------------------------------------------------------------------------

fn diff_line(line: &str) -> Line<'_> {
    let style = if line.starts_with("@@") {
        Style::default().fg(Color::Cyan)
    } else if line.starts_with("diff ") || line.starts_with("+++") || line.starts_with("---") {
        Style::default().add_modifier(Modifier::BOLD)
    } else if line.starts_with('+') {
        Style::default().fg(ADDED)
    } else if line.starts_with('-') {
        Style::default().fg(DANGER)
    } else {
        Style::default().fg(MUTED)
    };
    Line::styled(line, style)
}

fn focus_border(focused: bool) -> Style {
    Style::default().fg(if focused { ACCENT } else { MUTED })
}

fn draw_commits(frame: &mut Frame, area: Rect, history: &History) {
    let [list_area, diff_area] =
        Layout::horizontal([Constraint::Percentage(40), Constraint::Percentage(60)]).areas(area);

    let list_block = Block::default()
        .title(format!("Commits ({})", history.commits.len()))
        .borders(Borders::ALL)
        .border_style(focus_border(!history.diff_focus));

    let label = Style::default().fg(MUTED);
    if let Some(error) = &history.error {
        let text = Paragraph::new(Line::styled(error.clone(), Style::default().fg(DANGER)))
            .wrap(ratatui::widgets::Wrap { trim: false })
            .block(list_block);
        frame.render_widget(text, list_area);
    } else if history.commits.is_empty() {
        let text = Paragraph::new(Line::styled("No commits yet.", label)).block(list_block);
        frame.render_widget(text, list_area);
    } else {
        let items = history.commits.iter().map(|commit| {
            ListItem::new(vec![
                Line::from(vec![
                    Span::styled(
                        commit.short_hash().to_string(),
                        Style::default().fg(Color::Yellow),
                    ),
                    Span::raw(" "),
                    Span::raw(commit.subject().to_string()),
                ]),
                Line::styled(
                    format!("        {}, authored {}", commit.author, commit.date),
                    label,
                ),
            ])
        });
        let highlight = if history.diff_focus {
            Style::default().add_modifier(Modifier::BOLD)
        } else {
            Style::default().bg(ACCENT).fg(Color::White)
        };
        let list = List::new(items)
            .block(list_block)
            .highlight_style(highlight)
            .highlight_symbol("> ");
        let mut state = ListState::default();
        state.select(Some(history.selected));
        frame.render_stateful_widget(list, list_area, &mut state);
    }

    let selected = history.commits.get(history.selected);
    let diff = history
        .diff
        .as_ref()
        .filter(|d| selected.is_some_and(|c| c.hash == d.hash));

    let diff_block = Block::default()
        .title(match selected {
            Some(commit) => format!("Diff {}", commit.short_hash()),
            None => "Diff".to_string(),
        })
        .borders(Borders::ALL)
        .border_style(focus_border(history.diff_focus));

    let body = match (diff, selected) {
        (Some(diff), _) => Paragraph::new(diff.text.lines().map(diff_line).collect::<Vec<_>>())
            .scroll((history.scroll, 0)),
        (None, Some(_)) => Paragraph::new(Line::styled("Press enter to view the diff.", label)),
        (None, None) => Paragraph::new(Line::default()),
    };
    frame.render_widget(body.block(diff_block), diff_area);
}

// ---------------------------------------------------------------------------
// Logs tab
// ---------------------------------------------------------------------------

fn draw_logs(frame: &mut Frame, area: Rect, logs: &[LogEntry]) {
    // Borders plus the header row.
    let visible = area.height.saturating_sub(3) as usize;
    let start = logs.len().saturating_sub(visible);

    let rows = logs[start..].iter().map(|entry| {
        let level_style = match entry.level.as_str() {
            "ERROR" => Style::default().fg(DANGER).add_modifier(Modifier::BOLD),
            "WARN" => Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
            _ => Style::default().fg(MUTED),
        };
        let message = if entry.detail.is_empty() {
            entry.message.clone()
        } else {
            format!("{}  {}", entry.message, entry.detail)
        };
        Row::new(vec![
            Cell::from(Span::styled(entry.level.clone(), level_style)),
            Cell::from(Span::styled(entry.timestamp.clone(), Style::default().fg(MUTED))),
            Cell::from(message),
        ])
    });

    let header = Row::new(vec![Cell::from("LEVEL"), Cell::from("TIME"), Cell::from("MESSAGE")])
        .style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        );

    let table = Table::new(
        rows,
        [
            Constraint::Length(6),
            Constraint::Length(20),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(Block::default().title("Logs").borders(Borders::ALL))
    .column_spacing(1);

    frame.render_widget(table, area);
}

// ---------------------------------------------------------------------------
// Dialogs
// ---------------------------------------------------------------------------

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let w = width.min(area.width);
    let h = height.min(area.height);
    Rect::new(
        area.x + (area.width - w) / 2,
        area.y + (area.height - h) / 2,
        w,
        h,
    )
}

/// Last `width` characters of `text` with a cursor when focused.
fn input_line(text: &str, focused: bool, width: u16) -> Line<'static> {
    let width = width.saturating_sub(1) as usize;
    let count = text.chars().count();
    let shown: String = text.chars().skip(count.saturating_sub(width)).collect();
    let style = if focused {
        Style::default().fg(Color::White).add_modifier(Modifier::BOLD)
    } else {
        Style::default().fg(MUTED)
    };
    let mut spans = vec![Span::styled(shown, style)];
    if focused {
        spans.push(Span::styled("_", Style::default().fg(ACCENT)));
    }
    Line::from(spans)
}

fn draw_create_form(frame: &mut Frame, area: Rect, form: &CreateForm) {
    let popup = centered(area, 64, 14);
    let inner_width = popup.width.saturating_sub(4);
    let label = Style::default().fg(MUTED);

    let text = vec![
        Line::from(Span::styled("Username:", label)),
        input_line(&form.name, form.focus == Field::Name, inner_width),
        Line::default(),
        Line::from(Span::styled("SSH Public Key:", label)),
        input_line(&form.key, form.focus == Field::Key, inner_width),
        Line::default(),
        Line::from(Span::styled("Permission:", label)),
        Line::from(Span::styled(form.perm.as_str(), perm_style(&form.perm))),
        Line::default(),
        Line::from(Span::styled(
            "[up/down] field  [tab] cycle perm  [enter] create/next  [esc] cancel",
            label,
        )),
    ];

    let block = Block::default()
        .title("Create New User")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(ACCENT));
    frame.render_widget(Clear, popup);
    frame.render_widget(
        Paragraph::new(text).block(block.padding(ratatui::widgets::Padding::horizontal(1))),
        popup,
    );
}

fn draw_delete_confirm(frame: &mut Frame, area: Rect, name: &str) {
    let popup = centered(area, 50, 7);
    let text = vec![
        Line::from(vec![
            Span::styled("User: ", Style::default().fg(MUTED)),
            Span::styled(name.to_string(), Style::default().add_modifier(Modifier::BOLD)),
        ]),
        Line::default(),
        Line::from(Span::styled(
            "[d] delete  [esc] cancel",
            Style::default().fg(MUTED),
        )),
    ];
    let block = Block::default()
        .title(Span::styled(
            "Delete User?",
            Style::default().fg(DANGER).add_modifier(Modifier::BOLD),
        ))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(DANGER))
        .padding(ratatui::widgets::Padding::horizontal(1));
    frame.render_widget(Clear, popup);
    frame.render_widget(Paragraph::new(text).block(block), popup);
}

#[cfg(test)]
mod tests {
    use ratatui::backend::TestBackend;

    use super::*;
    use crate::auth::fingerprint::tests::ed25519_blob;
    use crate::auth::Fingerprint;
    use crate::config::GlobalConfig;
    use crate::console::{Diff, Status};
    use crate::git::Commit;
    use crate::registry::User;

    static NO_HISTORY: History = History {
        commits: Vec::new(),
        selected: 0,
        diff: None,
        diff_focus: false,
        scroll: 0,
        error: None,
        pending: None,
    };

    fn users() -> Vec<(Fingerprint, User)> {
        vec![
            (
                Fingerprint::from_key_blob(&ed25519_blob(1)).unwrap(),
                User::new("alice", Permission::Admin),
            ),
            (
                Fingerprint::from_key_blob(&ed25519_blob(2)).unwrap(),
                User::new("bob@10.0.0.9:1", Permission::Read),
            ),
        ]
    }

    fn view<'a>(tab: Tab, mode: &'a Mode, status: Option<&'a Status>) -> View<'a> {
        View {
            repo_name: "widgets.git",
            tab,
            mode,
            users: users(),
            selected: 1,
            config: GlobalConfig {
                public: true,
                default_perm: Some(Permission::Read),
            },
            logs: vec![LogEntry {
                timestamp: "2026-03-01 10:00:00".into(),
                level: "WARN".into(),
                message: "unauthorized key tried to connect".into(),
                detail: String::new(),
            }],
            history: &NO_HISTORY,
            status,
        }
    }

    fn screen_text(view: &View<'_>) -> String {
        let mut terminal = Terminal::new(TestBackend::new(100, 30)).unwrap();
        terminal.draw(|f| draw(f, view)).unwrap();
        terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|c| c.symbol())
            .collect()
    }

    #[test]
    fn users_tab_shows_users_and_config() {
        let text = screen_text(&view(Tab::Users, &Mode::Normal, None));
        assert!(text.contains("alice"));
        assert!(text.contains("bob@10.0.0.9:1"));
        assert!(text.contains("Public"));
        assert!(text.contains("Default permission: read"));
        assert!(text.contains("SHA256:"));
    }

    #[test]
    fn logs_tab_shows_entries() {
        let text = screen_text(&view(Tab::Logs, &Mode::Normal, None));
        assert!(text.contains("unauthorized key tried to connect"));
        assert!(!text.contains("alice"));
    }

    fn history() -> History {
        let commit = |hash: &str, message: &str| Commit {
            hash: hash.into(),
            author: "Ada".into(),
            date: "Mar 01, 2026".into(),
            message: message.into(),
        };
        History {
            commits: vec![
                commit("a1b2c3d4e5f6a7b8", "Add parser\n\nLonger body."),
                commit("0f0f0f0f0f0f0f0f", "Initial commit"),
            ],
            selected: 0,
            diff: Some(Diff {
                hash: "a1b2c3d4e5f6a7b8".into(),
                text: "diff --git a/src/lib.rs b/src/lib.rs\n@@ -1,2 +1,2 @@\n-old line\n+new line\n context"
                    .into(),
            }),
            diff_focus: true,
            ..History::default()
        }
    }

    #[test]
    fn commits_tab_shows_list_and_diff() {
        let h = history();
        let text = screen_text(&View {
            history: &h,
            ..view(Tab::Commits, &Mode::Normal, None)
        });
        assert!(text.contains("a1b2c3d Add parser"));
        assert!(text.contains("Ada, authored Mar 01, 2026"));
        assert!(!text.contains("Longer body."));
        assert!(text.contains("Diff a1b2c3d"));
        assert!(text.contains("+new line"));
        assert!(text.contains("[esc] back to list"));
        assert!(!text.contains("alice"));
    }

    #[test]
    fn diff_pane_scrolls_and_follows_selection() {
        let mut h = history();
        h.scroll = 2;
        let text = screen_text(&View {
            history: &h,
            ..view(Tab::Commits, &Mode::Normal, None)
        });
        assert!(!text.contains("diff --git"));
        assert!(text.contains("+new line"));

        h.selected = 1;
        h.diff_focus = false;
        let text = screen_text(&View {
            history: &h,
            ..view(Tab::Commits, &Mode::Normal, None)
        });
        assert!(text.contains("Press enter to view the diff."));
        assert!(!text.contains("+new line"));
    }

    #[test]
    fn commits_tab_reports_errors_and_empty_repo() {
        let text = screen_text(&view(Tab::Commits, &Mode::Normal, None));
        assert!(text.contains("No commits yet."));

        let h = History {
            error: Some("could not read commit history: boom".into()),
            ..History::default()
        };
        let text = screen_text(&View {
            history: &h,
            ..view(Tab::Commits, &Mode::Normal, None)
        });
        assert!(text.contains("boom"));
    }

    #[test]
    fn diff_lines_are_colored_by_kind() {
        assert_eq!(diff_line("+x").style.fg, Some(ADDED));
        assert_eq!(diff_line("-x").style.fg, Some(DANGER));
        assert_eq!(diff_line("@@ -1 +1 @@").style.fg, Some(Color::Cyan));
        assert_eq!(diff_line(" x").style.fg, Some(MUTED));
        assert_eq!(diff_line("+++ b/x").style.fg, None);
    }

    #[test]
    fn dialogs_and_status() {
        let deleting = Mode::Deleting {
            fingerprint: users()[1].0.clone(),
            name: "bob@10.0.0.9:1".into(),
        };
        assert!(screen_text(&view(Tab::Users, &deleting, None)).contains("Delete User?"));

        let creating = Mode::Creating(CreateForm::default());
        let status = Status {
            text: "invalid key: bad base64".into(),
            is_error: true,
        };
        let text = screen_text(&view(Tab::Users, &creating, Some(&status)));
        assert!(text.contains("Create New User"));
        assert!(text.contains("invalid key: bad base64"));
    }

    #[test]
    fn screen_emits_bytes() {
        let mut screen = Screen::new(0, 0).unwrap();
        let enter = screen.enter().unwrap();
        assert!(enter.windows(8).any(|w| w == b"\x1b[?1049h"));

        let frame = screen.draw(&view(Tab::Users, &Mode::Normal, None)).unwrap();
        assert!(frame.windows(11).any(|w| w == b"widgets.git"));

        screen.resize(120, 40).unwrap();
        assert!(!screen.draw(&view(Tab::Users, &Mode::Normal, None)).unwrap().is_empty());
        assert!(screen.leave().unwrap().windows(8).any(|w| w == b"\x1b[?1049l"));
    }
}
