//! Watches `users.json` and `config.json` for edits made outside this
//! process and hands them to a [`Reconcile`] implementation.
//!
//! The state directory is watched rather than the files themselves, so the
//! watch survives editors and our own store replacing the files by rename.
//! Events for a path the store has just written are dropped while its
//! [`SelfWrites`] mark is live.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::SelfWrites;

/// Quiet period used to coalesce the burst of events a single save produces.
const DEBOUNCE: Duration = Duration::from_millis(50);
/// Delay between checks for a removed file to reappear.
const RECHECK_DELAY: Duration = Duration::from_millis(100);
const RECHECK_ATTEMPTS: u32 = 10;

/// Which backing file changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchedFile {
    Users,
    Config,
}

/// Receiver of reconciliation requests.  Implementations replace their
/// in-memory state with the file's current contents.
pub trait Reconcile: Send + Sync + 'static {
    fn reconcile(&self, file: WatchedFile) -> Result<()>;
}

/// The two files being watched.  Both must live in the same directory.
#[derive(Debug, Clone)]
pub struct WatchTargets {
    pub users: PathBuf,
    pub config: PathBuf,
}

impl WatchTargets {
    fn classify(&self, path: &Path) -> Option<(WatchedFile, &Path)> {
        let name = path.file_name()?;
        if Some(name) == self.users.file_name() {
            Some((WatchedFile::Users, &self.users))
        } else if Some(name) == self.config.file_name() {
            Some((WatchedFile::Config, &self.config))
        } else {
            None
        }
    }

    fn dir(&self) -> &Path {
        self.users.parent().unwrap_or_else(|| Path::new("."))
    }
}

/// What an OS event means for a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    Written,
    Removed,
    Ignored,
}

fn change_kind(kind: &EventKind) -> Change {
    match kind {
        EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            Change::Removed
        }
        EventKind::Create(_) | EventKind::Modify(_) => Change::Written,
        _ => Change::Ignored,
    }
}

/// Files with a pending write event, collected over one debounce window.
#[derive(Debug, Default)]
struct Pending {
    users: bool,
    config: bool,
}

impl Pending {
    fn mark(&mut self, file: WatchedFile) {
        match file {
            WatchedFile::Users => self.users = true,
            WatchedFile::Config => self.config = true,
        }
    }

    fn drain(&mut self) -> Vec<WatchedFile> {
        let mut out = Vec::new();
        if std::mem::take(&mut self.users) {
            out.push(WatchedFile::Users);
        }
        if std::mem::take(&mut self.config) {
            out.push(WatchedFile::Config);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

/// Running watch.  Call [`FileWatcher::stop`] before exit to release the OS
/// handle.
pub struct FileWatcher {
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
}

impl FileWatcher {
    /// Start watching `targets` on a background task.  Must be called from
    /// within a Tokio runtime.
    pub fn start(
        targets: WatchTargets,
        self_writes: Arc<SelfWrites>,
        sink: Arc<dyn Reconcile>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // The receiver is gone only during shutdown.
            let _ = tx.send(res);
        })
        .context("failed to create file watcher")?;

        let dir = targets.dir().to_path_buf();
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;
        info!(dir = %dir.display(), "started watching state files");

        let task = tokio::spawn(run_event_loop(rx, targets, self_writes, sink));

        Ok(Self {
            watcher: Some(watcher),
            task: Some(task),
        })
    }

    /// Release the OS watch and wait for the event loop to drain.
    pub async fn stop(mut self) {
        // Dropping the watcher drops its event handler and with it the
        // channel sender, which ends the loop.
        drop(self.watcher.take());
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                warn!("file watcher loop did not stop in time, aborting");
                task.abort();
            }
        }
        info!("file watcher stopped");
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_event_loop(
    mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    targets: WatchTargets,
    self_writes: Arc<SelfWrites>,
    sink: Arc<dyn Reconcile>,
) {
    let mut pending = Pending::default();

    while let Some(first) = rx.recv().await {
        absorb(first, &targets, &self_writes, &sink, &mut pending);

        let mut closed = false;
        loop {
            match tokio::time::timeout(DEBOUNCE, rx.recv()).await {
                Ok(Some(next)) => absorb(next, &targets, &self_writes, &sink, &mut pending),
                Ok(None) => {
                    closed = true;
                    break;
                }
                Err(_) => break,
            }
        }

        for file in pending.drain() {
            dispatch(Arc::clone(&sink), file).await;
        }

        if closed {
            break;
        }
    }

    debug!("file watcher event loop finished");
}

/// Fold one OS event into `pending`, dropping self-writes and scheduling
/// re-checks for removed files.
fn absorb(
    res: notify::Result<Event>,
    targets: &WatchTargets,
    self_writes: &SelfWrites,
    sink: &Arc<dyn Reconcile>,
    pending: &mut Pending,
) {
    let event = match res {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, "file watcher error");
            return;
        }
    };

    let change = change_kind(&event.kind);
    if change == Change::Ignored {
        return;
    }

    for path in &event.paths {
        let Some((file, canonical)) = targets.classify(path) else {
            continue;
        };

        match change {
            Change::Written => {
                if self_writes.is_suppressed(canonical) {
                    debug!(file = ?file, "ignoring event from our own write");
                    continue;
                }
                info!(file = ?file, path = %path.display(), "file modified externally");
                pending.mark(file);
            }
            Change::Removed => {
                if self_writes.is_suppressed(canonical) {
                    continue;
                }
                warn!(file = ?file, path = %path.display(), "file removed or renamed");
                tokio::spawn(recheck_removed(
                    canonical.to_path_buf(),
                    file,
                    Arc::clone(sink),
                ));
            }
            Change::Ignored => {}
        }
    }
}

/// Wait for a removed file to come back, then reconcile once.
async fn recheck_removed(path: PathBuf, file: WatchedFile, sink: Arc<dyn Reconcile>) {
    for _ in 0..RECHECK_ATTEMPTS {
        tokio::time::sleep(RECHECK_DELAY).await;
        if path.exists() {
            info!(file = ?file, "watched file reappeared");
            dispatch(sink, file).await;
            return;
        }
    }
    warn!(
        file = ?file,
        path = %path.display(),
        "watched file has not reappeared; keeping in-memory state"
    );
}

async fn dispatch(sink: Arc<dyn Reconcile>, file: WatchedFile) {
    let result = tokio::task::spawn_blocking(move || sink.reconcile(file)).await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(file = ?file, error = %e, "failed to reload file"),
        Err(e) => error!(file = ?file, error = %e, "reload task panicked"),
    }
}
