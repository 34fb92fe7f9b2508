//! JSON persistence for `users.json` and `config.json`.
//!
//! Saves go through a temp file in the same directory followed by a rename,
//! so a concurrent reader (including the file watcher's reload) never sees a
//! half-written file.  Each save first marks its path in [`SelfWrites`] so the
//! watcher can drop the events caused by our own write.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

/// How long events for a freshly saved path are attributed to our own write.
pub const SELF_WRITE_WINDOW: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Self-write suppression
// ---------------------------------------------------------------------------

/// Deadlines until which filesystem events for a path are ignored.
#[derive(Debug, Default)]
pub struct SelfWrites {
    until: Mutex<HashMap<PathBuf, Instant>>,
}

impl SelfWrites {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ignore events for `path` for the next `window`.
    pub fn suppress(&self, path: &Path, window: Duration) {
        let deadline = Instant::now() + window;
        if let Ok(mut until) = self.until.lock() {
            until.insert(path.to_path_buf(), deadline);
        }
    }

    /// Whether an event for `path` observed now should be ignored.  Expired
    /// marks are dropped on the way.
    pub fn is_suppressed(&self, path: &Path) -> bool {
        let Ok(mut until) = self.until.lock() else {
            return false;
        };
        match until.get(path) {
            Some(deadline) if Instant::now() < *deadline => true,
            Some(_) => {
                until.remove(path);
                false
            }
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Loads and saves JSON documents, coordinating with the file watcher.
#[derive(Debug, Clone)]
pub struct JsonStore {
    self_writes: Arc<SelfWrites>,
    window: Duration,
}

impl JsonStore {
    pub fn new(self_writes: Arc<SelfWrites>) -> Self {
        Self {
            self_writes,
            window: SELF_WRITE_WINDOW,
        }
    }

    /// Load `path`, returning `T::default()` when the file does not exist.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load<T>(&self, path: &Path) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("file not found, starting empty");
                return Ok(T::default());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Serialize `value` as indented JSON and replace `path` with it.
    #[instrument(skip(self, value), fields(path = %path.display()))]
    pub fn save<T>(&self, path: &Path, value: &T) -> Result<(), StoreError>
    where
        T: Serialize + ?Sized,
    {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut body = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        body.push(b'\n');

        self.self_writes.suppress(path, self.window);

        let tmp = temp_path(path);
        let result = (|| {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            std::fs::rename(&tmp, path)
        })();

        if let Err(source) = result {
            error!(error = %source, "failed to write JSON file");
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(source));
        }

        debug!(bytes = body.len(), "JSON file written");
        Ok(())
    }
}

/// `dir/.name.tmp` next to `path`, so the rename stays on one filesystem.
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}
