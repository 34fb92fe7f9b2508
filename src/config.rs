use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{error, info};

use crate::auth::permission::Permission;
use crate::store::{JsonStore, StoreError};

// ---------------------------------------------------------------------------
// File layout
// ---------------------------------------------------------------------------

pub const USERS_FILE: &str = "users.json";
pub const CONFIG_FILE: &str = "config.json";
pub const LOG_FILE: &str = "logs.jsonl";
/// Name of the per-repository state directory inside the bare repo.
pub const STATE_DIR: &str = ".gitport";

/// Locations of everything gitport keeps on disk for one served repository.
#[derive(Debug, Clone)]
pub struct StatePaths {
    /// Directory holding all served bare repos (`<config_dir>/gitport`).
    pub base_dir: PathBuf,
    /// Bare repository name, always ending in `.git`.
    pub repo_name: String,
    /// `<base_dir>/<repo_name>`.
    pub bare_repo: PathBuf,
    /// `<bare_repo>/.gitport`.
    pub state_dir: PathBuf,
}

impl StatePaths {
    /// Paths for serving the working tree at `worktree`, rooted under the
    /// user's config directory.
    pub fn for_worktree(worktree: &Path) -> Result<Self> {
        let config_dir = dirs::config_dir().context("could not determine user config directory")?;
        Self::with_base(config_dir.join("gitport"), worktree)
    }

    pub fn with_base(base_dir: PathBuf, worktree: &Path) -> Result<Self> {
        let stem = worktree
            .file_name()
            .with_context(|| format!("cannot derive repository name from {}", worktree.display()))?
            .to_string_lossy();
        let repo_name = format!("{stem}.git");
        let bare_repo = base_dir.join(&repo_name);
        let state_dir = bare_repo.join(STATE_DIR);
        Ok(Self {
            base_dir,
            repo_name,
            bare_repo,
            state_dir,
        })
    }

    pub fn users_file(&self) -> PathBuf {
        self.state_dir.join(USERS_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join(LOG_FILE)
    }

    pub fn host_key(&self) -> PathBuf {
        self.state_dir.join("ssh").join("host_ed25519")
    }
}

// ---------------------------------------------------------------------------
// Global config
// ---------------------------------------------------------------------------

/// Server-wide admission policy, persisted as `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Whether unknown keys are registered as guests on first contact.
    pub public: bool,
    /// Permission given to auto-registered guests.  `None` when the field is
    /// absent, `null` or empty.
    #[serde(
        default,
        deserialize_with = "deserialize_default_perm",
        serialize_with = "serialize_default_perm"
    )]
    pub default_perm: Option<Permission>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            public: false,
            default_perm: Some(Permission::None),
        }
    }
}

impl GlobalConfig {
    /// Permission for a new guest.  A missing or unrecognized value falls
    /// back to `none`.
    pub fn guest_permission(&self) -> Permission {
        match &self.default_perm {
            Some(p) if p.is_known() => p.clone(),
            Some(p) => {
                error!(file = CONFIG_FILE, value = %p, "unrecognized default permission, using none");
                Permission::None
            }
            None => {
                error!(file = CONFIG_FILE, "no default permission configured, using none");
                Permission::None
            }
        }
    }
}

fn deserialize_default_perm<'de, D>(d: D) -> Result<Option<Permission>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw.filter(|s| !s.is_empty()).map(Permission::from))
}

fn serialize_default_perm<S>(value: &Option<Permission>, s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.serialize_str(value.as_ref().map(Permission::as_str).unwrap_or(""))
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Lock-guarded, disk-backed [`GlobalConfig`].
#[derive(Debug)]
pub struct ConfigHandle {
    path: PathBuf,
    store: JsonStore,
    inner: RwLock<GlobalConfig>,
}

impl ConfigHandle {
    /// Load from `path`.  A missing file yields the private default; a
    /// malformed one is an error.
    pub fn load(path: PathBuf, store: JsonStore) -> Result<Self, StoreError> {
        let config: GlobalConfig = store.load(&path)?;
        info!(
            public = config.public,
            default_perm = ?config.default_perm,
            "config loaded"
        );
        Ok(Self {
            path,
            store,
            inner: RwLock::new(config),
        })
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn get(&self) -> GlobalConfig {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_public(&self) -> bool {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).public
    }

    /// Apply `f` and persist while holding the write lock.  The in-memory value
    /// is kept even when the write fails.
    pub fn update<F>(&self, f: F) -> Result<GlobalConfig, StoreError>
    where
        F: FnOnce(&mut GlobalConfig),
    {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
        let snapshot = guard.clone();
        self.store.save(&self.path, &snapshot)?;
        drop(guard);
        info!(
            public = snapshot.public,
            default_perm = ?snapshot.default_perm,
            "config updated"
        );
        Ok(snapshot)
    }

    pub fn set(&self, config: GlobalConfig) -> Result<(), StoreError> {
        self.update(|c| *c = config).map(|_| ())
    }

    /// Re-read the file and replace the in-memory value wholesale.  The file
    /// is read under the write lock so an `update` cannot land between the
    /// read and the swap; a parse failure leaves the current value untouched.
    pub fn reload(&self) -> Result<(), StoreError> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let fresh: GlobalConfig = self.store.load(&self.path)?;
        *guard = fresh.clone();
        drop(guard);
        info!(
            public = fresh.public,
            default_perm = ?fresh.default_perm,
            "config refreshed from disk"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::SelfWrites;

    fn store() -> JsonStore {
        JsonStore::new(Arc::new(SelfWrites::new()))
    }

    #[test]
    fn parses_config_file_layout() {
        let c: GlobalConfig =
            serde_json::from_str(r#"{"public": true, "default_perm": "read"}"#).unwrap();
        assert!(c.public);
        assert_eq!(c.default_perm, Some(Permission::Read));
    }

    #[test]
    fn empty_default_perm_is_unset() {
        let c: GlobalConfig = serde_json::from_str(r#"{"public": true, "default_perm": ""}"#).unwrap();
        assert_eq!(c.default_perm, None);
        assert_eq!(c.guest_permission(), Permission::None);

        let c: GlobalConfig = serde_json::from_str(r#"{"public": true}"#).unwrap();
        assert_eq!(c.default_perm, None);
    }

    #[test]
    fn missing_public_is_an_error() {
        assert!(serde_json::from_str::<GlobalConfig>(r#"{"default_perm": "read"}"#).is_err());
    }

    #[test]
    fn garbage_default_perm_fails_closed() {
        let c: GlobalConfig =
            serde_json::from_str(r#"{"public": true, "default_perm": "owner"}"#).unwrap();
        assert_eq!(c.guest_permission(), Permission::None);
    }

    #[test]
    fn state_paths_layout() {
        let paths = StatePaths::with_base(PathBuf::from("/cfg/gitport"), Path::new("/src/widgets"))
            .unwrap();
        assert_eq!(paths.repo_name, "widgets.git");
        assert_eq!(paths.bare_repo, PathBuf::from("/cfg/gitport/widgets.git"));
        assert_eq!(
            paths.users_file(),
            PathBuf::from("/cfg/gitport/widgets.git/.gitport/users.json")
        );
        assert_eq!(
            paths.config_file(),
            PathBuf::from("/cfg/gitport/widgets.git/.gitport/config.json")
        );
    }

    #[test]
    fn handle_missing_file_is_private() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = ConfigHandle::load(tmp.path().join(CONFIG_FILE), store()).unwrap();
        assert!(!handle.is_public());
        assert!(!handle.exists());
    }

    #[test]
    fn update_persists_and_reload_replaces() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        let handle = ConfigHandle::load(path.clone(), store()).unwrap();

        handle.update(|c| c.public = true).unwrap();
        let on_disk: GlobalConfig =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(on_disk.public);

        std::fs::write(&path, r#"{"public": false, "default_perm": "write"}"#).unwrap();
        handle.reload().unwrap();
        let c = handle.get();
        assert!(!c.public);
        assert_eq!(c.default_perm, Some(Permission::Write));
    }

    #[test]
    fn unknown_default_perm_survives_unrelated_update() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"public": false, "default_perm": "owner"}"#).unwrap();
        let handle = ConfigHandle::load(path.clone(), store()).unwrap();

        handle.update(|c| c.public = true).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains(r#""default_perm": "owner""#), "{text}");
        assert_eq!(handle.get().guest_permission(), Permission::None);
    }

    #[test]
    fn reload_of_malformed_file_keeps_value() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        let handle = ConfigHandle::load(path.clone(), store()).unwrap();
        handle.update(|c| c.public = true).unwrap();

        std::fs::write(&path, "{ nope").unwrap();
        assert!(handle.reload().is_err());
        assert!(handle.is_public());
        handle.update(|c| c.public = false).unwrap();
        assert!(!handle.is_public());
    }

    #[test]
    fn failed_save_keeps_memory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing").join(CONFIG_FILE);
        let handle = ConfigHandle::load(path, store()).unwrap();
        assert!(handle.update(|c| c.public = true).is_err());
        assert!(handle.is_public());
    }
}
