//! In-memory user registry mirrored to `users.json`.
//!
//! Every read and write goes through one [`RwLock`].  Mutations persist the
//! whole map while still holding the write lock, so the file on disk always
//! reflects a state that was visible in memory and concurrent writers are
//! totally ordered by lock acquisition.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::auth::fingerprint::Fingerprint;
use crate::auth::permission::Permission;
use crate::store::{JsonStore, StoreError};

/// Display name given to the key registered by [`UserRegistry::ensure_host_admin`].
pub const HOST_ADMIN_NAME: &str = "host (admin)";

/// Local public keys tried for the bootstrap admin, in priority order.
const HOST_KEY_FILES: [&str; 3] = ["id_ed25519.pub", "id_rsa.pub", "id_ecdsa.pub"];

/// A registered key's record as stored in `users.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    pub perm: Permission,
}

impl User {
    pub fn new(name: impl Into<String>, perm: Permission) -> Self {
        Self {
            name: name.into(),
            perm,
        }
    }
}

/// Full registry contents, ordered by fingerprint so saves are stable.
pub type Users = BTreeMap<Fingerprint, User>;

/// Outcome of [`UserRegistry::register_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created,
    /// Another connection registered the key first; nothing was written.
    Existing(User),
}

#[derive(Debug)]
pub struct UserRegistry {
    path: PathBuf,
    store: JsonStore,
    users: RwLock<Users>,
}

impl UserRegistry {
    /// Load the registry from `path`.  A missing file yields an empty
    /// registry; malformed JSON is an error.
    pub fn load(path: PathBuf, store: JsonStore) -> Result<Self, StoreError> {
        let users: Users = store.load(&path)?;
        info!(count = users.len(), file = %path.display(), "users loaded");
        Ok(Self {
            path,
            store,
            users: RwLock::new(users),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Users> {
        self.users.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Users> {
        self.users.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, users: &Users) -> Result<(), StoreError> {
        self.store.save(&self.path, users)
    }

    // -- Reads ------------------------------------------------------------

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<User> {
        self.read().get(fingerprint).cloned()
    }

    /// Owned snapshot of the whole registry.
    pub fn get_all(&self) -> Users {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn has_admin(&self) -> bool {
        self.read().values().any(|u| u.perm == Permission::Admin)
    }

    // -- Writes -----------------------------------------------------------

    /// Insert or overwrite `fingerprint` and persist.  On a failed write the
    /// in-memory change is kept and the error returned.
    #[instrument(skip(self, fingerprint, user), fields(name = %user.name, perm = %user.perm))]
    pub fn upsert(&self, fingerprint: Fingerprint, user: User) -> Result<(), StoreError> {
        let mut users = self.write();
        users.insert(fingerprint, user);
        self.persist(&users)
    }

    /// Remove `fingerprint` and persist.  Returns the removed record; a
    /// missing key is a no-op and does not touch the file.
    #[instrument(skip(self, fingerprint), fields(key = %fingerprint.sha256()))]
    pub fn delete(&self, fingerprint: &Fingerprint) -> Result<Option<User>, StoreError> {
        let mut users = self.write();
        let Some(removed) = users.remove(fingerprint) else {
            debug!("delete of unknown key ignored");
            return Ok(None);
        };
        self.persist(&users)?;
        Ok(Some(removed))
    }

    /// Insert `user` only if `fingerprint` is not registered yet.  The check
    /// and the insert happen under one write lock, so simultaneous first
    /// contacts from the same key produce a single entry and a single save.
    pub fn register_if_absent(
        &self,
        fingerprint: Fingerprint,
        user: User,
    ) -> Result<Registration, StoreError> {
        let mut users = self.write();
        if let Some(existing) = users.get(&fingerprint) {
            return Ok(Registration::Existing(existing.clone()));
        }
        users.insert(fingerprint, user);
        self.persist(&users)?;
        Ok(Registration::Created)
    }

    /// Advance a user's permission one step along
    /// `none → read → write → admin → none`.  Returns the new value, or
    /// `None` if the key is not registered.
    pub fn cycle_permission(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Option<Permission>, StoreError> {
        let mut users = self.write();
        let Some(user) = users.get_mut(fingerprint) else {
            return Ok(None);
        };
        user.perm = user.perm.next();
        let perm = user.perm.clone();
        self.persist(&users)?;
        Ok(Some(perm))
    }

    /// Replace the whole map.  Used by reconciliation only; nothing is
    /// written back to disk.
    pub fn replace_all(&self, users: Users) {
        *self.write() = users;
    }

    /// Re-read `users.json` and replace the in-memory map with it.  The file
    /// is read under the write lock, so a concurrent mutation either lands
    /// before the read (and is in the file) or after the swap.  A parse
    /// failure leaves the current state untouched.
    pub fn reload(&self) -> Result<usize, StoreError> {
        let mut users = self.write();
        let fresh: Users = self.store.load(&self.path)?;
        let count = fresh.len();
        *users = fresh;
        drop(users);
        info!(count, "users refreshed from disk");
        Ok(count)
    }

    // -- Bootstrap --------------------------------------------------------

    /// Make sure at least one admin exists by registering the local user's
    /// SSH public key found under `home/.ssh`.
    ///
    /// Returns the key file used, or `None` when an admin already exists or
    /// no usable key was found.  Only a failed save is an error.
    pub fn ensure_host_admin(&self, home: &Path) -> Result<Option<PathBuf>, StoreError> {
        if self.has_admin() {
            debug!("admin already present, skipping host bootstrap");
            return Ok(None);
        }

        let ssh_dir = home.join(".ssh");
        let found = HOST_KEY_FILES.iter().find_map(|name| {
            let path = ssh_dir.join(name);
            std::fs::read_to_string(&path).ok().map(|text| (path, text))
        });

        let Some((key_path, text)) = found else {
            warn!(
                dir = %ssh_dir.display(),
                "no SSH public key found; add an admin key to users.json manually"
            );
            return Ok(None);
        };

        let fingerprint = match Fingerprint::parse_openssh(text.trim()) {
            Ok(fp) => fp,
            Err(e) => {
                warn!(key_file = %key_path.display(), error = %e, "invalid SSH public key format");
                return Ok(None);
            }
        };

        self.upsert(fingerprint, User::new(HOST_ADMIN_NAME, Permission::Admin))?;
        info!(key_file = %key_path.display(), "host added as admin");
        Ok(Some(key_path))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::fingerprint::tests::{ed25519_blob, ed25519_line};
    use crate::store::SelfWrites;

    fn fp(seed: u8) -> Fingerprint {
        Fingerprint::from_key_blob(&ed25519_blob(seed)).unwrap()
    }

    fn registry(dir: &Path) -> UserRegistry {
        let store = JsonStore::new(Arc::new(SelfWrites::new()));
        UserRegistry::load(dir.join("users.json"), store).unwrap()
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        assert!(reg.is_empty());
        assert!(!reg.has_admin());
    }

    #[test]
    fn malformed_file_fails_load() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("users.json"), "[1, 2").unwrap();
        let store = JsonStore::new(Arc::new(SelfWrites::new()));
        assert!(UserRegistry::load(tmp.path().join("users.json"), store).is_err());
    }

    #[test]
    fn reads_users_file_format() {
        let tmp = tempfile::tempdir().unwrap();
        let key = fp(1);
        let body = format!(
            r#"{{ "{key}": {{ "name": "bob@10.0.0.2:5555", "perm": "write" }},
                 "ssh-rsa AAAAjunk": {{ "name": "eve", "perm": "root" }} }}"#
        );
        std::fs::write(tmp.path().join("users.json"), body).unwrap();
        let reg = registry(tmp.path());
        assert_eq!(reg.get(&key).unwrap().perm, Permission::Write);
        let eve = reg.get(&Fingerprint::from("ssh-rsa AAAAjunk".to_string())).unwrap();
        assert_eq!(eve.perm, Permission::Unknown("root".to_string()));
        assert_eq!(eve.perm.access(), crate::auth::AccessLevel::NoAccess);
    }

    #[test]
    fn unknown_perm_survives_unrelated_upsert() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("users.json");
        std::fs::write(
            &path,
            r#"{"ssh-rsa AAAAop": {"name": "ops", "perm": "Admin"}}"#,
        )
        .unwrap();
        let reg = registry(tmp.path());
        reg.upsert(fp(1), User::new("alice", Permission::Read)).unwrap();

        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["ssh-rsa AAAAop"]["perm"], "Admin");
        assert_eq!(on_disk[fp(1).to_string().as_str()]["perm"], "read");
        assert!(!reg.has_admin());
    }

    #[test]
    fn upsert_persists_and_get_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.upsert(fp(1), User::new("alice", Permission::Read)).unwrap();
        assert_eq!(reg.get(&fp(1)), Some(User::new("alice", Permission::Read)));

        let again = registry(tmp.path());
        assert_eq!(again.get(&fp(1)), Some(User::new("alice", Permission::Read)));
    }

    #[test]
    fn delete_removes_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.upsert(fp(1), User::new("alice", Permission::Read)).unwrap();
        let removed = reg.delete(&fp(1)).unwrap();
        assert_eq!(removed.map(|u| u.name), Some("alice".to_string()));
        assert!(reg.get(&fp(1)).is_none());
        assert!(reg.delete(&fp(1)).unwrap().is_none());
        assert!(registry(tmp.path()).is_empty());
    }

    #[test]
    fn snapshot_is_detached_from_live_map() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.upsert(fp(1), User::new("a", Permission::Read)).unwrap();
        let snap = reg.get_all();
        reg.upsert(fp(2), User::new("b", Permission::Read)).unwrap();
        assert_eq!(snap.len(), 1);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn save_load_save_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.upsert(fp(3), User::new("c", Permission::Admin)).unwrap();
        reg.upsert(fp(1), User::new("a", Permission::Read)).unwrap();
        let path = tmp.path().join("users.json");
        let first = std::fs::read(&path).unwrap();

        let reloaded = registry(tmp.path());
        reloaded.upsert(fp(1), User::new("a", Permission::Read)).unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn register_if_absent_does_not_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        assert_eq!(
            reg.register_if_absent(fp(1), User::new("first", Permission::Read)).unwrap(),
            Registration::Created
        );
        assert_eq!(
            reg.register_if_absent(fp(1), User::new("second", Permission::Write)).unwrap(),
            Registration::Existing(User::new("first", Permission::Read))
        );
        assert_eq!(reg.get(&fp(1)).unwrap().name, "first");
    }

    #[test]
    fn concurrent_registrations_keep_every_key() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = Arc::new(registry(tmp.path()));
        let handles: Vec<_> = (0..16u8)
            .map(|i| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || {
                    // Two threads per key race on the same fingerprint.
                    reg.register_if_absent(fp(i / 2), User::new(format!("u{i}"), Permission::Read))
                        .unwrap()
                })
            })
            .collect();
        let created = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r == Registration::Created)
            .count();
        assert_eq!(created, 8);
        assert_eq!(reg.len(), 8);
        assert_eq!(registry(tmp.path()).len(), 8);
    }

    #[test]
    fn cycle_permission_wraps() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.upsert(fp(1), User::new("root", Permission::Admin)).unwrap();
        let seq: Vec<_> = (0..4)
            .map(|_| reg.cycle_permission(&fp(1)).unwrap().unwrap())
            .collect();
        assert_eq!(
            seq,
            vec![
                Permission::None,
                Permission::Read,
                Permission::Write,
                Permission::Admin
            ]
        );
        assert!(reg.cycle_permission(&fp(9)).unwrap().is_none());
    }

    #[test]
    fn reload_replaces_instead_of_merging() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.upsert(fp(1), User::new("a", Permission::Read)).unwrap();
        reg.upsert(fp(2), User::new("b", Permission::Read)).unwrap();

        let mut only_a = Users::new();
        only_a.insert(fp(1), User::new("a", Permission::Read));
        std::fs::write(
            tmp.path().join("users.json"),
            serde_json::to_string(&only_a).unwrap(),
        )
        .unwrap();

        assert_eq!(reg.reload().unwrap(), 1);
        assert_eq!(reg.get_all(), only_a);
    }

    #[test]
    fn reload_of_malformed_file_keeps_state() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        reg.upsert(fp(1), User::new("a", Permission::Read)).unwrap();
        std::fs::write(tmp.path().join("users.json"), "{").unwrap();
        assert!(reg.reload().is_err());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reload_racing_upsert_keeps_memory_and_disk_equal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("users.json");
        for round in 0..50u8 {
            let reg = Arc::new(registry(tmp.path()));
            reg.replace_all(Users::new());
            reg.upsert(fp(0), User::new("a", Permission::Read)).unwrap();

            let reloader = {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.reload().unwrap())
            };
            reg.upsert(fp(1 + round % 8), User::new("b", Permission::Write)).unwrap();
            reloader.join().unwrap();

            let on_disk: Users =
                serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
            assert_eq!(reg.get_all(), on_disk, "round {round}");
            assert_eq!(reg.len(), 2, "round {round}");
        }
    }

    // ── Bootstrap ────────────────────────────────────────────────────

    #[test]
    fn host_admin_bootstrap() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join(".ssh")).unwrap();
        std::fs::write(home.path().join(".ssh/id_ed25519.pub"), ed25519_line(4, "me@host\n")).unwrap();

        let reg = registry(tmp.path());
        let used = reg.ensure_host_admin(home.path()).unwrap();
        assert_eq!(used, Some(home.path().join(".ssh/id_ed25519.pub")));
        assert!(reg.has_admin());

        let admins: Vec<_> = reg
            .get_all()
            .into_iter()
            .filter(|(_, u)| u.name == HOST_ADMIN_NAME && u.perm == Permission::Admin)
            .collect();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].0, fp(4));
    }

    #[test]
    fn host_admin_prefers_ed25519() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let ssh = home.path().join(".ssh");
        std::fs::create_dir(&ssh).unwrap();
        std::fs::write(ssh.join("id_rsa.pub"), "ssh-rsa garbage").unwrap();
        std::fs::write(ssh.join("id_ed25519.pub"), ed25519_line(6, "x")).unwrap();

        let reg = registry(tmp.path());
        reg.ensure_host_admin(home.path()).unwrap();
        assert!(reg.get(&fp(6)).is_some());
    }

    #[test]
    fn host_admin_skipped_when_admin_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        std::fs::create_dir(home.path().join(".ssh")).unwrap();
        std::fs::write(home.path().join(".ssh/id_ed25519.pub"), ed25519_line(4, "x")).unwrap();

        let reg = registry(tmp.path());
        reg.upsert(fp(1), User::new("boss", Permission::Admin)).unwrap();
        assert_eq!(reg.ensure_host_admin(home.path()).unwrap(), None);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn host_admin_without_key_is_soft_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();
        let reg = registry(tmp.path());
        assert_eq!(reg.ensure_host_admin(home.path()).unwrap(), None);
        assert!(!reg.has_admin());
    }
}
