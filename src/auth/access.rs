//! Admission and authorization decisions for SSH connections.
//!
//! [`AccessControl`] is the one service object shared (behind an `Arc`) by
//! every connection handler, the admin console and the file watcher.  It owns
//! no lock of its own: all state lives in the [`UserRegistry`] and
//! [`ConfigHandle`] it wraps.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, instrument, warn};

use super::fingerprint::Fingerprint;
use super::permission::AccessLevel;
use crate::config::ConfigHandle;
use crate::registry::{Registration, User, UserRegistry};
use crate::watch::{Reconcile, WatchedFile};

#[derive(Debug)]
pub struct AccessControl {
    /// The single bare repository this process serves, e.g. `widgets.git`.
    repo_name: String,
    registry: Arc<UserRegistry>,
    config: Arc<ConfigHandle>,
}

impl AccessControl {
    pub fn new(
        repo_name: impl Into<String>,
        registry: Arc<UserRegistry>,
        config: Arc<ConfigHandle>,
    ) -> Self {
        Self {
            repo_name: repo_name.into(),
            registry,
            config,
        }
    }

    pub fn repo_name(&self) -> &str {
        &self.repo_name
    }

    pub fn registry(&self) -> &Arc<UserRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Arc<ConfigHandle> {
        &self.config
    }

    // -- Connection time --------------------------------------------------

    /// Decide whether a key may open an SSH session.
    ///
    /// Registered keys are always admitted, whatever their permission; Git
    /// operations are gated separately by [`AccessControl::authorize_repo`].
    /// Unknown keys are registered as guests when the server is public and
    /// rejected otherwise.  A guest whose registration cannot be persisted is
    /// rejected.
    #[instrument(skip(self, fingerprint), fields(key = %fingerprint.sha256()))]
    pub fn authenticate(&self, username: &str, remote_addr: &str, fingerprint: &Fingerprint) -> bool {
        if let Some(user) = self.registry.get(fingerprint) {
            info!(user = %user.name, perm = %user.perm, "user authenticated");
            return true;
        }

        let display_name = format!("{username}@{remote_addr}");
        if !self.config.is_public() {
            warn!(user = %display_name, "unauthorized key tried to connect");
            return false;
        }

        info!(user = %display_name, "new user connecting");
        let guest = User::new(display_name, self.config.get().guest_permission());
        let perm = guest.perm.clone();

        match self.registry.register_if_absent(fingerprint.clone(), guest) {
            Ok(Registration::Created) => {
                info!(perm = %perm, "guest registered");
                true
            }
            Ok(Registration::Existing(user)) => {
                info!(user = %user.name, "key registered by a concurrent connection");
                true
            }
            Err(e) => {
                error!(error = %e, "could not persist guest; rejecting connection");
                false
            }
        }
    }

    // -- Operation time ---------------------------------------------------

    /// Capability of `fingerprint` on `repo_name`.  Pure lookup.
    pub fn authorize_repo(&self, repo_name: &str, fingerprint: &Fingerprint) -> AccessLevel {
        if repo_name != self.repo_name {
            return AccessLevel::NoAccess;
        }
        self.access_of(fingerprint)
    }

    /// Capability of `fingerprint` regardless of repository.
    pub fn access_of(&self, fingerprint: &Fingerprint) -> AccessLevel {
        self.registry
            .get(fingerprint)
            .map(|u| u.perm.access())
            .unwrap_or(AccessLevel::NoAccess)
    }

    /// Whether `fingerprint` may use the interactive admin console.
    pub fn console_allowed(&self, fingerprint: &Fingerprint) -> bool {
        self.access_of(fingerprint) == AccessLevel::Admin
    }
}

impl Reconcile for AccessControl {
    fn reconcile(&self, file: WatchedFile) -> Result<()> {
        match file {
            WatchedFile::Users => {
                info!("detected external change, reloading users");
                self.registry.reload()?;
            }
            WatchedFile::Config => {
                info!("detected external change, reloading config");
                self.config.reload()?;
            }
        }
        Ok(())
    }
}
