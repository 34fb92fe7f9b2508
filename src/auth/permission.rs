use std::fmt;

use serde::{Deserialize, Serialize};

/// Stored authorization tier of a registered key.
///
/// Values are persisted as lowercase strings.  Anything that is not one of
/// the four known values is kept verbatim as [`Permission::Unknown`], written
/// back unchanged on the next save, and grants nothing, so a hand-edited
/// `users.json` can never grant more than it spells out.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(from = "String", into = "String")]
pub enum Permission {
    /// Unrecognized stored value.  Orders below every known tier.
    Unknown(String),
    #[default]
    None,
    Read,
    Write,
    Admin,
}

impl Permission {
    /// Known values in cycle order.
    pub const ALL: [Permission; 4] = [
        Permission::None,
        Permission::Read,
        Permission::Write,
        Permission::Admin,
    ];

    /// Strict parse.  Returns `None` for anything but the four known names.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == s)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Permission::Unknown(raw) => raw,
            Permission::None => "none",
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Admin => "admin",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Permission::Unknown(_))
    }

    /// Next value in the `none → read → write → admin → none` cycle.  An
    /// unknown value counts as `none`.
    pub fn next(&self) -> Self {
        match self {
            Permission::Unknown(_) | Permission::None => Permission::Read,
            Permission::Read => Permission::Write,
            Permission::Write => Permission::Admin,
            Permission::Admin => Permission::None,
        }
    }

    /// The capability this permission grants for Git operations and the
    /// admin console.
    pub fn access(&self) -> AccessLevel {
        access_for(self)
    }
}

impl From<String> for Permission {
    fn from(s: String) -> Self {
        Permission::parse(&s).unwrap_or(Permission::Unknown(s))
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        match p {
            Permission::Unknown(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Access level
// ---------------------------------------------------------------------------

/// Capability handed to the Git transport for a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    NoAccess,
    ReadOnly,
    ReadWrite,
    Admin,
}

impl AccessLevel {
    /// Whether this level satisfies `required`.
    pub fn allows(self, required: AccessLevel) -> bool {
        self >= required
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessLevel::NoAccess => "no-access",
            AccessLevel::ReadOnly => "read-only",
            AccessLevel::ReadWrite => "read-write",
            AccessLevel::Admin => "admin",
        };
        f.write_str(s)
    }
}

/// Permission → capability mapping shared by the Git authorization path and
/// the console gate.
pub fn access_for(perm: &Permission) -> AccessLevel {
    match perm {
        Permission::Read => AccessLevel::ReadOnly,
        Permission::Write => AccessLevel::ReadWrite,
        Permission::Admin => AccessLevel::Admin,
        Permission::None | Permission::Unknown(_) => AccessLevel::NoAccess,
    }
}
