//! Identity and permission handling: key fingerprints, the permission model
//! and the admission/authorization service built on top of them.

pub mod access;
pub mod fingerprint;
pub mod permission;

pub use access::AccessControl;
pub use fingerprint::Fingerprint;
pub use permission::{AccessLevel, Permission};
