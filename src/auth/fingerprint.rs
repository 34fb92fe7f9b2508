//! Registry keys derived from SSH public keys.
//!
//! A [`Fingerprint`] is the string `"<algo> <base64-blob>"`, i.e. the first two
//! fields of an OpenSSH `.pub` / `authorized_keys` line.  The same string is
//! produced for a key presented during SSH authentication and for the same key
//! read from disk, so both paths hit the same `users.json` entry.

use std::fmt;

use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyParseError {
    #[error("expected \"<type> <base64-key>\", got {0} field(s)")]
    MissingFields(usize),
    #[error("key data is not valid base64")]
    InvalidBase64,
    #[error("key blob is truncated or malformed")]
    MalformedBlob,
    #[error("key type {declared:?} does not match encoded type {actual:?}")]
    AlgorithmMismatch { declared: String, actual: String },
}

/// Primary key of the user registry.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Build from the SSH wire encoding of a public key.  The algorithm name
    /// is taken from the blob itself.
    pub fn from_key_blob(blob: &[u8]) -> Result<Self, KeyParseError> {
        let algo = blob_algorithm(blob)?;
        Ok(Self(format!("{algo} {}", B64.encode(blob))))
    }

    /// Fingerprint of a key presented during SSH authentication.
    ///
    /// The algorithm comes from the encoded blob rather than
    /// [`PublicKey::name`], which reports the negotiated signature hash for
    /// RSA keys (`rsa-sha2-512`) instead of the key type (`ssh-rsa`).
    pub fn from_public_key(key: &PublicKey) -> Self {
        let blob_b64 = key.public_key_base64();
        let algo = B64
            .decode(blob_b64.as_bytes())
            .ok()
            .and_then(|blob| blob_algorithm(&blob).ok().map(str::to_string))
            .unwrap_or_else(|| key.name().to_string());
        Self(format!("{algo} {blob_b64}"))
    }

    /// Parse an OpenSSH public key line (`ssh-ed25519 AAAA... comment`),
    /// discarding the comment.
    pub fn parse_openssh(line: &str) -> Result<Self, KeyParseError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            return Err(KeyParseError::MissingFields(fields.len()));
        }
        let blob = B64
            .decode(fields[1].as_bytes())
            .map_err(|_| KeyParseError::InvalidBase64)?;
        let actual = blob_algorithm(&blob)?;
        if actual != fields[0] {
            return Err(KeyParseError::AlgorithmMismatch {
                declared: fields[0].to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(Self(format!("{} {}", fields[0], fields[1])))
    }

    /// Key type, e.g. `ssh-ed25519`.
    pub fn algorithm(&self) -> &str {
        self.0.split(' ').next().unwrap_or_default()
    }

    /// `SHA256:<base64-nopad>` digest of the key blob, matching the format
    /// printed by `ssh-keygen -l`.  Falls back to the raw key text when the
    /// stored value does not carry decodable key data.
    pub fn sha256(&self) -> String {
        let Some(b64) = self.0.split(' ').nth(1) else {
            return self.0.clone();
        };
        match B64.decode(b64.as_bytes()) {
            Ok(blob) => {
                let hash = Sha256::digest(&blob);
                let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
                format!("SHA256:{encoded}")
            }
            Err(_) => self.0.clone(),
        }
    }
}

impl From<String> for Fingerprint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read the leading length-prefixed algorithm string of an SSH key blob.
fn blob_algorithm(blob: &[u8]) -> Result<&str, KeyParseError> {
    let len_bytes: [u8; 4] = blob
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(KeyParseError::MalformedBlob)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4 + len).ok_or(KeyParseError::MalformedBlob)?;
    if name.is_empty() {
        return Err(KeyParseError::MalformedBlob);
    }
    std::str::from_utf8(name).map_err(|_| KeyParseError::MalformedBlob)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal ed25519-shaped blob: `string "ssh-ed25519" || string key`.
    pub(crate) fn ed25519_blob(seed: u8) -> Vec<u8> {
        let algo = b"ssh-ed25519";
        let mut blob = Vec::new();
        blob.extend_from_slice(&(algo.len() as u32).to_be_bytes());
        blob.extend_from_slice(algo);
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&[seed; 32]);
        blob
    }

    pub(crate) fn ed25519_line(seed: u8, comment: &str) -> String {
        format!("ssh-ed25519 {} {comment}", B64.encode(ed25519_blob(seed)))
    }

    #[test]
    fn blob_fingerprint_is_deterministic() {
        let a = Fingerprint::from_key_blob(&ed25519_blob(7)).unwrap();
        let b = Fingerprint::from_key_blob(&ed25519_blob(7)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.algorithm(), "ssh-ed25519");
    }

    #[test]
    fn different_keys_differ() {
        let a = Fingerprint::from_key_blob(&ed25519_blob(1)).unwrap();
        let b = Fingerprint::from_key_blob(&ed25519_blob(2)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn openssh_line_matches_blob_fingerprint() {
        let from_line = Fingerprint::parse_openssh(&ed25519_line(9, "alice@laptop")).unwrap();
        let from_blob = Fingerprint::from_key_blob(&ed25519_blob(9)).unwrap();
        assert_eq!(from_line, from_blob);
    }

    #[test]
    fn openssh_line_without_comment() {
        let line = format!("ssh-ed25519 {}\n", B64.encode(ed25519_blob(3)));
        let fp = Fingerprint::parse_openssh(&line).unwrap();
        assert!(!fp.to_string().ends_with('\n'));
        assert_eq!(fp.to_string().split(' ').count(), 2);
    }

    #[test]
    fn openssh_line_rejects_missing_fields() {
        assert_eq!(
            Fingerprint::parse_openssh("ssh-ed25519"),
            Err(KeyParseError::MissingFields(1))
        );
        assert_eq!(
            Fingerprint::parse_openssh("   "),
            Err(KeyParseError::MissingFields(0))
        );
    }

    #[test]
    fn openssh_line_rejects_bad_base64() {
        assert_eq!(
            Fingerprint::parse_openssh("ssh-ed25519 not*base64"),
            Err(KeyParseError::InvalidBase64)
        );
    }

    #[test]
    fn openssh_line_rejects_type_mismatch() {
        let line = format!("ssh-rsa {}", B64.encode(ed25519_blob(3)));
        assert!(matches!(
            Fingerprint::parse_openssh(&line),
            Err(KeyParseError::AlgorithmMismatch { .. })
        ));
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert_eq!(
            Fingerprint::from_key_blob(&[0, 0, 0, 20, b's']),
            Err(KeyParseError::MalformedBlob)
        );
        assert_eq!(Fingerprint::from_key_blob(&[]), Err(KeyParseError::MalformedBlob));
    }

    #[test]
    fn sha256_has_ssh_keygen_shape() {
        let fp = Fingerprint::from_key_blob(&ed25519_blob(5)).unwrap();
        let digest = fp.sha256();
        assert!(digest.starts_with("SHA256:"));
        // 32-byte digest, unpadded base64 → 43 characters.
        assert_eq!(digest.len(), "SHA256:".len() + 43);
        assert_eq!(digest, fp.sha256());
    }

    #[test]
    fn serializes_as_plain_string() {
        let fp = Fingerprint::from("ssh-ed25519 AAAA".to_string());
        assert_eq!(serde_json::to_string(&fp).unwrap(), "\"ssh-ed25519 AAAA\"");
    }
}
