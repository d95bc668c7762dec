//! Public-key authentication and repository access policy.
//!
//! The SSH transport calls into [`PublicKeyAuthenticator`] during the auth
//! exchange; a successful lookup yields the [`SessionIdentity`] that every
//! later repository and service decision is made against.  The default
//! implementation is a flat `authorized_keys`-style file under the
//! configuration root, keyed by SHA-256 fingerprint.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tracing::warn;

// ---------------------------------------------------------------------------
// Session identity
// ---------------------------------------------------------------------------

/// The authenticated principal bound to one SSH session.
///
/// Created by the transport at auth time and immutable for the lifetime of
/// the session; the command layer only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub username: String,
    pub fingerprint: String,
}

// ---------------------------------------------------------------------------
// Fingerprint helper
// ---------------------------------------------------------------------------

/// Compute the SHA-256 fingerprint of an SSH public key, returned as a
/// base64-encoded string prefixed with `SHA256:` (matching the format used
/// by `ssh-keygen -l`).
pub fn fingerprint_of(key: &PublicKey) -> String {
    let blob_b64 = key.public_key_base64();
    let blob = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Authenticator seam
// ---------------------------------------------------------------------------

/// Maps an offered public key to a session identity, or rejects it.
pub trait PublicKeyAuthenticator: Send + Sync {
    /// `user` is the username the client asked for (conventionally `git`);
    /// `key` is the public key it proved ownership of.
    fn authenticate(&self, user: &str, key: &PublicKey) -> Option<SessionIdentity>;
}

/// Authenticator backed by an `authorized_keys`-style file.
///
/// Each non-comment line is `<key-type> <base64-key> <username>`.  Lines
/// that fail to parse are skipped with a warning rather than failing the
/// whole load, so one bad entry cannot lock every user out.
pub struct AuthorizedKeys {
    by_fingerprint: HashMap<String, String>,
}

impl AuthorizedKeys {
    /// Load the key file at `path`.  A missing file yields an empty (deny
    /// everyone) authenticator.
    pub fn load(path: &Path) -> Result<Self> {
        let mut by_fingerprint = HashMap::new();

        if !path.exists() {
            warn!(path = %path.display(), "authorized keys file not found; all clients will be rejected");
            return Ok(Self { by_fingerprint });
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read authorized keys file: {}", path.display()))?;

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (Some(_keytype), Some(blob), Some(username)) =
                (fields.next(), fields.next(), fields.next())
            else {
                warn!(line = lineno + 1, "malformed authorized keys entry; skipping");
                continue;
            };

            match russh_keys::parse_public_key_base64(blob) {
                Ok(key) => {
                    by_fingerprint.insert(fingerprint_of(&key), username.to_string());
                }
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "unparseable public key; skipping");
                }
            }
        }

        Ok(Self { by_fingerprint })
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.by_fingerprint.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_fingerprint.is_empty()
    }
}

impl PublicKeyAuthenticator for AuthorizedKeys {
    fn authenticate(&self, _user: &str, key: &PublicKey) -> Option<SessionIdentity> {
        let fingerprint = fingerprint_of(key);
        let username = self.by_fingerprint.get(&fingerprint)?;
        Some(SessionIdentity {
            username: username.clone(),
            fingerprint,
        })
    }
}

// ---------------------------------------------------------------------------
// Access policy
// ---------------------------------------------------------------------------

/// Per-repository capability checks for an authenticated caller.
///
/// The resolver consults `can_read` before opening a repository; the pack
/// engine consults `can_write` before accepting a push.  A denial in either
/// place is indistinguishable from the repository not existing, from the
/// client's point of view.
pub trait AccessPolicy: Send + Sync {
    fn can_read(&self, identity: &SessionIdentity, repo: &str) -> bool;
    fn can_write(&self, identity: &SessionIdentity, repo: &str) -> bool;
}

/// Fixed policy: every authenticated caller may fetch; pushes are gated on
/// a single configuration switch.
pub struct StaticPolicy {
    allow_push: bool,
}

impl StaticPolicy {
    pub fn new(allow_push: bool) -> Self {
        Self { allow_push }
    }
}

impl AccessPolicy for StaticPolicy {
    fn can_read(&self, _identity: &SessionIdentity, _repo: &str) -> bool {
        true
    }

    fn can_write(&self, _identity: &SessionIdentity, _repo: &str) -> bool {
        self.allow_push
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
