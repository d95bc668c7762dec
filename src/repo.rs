//! Repository resolution and access control.
//!
//! The resolver turns the raw path a Git client sent (`/org/repo.git`) into
//! an open [`RepoHandle`], or into one of two failure shapes: a collapsed
//! "unavailable" outcome that deliberately hides whether the repository is
//! absent or merely forbidden, and a "may not continue" outcome that must be
//! surfaced to the client as a framed protocol error because it is already
//! waiting on a ref advertisement.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, trace};

use crate::auth::{AccessPolicy, SessionIdentity};

// ---------------------------------------------------------------------------
// Repository handle
// ---------------------------------------------------------------------------

/// An open handle to one repository, scoped to a single command invocation.
///
/// Release happens exactly once, on every exit path, when the handle is
/// dropped.  An optional release hook lets the store (and tests) observe
/// the release.
pub struct RepoHandle {
    name: String,
    path: PathBuf,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl std::fmt::Debug for RepoHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RepoHandle {
    pub fn new(name: String, path: PathBuf) -> Self {
        Self {
            name,
            path,
            on_release: None,
        }
    }

    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RepoHandle {
    fn drop(&mut self) {
        trace!(repo = %self.name, "repository handle released");
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

// ---------------------------------------------------------------------------
// Store seam
// ---------------------------------------------------------------------------

/// Why a repository could not be opened.
///
/// `NotFound` and `NotEnabled` are collapsed by the resolver; only
/// `MayNotContinue` reaches the client in any recognisable form.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("repository not found")]
    NotFound,
    #[error("service not enabled for this caller")]
    NotEnabled,
    #[error("{0}")]
    MayNotContinue(String),
}

/// Opens repositories by logical name on behalf of an authenticated caller.
#[async_trait]
pub trait RepoStore: Send + Sync {
    async fn open(&self, identity: &SessionIdentity, name: &str) -> Result<RepoHandle, StoreError>;
}

// ---------------------------------------------------------------------------
// Filesystem store
// ---------------------------------------------------------------------------

/// Store serving bare repositories from a directory tree under `root`.
pub struct FsRepoStore {
    root: PathBuf,
    policy: Arc<dyn AccessPolicy>,
}

impl FsRepoStore {
    pub fn new(root: PathBuf, policy: Arc<dyn AccessPolicy>) -> Self {
        Self { root, policy }
    }

    /// A bare repo must be a directory that contains a `HEAD` file.  This is
    /// a lightweight heuristic, not a full integrity check.
    async fn is_bare_repo(path: &Path) -> bool {
        let is_dir = tokio::fs::metadata(path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return false;
        }
        tokio::fs::metadata(path.join("HEAD"))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }
}

/// Reject names that would escape the storage root.  Only plain path
/// components are allowed; `..`, absolute segments, and drive prefixes all
/// fail.
fn safe_relative(name: &str) -> Option<&Path> {
    let path = Path::new(name);
    if path
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        Some(path)
    } else {
        None
    }
}

#[async_trait]
impl RepoStore for FsRepoStore {
    async fn open(&self, identity: &SessionIdentity, name: &str) -> Result<RepoHandle, StoreError> {
        let relative = safe_relative(name).ok_or(StoreError::NotFound)?;

        // Exact name first, then the conventional `.git` suffix.
        let mut candidate = self.root.join(relative);
        if !Self::is_bare_repo(&candidate).await {
            candidate = self.root.join(format!("{name}.git"));
            if !Self::is_bare_repo(&candidate).await {
                debug!(repo = %name, "no bare repository at either candidate path");
                return Err(StoreError::NotFound);
            }
        }

        if !self.policy.can_read(identity, name) {
            debug!(repo = %name, user = %identity.username, "read access denied");
            return Err(StoreError::NotEnabled);
        }

        Ok(RepoHandle::new(name.to_string(), candidate))
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Outcome of resolution as seen by the command lifecycle.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Absent, malformed, or forbidden -- deliberately indistinguishable.
    #[error("repository unavailable")]
    Unavailable,
    /// The service exists but cannot proceed; the client must receive a
    /// framed `ERR` line rather than silence.
    #[error("{0}")]
    MayNotContinue(String),
}

/// Normalises client-supplied paths and collapses store failures into the
/// externally observable outcome set.
pub struct RepositoryResolver {
    store: Arc<dyn RepoStore>,
}

impl RepositoryResolver {
    pub fn new(store: Arc<dyn RepoStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        identity: &SessionIdentity,
        logical_path: &str,
    ) -> Result<RepoHandle, ResolveError> {
        // Assume any attempt to use \ was by a Windows client and correct to
        // the / used in Git URIs.
        let name = logical_path.replace('\\', "/");

        // ssh://git@host/path always arrives as "/path" here.  A path with
        // no leading separator is malformed, and malformed must look exactly
        // like absent.
        let Some(name) = name.strip_prefix('/') else {
            debug!(path = %logical_path, "path does not start with a separator");
            return Err(ResolveError::Unavailable);
        };

        match self.store.open(identity, name).await {
            Ok(handle) => Ok(handle),
            Err(StoreError::NotFound | StoreError::NotEnabled) => Err(ResolveError::Unavailable),
            Err(StoreError::MayNotContinue(msg)) => Err(ResolveError::MayNotContinue(msg)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
