//! Pack service engine: hands an open repository and the session's byte
//! streams to the actual Git negotiation.
//!
//! The default engine shells out to the system `git` binary
//! (`git upload-pack` / `git receive-pack`) the same way the rest of the
//! gateway's git plumbing does, pumping client bytes to the child's stdin
//! and child output back to the client until the negotiation completes.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::auth::{AccessPolicy, SessionIdentity};
use crate::repo::RepoHandle;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The two Git services the gateway dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    UploadPack,
    ReceivePack,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }
}

/// The three raw byte streams the transport bound to this invocation.
pub struct SessionStreams {
    pub input: Box<dyn AsyncRead + Send + Unpin>,
    pub output: Box<dyn AsyncWrite + Send + Unpin>,
    pub error: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Service-layer failure.  `NotEnabled` and `NotAuthorized` are swallowed
/// silently by the command lifecycle -- the client cannot use this
/// repository, and must not learn why.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service not enabled")]
    NotEnabled,
    #[error("service not authorized for this caller")]
    NotAuthorized,
    #[error("git {service} exited with status {status}")]
    Failed { service: &'static str, status: i32 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Engine seam
// ---------------------------------------------------------------------------

/// Runs one Git service over the invocation's streams.  Consumes the
/// streams: nothing may be written to the client after the service ends.
#[async_trait]
pub trait PackEngine: Send + Sync {
    async fn serve(
        &self,
        kind: ServiceKind,
        identity: &SessionIdentity,
        repo: &RepoHandle,
        streams: SessionStreams,
        git_protocol: Option<&str>,
    ) -> Result<(), ServiceError>;
}

// ---------------------------------------------------------------------------
// System-git engine
// ---------------------------------------------------------------------------

/// Engine backed by the system `git` binary.
pub struct GitPackEngine {
    policy: Arc<dyn AccessPolicy>,
    /// Instance-wide push switch.  When off, `git-receive-pack` is not a
    /// service this daemon offers at all, regardless of the caller.
    receive_enabled: bool,
}

impl GitPackEngine {
    pub fn new(policy: Arc<dyn AccessPolicy>, receive_enabled: bool) -> Self {
        Self {
            policy,
            receive_enabled,
        }
    }

    fn authorize(
        &self,
        kind: ServiceKind,
        identity: &SessionIdentity,
        repo: &RepoHandle,
    ) -> Result<(), ServiceError> {
        match kind {
            ServiceKind::UploadPack => {
                if !self.policy.can_read(identity, repo.name()) {
                    return Err(ServiceError::NotAuthorized);
                }
            }
            ServiceKind::ReceivePack => {
                if !self.receive_enabled {
                    return Err(ServiceError::NotEnabled);
                }
                if !self.policy.can_write(identity, repo.name()) {
                    return Err(ServiceError::NotAuthorized);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PackEngine for GitPackEngine {
    async fn serve(
        &self,
        kind: ServiceKind,
        identity: &SessionIdentity,
        repo: &RepoHandle,
        streams: SessionStreams,
        git_protocol: Option<&str>,
    ) -> Result<(), ServiceError> {
        self.authorize(kind, identity, repo)?;

        let mut cmd = Command::new("git");
        match kind {
            ServiceKind::UploadPack => {
                cmd.arg("upload-pack").arg("--strict").arg(repo.path());
            }
            ServiceKind::ReceivePack => {
                cmd.arg("receive-pack").arg(repo.path());
            }
        }

        // Forward the protocol version the client negotiated over the SSH
        // env request (v2 where supported, v1 otherwise).
        if let Some(proto) = git_protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(repo = %repo.name(), service = kind.as_str(), "spawning git service");

        let mut child = cmd.spawn()?;
        let mut stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::other("child stdin was not piped")
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("child stdout was not piped")
        })?;
        let mut stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::other("child stderr was not piped")
        })?;

        let SessionStreams {
            mut input,
            mut output,
            mut error,
        } = streams;

        // Client -> child.  Runs as its own task because the client may not
        // close its side until after the child has exited; dropping stdin
        // when the copy ends signals EOF to the child.
        let feed = tokio::spawn(async move {
            let _ = tokio::io::copy(&mut input, &mut stdin).await;
            drop(stdin);
        });

        // Child -> client.  Both pumps run to completion; stdout closes when
        // the child exits.
        let out_pump = tokio::io::copy(&mut stdout, &mut output);
        let err_pump = tokio::io::copy(&mut stderr, &mut error);
        let (out_res, err_res) = tokio::join!(out_pump, err_pump);

        let status = child.wait().await?;
        feed.abort();

        if let Err(e) = out_res {
            debug!(error = %e, "output pump ended with error");
        }
        if let Err(e) = err_res {
            debug!(error = %e, "error pump ended with error");
        }

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            warn!(
                repo = %repo.name(),
                service = kind.as_str(),
                status = code,
                "git service exited with non-zero status"
            );
            return Err(ServiceError::Failed {
                service: kind.as_str(),
                status: code,
            });
        }

        debug!(repo = %repo.name(), service = kind.as_str(), "git service complete");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
