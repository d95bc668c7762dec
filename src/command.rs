//! Command parsing and the per-invocation lifecycle.
//!
//! The SSH transport hands us one raw command line per session.  We split it
//! into a verb and a repository path, map the verb onto a closed set of
//! command variants, and then drive the shared lifecycle: resolve the
//! repository, delegate to the pack engine, signal exactly one exit code,
//! and release the handle -- on every path, including the failing ones.

use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::auth::SessionIdentity;
use crate::pktline;
use crate::repo::{RepositoryResolver, ResolveError};
use crate::service::{PackEngine, ServiceError, ServiceKind, SessionStreams};

// ---------------------------------------------------------------------------
// Exit codes
// ---------------------------------------------------------------------------

/// Successful completion of the delegated service.
pub const EXIT_OK: u32 = 0;
/// Repository unavailable, unauthorized, or the service failed.
pub const EXIT_FAILURE: u32 = 1;
/// Unrecognised command verb (shell "command not found" convention).
pub const EXIT_UNKNOWN_COMMAND: u32 = 127;

// ---------------------------------------------------------------------------
// Parsed command
// ---------------------------------------------------------------------------

/// The closed set of commands the gateway dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCommand {
    Upload { path: String },
    Receive { path: String },
    Unknown,
}

impl GitCommand {
    /// Split `raw` on the first whitespace run into `(verb, rest)` and map
    /// the verb.  The rest passes through unmodified -- internal whitespace
    /// and all -- as the repository path.  Parsing never fails: anything
    /// unrecognised, including the empty line, degrades to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        let (verb, rest) = match raw.find(char::is_whitespace) {
            Some(idx) => (&raw[..idx], raw[idx..].trim_start()),
            None => (raw, ""),
        };

        match verb {
            "git-upload-pack" => Self::Upload {
                path: rest.to_string(),
            },
            "git-receive-pack" => Self::Receive {
                path: rest.to_string(),
            },
            _ => Self::Unknown,
        }
    }
}

// ---------------------------------------------------------------------------
// Exit sink
// ---------------------------------------------------------------------------

/// Set-once exit-code signal.
///
/// The lifecycle signals unconditionally in its cleanup step; wrapping a
/// `oneshot` sender that is taken on first use guarantees the first signal
/// is the only one a receiver can ever observe.
pub struct ExitSink {
    tx: Mutex<Option<oneshot::Sender<u32>>>,
}

impl ExitSink {
    pub fn new() -> (Self, oneshot::Receiver<u32>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Signal `code`.  A no-op if an exit code was already signalled.
    pub fn signal(&self, code: u32) {
        let sender = self.tx.lock().expect("exit sink lock poisoned").take();
        if let Some(tx) = sender {
            let _ = tx.send(code);
        }
    }
}

// ---------------------------------------------------------------------------
// Invocation context
// ---------------------------------------------------------------------------

/// Everything one command invocation needs, assembled by the transport once
/// all session-scoped dependencies are known.  Immutable from here on.
pub struct Invocation {
    pub identity: SessionIdentity,
    pub streams: SessionStreams,
    pub exit: ExitSink,
    /// `GIT_PROTOCOL` value the client sent via SSH env request, if any.
    pub git_protocol: Option<String>,
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Read-only wiring shared by every session: the resolver and the pack
/// engine.  One dispatcher serves the whole daemon.
pub struct CommandDispatcher {
    resolver: RepositoryResolver,
    engine: Arc<dyn PackEngine>,
}

impl CommandDispatcher {
    pub fn new(resolver: RepositoryResolver, engine: Arc<dyn PackEngine>) -> Self {
        Self { resolver, engine }
    }

    /// Drive one invocation to completion.
    ///
    /// Ordering within the invocation: resolve, then delegate, then signal,
    /// then release.  The cleanup at the end always signals `EXIT_FAILURE`
    /// and always drops the handle; the set-once sink makes the late signal
    /// harmless on paths that already signalled.
    pub async fn run(&self, command: GitCommand, invocation: Invocation) {
        let Invocation {
            identity,
            mut streams,
            exit,
            git_protocol,
        } = invocation;

        let (kind, path) = match command {
            GitCommand::Unknown => {
                // No resolution, no output; just the shell convention.
                exit.signal(EXIT_UNKNOWN_COMMAND);
                return;
            }
            GitCommand::Upload { path } => (ServiceKind::UploadPack, path),
            GitCommand::Receive { path } => (ServiceKind::ReceivePack, path),
        };

        info!(
            user = %identity.username,
            service = kind.as_str(),
            path = %path,
            "dispatching git command"
        );

        let handle = match self.resolver.resolve(&identity, &path).await {
            Ok(handle) => Some(handle),
            Err(ResolveError::Unavailable) => {
                // Silent rejection: the client learns nothing beyond the
                // exit code, and cannot tell absent from forbidden.
                debug!(path = %path, "repository unavailable; rejecting silently");
                exit.signal(EXIT_FAILURE);
                None
            }
            Err(ResolveError::MayNotContinue(msg)) => {
                // The client is waiting for a ref advertisement, so it gets
                // a pkt-line framed error instead of a hung connection.
                debug!(path = %path, reason = %msg, "service may not continue");
                let _ = pktline::write_err(&mut streams.output, &msg).await;
                exit.signal(EXIT_FAILURE);
                None
            }
        };

        if let Some(repo) = handle.as_ref() {
            match self
                .engine
                .serve(kind, &identity, repo, streams, git_protocol.as_deref())
                .await
            {
                Ok(()) => exit.signal(EXIT_OK),
                Err(ServiceError::NotEnabled | ServiceError::NotAuthorized) => {
                    // Same observable as an absent repository: exit 1 and
                    // not a byte of explanation.
                    debug!(repo = %repo.name(), "service-level rejection");
                    exit.signal(EXIT_FAILURE);
                }
                Err(e) => {
                    debug!(repo = %repo.name(), error = %e, "git service failed");
                    exit.signal(EXIT_FAILURE);
                }
            }
        }

        // Cleanup: release the handle, then the unconditional late signal.
        drop(handle);
        exit.signal(EXIT_FAILURE);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{RepoHandle, RepoStore, StoreError};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;

    // -- parsing ----------------------------------------------------------

    #[test]
    fn parses_the_two_reserved_verbs() {
        assert_eq!(
            GitCommand::parse("git-upload-pack /repo/a.git"),
            GitCommand::Upload {
                path: "/repo/a.git".into()
            }
        );
        assert_eq!(
            GitCommand::parse("git-receive-pack /repo/a.git"),
            GitCommand::Receive {
                path: "/repo/a.git".into()
            }
        );
    }

    #[test]
    fn path_keeps_internal_whitespace() {
        assert_eq!(
            GitCommand::parse("git-upload-pack /my repo/a.git"),
            GitCommand::Upload {
                path: "/my repo/a.git".into()
            }
        );
    }

    #[test]
    fn anything_else_degrades_to_unknown() {
        assert_eq!(GitCommand::parse("foo bar"), GitCommand::Unknown);
        assert_eq!(GitCommand::parse(""), GitCommand::Unknown);
        assert_eq!(GitCommand::parse("git-upload-packx /a"), GitCommand::Unknown);
    }

    #[test]
    fn verb_with_no_argument_yields_empty_path() {
        assert_eq!(
            GitCommand::parse("git-upload-pack"),
            GitCommand::Upload { path: String::new() }
        );
    }

    // -- exit sink --------------------------------------------------------

    #[tokio::test]
    async fn first_signal_wins() {
        let (sink, rx) = ExitSink::new();
        sink.signal(0);
        sink.signal(1);
        sink.signal(1);
        assert_eq!(rx.await.unwrap(), 0);
    }

    // -- lifecycle fixtures -----------------------------------------------

    struct FakeStore {
        opens: AtomicUsize,
        releases: Arc<AtomicUsize>,
        outcome: Outcome,
    }

    #[derive(Clone)]
    enum Outcome {
        Found,
        NotFound,
        NotEnabled,
        MayNotContinue(String),
    }

    #[async_trait]
    impl RepoStore for FakeStore {
        async fn open(
            &self,
            _id: &SessionIdentity,
            name: &str,
        ) -> Result<RepoHandle, StoreError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Outcome::Found => {
                    let releases = Arc::clone(&self.releases);
                    Ok(
                        RepoHandle::new(name.to_string(), PathBuf::from("/tmp/fake"))
                            .with_release_hook(move || {
                                releases.fetch_add(1, Ordering::SeqCst);
                            }),
                    )
                }
                Outcome::NotFound => Err(StoreError::NotFound),
                Outcome::NotEnabled => Err(StoreError::NotEnabled),
                Outcome::MayNotContinue(m) => Err(StoreError::MayNotContinue(m.clone())),
            }
        }
    }

    struct FakeEngine {
        serves: AtomicUsize,
        result: Result<(), &'static str>,
    }

    #[async_trait]
    impl PackEngine for FakeEngine {
        async fn serve(
            &self,
            _kind: ServiceKind,
            _identity: &SessionIdentity,
            _repo: &RepoHandle,
            mut streams: SessionStreams,
            _git_protocol: Option<&str>,
        ) -> Result<(), ServiceError> {
            self.serves.fetch_add(1, Ordering::SeqCst);
            match self.result {
                Ok(()) => {
                    use tokio::io::AsyncWriteExt;
                    // A stand-in for the pack negotiation.
                    streams.output.write_all(b"0000").await?;
                    Ok(())
                }
                Err("not-enabled") => Err(ServiceError::NotEnabled),
                Err("not-authorized") => Err(ServiceError::NotAuthorized),
                Err(_) => Err(ServiceError::Failed {
                    service: "upload-pack",
                    status: 128,
                }),
            }
        }
    }

    struct Harness {
        store: Arc<FakeStore>,
        engine: Arc<FakeEngine>,
        dispatcher: CommandDispatcher,
        releases: Arc<AtomicUsize>,
    }

    fn harness(outcome: Outcome, engine_result: Result<(), &'static str>) -> Harness {
        let releases = Arc::new(AtomicUsize::new(0));
        let store = Arc::new(FakeStore {
            opens: AtomicUsize::new(0),
            releases: Arc::clone(&releases),
            outcome,
        });
        let engine = Arc::new(FakeEngine {
            serves: AtomicUsize::new(0),
            result: engine_result,
        });
        let dispatcher = CommandDispatcher::new(
            RepositoryResolver::new(Arc::clone(&store) as Arc<dyn RepoStore>),
            Arc::clone(&engine) as Arc<dyn PackEngine>,
        );
        Harness {
            store,
            engine,
            dispatcher,
            releases,
        }
    }

    /// Run one command line through the harness; returns the exit code and
    /// everything written to the output stream.
    async fn run_line(h: &Harness, line: &str) -> (u32, Vec<u8>) {
        let (server_io, mut observed) = tokio::io::duplex(64 * 1024);

        let (exit, exit_rx) = ExitSink::new();
        let invocation = Invocation {
            identity: SessionIdentity {
                username: "alice".into(),
                fingerprint: "SHA256:test".into(),
            },
            streams: SessionStreams {
                input: Box::new(tokio::io::empty()),
                output: Box::new(server_io),
                error: Box::new(tokio::io::sink()),
            },
            exit,
            git_protocol: None,
        };

        h.dispatcher
            .run(GitCommand::parse(line), invocation)
            .await;

        let code = exit_rx.await.expect("an exit code is always signalled");
        let mut written = Vec::new();
        let _ = observed.read_to_end(&mut written).await;
        (code, written)
    }

    // -- lifecycle tests --------------------------------------------------

    #[tokio::test]
    async fn unknown_command_exits_127_without_touching_storage() {
        let h = harness(Outcome::Found, Ok(()));
        let (code, written) = run_line(&h, "foo bar").await;
        assert_eq!(code, EXIT_UNKNOWN_COMMAND);
        assert!(written.is_empty());
        assert_eq!(h.store.opens.load(Ordering::SeqCst), 0);
        assert_eq!(h.engine.serves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_upload_delegates_and_exits_zero() {
        let h = harness(Outcome::Found, Ok(()));
        let (code, written) = run_line(&h, "git-upload-pack /repo/a.git").await;
        assert_eq!(code, EXIT_OK);
        assert_eq!(written, b"0000");
        assert_eq!(h.engine.serves.load(Ordering::SeqCst), 1);
        assert_eq!(h.releases.load(Ordering::SeqCst), 1, "handle released exactly once");
    }

    #[tokio::test]
    async fn missing_repository_is_a_silent_exit_1() {
        let h = harness(Outcome::NotFound, Ok(()));
        let (code, written) = run_line(&h, "git-receive-pack /missing.git").await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(written.is_empty(), "silent rejection writes zero bytes");
        assert_eq!(h.engine.serves.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn not_found_and_unauthorized_look_identical() {
        let absent = harness(Outcome::NotFound, Ok(()));
        let forbidden = harness(Outcome::NotEnabled, Ok(()));
        let a = run_line(&absent, "git-upload-pack /x.git").await;
        let b = run_line(&forbidden, "git-upload-pack /x.git").await;
        assert_eq!(a, b);
        assert_eq!(a.0, EXIT_FAILURE);
        assert!(a.1.is_empty());
    }

    #[tokio::test]
    async fn malformed_path_never_reaches_the_store() {
        let h = harness(Outcome::Found, Ok(()));
        let (code, written) = run_line(&h, "git-upload-pack repo/a.git").await;
        assert_eq!(code, EXIT_FAILURE);
        assert!(written.is_empty());
        assert_eq!(h.store.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn may_not_continue_emits_one_framed_err_line() {
        let h = harness(Outcome::MayNotContinue("repo is migrating".into()), Ok(()));
        let (code, written) = run_line(&h, "git-upload-pack /x.git").await;
        assert_eq!(code, EXIT_FAILURE);

        // Exactly one correctly framed pkt-line.
        let declared =
            usize::from_str_radix(std::str::from_utf8(&written[..4]).unwrap(), 16).unwrap();
        assert_eq!(declared, written.len());
        assert_eq!(&written[4..], b"ERR repo is migrating\n");
    }

    #[tokio::test]
    async fn service_level_rejection_is_silent_and_releases_the_handle() {
        for reason in ["not-enabled", "not-authorized"] {
            let h = harness(Outcome::Found, Err(reason));
            let (code, written) = run_line(&h, "git-upload-pack /x.git").await;
            assert_eq!(code, EXIT_FAILURE);
            assert!(written.is_empty());
            assert_eq!(h.releases.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn engine_failure_exits_1_and_releases_the_handle() {
        let h = harness(Outcome::Found, Err("boom"));
        let (code, _) = run_line(&h, "git-upload-pack /x.git").await;
        assert_eq!(code, EXIT_FAILURE);
        assert_eq!(h.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_path_survives_the_unconditional_cleanup_signal() {
        // The cleanup step signals 1 after the success path signalled 0;
        // the receiver must still observe 0.
        let h = harness(Outcome::Found, Ok(()));
        let (code, _) = run_line(&h, "git-upload-pack /x.git").await;
        assert_eq!(code, EXIT_OK);
    }
}
