//! SSH daemon lifecycle: bind address, host identity key, start/stop state,
//! and the wiring that composes the dispatcher out of its parts.
//!
//! Construction is side-effect free apart from host-key provisioning; no
//! socket is bound until [`SshDaemon::start`].  Start and stop are
//! serialized against each other, and the running flag only ever changes
//! under that lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use russh::server::Server as _;
use russh::MethodSet;
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auth::{AuthorizedKeys, PublicKeyAuthenticator, StaticPolicy};
use crate::command::CommandDispatcher;
use crate::config::Config;
use crate::repo::{FsRepoStore, RepositoryResolver};
use crate::service::GitPackEngine;
use crate::ssh::server::SshServer;

/// 22: IANA assigned port number for ssh.  This "default" is what the git
/// protocol itself assumes when it sees an ssh URL without a port; it is a
/// distinct concept from the port the daemon is configured to listen on.
pub const DEFAULT_PORT: u16 = 22;

/// Fixed host-key filename under the configuration root.
const HOST_KEY_FILE: &str = "host_key.pem";

// ---------------------------------------------------------------------------
// Bind address
// ---------------------------------------------------------------------------

/// Immutable (interface, port) pair.  No interface means all interfaces.
#[derive(Debug, Clone)]
pub struct BindAddress {
    interface: Option<String>,
    port: u16,
}

impl BindAddress {
    pub fn new(interface: Option<String>, port: u16) -> Self {
        let interface = interface.filter(|s| !s.is_empty());
        Self { interface, port }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn host(&self) -> &str {
        self.interface.as_deref().unwrap_or("0.0.0.0")
    }
}

impl std::fmt::Display for BindAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host(), self.port)
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the host key from `config_root/host_key.pem`, generating and
/// persisting a fresh Ed25519 key on first run.
fn load_or_create_host_key(config_root: &Path) -> Result<KeyPair> {
    let path = config_root.join(HOST_KEY_FILE);

    if path.exists() {
        let key = russh_keys::load_secret_key(&path, None)
            .with_context(|| format!("failed to load host key: {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    let key = KeyPair::generate_ed25519();

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode host key")?;

    std::fs::create_dir_all(config_root).with_context(|| {
        format!("failed to create config root: {}", config_root.display())
    })?;
    std::fs::write(&path, &pem)
        .with_context(|| format!("failed to write host key: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to set host key permissions: {}", path.display()))?;
    }

    info!(path = %path.display(), "generated new Ed25519 SSH host key");
    Ok(key)
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon lifecycle: each instance listens at most once.
#[derive(Debug, PartialEq, Eq)]
enum LifecycleState {
    Idle,
    Listening,
    Stopped,
}

/// Owns the transport configuration, the command dispatcher wiring, and the
/// listening state.
pub struct SshDaemon {
    address: BindAddress,
    ssh_config: Arc<russh::server::Config>,
    dispatcher: Arc<CommandDispatcher>,
    authenticator: Arc<dyn PublicKeyAuthenticator>,
    running: AtomicBool,
    /// Lifecycle state plus the accept-loop task.  Guarded by one lock so
    /// concurrent start/stop calls are mutually exclusive; the `running`
    /// flag is only ever written while the lock is held.
    state: Mutex<(LifecycleState, Option<JoinHandle<()>>)>,
}

impl SshDaemon {
    /// Compose a daemon for `address`, serving repositories under
    /// `repo_root` and keeping key material under `config_root`.
    ///
    /// Provisions the host key (load-or-generate) but binds no socket.
    pub fn new(
        address: BindAddress,
        config_root: &Path,
        repo_root: &Path,
        settings: &Config,
    ) -> Result<Self> {
        let host_key = load_or_create_host_key(config_root)?;

        let ssh_config = Arc::new(russh::server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            inactivity_timeout: Some(Duration::from_secs(
                settings.limits.inactivity_timeout_secs,
            )),
            auth_rejection_time: Duration::from_secs(settings.limits.auth_rejection_delay_secs),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: settings.limits.max_auth_attempts,
            ..Default::default()
        });

        let authenticator: Arc<dyn PublicKeyAuthenticator> = Arc::new(AuthorizedKeys::load(
            &config_root.join(&settings.access.authorized_keys),
        )?);

        let policy = Arc::new(StaticPolicy::new(settings.access.allow_push));
        let store = Arc::new(FsRepoStore::new(
            PathBuf::from(repo_root),
            Arc::clone(&policy) as _,
        ));
        let engine = Arc::new(GitPackEngine::new(
            policy as _,
            settings.access.allow_push,
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            RepositoryResolver::new(store as _),
            engine as _,
        ));

        Ok(Self {
            address,
            ssh_config,
            dispatcher,
            authenticator,
            running: AtomicBool::new(false),
            state: Mutex::new((LifecycleState::Idle, None)),
        })
    }

    /// Bind the listener and start accepting sessions.
    ///
    /// Fails if the daemon is already running, and again once it has been
    /// stopped: each instance transitions into listening exactly once.  The
    /// running flag is untouched on failure, and binding errors surface
    /// here, before the flag flips.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.0 {
            LifecycleState::Idle => {}
            LifecycleState::Listening => bail!("ssh daemon is already running"),
            LifecycleState::Stopped => bail!("ssh daemon has been stopped"),
        }

        let listener = TcpListener::bind((self.address.host(), self.address.port))
            .await
            .with_context(|| format!("failed to bind ssh listener on {}", self.address))?;
        let bound = listener.local_addr().context("listener has no local address")?;

        let mut server = SshServer::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.authenticator),
        );
        let config = Arc::clone(&self.ssh_config);

        let task = tokio::spawn(async move {
            if let Err(e) = server.run_on_socket(config, &listener).await {
                error!(error = %e, "ssh accept loop exited with error");
            }
        });

        *state = (LifecycleState::Listening, Some(task));
        self.running.store(true, Ordering::SeqCst);
        info!(address = %bound, "ssh daemon is listening");
        Ok(())
    }

    /// `true` while the daemon is accepting connections.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop accepting new sessions.  A no-op if the daemon is not running;
    /// in-flight sessions are left to drain on their own.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if state.0 != LifecycleState::Listening {
            return;
        }

        info!("ssh daemon stopping");
        state.0 = LifecycleState::Stopped;
        self.running.store(false, Ordering::SeqCst);

        if let Some(task) = state.1.take() {
            task.abort();
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    // Diagnostics only; the daemon is stopped regardless.
                    warn!(error = %e, "ssh accept loop ended abnormally during stop");
                }
            }
        }
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    /// Client-facing connection string for a repository served by this
    /// daemon.  The bare `user@host/path` form only applies on the protocol
    /// default port; anywhere else the port must be spelled out.
    pub fn format_url(&self, user: &str, host: &str, repo: &str) -> String {
        if self.port() == DEFAULT_PORT {
            format!("{user}@{host}/{repo}")
        } else {
            format!("ssh://{user}@{host}:{}/{repo}", self.port())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AccessSection, Config, DaemonSection, LimitsSection, StorageSection};

    fn test_config(root: &Path) -> Config {
        Config {
            daemon: DaemonSection {
                bind_interface: Some("127.0.0.1".into()),
                port: 0,
            },
            storage: StorageSection {
                config_root: root.join("conf"),
                repo_root: root.join("repos"),
            },
            access: AccessSection::default(),
            limits: LimitsSection::default(),
        }
    }

    fn test_daemon(root: &Path, port: u16) -> SshDaemon {
        let config = test_config(root);
        SshDaemon::new(
            BindAddress::new(Some("127.0.0.1".into()), port),
            &config.storage.config_root,
            &config.storage.repo_root,
            &config,
        )
        .unwrap()
    }

    #[test]
    fn bind_address_defaults_to_all_interfaces() {
        let addr = BindAddress::new(None, 2222);
        assert_eq!(addr.host(), "0.0.0.0");
        assert_eq!(addr.to_string(), "0.0.0.0:2222");

        let empty = BindAddress::new(Some(String::new()), 2222);
        assert_eq!(empty.host(), "0.0.0.0");
    }

    #[tokio::test]
    async fn format_url_uses_bare_form_on_the_default_port() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = test_daemon(tmp.path(), DEFAULT_PORT);
        assert_eq!(daemon.format_url("user", "host", "path"), "user@host/path");
    }

    #[tokio::test]
    async fn format_url_spells_out_nonstandard_ports() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = test_daemon(tmp.path(), 2222);
        assert_eq!(
            daemon.format_url("user", "host", "path"),
            "ssh://user@host:2222/path"
        );
    }

    #[tokio::test]
    async fn host_key_is_created_once_and_reused() {
        let tmp = tempfile::tempdir().unwrap();
        let _ = test_daemon(tmp.path(), 0);
        let key_path = tmp.path().join("conf").join(HOST_KEY_FILE);
        assert!(key_path.is_file());

        let first = std::fs::read(&key_path).unwrap();
        let _ = test_daemon(tmp.path(), 0);
        let second = std::fs::read(&key_path).unwrap();
        assert_eq!(first, second, "existing key must be reloaded, not replaced");
    }

    #[tokio::test]
    async fn double_start_errors_and_leaves_the_daemon_running() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = test_daemon(tmp.path(), 0);

        daemon.start().await.unwrap();
        assert!(daemon.is_running());

        let err = daemon.start().await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        assert!(daemon.is_running());

        daemon.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = test_daemon(tmp.path(), 0);

        // Stopping a daemon that never started is a no-op.
        daemon.stop().await;
        assert!(!daemon.is_running());

        daemon.start().await.unwrap();
        daemon.stop().await;
        assert!(!daemon.is_running());

        daemon.stop().await;
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn a_stopped_daemon_cannot_listen_again() {
        let tmp = tempfile::tempdir().unwrap();
        let daemon = test_daemon(tmp.path(), 0);

        daemon.start().await.unwrap();
        daemon.stop().await;

        let err = daemon.start().await.unwrap_err();
        assert!(err.to_string().contains("stopped"));
        assert!(!daemon.is_running());
    }
}
