use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub daemon: DaemonSection,
    pub storage: StorageSection,
    #[serde(default)]
    pub access: AccessSection,
    #[serde(default)]
    pub limits: LimitsSection,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    /// Interface to bind (e.g. `127.0.0.1`).  Absent or empty binds all
    /// interfaces.
    #[serde(default)]
    pub bind_interface: Option<String>,
    /// Port to listen on.  The IANA ssh port (22) usually requires elevated
    /// privileges, hence the non-privileged default.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    2222
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    /// Directory holding daemon key material (host key, authorized keys).
    pub config_root: PathBuf,
    /// Root directory the bare repositories are served from.
    pub repo_root: PathBuf,
}

// ---------------------------------------------------------------------------
// Access
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessSection {
    /// Whether `git-receive-pack` is offered at all.
    pub allow_push: bool,
    /// Name of the authorized-keys file under the config root.
    pub authorized_keys: String,
}

impl Default for AccessSection {
    fn default() -> Self {
        Self {
            allow_push: true,
            authorized_keys: "authorized_keys".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Seconds of inactivity before a session is dropped.
    pub inactivity_timeout_secs: u64,
    /// Delay applied to rejected auth attempts.
    pub auth_rejection_delay_secs: u64,
    /// Auth attempts allowed before the connection is cut.
    pub max_auth_attempts: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 600,
            auth_rejection_delay_secs: 1,
            max_auth_attempts: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.limits.max_auth_attempts >= 1,
        "max_auth_attempts must be at least 1"
    );
    anyhow::ensure!(
        !config.access.authorized_keys.is_empty(),
        "authorized_keys file name must not be empty"
    );
    anyhow::ensure!(
        !config.storage.repo_root.as_os_str().is_empty(),
        "repo_root must not be empty"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "
daemon:
  port: 2222
storage:
  config_root: /var/lib/gitgate
  repo_root: /srv/git
";

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        validate_config(&config).unwrap();

        assert_eq!(config.daemon.port, 2222);
        assert!(config.daemon.bind_interface.is_none());
        assert!(config.access.allow_push);
        assert_eq!(config.access.authorized_keys, "authorized_keys");
        assert_eq!(config.limits.inactivity_timeout_secs, 600);
        assert_eq!(config.limits.max_auth_attempts, 3);
    }

    #[test]
    fn port_defaults_when_omitted() {
        let config: Config = serde_yaml::from_str(
            "
daemon: {}
storage:
  config_root: /var/lib/gitgate
  repo_root: /srv/git
",
        )
        .unwrap();
        assert_eq!(config.daemon.port, 2222);
    }

    #[test]
    fn zero_auth_attempts_is_rejected() {
        let config: Config = serde_yaml::from_str(
            "
daemon: {}
storage:
  config_root: /var/lib/gitgate
  repo_root: /srv/git
limits:
  max_auth_attempts: 0
",
        )
        .unwrap();
        assert!(validate_config(&config).is_err());
    }
}
