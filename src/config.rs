//! Configuration for hopterm.
//!
//! Loaded from `~/.hopterm/config.toml`; a missing file means defaults.
//!
//! ```toml
//! # Default shell (optional)
//! shell = "/bin/zsh"
//!
//! [terminal]
//! scrollback_limit = 10000
//! render_interval_ms = 16
//! term = "xterm-256color"
//!
//! [ssh]
//! prompt_timeout_secs = 120
//! max_password_attempts = 2
//! max_interactive_rounds = 3
//!
//! [[sessions]]
//! name = "prod"
//! host = "10.0.0.5"
//! username = "deploy"
//! [sessions.proxy_jump]
//! enabled = true
//! host = "bastion"
//! username = "b"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::auth::prompt::DEFAULT_PROMPT_TIMEOUT;
use crate::auth::{AuthPolicy, Credentials, JumpHostConfig, DEFAULT_SSH_PORT};
use crate::core::term::DEFAULT_SCROLLBACK;
use crate::ssh::client::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEPALIVE};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default shell command
    pub shell: Option<String>,
    pub terminal: TerminalConfig,
    pub ssh: SshConfig,
    /// Saved connection profiles
    pub sessions: Vec<SessionProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub scrollback_limit: usize,
    /// Minimum time between two redraws
    pub render_interval_ms: u64,
    /// `TERM` announced to shells and remote hosts
    pub term: String,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            scrollback_limit: DEFAULT_SCROLLBACK,
            render_interval_ms: 16,
            term: "xterm-256color".to_string(),
        }
    }
}

impl TerminalConfig {
    pub fn render_interval(&self) -> Duration {
        Duration::from_millis(self.render_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub prompt_timeout_secs: u64,
    pub max_password_attempts: u32,
    pub max_interactive_rounds: u32,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        let policy = AuthPolicy::default();
        Self {
            prompt_timeout_secs: DEFAULT_PROMPT_TIMEOUT.as_secs(),
            max_password_attempts: policy.max_password_attempts,
            max_interactive_rounds: policy.max_interactive_rounds,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            keepalive_secs: DEFAULT_KEEPALIVE.as_secs(),
        }
    }
}

impl SshConfig {
    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_secs(self.prompt_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn policy(&self) -> AuthPolicy {
        AuthPolicy {
            max_password_attempts: self.max_password_attempts.max(1),
            max_interactive_rounds: self.max_interactive_rounds.max(1),
        }
    }
}

/// A saved SSH connection
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionProfile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_file: Option<String>,
    pub proxy_jump: JumpHostConfig,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
            password: None,
            key_file: None,
            proxy_jump: JumpHostConfig::default(),
        }
    }
}

impl std::fmt::Debug for SessionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionProfile")
            .field("name", &self.name)
            .field("credentials", &self.credentials())
            .field("proxy_jump", &self.proxy_jump)
            .finish()
    }
}

impl SessionProfile {
    pub fn credentials(&self) -> Credentials {
        let mut creds = Credentials::new(&self.host, self.port, &self.username);
        creds.password = self.password.clone();
        creds.key_file = self.key_file.as_deref().map(expand_home);
        creds
    }
}

impl Config {
    /// Load configuration, falling back to defaults on any problem
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "using default configuration");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn session(&self, name: &str) -> Option<&SessionProfile> {
        self.sessions.iter().find(|s| s.name == name)
    }

    fn config_path() -> Option<PathBuf> {
        data_dir().map(|dir| dir.join("config.toml"))
    }
}

/// `~/.hopterm`, created on first use
pub fn data_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".hopterm");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
