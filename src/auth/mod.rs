//! Connection authentication
//!
//! Drives a connection to a target host, optionally through a jump host,
//! trying keyboard-interactive (MFA) first and password second.
//!
//! ```text
//! Init ─┬─> JumpConnect -> JumpAuth -> TunnelOpen ─┐
//!       └──────────────────────────────────────────┴─> TargetConnect -> TargetAuth -> Authenticated
//!                       (any state) -> Failed
//! ```

pub mod engine;
pub mod prompt;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ssh::SshError;

pub use engine::{AuthEngine, AuthPolicy, AuthenticatedConnection, InteractiveAttempt};
pub use prompt::{
    prompt_channel, ChannelPrompter, PasswordRetry, PromptError, PromptRequest, PromptResolver,
};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Engine state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    Init,
    JumpConnect,
    JumpAuth,
    TunnelOpen,
    TargetConnect,
    TargetAuth,
    Authenticated,
    Failed,
}

impl AuthState {
    pub fn can_transition_to(self, next: AuthState) -> bool {
        use AuthState::*;
        match (self, next) {
            (Authenticated | Failed, _) => false,
            (_, Failed) => true,
            (Init, JumpConnect | TargetConnect) => true,
            (JumpConnect, JumpAuth) => true,
            (JumpAuth, TunnelOpen) => true,
            (TunnelOpen, TargetConnect) => true,
            (TargetConnect, TargetAuth | Authenticated) => true,
            (TargetAuth, Authenticated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthState::Init => "init",
            AuthState::JumpConnect => "jump-connect",
            AuthState::JumpAuth => "jump-auth",
            AuthState::TunnelOpen => "tunnel-open",
            AuthState::TargetConnect => "target-connect",
            AuthState::TargetAuth => "target-auth",
            AuthState::Authenticated => "authenticated",
            AuthState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which host an attempt was made against
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Jump,
    Target,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Jump => "jump",
            Stage::Target => "target",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// The `none` method, offered when no credential is stored
    None,
    Interactive,
    Password,
    PublicKey,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptResult {
    Success,
    Partial,
    Failed,
}

/// One authentication attempt, in the order made
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AuthAttempt {
    pub method: AuthMethod,
    pub stage: Stage,
    pub result: AttemptResult,
}

/// Login details for one host
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_file: Option<PathBuf>,
}

impl Credentials {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: None,
            key_file: None,
        }
    }

    /// Copy with a different password
    pub fn with_password(&self, password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
            ..self.clone()
        }
    }

    pub fn with_key_file(&self, key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: Some(key_file.into()),
            ..self.clone()
        }
    }

    /// Method used by a one-shot connect: key, else password, else none
    pub fn convenience_method(&self) -> AuthMethod {
        if self.key_file.is_some() {
            AuthMethod::PublicKey
        } else if self.password.is_some() {
            AuthMethod::Password
        } else {
            AuthMethod::None
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("key_file", &self.key_file)
            .finish()
    }
}

/// Bastion host to tunnel through
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct JumpHostConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
}

impl Default for JumpHostConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
            password: None,
        }
    }
}

impl JumpHostConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            key_file: None,
        }
    }
}

impl fmt::Debug for JumpHostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JumpHostConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// Every method was tried and refused
    Exhausted,
    /// The user declined a prompt
    Cancelled,
    /// A prompt went unanswered
    TimedOut,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureReason::Exhausted => "all authentication methods exhausted",
            FailureReason::Cancelled => "cancelled by user",
            FailureReason::TimedOut => "prompt timed out",
        })
    }
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("cannot connect to {stage} host {host}: {source}")]
    Connection {
        stage: Stage,
        host: String,
        #[source]
        source: SshError,
    },

    #[error("authentication failed on {stage} host {host}: {reason}")]
    Failed {
        stage: Stage,
        host: String,
        reason: FailureReason,
    },

    #[error("cannot open tunnel to {host} through the jump host: {source}")]
    Tunnel {
        host: String,
        #[source]
        source: SshError,
    },
}

impl AuthError {
    pub fn stage(&self) -> Stage {
        match self {
            AuthError::Connection { stage, .. } | AuthError::Failed { stage, .. } => *stage,
            AuthError::Tunnel { .. } => Stage::Jump,
        }
    }
}
