//! SSH transport capability
//!
//! The authentication engine and remote sessions only talk to SSH through
//! the traits in this module. [`client::RusshClient`] implements them on top
//! of `russh`; tests plug in scripted fakes.

pub mod client;

use thiserror::Error;

use crate::auth::{AuthMethod, Credentials};

pub use client::RusshClient;

#[derive(Error, Debug)]
pub enum SshError {
    /// The host could not be reached or the connection dropped
    #[error("cannot reach {host}:{port}: {reason}")]
    Network {
        host: String,
        port: u16,
        reason: String,
    },

    /// The server refused the offered credentials
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel closed")]
    ChannelClosed,
}

impl SshError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SshError::AuthRejected(_))
    }
}

pub type Result<T> = std::result::Result<T, SshError>;

/// Where a new transport connects to
#[derive(Debug)]
pub enum Endpoint<T> {
    Direct { host: String, port: u16 },
    /// Over a forwarding channel opened on a jump host
    Tunneled(T),
}

/// Result of a single password or public-key request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    /// Accepted, but the server wants more factors
    Partial,
    Failure,
}

/// A prompt inside a keyboard-interactive challenge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    /// Whether the answer may be shown while typed
    pub echo: bool,
}

impl Prompt {
    pub fn new(text: impl Into<String>, echo: bool) -> Self {
        Self {
            text: text.into(),
            echo,
        }
    }
}

/// Keyboard-interactive info request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Challenge {
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<Prompt>,
}

/// Server reply during keyboard-interactive authentication
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InteractiveStep {
    Success,
    Failure { partial: bool },
    InfoRequest(Challenge),
}

/// Pseudo-terminal parameters for a remote shell
#[derive(Clone, Debug)]
pub struct PtyRequest {
    pub term: String,
    pub rows: u16,
    pub cols: u16,
}

/// Anything holding a connection that must be torn down
pub trait Link: Send {
    fn disconnect(&mut self) -> Result<()>;
}

/// An SSH connection, authenticated or not
pub trait SshTransport: Link {
    /// Forwarding channel usable as an [`Endpoint::Tunneled`]
    type Tunnel: Send;

    fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthOutcome>;

    fn keyboard_interactive_start(&mut self, user: &str) -> Result<InteractiveStep>;

    fn keyboard_interactive_respond(&mut self, responses: Vec<String>) -> Result<InteractiveStep>;

    /// Open a `direct-tcpip` channel to `host:port`
    fn open_tunnel(&mut self, host: &str, port: u16) -> Result<Self::Tunnel>;

    fn open_shell(&mut self, pty: &PtyRequest) -> Result<Box<dyn ShellChannel>>;
}

/// Factory for transports
pub trait SshClient: Send + Sync {
    type Transport: SshTransport + 'static;

    /// Handshake only
    fn connect(&self, endpoint: Endpoint<TunnelOf<Self>>) -> Result<Self::Transport>;

    /// Handshake plus one authentication attempt with whatever `creds`
    /// carries (key, else password, else `none`). Fails with
    /// [`SshError::AuthRejected`] when the server refuses.
    fn connect_authenticated(
        &self,
        endpoint: Endpoint<TunnelOf<Self>>,
        creds: &Credentials,
    ) -> Result<(Self::Transport, AuthMethod)>;
}

pub type TunnelOf<C> = <<C as SshClient>::Transport as SshTransport>::Tunnel;

/// Interactive shell channel with a non-blocking read side
pub trait ShellChannel: Send {
    /// Copy available output into `buf`. `Ok(0)` means nothing is ready;
    /// `Err(SshError::ChannelClosed)` means the remote side is gone.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn write(&mut self, data: &[u8]) -> Result<()>;

    fn resize(&mut self, rows: u16, cols: u16) -> Result<()>;

    fn is_closed(&self) -> bool;

    fn close(&mut self) -> Result<()>;
}
