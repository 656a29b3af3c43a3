//! russh-backed SSH client
//!
//! The engine and sessions are synchronous, so every call blocks on a shared
//! multi-thread runtime. Interactive shells are served by a pump task that
//! moves data between the russh channel and plain mpsc channels.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::{self, load_secret_key, HashAlg, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

use super::{
    AuthOutcome, Challenge, Endpoint, InteractiveStep, Link, Prompt, PtyRequest, Result,
    ShellChannel, SshClient, SshError, SshTransport,
};
use crate::auth::{AuthMethod, Credentials};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(20);

/// Accepts every host key and logs its fingerprint
struct TrustingHandler {
    host: String,
}

impl client::Handler for TrustingHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> impl Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        info!(host = %self.host, %fingerprint, "accepting host key");
        async { Ok(true) }
    }
}

pub struct RusshClient {
    runtime: Arc<Runtime>,
    connect_timeout: Duration,
    keepalive: Duration,
}

impl RusshClient {
    pub fn new(connect_timeout: Duration, keepalive: Duration) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("hopterm-ssh")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
            connect_timeout,
            keepalive,
        })
    }

    fn config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.keepalive),
            keepalive_max: 3,
            ..client::Config::default()
        })
    }

    async fn handshake(&self, endpoint: Endpoint<RusshTunnel>) -> Result<RusshTransport> {
        let config = self.config();
        let (handle, host, port) = match endpoint {
            Endpoint::Direct { host, port } => {
                debug!(%host, port, "opening tcp connection");
                let tcp = tokio::time::timeout(
                    self.connect_timeout,
                    TcpStream::connect((host.as_str(), port)),
                )
                .await
                .map_err(|_| network(&host, port, "connection timed out"))?
                .map_err(|e| network(&host, port, e))?;
                let _ = tcp.set_nodelay(true);

                let handler = TrustingHandler { host: host.clone() };
                let handle = client::connect_stream(config, tcp, handler)
                    .await
                    .map_err(|e| network(&host, port, e))?;
                (handle, host, port)
            }
            Endpoint::Tunneled(tunnel) => {
                let RusshTunnel {
                    channel,
                    host,
                    port,
                } = tunnel;
                debug!(%host, port, "handshake over tunnel");
                let handler = TrustingHandler { host: host.clone() };
                let handle = client::connect_stream(config, channel.into_stream(), handler)
                    .await
                    .map_err(|e| network(&host, port, e))?;
                (handle, host, port)
            }
        };

        info!(%host, port, "ssh handshake complete");
        Ok(RusshTransport {
            runtime: self.runtime.clone(),
            handle,
            host,
        })
    }
}

impl SshClient for RusshClient {
    type Transport = RusshTransport;

    fn connect(&self, endpoint: Endpoint<RusshTunnel>) -> Result<RusshTransport> {
        self.runtime.block_on(self.handshake(endpoint))
    }

    fn connect_authenticated(
        &self,
        endpoint: Endpoint<RusshTunnel>,
        creds: &Credentials,
    ) -> Result<(RusshTransport, AuthMethod)> {
        let mut transport = self.connect(endpoint)?;
        let method = creds.convenience_method();

        let outcome = match (&creds.key_file, &creds.password) {
            (Some(path), _) => transport.auth_publickey(&creds.username, path),
            (None, Some(password)) => transport.auth_password(&creds.username, password),
            (None, None) => transport.auth_none(&creds.username),
        };

        let err = match outcome {
            Ok(AuthOutcome::Success) => return Ok((transport, method)),
            Ok(_) => SshError::AuthRejected(format!("{:?} login refused", method)),
            Err(e) => e,
        };
        if let Err(e) = transport.disconnect() {
            warn!(host = %transport.host, error = %e, "disconnect after refused login failed");
        }
        Err(err)
    }
}

/// `direct-tcpip` channel to the next host
pub struct RusshTunnel {
    channel: Channel<Msg>,
    host: String,
    port: u16,
}

pub struct RusshTransport {
    runtime: Arc<Runtime>,
    handle: client::Handle<TrustingHandler>,
    host: String,
}

impl RusshTransport {
    fn auth_none(&mut self, user: &str) -> Result<AuthOutcome> {
        let result = self
            .runtime
            .block_on(self.handle.authenticate_none(user))
            .map_err(protocol)?;
        Ok(outcome(result))
    }

    fn auth_publickey(&mut self, user: &str, path: &std::path::Path) -> Result<AuthOutcome> {
        let key = load_secret_key(path, None).map_err(|e| {
            SshError::AuthRejected(format!("cannot load key {}: {}", path.display(), e))
        })?;

        let handle = &mut self.handle;
        let result = self.runtime.block_on(async {
            let hash = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
            handle.authenticate_publickey(user, key).await
        });
        Ok(outcome(result.map_err(protocol)?))
    }
}

impl Link for RusshTransport {
    fn disconnect(&mut self) -> Result<()> {
        debug!(host = %self.host, "disconnecting");
        self.runtime
            .block_on(
                self.handle
                    .disconnect(Disconnect::ByApplication, "", "en"),
            )
            .map_err(protocol)
    }
}

impl SshTransport for RusshTransport {
    type Tunnel = RusshTunnel;

    fn auth_password(&mut self, user: &str, password: &str) -> Result<AuthOutcome> {
        let result = self
            .runtime
            .block_on(self.handle.authenticate_password(user, password))
            .map_err(protocol)?;
        Ok(outcome(result))
    }

    fn keyboard_interactive_start(&mut self, user: &str) -> Result<InteractiveStep> {
        let response = self
            .runtime
            .block_on(
                self.handle
                    .authenticate_keyboard_interactive_start(user, None::<String>),
            )
            .map_err(protocol)?;
        Ok(interactive_step(response))
    }

    fn keyboard_interactive_respond(&mut self, responses: Vec<String>) -> Result<InteractiveStep> {
        let response = self
            .runtime
            .block_on(self.handle.authenticate_keyboard_interactive_respond(responses))
            .map_err(protocol)?;
        Ok(interactive_step(response))
    }

    fn open_tunnel(&mut self, host: &str, port: u16) -> Result<RusshTunnel> {
        debug!(via = %self.host, %host, port, "opening direct-tcpip channel");
        let channel = self
            .runtime
            .block_on(self.handle.channel_open_direct_tcpip(
                host,
                u32::from(port),
                "127.0.0.1",
                0,
            ))
            .map_err(protocol)?;
        Ok(RusshTunnel {
            channel,
            host: host.to_string(),
            port,
        })
    }

    fn open_shell(&mut self, pty: &PtyRequest) -> Result<Box<dyn ShellChannel>> {
        let handle = &self.handle;
        let channel = self
            .runtime
            .block_on(async {
                let channel = handle.channel_open_session().await?;
                channel
                    .request_pty(
                        false,
                        &pty.term,
                        u32::from(pty.cols),
                        u32::from(pty.rows),
                        0,
                        0,
                        &[],
                    )
                    .await?;
                channel.request_shell(true).await?;
                Ok::<_, russh::Error>(channel)
            })
            .map_err(protocol)?;

        let (output_tx, output_rx) = std_mpsc::channel();
        let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.runtime
            .spawn(pump(channel, command_rx, output_tx, closed.clone()));

        info!(host = %self.host, term = %pty.term, rows = pty.rows, cols = pty.cols, "shell opened");
        Ok(Box::new(RusshShell {
            commands: command_tx,
            output: output_rx,
            pending: Vec::new(),
            closed,
        }))
    }
}

enum PumpCommand {
    Data(Vec<u8>),
    Resize { rows: u16, cols: u16 },
    Close,
}

async fn pump(
    mut channel: Channel<Msg>,
    mut commands: tokio_mpsc::UnboundedReceiver<PumpCommand>,
    output: std_mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if output.send(data.to_vec()).is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "remote shell exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
            command = commands.recv() => match command {
                Some(PumpCommand::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        warn!(error = %e, "channel write failed");
                        break;
                    }
                }
                Some(PumpCommand::Resize { rows, cols }) => {
                    if let Err(e) = channel
                        .window_change(u32::from(cols), u32::from(rows), 0, 0)
                        .await
                    {
                        warn!(error = %e, "window change failed");
                    }
                }
                Some(PumpCommand::Close) | None => {
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                    break;
                }
            },
        }
    }
    closed.store(true, Ordering::SeqCst);
    drop(output);
    debug!("shell pump finished");
}

/// Synchronous side of a pumped shell channel
struct RusshShell {
    commands: tokio_mpsc::UnboundedSender<PumpCommand>,
    output: std_mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
    closed: Arc<AtomicBool>,
}

impl RusshShell {
    fn send(&self, command: PumpCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SshError::ChannelClosed)
    }
}

impl ShellChannel for RusshShell {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            match self.output.try_recv() {
                Ok(chunk) => self.pending = chunk,
                Err(TryRecvError::Empty) => return Ok(0),
                // The pump drops its sender only after the last chunk is queued
                Err(TryRecvError::Disconnected) => return Err(SshError::ChannelClosed),
            }
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.send(PumpCommand::Data(data.to_vec()))
    }

    fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        self.send(PumpCommand::Resize { rows, cols })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&mut self) -> Result<()> {
        // The pump may already be gone
        let _ = self.send(PumpCommand::Close);
        Ok(())
    }
}

fn outcome(result: AuthResult) -> AuthOutcome {
    match result {
        AuthResult::Success => AuthOutcome::Success,
        AuthResult::Failure {
            partial_success: true,
            ..
        } => AuthOutcome::Partial,
        AuthResult::Failure { .. } => AuthOutcome::Failure,
    }
}

fn interactive_step(response: KeyboardInteractiveAuthResponse) -> InteractiveStep {
    match response {
        KeyboardInteractiveAuthResponse::Success => InteractiveStep::Success,
        KeyboardInteractiveAuthResponse::Failure {
            partial_success, ..
        } => InteractiveStep::Failure {
            partial: partial_success,
        },
        KeyboardInteractiveAuthResponse::InfoRequest {
            name,
            instructions,
            prompts,
        } => InteractiveStep::InfoRequest(Challenge {
            name,
            instructions,
            prompts: prompts
                .into_iter()
                .map(|p| Prompt::new(p.prompt, p.echo))
                .collect(),
        }),
    }
}

fn network(host: &str, port: u16, reason: impl ToString) -> SshError {
    SshError::Network {
        host: host.to_string(),
        port,
        reason: reason.to_string(),
    }
}

fn protocol(e: russh::Error) -> SshError {
    SshError::Protocol(e.to_string())
}
