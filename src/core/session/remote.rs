//! Remote shell session over an authenticated SSH transport

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::buffer::ReadBuffer;
use super::{lock, Result, SessionError, SessionEvent, SessionIo};
use crate::auth::AuthenticatedConnection;
use crate::ssh::{Link, PtyRequest, ShellChannel, SshError, SshTransport};

const IDLE_BACKOFF: Duration = Duration::from_millis(5);

type SharedChannel = Arc<Mutex<Box<dyn ShellChannel>>>;

pub struct RemoteSession {
    channel: SharedChannel,
    transport: Option<Box<dyn Link>>,
    jump: Option<Box<dyn Link>>,
    pub(super) io: SessionIo,
    reader: Option<JoinHandle<()>>,
    label: String,
}

impl RemoteSession {
    /// Open a shell on an authenticated connection
    pub fn open<T>(
        conn: AuthenticatedConnection<T>,
        pty: &PtyRequest,
        label: impl Into<String>,
    ) -> Result<Self>
    where
        T: SshTransport + 'static,
    {
        let AuthenticatedConnection {
            mut transport,
            jump,
            ..
        } = conn;

        let channel = match transport.open_shell(pty) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %e, "cannot open shell");
                if let Err(e) = transport.disconnect() {
                    warn!(error = %e, "failed to disconnect transport");
                }
                if let Some(mut jump) = jump {
                    if let Err(e) = jump.disconnect() {
                        warn!(error = %e, "failed to disconnect jump host");
                    }
                }
                return Err(e.into());
            }
        };

        Ok(Self::start(
            channel,
            Box::new(transport),
            jump.map(|j| Box::new(j) as Box<dyn Link>),
            label.into(),
        ))
    }

    pub fn start(
        channel: Box<dyn ShellChannel>,
        transport: Box<dyn Link>,
        jump: Option<Box<dyn Link>>,
        label: String,
    ) -> Self {
        let channel: SharedChannel = Arc::new(Mutex::new(channel));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let reader_channel = channel.clone();
        let reader_running = running.clone();
        let reader = thread::spawn(move || reader_loop(reader_channel, reader_running, tx));

        info!(session = %label, "remote session started");
        Self {
            channel,
            transport: Some(transport),
            jump,
            io: SessionIo::new(rx, running),
            reader: Some(reader),
            label,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        if !self.io.is_active() {
            return Err(SessionError::NotActive);
        }
        lock(&self.channel).write(data)?;
        Ok(())
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        let mut channel = lock(&self.channel);
        match channel.resize(rows, cols) {
            Ok(()) => Ok(()),
            Err(e) if channel.is_closed() || !self.io.is_active() => {
                debug!(error = %e, "ignoring resize of closing channel");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, rows, cols, "window change failed");
                Err(e.into())
            }
        }
    }

    /// Channel, transport, jump, then the active flag
    pub fn close(&mut self) {
        let Some(mut transport) = self.transport.take() else {
            return;
        };

        if let Err(e) = lock(&self.channel).close() {
            debug!(error = %e, "channel close failed");
        }
        if let Err(e) = transport.disconnect() {
            warn!(error = %e, "failed to disconnect transport");
        }
        if let Some(mut jump) = self.jump.take() {
            if let Err(e) = jump.disconnect() {
                warn!(error = %e, "failed to disconnect jump host");
            }
        }
        self.io.deactivate();

        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("remote reader thread panicked");
            }
        }
        info!(session = %self.label, "remote session closed");
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(channel: SharedChannel, running: Arc<AtomicBool>, tx: Sender<SessionEvent>) {
    let mut buf = ReadBuffer::new();
    let mut reason = None;

    while running.load(Ordering::SeqCst) {
        let result = lock(&channel).read(buf.as_mut_slice());
        match result {
            Ok(0) => thread::sleep(IDLE_BACKOFF),
            Ok(n) => {
                buf.record(n);
                if tx.send(SessionEvent::Output(buf.filled(n).to_vec())).is_err() {
                    break;
                }
            }
            Err(SshError::ChannelClosed) => {
                reason = Some("connection closed by remote host".to_string());
                break;
            }
            Err(e) => {
                reason = Some(format!("connection lost: {}", e));
                break;
            }
        }
    }

    if let Some(reason) = reason {
        debug!(%reason, "remote reader finished");
        let _ = tx.send(SessionEvent::Closed { reason });
    }
    running.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::Session;
    use crate::auth::AuthMethod;
    use crate::ssh::{AuthOutcome, InteractiveStep};
    use std::collections::VecDeque;
    use std::time::Instant;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Default)]
    struct FakeChannel {
        incoming: VecDeque<Vec<u8>>,
        written: Vec<u8>,
        closed: bool,
        hang_up_when_drained: bool,
        refuse_resize: bool,
        log: Log,
    }

    impl ShellChannel for FakeChannel {
        fn read(&mut self, buf: &mut [u8]) -> crate::ssh::Result<usize> {
            if self.closed {
                return Err(SshError::ChannelClosed);
            }
            match self.incoming.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    Ok(n)
                }
                None if self.hang_up_when_drained => Err(SshError::ChannelClosed),
                None => Ok(0),
            }
        }

        fn write(&mut self, data: &[u8]) -> crate::ssh::Result<()> {
            self.written.extend_from_slice(data);
            Ok(())
        }

        fn resize(&mut self, _rows: u16, _cols: u16) -> crate::ssh::Result<()> {
            if self.closed {
                return Err(SshError::ChannelClosed);
            }
            if self.refuse_resize {
                return Err(SshError::Protocol("window change refused".into()));
            }
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn close(&mut self) -> crate::ssh::Result<()> {
            self.closed = true;
            self.log.lock().unwrap().push("channel".into());
            Ok(())
        }
    }

    struct FakeLink {
        name: &'static str,
        log: Log,
        fail: bool,
    }

    impl Link for FakeLink {
        fn disconnect(&mut self) -> crate::ssh::Result<()> {
            self.log.lock().unwrap().push(self.name.into());
            if self.fail {
                return Err(SshError::Protocol("already gone".into()));
            }
            Ok(())
        }
    }

    /// Transport whose shell request always fails
    struct NoShell {
        link: FakeLink,
    }

    impl Link for NoShell {
        fn disconnect(&mut self) -> crate::ssh::Result<()> {
            self.link.disconnect()
        }
    }

    impl SshTransport for NoShell {
        type Tunnel = ();

        fn auth_password(&mut self, _user: &str, _password: &str) -> crate::ssh::Result<AuthOutcome> {
            Ok(AuthOutcome::Success)
        }

        fn keyboard_interactive_start(&mut self, _user: &str) -> crate::ssh::Result<InteractiveStep> {
            Ok(InteractiveStep::Success)
        }

        fn keyboard_interactive_respond(
            &mut self,
            _responses: Vec<String>,
        ) -> crate::ssh::Result<InteractiveStep> {
            Ok(InteractiveStep::Success)
        }

        fn open_tunnel(&mut self, _host: &str, _port: u16) -> crate::ssh::Result<()> {
            Ok(())
        }

        fn open_shell(&mut self, _pty: &PtyRequest) -> crate::ssh::Result<Box<dyn ShellChannel>> {
            Err(SshError::Protocol("shell request refused".into()))
        }
    }

    fn session(channel: FakeChannel, log: &Log, failing_transport: bool) -> Session {
        let transport = FakeLink {
            name: "transport",
            log: log.clone(),
            fail: failing_transport,
        };
        let jump = FakeLink {
            name: "jump",
            log: log.clone(),
            fail: false,
        };
        Session::Remote(RemoteSession::start(
            Box::new(channel),
            Box::new(transport),
            Some(Box::new(jump)),
            "me@web".into(),
        ))
    }

    #[test]
    fn test_output_then_remote_hangup() {
        let log = Log::default();
        let channel = FakeChannel {
            incoming: VecDeque::from(vec![b"hel".to_vec(), b"lo".to_vec()]),
            hang_up_when_drained: true,
            log: log.clone(),
            ..FakeChannel::default()
        };
        let mut session = session(channel, &log, false);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut output = Vec::new();
        while Instant::now() < deadline && session.is_active() {
            if let Some(data) = session.read() {
                output.extend(data);
            }
            thread::sleep(Duration::from_millis(5));
        }
        if let Some(data) = session.read() {
            output.extend(data);
        }

        assert_eq!(output, b"hello");
        assert!(!session.is_active());
        assert_eq!(
            session.last_error().as_deref(),
            Some("connection closed by remote host")
        );
    }

    #[test]
    fn test_close_releases_in_order_and_once() {
        let log = Log::default();
        let channel = FakeChannel {
            log: log.clone(),
            ..FakeChannel::default()
        };
        let mut session = session(channel, &log, true);
        assert!(session.is_active());

        session.close();
        session.close();

        assert!(!session.is_active());
        assert_eq!(*log.lock().unwrap(), vec!["channel", "transport", "jump"]);
        assert!(matches!(session.send(b"x"), Err(SessionError::NotActive)));
        assert!(session.resize(24, 80).is_ok());
        assert_eq!(session.read(), None);
    }

    #[test]
    fn test_refused_resize_is_reported_while_active() {
        let log = Log::default();
        let channel = FakeChannel {
            refuse_resize: true,
            log: log.clone(),
            ..FakeChannel::default()
        };
        let mut session = session(channel, &log, false);

        assert!(matches!(
            session.resize(24, 80),
            Err(SessionError::Ssh(SshError::Protocol(_)))
        ));
        assert!(session.is_active());

        session.close();
        assert!(session.resize(24, 80).is_ok());
    }

    #[test]
    fn test_failed_shell_request_releases_both_links() {
        let log = Log::default();
        let link = |name, fail| NoShell {
            link: FakeLink {
                name,
                log: log.clone(),
                fail,
            },
        };
        let conn = AuthenticatedConnection {
            transport: link("transport", true),
            jump: Some(link("jump", false)),
            method: AuthMethod::Password,
        };
        let pty = PtyRequest {
            term: "xterm-256color".into(),
            rows: 24,
            cols: 80,
        };

        let result = RemoteSession::open(conn, &pty, "me@web");

        assert!(matches!(result, Err(SessionError::Ssh(SshError::Protocol(_)))));
        assert_eq!(*log.lock().unwrap(), vec!["transport", "jump"]);
    }
}
