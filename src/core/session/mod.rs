//! Session management
//!
//! A session is a byte pipe to a shell, either local or over SSH. Each one
//! owns a background reader thread that forwards output over a channel;
//! the UI thread drains it with [`Session::read`].

pub mod buffer;
pub mod local;
pub mod remote;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use super::pty::PtyError;
use crate::ssh::SshError;

pub use buffer::ReadBuffer;
pub use local::LocalSession;
pub use remote::RemoteSession;

/// Events sent by a reader thread
#[derive(Debug)]
pub enum SessionEvent {
    /// Raw output bytes
    Output(Vec<u8>),
    /// The shell or connection ended
    Closed { reason: String },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session is not active")]
    NotActive,

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("write failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// A local or remote shell session
pub enum Session {
    Local(LocalSession),
    Remote(RemoteSession),
}

impl Session {
    /// Write input; writers are serialized
    pub fn send(&self, data: &[u8]) -> Result<()> {
        match self {
            Session::Local(s) => s.send(data),
            Session::Remote(s) => s.send(data),
        }
    }

    /// Drain all output received so far; `None` when there is nothing new
    pub fn read(&mut self) -> Option<Vec<u8>> {
        self.io_mut().drain()
    }

    pub fn is_active(&self) -> bool {
        self.io().is_active()
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        match self {
            Session::Local(s) => s.resize(rows, cols),
            Session::Remote(s) => s.resize(rows, cols),
        }
    }

    /// Release everything; safe to call repeatedly
    pub fn close(&mut self) {
        match self {
            Session::Local(s) => s.close(),
            Session::Remote(s) => s.close(),
        }
    }

    /// Why the session ended, if it did on its own
    pub fn last_error(&self) -> Option<String> {
        self.io().last_error()
    }

    pub fn label(&self) -> &str {
        match self {
            Session::Local(s) => s.label(),
            Session::Remote(s) => s.label(),
        }
    }

    fn io(&self) -> &SessionIo {
        match self {
            Session::Local(s) => &s.io,
            Session::Remote(s) => &s.io,
        }
    }

    fn io_mut(&mut self) -> &mut SessionIo {
        match self {
            Session::Local(s) => &mut s.io,
            Session::Remote(s) => &mut s.io,
        }
    }
}

/// Receiving end of a reader thread plus the shared liveness flag
pub(crate) struct SessionIo {
    rx: Receiver<SessionEvent>,
    running: Arc<AtomicBool>,
    last_error: Option<String>,
}

impl SessionIo {
    pub(crate) fn new(rx: Receiver<SessionEvent>, running: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            running,
            last_error: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn deactivate(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }

    pub(crate) fn drain(&mut self) -> Option<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(SessionEvent::Output(bytes)) => data.extend_from_slice(&bytes),
                Ok(SessionEvent::Closed { reason }) => {
                    self.deactivate();
                    self.last_error = Some(reason);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.deactivate();
                    break;
                }
            }
        }
        (!data.is_empty()).then_some(data)
    }
}

/// Lock ignoring poisoning; the guarded handles stay usable after a panic
pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
