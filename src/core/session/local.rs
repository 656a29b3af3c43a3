//! Local shell session

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{lock, Result, SessionError, SessionEvent, SessionIo};
use crate::core::pty::{LocalProcess, ProcessIo, ShellCommand};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 4096;

pub struct LocalSession {
    process: Arc<Mutex<LocalProcess>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    pub(super) io: SessionIo,
    reader: Option<JoinHandle<()>>,
    label: String,
    closed: bool,
}

impl LocalSession {
    /// Spawn the shell and start reading its output
    pub fn spawn(cmd: &ShellCommand) -> Result<Self> {
        let (process, io) = LocalProcess::spawn(cmd)?;
        Ok(Self::start(process, io))
    }

    pub fn start(process: LocalProcess, io: ProcessIo) -> Self {
        let label = process.program().to_string();
        let process = Arc::new(Mutex::new(process));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel();

        let reader_process = process.clone();
        let reader_running = running.clone();
        let reader = thread::spawn(move || reader_loop(io.reader, reader_process, reader_running, tx));
        if !io.nonblocking {
            warn!(shell = %label, "shell output is blocking; close will not wait for the reader");
        }

        Self {
            process,
            writer: Mutex::new(Some(io.writer)),
            io: SessionIo::new(rx, running),
            reader: io.nonblocking.then_some(reader),
            label,
            closed: false,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = lock(&self.writer);
        let writer = match writer.as_mut() {
            Some(w) if self.io.is_active() => w,
            _ => return Err(SessionError::NotActive),
        };
        write_all(&mut **writer, data)?;
        Ok(())
    }

    pub fn resize(&mut self, rows: u16, cols: u16) -> Result<()> {
        let Err(e) = lock(&self.process).resize(rows, cols) else {
            return Ok(());
        };
        if !self.io.is_active() || lock(&self.process).has_exited() {
            debug!(error = %e, "ignoring resize of exiting shell");
            return Ok(());
        }
        warn!(error = %e, rows, cols, "resize failed");
        Err(e.into())
    }

    pub fn close(&mut self) {
        if std::mem::replace(&mut self.closed, true) {
            return;
        }

        if let Err(e) = lock(&self.process).kill() {
            warn!(error = %e, "failed to stop shell");
        }
        lock(&self.writer).take();
        self.io.deactivate();

        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("local reader thread panicked");
            }
        }
        info!(shell = %self.label, "local session closed");
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(
    mut reader: Box<dyn Read + Send>,
    process: Arc<Mutex<LocalProcess>>,
    running: Arc<AtomicBool>,
    tx: Sender<SessionEvent>,
) {
    let mut buf = vec![0u8; READ_CHUNK];

    while running.load(Ordering::SeqCst) {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(SessionEvent::Output(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if lock(&process).has_exited() {
                    drain_output(&mut *reader, &mut buf, &tx);
                    break;
                }
                thread::sleep(POLL_INTERVAL);
            }
            // EIO from a pty master once the child is gone
            Err(e) => {
                debug!(error = %e, "shell output ended");
                break;
            }
        }
    }

    let reason = exit_reason(&process);
    let _ = tx.send(SessionEvent::Closed { reason });
    running.store(false, Ordering::SeqCst);
}

/// Forward whatever the shell wrote before exiting; background jobs may
/// still hold the output open, so stop at the first empty read
fn drain_output(reader: &mut dyn Read, buf: &mut [u8], tx: &Sender<SessionEvent>) {
    loop {
        match reader.read(buf) {
            Ok(0) => return,
            Ok(n) => {
                if tx.send(SessionEvent::Output(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => return,
        }
    }
}

/// `write_all` that tolerates a non-blocking pty master
fn write_all(writer: &mut dyn Write, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => return Err(e),
        }
    }
    writer.flush()
}

fn exit_reason(process: &Mutex<LocalProcess>) -> String {
    // The pipe can close slightly before the exit status is available
    for _ in 0..20 {
        match lock(process).try_wait() {
            Ok(Some(code)) => return format!("shell exited with code {}", code),
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => return format!("shell status unavailable: {}", e),
        }
    }
    "shell output closed".to_string()
}
