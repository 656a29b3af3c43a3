//! Local shell process
//!
//! Spawns a shell inside a pseudo-terminal via `portable-pty`. When no
//! pseudo-terminal can be created the shell runs with plain pipes instead,
//! stdout and stderr sharing one pipe so a single reader sees both.

use std::io::{self, Read, Write};
use std::process::{Command, Stdio};

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pseudo-terminal: {0}")]
    Open(anyhow::Error),

    #[error("failed to spawn {program} in pseudo-terminal: {reason}")]
    SpawnPty { program: String, reason: anyhow::Error },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to resize pseudo-terminal: {0}")]
    Resize(anyhow::Error),

    #[error("process I/O failed: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PtyError>;

/// Program and environment for a local shell
#[derive(Clone, Debug)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub term: String,
    pub rows: u16,
    pub cols: u16,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            term: "xterm-256color".to_string(),
            rows: 24,
            cols: 80,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn size(mut self, rows: u16, cols: u16) -> Self {
        self.rows = rows;
        self.cols = cols;
        self
    }

    pub fn term(mut self, term: impl Into<String>) -> Self {
        self.term = term.into();
        self
    }
}

/// Platform default shell
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// Byte streams of a spawned process
pub struct ProcessIo {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    /// Reads return `WouldBlock` instead of waiting for output
    pub nonblocking: bool,
}

enum Handle {
    Pty {
        master: Box<dyn MasterPty + Send>,
        child: Box<dyn portable_pty::Child + Send + Sync>,
    },
    Pipe(std::process::Child),
}

/// A running local shell
pub struct LocalProcess {
    handle: Handle,
    program: String,
}

impl LocalProcess {
    /// Spawn in a pseudo-terminal, falling back to pipes
    pub fn spawn(cmd: &ShellCommand) -> Result<(Self, ProcessIo)> {
        match Self::spawn_pty(cmd) {
            Ok(spawned) => Ok(spawned),
            Err(e) => {
                warn!(error = %e, "pseudo-terminal unavailable, using pipes");
                Self::spawn_pipe(cmd)
            }
        }
    }

    pub fn spawn_pty(cmd: &ShellCommand) -> Result<(Self, ProcessIo)> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: cmd.rows,
                cols: cmd.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(PtyError::Open)?;

        let mut builder = CommandBuilder::new(&cmd.program);
        builder.args(&cmd.args);
        builder.env("TERM", &cmd.term);
        if let Ok(cwd) = std::env::current_dir() {
            builder.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|reason| PtyError::SpawnPty {
                program: cmd.program.clone(),
                reason,
            })?;
        drop(pair.slave);

        let reader = pair.master.try_clone_reader().map_err(PtyError::Open)?;
        let writer = pair.master.take_writer().map_err(PtyError::Open)?;
        #[cfg(unix)]
        let nonblocking = match pair.master.as_raw_fd() {
            Some(fd) => set_nonblocking(fd).is_ok(),
            None => false,
        };
        #[cfg(not(unix))]
        let nonblocking = false;
        info!(program = %cmd.program, pid = ?child.process_id(), "spawned shell in pseudo-terminal");

        Ok((
            Self {
                handle: Handle::Pty {
                    master: pair.master,
                    child,
                },
                program: cmd.program.clone(),
            },
            ProcessIo {
                reader,
                writer,
                nonblocking,
            },
        ))
    }

    pub fn spawn_pipe(cmd: &ShellCommand) -> Result<(Self, ProcessIo)> {
        let spawn_err = |source| PtyError::Spawn {
            program: cmd.program.clone(),
            source,
        };

        let (reader, writer) = io::pipe().map_err(spawn_err)?;
        let stderr = writer.try_clone().map_err(spawn_err)?;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .env("TERM", &cmd.term)
            .stdin(Stdio::piped())
            .stdout(writer)
            .stderr(stderr);
        let mut child = command.spawn().map_err(spawn_err)?;
        // Our copies of the write end must go, or the reader never sees EOF
        drop(command);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(io::Error::other("stdin not captured")))?;
        #[cfg(unix)]
        let nonblocking = set_nonblocking(std::os::fd::AsRawFd::as_raw_fd(&reader)).is_ok();
        #[cfg(not(unix))]
        let nonblocking = false;
        info!(program = %cmd.program, pid = child.id(), nonblocking, "spawned shell with pipes");

        Ok((
            Self {
                handle: Handle::Pipe(child),
                program: cmd.program.clone(),
            },
            ProcessIo {
                reader: Box::new(reader),
                writer: Box::new(stdin),
                nonblocking,
            },
        ))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn is_pty(&self) -> bool {
        matches!(self.handle, Handle::Pty { .. })
    }

    /// Resize the pseudo-terminal; pipes have no size
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        match &self.handle {
            Handle::Pty { master, .. } => master
                .resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                })
                .map_err(PtyError::Resize),
            Handle::Pipe(_) => {
                debug!("resize ignored for pipe process");
                Ok(())
            }
        }
    }

    /// Exit code once the process has ended
    pub fn try_wait(&mut self) -> Result<Option<i64>> {
        Ok(match &mut self.handle {
            Handle::Pty { child, .. } => child.try_wait()?.map(|s| s.exit_code() as i64),
            Handle::Pipe(child) => child.try_wait()?.map(|s| s.code().unwrap_or(-1) as i64),
        })
    }

    pub fn has_exited(&mut self) -> bool {
        // An unreadable status counts as gone
        !matches!(self.try_wait(), Ok(None))
    }

    pub fn kill(&mut self) -> Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        match &mut self.handle {
            Handle::Pty { child, .. } => child.kill()?,
            Handle::Pipe(child) => child.kill()?,
        }
        Ok(())
    }
}

/// Set O_NONBLOCK on the read side; the flag is shared by every duplicate
/// of the descriptor
#[cfg(unix)]
fn set_nonblocking(fd: std::os::fd::RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};

    let result = fcntl(fd, FcntlArg::F_GETFL)
        .and_then(|flags| {
            let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
            fcntl(fd, FcntlArg::F_SETFL(flags))
        })
        .map(drop)
        .map_err(io::Error::from);
    if let Err(e) = &result {
        warn!(error = %e, fd, "failed to make shell output non-blocking");
    }
    result
}
