//! hopterm - a terminal for local shells and SSH sessions
//!
//! Connects to a target host directly or through a jump host, answering
//! keyboard-interactive (MFA) prompts on the console before the session
//! starts.
//!
//! # Quick Start
//!
//! ```text
//! hopterm                                  # local shell
//! hopterm --ssh deploy@10.0.0.5 -J b@bastion
//! hopterm --session prod                   # profile from ~/.hopterm/config.toml
//! ```
//!
//! # Keys
//!
//! | Key | Action |
//! |-----|--------|
//! | Shift+PageUp / Shift+PageDown | Scroll history |
//! | Shift+Home / Shift+End | Oldest line / live output |

use std::env;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hopterm::auth::{prompt_channel, AuthEngine, Credentials, JumpHostConfig, DEFAULT_SSH_PORT};
use hopterm::config::{self, Config};
use hopterm::core::pty::{default_shell, ShellCommand};
use hopterm::core::render::{RenderDiffEngine, RenderSink, RenderTicker};
use hopterm::core::session::{LocalSession, RemoteSession, Session};
use hopterm::core::term::{StreamParser, TerminalBuffer};
use hopterm::ssh::{PtyRequest, RusshClient};
use hopterm::ui::{serve_prompts, KeyMapper, Renderer, ScrollView};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What to connect to
enum Target {
    Local,
    Ssh {
        creds: Credentials,
        jump: Option<JumpHostConfig>,
    },
    Profile(String),
}

struct Options {
    shell: Option<String>,
    target: Target,
}

fn print_help() {
    eprintln!("hopterm {} - terminal for local shells and SSH through jump hosts", VERSION);
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  hopterm [-s SHELL]");
    eprintln!("  hopterm --ssh [user@]host[:port] [-J [user@]jump[:port]] [-i KEY]");
    eprintln!("  hopterm --session NAME");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -s, --shell <CMD>     Local shell command");
    eprintln!("      --ssh <DEST>      Connect to an SSH host");
    eprintln!("  -J, --jump <HOST>     Connect through a jump host");
    eprintln!("  -i, --identity <KEY>  Private key for the target host");
    eprintln!("      --session <NAME>  Saved session from the config file");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration: ~/.hopterm/config.toml");
    eprintln!("Log file:      ~/.hopterm/hopterm.log (level from HOPTERM_LOG)");
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut shell = None;
    let mut destination = None;
    let mut jump = None;
    let mut identity = None;
    let mut profile = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("Missing argument for {}", name))
        };
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                eprintln!("hopterm {}", VERSION);
                std::process::exit(0);
            }
            "-s" | "--shell" => shell = Some(value(arg.as_str())?),
            "--ssh" => destination = Some(value(arg.as_str())?),
            "-J" | "--jump" => jump = Some(value(arg.as_str())?),
            "-i" | "--identity" => identity = Some(value(arg.as_str())?),
            "--session" => profile = Some(value(arg.as_str())?),
            other => return Err(format!("Unknown argument: {}. Use -h for help.", other)),
        }
    }

    let target = match (destination, profile) {
        (Some(_), Some(_)) => return Err("--ssh and --session are exclusive".to_string()),
        (None, Some(name)) => Target::Profile(name),
        (Some(dest), None) => {
            let (user, host, port) = parse_host_spec(&dest)?;
            let mut creds = Credentials::new(host, port, user);
            if let Some(key) = identity {
                creds = creds.with_key_file(key);
            }
            let jump = jump
                .map(|spec| {
                    parse_host_spec(&spec).map(|(username, host, port)| JumpHostConfig {
                        enabled: true,
                        host,
                        port,
                        username,
                        password: None,
                    })
                })
                .transpose()?;
            Target::Ssh { creds, jump }
        }
        (None, None) if jump.is_some() || identity.is_some() => {
            return Err("-J and -i need --ssh".to_string())
        }
        (None, None) => Target::Local,
    };

    Ok(Options { shell, target })
}

/// `[user@]host[:port]`, user defaulting to the local login name
fn parse_host_spec(spec: &str) -> Result<(String, String, u16), String> {
    let (user, rest) = match spec.rsplit_once('@') {
        Some((user, rest)) => (user.to_string(), rest),
        None => (local_user(), spec),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| format!("Invalid port in {}", spec))?;
            (host, port)
        }
        None => (rest, DEFAULT_SSH_PORT),
    };
    if host.is_empty() {
        return Err(format!("Missing host in {}", spec));
    }
    Ok((user, host.to_string(), port))
}

fn local_user() -> String {
    env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

fn init_logging() {
    let log_path = config::data_dir()
        .map(|dir| dir.join("hopterm.log"))
        .unwrap_or_else(|| std::path::PathBuf::from("hopterm.log"));

    let Ok(file) = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    else {
        return;
    };

    let filter = EnvFilter::try_from_env("HOPTERM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() {
    let args: Vec<String> = env::args().collect();
    let options = match parse_args(&args) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(2);
        }
    };

    init_logging();
    info!(version = VERSION, "hopterm starting");

    if let Err(e) = run(options) {
        error!(error = %format!("{:#}", e), "fatal");
        eprintln!("hopterm: {:#}", e);
        std::process::exit(1);
    }
}

fn run(options: Options) -> anyhow::Result<()> {
    let config = Config::load();
    let (cols, rows) = Renderer::size().context("cannot query terminal size")?;
    info!(cols, rows, "terminal size");

    let session = match options.target {
        Target::Local => {
            let shell = options
                .shell
                .or_else(|| config.shell.clone())
                .unwrap_or_else(default_shell);
            open_local(&shell, &config, rows, cols)?
        }
        Target::Ssh { creds, jump } => open_remote(creds, jump, &config, rows, cols)?,
        Target::Profile(name) => {
            let profile = config
                .session(&name)
                .ok_or_else(|| anyhow!("no session named {:?} in the config file", name))?;
            let jump = Some(profile.proxy_jump.clone()).filter(|j| j.enabled);
            open_remote(profile.credentials(), jump, &config, rows, cols)?
        }
    };

    run_session(session, &config, rows, cols)
}

fn open_local(shell: &str, config: &Config, rows: u16, cols: u16) -> anyhow::Result<Session> {
    let mut parts = shell.split_whitespace();
    let program = parts.next().ok_or_else(|| anyhow!("empty shell command"))?;
    let cmd = parts.fold(ShellCommand::new(program), ShellCommand::arg)
        .size(rows, cols)
        .term(&config.terminal.term);

    info!(shell, "starting local shell");
    let session = LocalSession::spawn(&cmd).with_context(|| format!("cannot start {}", shell))?;
    Ok(Session::Local(session))
}

/// Authenticate on a worker thread while this thread answers prompts
fn open_remote(
    creds: Credentials,
    jump: Option<JumpHostConfig>,
    config: &Config,
    rows: u16,
    cols: u16,
) -> anyhow::Result<Session> {
    let client = RusshClient::new(config.ssh.connect_timeout(), config.ssh.keepalive())
        .context("cannot start the ssh runtime")?;
    let (prompter, requests) = prompt_channel(config.ssh.prompt_timeout());
    let policy = config.ssh.policy();
    let pty = PtyRequest {
        term: config.terminal.term.clone(),
        rows,
        cols,
    };
    let label = format!("{}@{}", creds.username, creds.host);

    match &jump {
        Some(j) => println!("Connecting to {} via {}...", label, j.host),
        None => println!("Connecting to {}...", label),
    }

    let worker = thread::Builder::new()
        .name("hopterm-auth".to_string())
        .spawn(move || -> anyhow::Result<RemoteSession> {
            let prompter = Arc::new(prompter);
            let mut engine = AuthEngine::new(client, prompter.clone())
                .with_retry(prompter)
                .with_policy(policy);
            let conn = engine.connect(&creds, jump.as_ref())?;
            Ok(RemoteSession::open(conn, &pty, label)?)
        })
        .context("cannot start the authentication worker")?;

    serve_prompts(requests);

    let session = worker
        .join()
        .map_err(|_| anyhow!("authentication worker panicked"))??;
    Ok(Session::Remote(session))
}

struct Terminal {
    buf: TerminalBuffer,
    parser: StreamParser,
    diff: RenderDiffEngine,
    view: ScrollView,
    ticker: RenderTicker,
}

fn run_session(mut session: Session, config: &Config, rows: u16, cols: u16) -> anyhow::Result<()> {
    let mut term = Terminal {
        buf: TerminalBuffer::new(rows, cols, config.terminal.scrollback_limit),
        parser: StreamParser::new(),
        diff: RenderDiffEngine::new(),
        view: ScrollView::new(rows),
        ticker: RenderTicker::new(config.terminal.render_interval()),
    };

    let mut renderer = Renderer::new();
    renderer.init()?;
    let result = run_main_loop(&mut session, &mut term, &mut renderer);

    session.close();
    let _ = renderer.cleanup();

    if let Some(reason) = session.last_error() {
        info!(session = session.label(), %reason, "session ended");
        println!("[{}: {}]", session.label(), reason);
    }
    result
}

fn run_main_loop(
    session: &mut Session,
    term: &mut Terminal,
    renderer: &mut Renderer,
) -> anyhow::Result<()> {
    term.ticker.mark_dirty();

    loop {
        if let Some(data) = session.read() {
            for response in term.parser.feed(&data, &mut term.buf) {
                if let Err(e) = session.send(&response.to_bytes()) {
                    warn!(error = %e, "cannot answer terminal query");
                }
            }
            term.ticker.mark_dirty();
        }

        if !session.is_active() {
            info!(session = session.label(), "session ended");
            return Ok(());
        }

        if term.ticker.due(Instant::now()) {
            let patch = term.diff.refresh(&mut term.buf);
            term.view.apply(&patch);
            renderer.render(&term.view, &term.buf)?;
        }

        let timeout = term
            .ticker
            .time_until_due(Instant::now())
            .map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));
        if !event::poll(timeout)? {
            continue;
        }

        match event::read()? {
            Event::Key(key) if key.kind != KeyEventKind::Release => {
                if scroll_key(&key, term) {
                    renderer.render(&term.view, &term.buf)?;
                    continue;
                }
                if let Some(bytes) = KeyMapper::map(&key, &term.buf.modes) {
                    follow_live(term);
                    send_input(session, &bytes);
                }
            }
            Event::Paste(text) => {
                follow_live(term);
                send_input(session, &KeyMapper::paste(&text, &term.buf.modes));
            }
            Event::Resize(cols, rows) => {
                info!(cols, rows, "window resized");
                term.buf.resize(rows, cols);
                term.view.set_height(rows);
                if let Err(e) = session.resize(rows, cols) {
                    warn!(error = %e, "cannot resize session");
                }
                term.ticker.mark_dirty();
            }
            _ => {}
        }
    }
}

/// Shift+PageUp/PageDown/Home/End move through history
fn scroll_key(key: &KeyEvent, term: &mut Terminal) -> bool {
    if !key.modifiers.contains(KeyModifiers::SHIFT) {
        return false;
    }
    let page = term.view.height().saturating_sub(1).max(1);
    match key.code {
        KeyCode::PageUp => term.view.scroll_up(page),
        KeyCode::PageDown => term.view.scroll_down(page),
        KeyCode::Home => term.view.scroll_to_top(),
        KeyCode::End => term.view.scroll_to_bottom(),
        _ => return false,
    }
    true
}

fn follow_live(term: &mut Terminal) {
    if !term.view.is_live() {
        term.view.scroll_to_bottom();
        term.ticker.mark_dirty();
    }
}

fn send_input(session: &Session, bytes: &[u8]) {
    if let Err(e) = session.send(bytes) {
        warn!(error = %e, "input dropped");
    }
}
