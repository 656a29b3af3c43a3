//! Console answers for authentication prompts
//!
//! Runs on the main thread before the terminal switches to raw mode, serving
//! requests sent by the authentication worker.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::Receiver;

use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tracing::debug;

use crate::auth::PromptRequest;
use crate::ssh::Prompt;

/// Answer requests until every sender is gone
pub fn serve_prompts(requests: Receiver<PromptRequest>) {
    while let Ok(request) = requests.recv() {
        match request {
            PromptRequest::Interactive {
                title,
                instructions,
                prompts,
                reply,
            } => {
                print_header(&title, &instructions);
                let answers = collect_answers(&prompts, read_answer);
                let _ = reply.send(answers);
            }
            PromptRequest::NewPassword { message, reply } => {
                print_header(&message, "");
                let password = read_hidden("Password: ")
                    .ok()
                    .flatten()
                    .filter(|p| !p.is_empty());
                let _ = reply.send(password);
            }
        }
    }
    debug!("prompt owner finished");
}

/// One answer per prompt; a declined prompt blanks them all, which the
/// engine reads as cancellation
pub fn collect_answers<F>(prompts: &[Prompt], mut read: F) -> Vec<String>
where
    F: FnMut(&Prompt) -> io::Result<Option<String>>,
{
    let mut answers = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        match read(prompt) {
            Ok(Some(answer)) => answers.push(answer),
            Ok(None) | Err(_) => return vec![String::new(); prompts.len()],
        }
    }
    answers
}

fn print_header(title: &str, instructions: &str) {
    let mut stdout = io::stdout();
    if !title.is_empty() {
        let _ = writeln!(stdout, "{}", title);
    }
    if !instructions.is_empty() {
        let _ = writeln!(stdout, "{}", instructions);
    }
}

fn read_answer(prompt: &Prompt) -> io::Result<Option<String>> {
    if prompt.echo {
        read_visible(&prompt.text)
    } else {
        read_hidden(&prompt.text)
    }
}

fn read_visible(label: &str) -> io::Result<Option<String>> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", label)?;
    stdout.flush()?;

    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Read without echo. Esc or Ctrl+C declines.
fn read_hidden(label: &str) -> io::Result<Option<String>> {
    let mut stdout = io::stdout();
    write!(stdout, "{}", label)?;
    stdout.flush()?;

    terminal::enable_raw_mode()?;
    let result = read_hidden_raw();
    terminal::disable_raw_mode()?;
    writeln!(stdout)?;
    result
}

fn read_hidden_raw() -> io::Result<Option<String>> {
    let mut input = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(Some(input)),
            KeyCode::Esc => return Ok(None),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok(None)
            }
            KeyCode::Backspace => {
                input.pop();
            }
            KeyCode::Char(ch) => input.push(ch),
            _ => {}
        }
    }
}
