//! Prompt capabilities
//!
//! The engine asks the user for MFA answers and replacement passwords
//! through [`PromptResolver`] and [`PasswordRetry`]. [`ChannelPrompter`]
//! implements both by sending requests to whichever thread owns the user
//! interaction and blocking on the reply with a timeout.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::ssh::Prompt;

pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("no answer within {0:?}")]
    TimedOut(Duration),

    #[error("prompt declined")]
    Cancelled,

    #[error("nobody is answering prompts")]
    Disconnected,
}

/// Answers keyboard-interactive challenges
pub trait PromptResolver: Send + Sync {
    /// One answer per prompt, in order
    fn resolve(
        &self,
        title: &str,
        instructions: &str,
        prompts: &[Prompt],
    ) -> Result<Vec<String>, PromptError>;
}

/// Supplies a replacement password after a rejection
pub trait PasswordRetry: Send + Sync {
    fn request_new_password(&self, message: &str) -> Result<Option<String>, PromptError>;
}

/// A question waiting for the owner thread. Dropping it declines.
#[derive(Debug)]
pub enum PromptRequest {
    Interactive {
        title: String,
        instructions: String,
        prompts: Vec<Prompt>,
        reply: Sender<Vec<String>>,
    },
    NewPassword {
        message: String,
        reply: Sender<Option<String>>,
    },
}

/// Message-passing implementation of both prompt capabilities
#[derive(Clone)]
pub struct ChannelPrompter {
    tx: Sender<PromptRequest>,
    timeout: Duration,
}

/// Prompter plus the receiver the owner thread serves
pub fn prompt_channel(timeout: Duration) -> (ChannelPrompter, Receiver<PromptRequest>) {
    let (tx, rx) = mpsc::channel();
    (ChannelPrompter { tx, timeout }, rx)
}

impl ChannelPrompter {
    fn round_trip<T>(
        &self,
        build: impl FnOnce(Sender<T>) -> PromptRequest,
    ) -> Result<T, PromptError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| PromptError::Disconnected)?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(answer) => Ok(answer),
            Err(RecvTimeoutError::Timeout) => {
                debug!(timeout = ?self.timeout, "prompt timed out");
                Err(PromptError::TimedOut(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(PromptError::Cancelled),
        }
    }
}

impl PromptResolver for ChannelPrompter {
    fn resolve(
        &self,
        title: &str,
        instructions: &str,
        prompts: &[Prompt],
    ) -> Result<Vec<String>, PromptError> {
        self.round_trip(|reply| PromptRequest::Interactive {
            title: title.to_string(),
            instructions: instructions.to_string(),
            prompts: prompts.to_vec(),
            reply,
        })
    }
}

impl PasswordRetry for ChannelPrompter {
    fn request_new_password(&self, message: &str) -> Result<Option<String>, PromptError> {
        self.round_trip(|reply| PromptRequest::NewPassword {
            message: message.to_string(),
            reply,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_resolve_round_trip() {
        let (prompter, rx) = prompt_channel(Duration::from_secs(5));
        let owner = thread::spawn(move || match rx.recv().unwrap() {
            PromptRequest::Interactive { prompts, reply, .. } => {
                assert_eq!(prompts[0].text, "Passcode:");
                reply.send(vec!["123456".to_string()]).unwrap();
            }
            other => panic!("unexpected request {:?}", other),
        });

        let answers = prompter
            .resolve("MFA", "", &[Prompt::new("Passcode:", false)])
            .unwrap();
        assert_eq!(answers, vec!["123456"]);
        owner.join().unwrap();
    }

    #[test]
    fn test_unanswered_prompt_times_out() {
        let (prompter, _rx) = prompt_channel(Duration::from_millis(20));
        assert_eq!(
            prompter.request_new_password("again"),
            Err(PromptError::TimedOut(Duration::from_millis(20)))
        );
    }

    #[test]
    fn test_dropped_request_is_cancellation() {
        let (prompter, rx) = prompt_channel(Duration::from_secs(5));
        let owner = thread::spawn(move || drop(rx.recv().unwrap()));

        assert_eq!(
            prompter.request_new_password("again"),
            Err(PromptError::Cancelled)
        );
        owner.join().unwrap();
    }

    #[test]
    fn test_no_owner_is_disconnected() {
        let (prompter, rx) = prompt_channel(Duration::from_secs(5));
        drop(rx);
        assert_eq!(
            prompter.resolve("t", "", &[]),
            Err(PromptError::Disconnected)
        );
    }
}
