//! Authentication engine
//!
//! Runs the connect sequence against an [`SshClient`]: optional jump host,
//! then the target. Each host goes through the same procedure: interactive
//! rounds first, password second with a bounded number of retries.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::prompt::{PasswordRetry, PromptError, PromptResolver};
use super::{
    AttemptResult, AuthAttempt, AuthError, AuthMethod, AuthState, Credentials, FailureReason,
    JumpHostConfig, Stage,
};
use crate::ssh::{
    AuthOutcome, Challenge, Endpoint, InteractiveStep, Link, SshClient, SshError, SshTransport,
    TunnelOf,
};

/// Retry limits
#[derive(Clone, Copy, Debug)]
pub struct AuthPolicy {
    /// Password attempts per host, the first one included
    pub max_password_attempts: u32,
    /// Keyboard-interactive rounds per host
    pub max_interactive_rounds: u32,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            max_password_attempts: 2,
            max_interactive_rounds: 3,
        }
    }
}

/// Result of a successful run
pub struct AuthenticatedConnection<T> {
    pub transport: T,
    /// Jump transport carrying the tunnel; must outlive `transport`
    pub jump: Option<T>,
    pub method: AuthMethod,
}

/// Auto-fill bookkeeping for one keyboard-interactive exchange.
///
/// The stored password answers the first prompt that looks like a password
/// question, once.
pub struct InteractiveAttempt<'a> {
    password: Option<&'a str>,
    password_sent: bool,
}

impl<'a> InteractiveAttempt<'a> {
    pub fn new(password: Option<&'a str>) -> Self {
        Self {
            password,
            password_sent: false,
        }
    }

    pub fn autofill(&mut self, prompt: &str) -> Option<String> {
        if self.password_sent {
            return None;
        }
        let password = self.password?;
        let prompt = prompt.to_lowercase();
        if prompt.contains("password") || prompt.contains("passcode") {
            self.password_sent = true;
            return Some(password.to_string());
        }
        None
    }
}

enum Interactive {
    Success,
    Failed,
}

pub struct AuthEngine<C: SshClient> {
    client: C,
    prompts: Arc<dyn PromptResolver>,
    retry: Option<Arc<dyn PasswordRetry>>,
    policy: AuthPolicy,
    state: AuthState,
    attempts: Vec<AuthAttempt>,
}

impl<C: SshClient> AuthEngine<C> {
    pub fn new(client: C, prompts: Arc<dyn PromptResolver>) -> Self {
        Self {
            client,
            prompts,
            retry: None,
            policy: AuthPolicy::default(),
            state: AuthState::Init,
            attempts: Vec::new(),
        }
    }

    pub fn with_retry(mut self, retry: Arc<dyn PasswordRetry>) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_policy(mut self, policy: AuthPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Attempts of the last run, in order
    pub fn attempts(&self) -> &[AuthAttempt] {
        &self.attempts
    }

    /// Connect and authenticate to `creds.host`, through `jump` when enabled
    pub fn connect(
        &mut self,
        creds: &Credentials,
        jump: Option<&JumpHostConfig>,
    ) -> Result<AuthenticatedConnection<C::Transport>, AuthError> {
        self.state = AuthState::Init;
        self.attempts.clear();

        let mut jump_transport = match jump.filter(|j| j.enabled) {
            Some(cfg) => Some(self.connect_jump(cfg)?),
            None => None,
        };

        let result = self.connect_target(creds, jump_transport.as_mut());
        match result {
            Ok((transport, method)) => {
                self.transition(AuthState::Authenticated);
                info!(host = %creds.host, ?method, "authenticated");
                Ok(AuthenticatedConnection {
                    transport,
                    jump: jump_transport,
                    method,
                })
            }
            Err(e) => {
                if let Some(mut jump) = jump_transport {
                    close_link(&mut jump, Stage::Jump);
                }
                Err(self.fail(e))
            }
        }
    }

    fn connect_jump(&mut self, cfg: &JumpHostConfig) -> Result<C::Transport, AuthError> {
        let creds = cfg.credentials();
        self.transition(AuthState::JumpConnect);
        info!(host = %creds.host, port = creds.port, "connecting to jump host");

        let endpoint = Endpoint::Direct {
            host: creds.host.clone(),
            port: creds.port,
        };
        let mut transport = self.client.connect(endpoint).map_err(|source| {
            self.fail(AuthError::Connection {
                stage: Stage::Jump,
                host: creds.host.clone(),
                source,
            })
        })?;

        self.transition(AuthState::JumpAuth);
        if let Err(e) = self.authenticate(&mut transport, Stage::Jump, &creds) {
            close_link(&mut transport, Stage::Jump);
            return Err(self.fail(e));
        }

        self.transition(AuthState::TunnelOpen);
        Ok(transport)
    }

    fn connect_target(
        &mut self,
        creds: &Credentials,
        mut jump: Option<&mut C::Transport>,
    ) -> Result<(C::Transport, AuthMethod), AuthError> {
        let endpoint = Self::target_endpoint(creds, jump.as_deref_mut())?;
        self.transition(AuthState::TargetConnect);
        info!(host = %creds.host, port = creds.port, tunneled = jump.is_some(), "connecting to target");

        let method = creds.convenience_method();
        match self.client.connect_authenticated(endpoint, creds) {
            Ok((transport, method)) => {
                self.record(method, Stage::Target, AttemptResult::Success);
                return Ok((transport, method));
            }
            Err(e) if e.is_auth() => {
                self.record(method, Stage::Target, AttemptResult::Failed);
                debug!(error = %e, "one-shot login refused, authenticating step by step");
            }
            Err(source) => {
                return Err(AuthError::Connection {
                    stage: Stage::Target,
                    host: creds.host.clone(),
                    source,
                })
            }
        }

        // The tunnel used above may be unusable now; open another one
        let endpoint = Self::target_endpoint(creds, jump)?;
        let mut transport =
            self.client
                .connect(endpoint)
                .map_err(|source| AuthError::Connection {
                    stage: Stage::Target,
                    host: creds.host.clone(),
                    source,
                })?;

        self.transition(AuthState::TargetAuth);
        match self.authenticate(&mut transport, Stage::Target, creds) {
            Ok(method) => Ok((transport, method)),
            Err(e) => {
                close_link(&mut transport, Stage::Target);
                Err(e)
            }
        }
    }

    fn target_endpoint(
        creds: &Credentials,
        jump: Option<&mut C::Transport>,
    ) -> Result<Endpoint<TunnelOf<C>>, AuthError> {
        match jump {
            Some(jump) => jump
                .open_tunnel(&creds.host, creds.port)
                .map(Endpoint::Tunneled)
                .map_err(|source| AuthError::Tunnel {
                    host: creds.host.clone(),
                    source,
                }),
            None => Ok(Endpoint::Direct {
                host: creds.host.clone(),
                port: creds.port,
            }),
        }
    }

    /// Interactive first, then password
    fn authenticate(
        &mut self,
        transport: &mut C::Transport,
        stage: Stage,
        creds: &Credentials,
    ) -> Result<AuthMethod, AuthError> {
        if let Interactive::Success = self.interactive(transport, stage, creds)? {
            return Ok(AuthMethod::Interactive);
        }

        let mut creds = match creds.password {
            Some(_) => creds.clone(),
            None => {
                let message = format!("Password for {}@{}", creds.username, creds.host);
                creds.with_password(self.request_password(stage, &creds.host, &message)?)
            }
        };

        for attempt in 1..=self.policy.max_password_attempts {
            let password = creds.password.as_deref().unwrap_or_default();
            let outcome = transport
                .auth_password(&creds.username, password)
                .map_err(|e| connection_error(stage, &creds.host, e))?;

            match outcome {
                AuthOutcome::Success => {
                    self.record(AuthMethod::Password, stage, AttemptResult::Success);
                    return Ok(AuthMethod::Password);
                }
                AuthOutcome::Partial => {
                    self.record(AuthMethod::Password, stage, AttemptResult::Partial);
                    info!(%stage, host = %creds.host, "password accepted, more factors required");
                    return match self.interactive(transport, stage, &creds)? {
                        Interactive::Success => Ok(AuthMethod::Interactive),
                        Interactive::Failed => Err(exhausted(stage, &creds.host)),
                    };
                }
                AuthOutcome::Failure => {
                    self.record(AuthMethod::Password, stage, AttemptResult::Failed);
                    warn!(%stage, host = %creds.host, attempt, "password rejected");
                    if attempt < self.policy.max_password_attempts && self.retry.is_some() {
                        let message = format!(
                            "Password for {}@{} was rejected. Enter a new password",
                            creds.username, creds.host
                        );
                        let password = self.request_password(stage, &creds.host, &message)?;
                        creds = creds.with_password(password);
                    } else {
                        break;
                    }
                }
            }
        }

        Err(exhausted(stage, &creds.host))
    }

    fn interactive(
        &mut self,
        transport: &mut C::Transport,
        stage: Stage,
        creds: &Credentials,
    ) -> Result<Interactive, AuthError> {
        for round in 1..=self.policy.max_interactive_rounds {
            let mut attempt = InteractiveAttempt::new(creds.password.as_deref());
            let mut step = match transport.keyboard_interactive_start(&creds.username) {
                Ok(step) => step,
                Err(e) if e.is_auth() => {
                    debug!(%stage, error = %e, "keyboard-interactive not available");
                    self.record(AuthMethod::Interactive, stage, AttemptResult::Failed);
                    return Ok(Interactive::Failed);
                }
                Err(e) => return Err(connection_error(stage, &creds.host, e)),
            };

            loop {
                match step {
                    InteractiveStep::Success => {
                        self.record(AuthMethod::Interactive, stage, AttemptResult::Success);
                        return Ok(Interactive::Success);
                    }
                    InteractiveStep::Failure { partial: true } => {
                        self.record(AuthMethod::Interactive, stage, AttemptResult::Partial);
                        debug!(%stage, round, "partial success, continuing");
                        break;
                    }
                    InteractiveStep::Failure { partial: false } => {
                        self.record(AuthMethod::Interactive, stage, AttemptResult::Failed);
                        return Ok(Interactive::Failed);
                    }
                    InteractiveStep::InfoRequest(challenge) => {
                        let responses = self.answer(&mut attempt, &challenge, stage, creds)?;
                        step = transport
                            .keyboard_interactive_respond(responses)
                            .map_err(|e| connection_error(stage, &creds.host, e))?;
                    }
                }
            }
        }

        warn!(%stage, host = %creds.host, "interactive rounds exhausted");
        Ok(Interactive::Failed)
    }

    fn answer(
        &self,
        attempt: &mut InteractiveAttempt<'_>,
        challenge: &Challenge,
        stage: Stage,
        creds: &Credentials,
    ) -> Result<Vec<String>, AuthError> {
        if challenge.prompts.is_empty() {
            return Ok(Vec::new());
        }

        let mut responses: Vec<Option<String>> = challenge
            .prompts
            .iter()
            .map(|p| attempt.autofill(&p.text))
            .collect();

        let pending: Vec<_> = challenge
            .prompts
            .iter()
            .zip(&responses)
            .filter(|(_, filled)| filled.is_none())
            .map(|(prompt, _)| prompt.clone())
            .collect();
        if pending.is_empty() {
            return Ok(responses.into_iter().flatten().collect());
        }

        let title = if challenge.name.is_empty() {
            format!("Authentication for {}@{}", creds.username, creds.host)
        } else {
            challenge.name.clone()
        };
        let mut answers = self
            .prompts
            .resolve(&title, &challenge.instructions, &pending)
            .map_err(|e| prompt_failure(stage, &creds.host, e))?;

        if answers.iter().all(String::is_empty) {
            info!(%stage, host = %creds.host, "interactive prompt cancelled");
            return Err(AuthError::Failed {
                stage,
                host: creds.host.clone(),
                reason: FailureReason::Cancelled,
            });
        }

        answers.resize(pending.len(), String::new());
        let mut answers = answers.into_iter();
        for slot in responses.iter_mut().filter(|r| r.is_none()) {
            *slot = answers.next();
        }
        Ok(responses.into_iter().map(Option::unwrap_or_default).collect())
    }

    fn request_password(
        &self,
        stage: Stage,
        host: &str,
        message: &str,
    ) -> Result<String, AuthError> {
        let Some(retry) = &self.retry else {
            return Err(exhausted(stage, host));
        };
        match retry.request_new_password(message) {
            Ok(Some(password)) if !password.is_empty() => Ok(password),
            Ok(_) => Err(AuthError::Failed {
                stage,
                host: host.to_string(),
                reason: FailureReason::Cancelled,
            }),
            Err(e) => Err(prompt_failure(stage, host, e)),
        }
    }

    fn record(&mut self, method: AuthMethod, stage: Stage, result: AttemptResult) {
        debug!(?method, %stage, ?result, "auth attempt");
        self.attempts.push(AuthAttempt {
            method,
            stage,
            result,
        });
    }

    fn transition(&mut self, next: AuthState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid auth transition {} -> {}",
            self.state,
            next
        );
        debug!(from = %self.state, to = %next, "auth state");
        self.state = next;
    }

    fn fail(&mut self, err: AuthError) -> AuthError {
        if self.state != AuthState::Failed {
            self.transition(AuthState::Failed);
            warn!(error = %err, "authentication failed");
        }
        err
    }
}

fn close_link(link: &mut impl Link, stage: Stage) {
    if let Err(e) = link.disconnect() {
        warn!(%stage, error = %e, "failed to close transport");
    }
}

fn connection_error(stage: Stage, host: &str, source: SshError) -> AuthError {
    AuthError::Connection {
        stage,
        host: host.to_string(),
        source,
    }
}

fn exhausted(stage: Stage, host: &str) -> AuthError {
    AuthError::Failed {
        stage,
        host: host.to_string(),
        reason: FailureReason::Exhausted,
    }
}

fn prompt_failure(stage: Stage, host: &str, err: PromptError) -> AuthError {
    let reason = match err {
        PromptError::TimedOut(_) => FailureReason::TimedOut,
        PromptError::Cancelled | PromptError::Disconnected => FailureReason::Cancelled,
    };
    AuthError::Failed {
        stage,
        host: host.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::{Prompt, PtyRequest, ShellChannel};
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Scripted server behavior for one host
    #[derive(Clone, Default)]
    struct HostScript {
        password: Option<String>,
        password_partial: bool,
        /// Each round: prompts with the expected answers
        rounds: Vec<Vec<(Prompt, String)>>,
        unreachable: bool,
        /// Keyboard-interactive is only offered once the password was accepted
        password_first: bool,
        tunnel_fails: bool,
    }

    #[derive(Default)]
    struct World {
        hosts: HashMap<String, HostScript>,
        next_tunnel: u32,
        /// Tunnel ids in the order connects used them
        tunnels_used: Vec<u32>,
        disconnected: Vec<String>,
    }

    #[derive(Clone, Default)]
    struct FakeClient(Arc<Mutex<World>>);

    impl FakeClient {
        fn host(self, name: &str, script: HostScript) -> Self {
            self.0.lock().unwrap().hosts.insert(name.to_string(), script);
            self
        }
    }

    struct FakeTunnel {
        id: u32,
        host: String,
    }

    struct FakeTransport {
        world: Arc<Mutex<World>>,
        host: String,
        script: HostScript,
        round: usize,
        password_ok: bool,
    }

    impl Link for FakeTransport {
        fn disconnect(&mut self) -> crate::ssh::Result<()> {
            self.world.lock().unwrap().disconnected.push(self.host.clone());
            Ok(())
        }
    }

    impl SshTransport for FakeTransport {
        type Tunnel = FakeTunnel;

        fn auth_password(&mut self, _user: &str, password: &str) -> crate::ssh::Result<AuthOutcome> {
            let accepted = self.script.password.as_deref() == Some(password);
            self.password_ok |= accepted;
            Ok(match accepted {
                true if self.script.password_partial => AuthOutcome::Partial,
                true => AuthOutcome::Success,
                false => AuthOutcome::Failure,
            })
        }

        fn keyboard_interactive_start(&mut self, _user: &str) -> crate::ssh::Result<InteractiveStep> {
            if self.script.rounds.is_empty() || (self.script.password_first && !self.password_ok) {
                return Err(SshError::AuthRejected("keyboard-interactive".into()));
            }
            Ok(match self.script.rounds.get(self.round) {
                Some(round) => InteractiveStep::InfoRequest(Challenge {
                    name: String::new(),
                    instructions: String::new(),
                    prompts: round.iter().map(|(p, _)| p.clone()).collect(),
                }),
                None => InteractiveStep::Failure { partial: false },
            })
        }

        fn keyboard_interactive_respond(
            &mut self,
            responses: Vec<String>,
        ) -> crate::ssh::Result<InteractiveStep> {
            let expected: Vec<String> = self.script.rounds[self.round]
                .iter()
                .map(|(_, a)| a.clone())
                .collect();
            if responses != expected {
                return Ok(InteractiveStep::Failure { partial: false });
            }
            self.round += 1;
            Ok(if self.round == self.script.rounds.len() {
                InteractiveStep::Success
            } else {
                InteractiveStep::Failure { partial: true }
            })
        }

        fn open_tunnel(&mut self, host: &str, _port: u16) -> crate::ssh::Result<FakeTunnel> {
            if self.script.tunnel_fails {
                return Err(SshError::Protocol("administratively prohibited".into()));
            }
            let mut world = self.world.lock().unwrap();
            world.next_tunnel += 1;
            Ok(FakeTunnel {
                id: world.next_tunnel,
                host: host.to_string(),
            })
        }

        fn open_shell(&mut self, _pty: &PtyRequest) -> crate::ssh::Result<Box<dyn ShellChannel>> {
            Err(SshError::Protocol("no shell in tests".into()))
        }
    }

    impl SshClient for FakeClient {
        type Transport = FakeTransport;

        fn connect(&self, endpoint: Endpoint<FakeTunnel>) -> crate::ssh::Result<FakeTransport> {
            let mut world = self.0.lock().unwrap();
            let host = match endpoint {
                Endpoint::Direct { host, .. } => host,
                Endpoint::Tunneled(tunnel) => {
                    world.tunnels_used.push(tunnel.id);
                    tunnel.host
                }
            };
            let script = world.hosts.get(&host).cloned().unwrap_or_default();
            if script.unreachable {
                return Err(SshError::Network {
                    host,
                    port: 22,
                    reason: "connection refused".into(),
                });
            }
            Ok(FakeTransport {
                world: self.0.clone(),
                host,
                script,
                round: 0,
                password_ok: false,
            })
        }

        fn connect_authenticated(
            &self,
            endpoint: Endpoint<FakeTunnel>,
            creds: &Credentials,
        ) -> crate::ssh::Result<(FakeTransport, AuthMethod)> {
            let mut transport = self.connect(endpoint)?;
            if let Some(password) = &creds.password {
                if transport.auth_password(&creds.username, password)? == AuthOutcome::Success {
                    return Ok((transport, AuthMethod::Password));
                }
            }
            Err(SshError::AuthRejected("one-shot login refused".into()))
        }
    }

    #[derive(Default)]
    struct ScriptedPrompts {
        answers: Mutex<VecDeque<Vec<String>>>,
        seen: Mutex<Vec<Vec<Prompt>>>,
    }

    impl ScriptedPrompts {
        fn answering(answers: &[&[&str]]) -> Arc<Self> {
            let answers = answers
                .iter()
                .map(|a| a.iter().map(|s| s.to_string()).collect())
                .collect();
            Arc::new(Self {
                answers: Mutex::new(answers),
                seen: Mutex::default(),
            })
        }

        fn seen(&self) -> Vec<Vec<Prompt>> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl PromptResolver for ScriptedPrompts {
        fn resolve(
            &self,
            _title: &str,
            _instructions: &str,
            prompts: &[Prompt],
        ) -> Result<Vec<String>, PromptError> {
            self.seen.lock().unwrap().push(prompts.to_vec());
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .ok_or(PromptError::Cancelled)
        }
    }

    struct ScriptedRetry {
        passwords: Mutex<VecDeque<Result<Option<String>, PromptError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedRetry {
        fn new(passwords: Vec<Result<Option<String>, PromptError>>) -> Arc<Self> {
            Arc::new(Self {
                passwords: Mutex::new(passwords.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    impl PasswordRetry for ScriptedRetry {
        fn request_new_password(&self, _message: &str) -> Result<Option<String>, PromptError> {
            *self.calls.lock().unwrap() += 1;
            self.passwords
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }
    }

    fn password_only(password: &str) -> HostScript {
        HostScript {
            password: Some(password.to_string()),
            ..HostScript::default()
        }
    }

    fn prompt(text: &str, answer: &str) -> (Prompt, String) {
        (Prompt::new(text, false), answer.to_string())
    }

    fn jump(host: &str, password: &str) -> JumpHostConfig {
        JumpHostConfig {
            enabled: true,
            host: host.to_string(),
            username: "b".to_string(),
            password: Some(password.to_string()),
            ..JumpHostConfig::default()
        }
    }

    fn attempt(method: AuthMethod, stage: Stage, result: AttemptResult) -> AuthAttempt {
        AuthAttempt {
            method,
            stage,
            result,
        }
    }

    #[test]
    fn test_direct_password_login_uses_one_shot_connect() {
        let client = FakeClient::default().host("web", password_only("pw"));
        let mut engine = AuthEngine::new(client, ScriptedPrompts::answering(&[]));

        let creds = Credentials::new("web", 22, "me").with_password("pw");
        let conn = engine.connect(&creds, None).unwrap();

        assert_eq!(conn.method, AuthMethod::Password);
        assert!(conn.jump.is_none());
        assert_eq!(engine.state(), AuthState::Authenticated);
        assert_eq!(
            engine.attempts(),
            &[attempt(AuthMethod::Password, Stage::Target, AttemptResult::Success)]
        );
    }

    #[test]
    fn test_interactive_is_tried_before_password() {
        let client = FakeClient::default()
            .host("bastion", password_only("jpw"))
            .host("web", password_only("pw"));
        let mut engine = AuthEngine::new(client, ScriptedPrompts::answering(&[]));

        let creds = Credentials::new("web", 22, "me").with_password("pw");
        engine.connect(&creds, Some(&jump("bastion", "jpw"))).unwrap();

        let jump_attempts: Vec<_> = engine
            .attempts()
            .iter()
            .filter(|a| a.stage == Stage::Jump)
            .copied()
            .collect();
        assert_eq!(
            jump_attempts,
            vec![
                attempt(AuthMethod::Interactive, Stage::Jump, AttemptResult::Failed),
                attempt(AuthMethod::Password, Stage::Jump, AttemptResult::Success),
            ]
        );
    }

    #[test]
    fn test_partial_interactive_does_not_fall_back_to_password() {
        let script = HostScript {
            password: Some("pw".into()),
            password_partial: true,
            rounds: vec![
                vec![prompt("Password:", "pw")],
                vec![prompt("Verification code:", "123456")],
            ],
            ..HostScript::default()
        };
        let client = FakeClient::default().host("web", script);
        let prompts = ScriptedPrompts::answering(&[&["123456"]]);
        let mut engine = AuthEngine::new(client, prompts.clone());

        let creds = Credentials::new("web", 22, "me").with_password("pw");
        let conn = engine.connect(&creds, None).unwrap();

        assert_eq!(conn.method, AuthMethod::Interactive);
        assert_eq!(
            engine.attempts(),
            &[
                // one-shot password login gets a partial success and is refused
                attempt(AuthMethod::Password, Stage::Target, AttemptResult::Failed),
                attempt(AuthMethod::Interactive, Stage::Target, AttemptResult::Partial),
                attempt(AuthMethod::Interactive, Stage::Target, AttemptResult::Success),
            ]
        );
        // The password prompt was auto-filled; only the code reached the user
        assert_eq!(prompts.seen(), vec![vec![Prompt::new("Verification code:", false)]]);
    }

    #[test]
    fn test_manual_attempt_uses_fresh_tunnel() {
        let client = FakeClient::default()
            .host("bastion", password_only("jpw"))
            .host(
                "web",
                HostScript {
                    rounds: vec![vec![prompt("Passcode:", "42")]],
                    ..HostScript::default()
                },
            );
        let world = client.0.clone();
        let mut engine = AuthEngine::new(client, ScriptedPrompts::answering(&[&["42"]]));

        let creds = Credentials::new("web", 22, "me");
        engine.connect(&creds, Some(&jump("bastion", "jpw"))).unwrap();

        let used = world.lock().unwrap().tunnels_used.clone();
        assert_eq!(used.len(), 2);
        assert_ne!(used[0], used[1]);
    }

    #[test]
    fn test_bastion_with_passcode_target() {
        let client = FakeClient::default()
            .host("bastion", password_only("jpw"))
            .host(
                "web",
                HostScript {
                    rounds: vec![vec![prompt("Passcode:", "777")]],
                    ..HostScript::default()
                },
            );
        let prompts = ScriptedPrompts::answering(&[&["777"]]);
        let mut engine = AuthEngine::new(client, prompts.clone());

        let creds = Credentials::new("web", 22, "me");
        let conn = engine.connect(&creds, Some(&jump("bastion", "jpw"))).unwrap();

        assert_eq!(engine.state(), AuthState::Authenticated);
        assert!(conn.jump.is_some());
        assert_eq!(prompts.seen(), vec![vec![Prompt::new("Passcode:", false)]]);
    }

    #[test]
    fn test_password_retry_produces_new_attempt() {
        let client = FakeClient::default().host("bastion", password_only("right"));
        let client = client.host("web", password_only("pw"));
        let retry = ScriptedRetry::new(vec![Ok(Some("right".into()))]);
        let mut engine =
            AuthEngine::new(client, ScriptedPrompts::answering(&[])).with_retry(retry.clone());

        let creds = Credentials::new("web", 22, "me").with_password("pw");
        engine.connect(&creds, Some(&jump("bastion", "wrong"))).unwrap();

        assert_eq!(retry.calls(), 1);
        let passwords: Vec<_> = engine
            .attempts()
            .iter()
            .filter(|a| a.stage == Stage::Jump && a.method == AuthMethod::Password)
            .map(|a| a.result)
            .collect();
        assert_eq!(passwords, vec![AttemptResult::Failed, AttemptResult::Success]);
    }

    #[test]
    fn test_password_attempts_are_bounded() {
        let client = FakeClient::default().host("bastion", password_only("right"));
        let retry = ScriptedRetry::new(vec![Ok(Some("nope".into())), Ok(Some("right".into()))]);
        let mut engine =
            AuthEngine::new(client, ScriptedPrompts::answering(&[])).with_retry(retry.clone());

        let creds = Credentials::new("web", 22, "me");
        let err = engine
            .connect(&creds, Some(&jump("bastion", "wrong")))
            .err()
            .unwrap();

        assert!(matches!(
            err,
            AuthError::Failed {
                stage: Stage::Jump,
                reason: FailureReason::Exhausted,
                ..
            }
        ));
        assert_eq!(retry.calls(), 1);
        assert_eq!(engine.state(), AuthState::Failed);
    }

    #[test]
    fn test_empty_retry_is_cancellation() {
        let client = FakeClient::default().host("bastion", password_only("right"));
        let world = client.0.clone();
        let retry = ScriptedRetry::new(vec![Ok(Some(String::new()))]);
        let mut engine =
            AuthEngine::new(client, ScriptedPrompts::answering(&[])).with_retry(retry);

        let err = engine
            .connect(&Credentials::new("web", 22, "me"), Some(&jump("bastion", "wrong")))
            .err()
            .unwrap();

        assert!(matches!(
            err,
            AuthError::Failed {
                reason: FailureReason::Cancelled,
                ..
            }
        ));
        // The half-open jump connection is torn down
        assert_eq!(world.lock().unwrap().disconnected, vec!["bastion"]);
    }

    #[test]
    fn test_retry_timeout_is_reported() {
        let client = FakeClient::default().host("bastion", password_only("right"));
        let retry = ScriptedRetry::new(vec![Err(PromptError::TimedOut(
            std::time::Duration::from_secs(120),
        ))]);
        let mut engine =
            AuthEngine::new(client, ScriptedPrompts::answering(&[])).with_retry(retry);

        let err = engine
            .connect(&Credentials::new("web", 22, "me"), Some(&jump("bastion", "wrong")))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            AuthError::Failed {
                reason: FailureReason::TimedOut,
                ..
            }
        ));
    }

    #[test]
    fn test_all_empty_answers_cancel_everything() {
        let client = FakeClient::default().host(
            "web",
            HostScript {
                password: Some("pw".into()),
                rounds: vec![vec![prompt("Token:", "1")]],
                ..HostScript::default()
            },
        );
        let mut engine = AuthEngine::new(client, ScriptedPrompts::answering(&[&[""]]));

        let err = engine
            .connect(&Credentials::new("web", 22, "me"), None)
            .err()
            .unwrap();

        assert!(matches!(
            err,
            AuthError::Failed {
                stage: Stage::Target,
                reason: FailureReason::Cancelled,
                ..
            }
        ));
        // No password attempt after the cancellation
        assert!(engine
            .attempts()
            .iter()
            .all(|a| a.method != AuthMethod::Password));
    }

    #[test]
    fn test_unreachable_target_is_fatal() {
        let client = FakeClient::default().host(
            "web",
            HostScript {
                unreachable: true,
                ..HostScript::default()
            },
        );
        let mut engine = AuthEngine::new(client, ScriptedPrompts::answering(&[]));

        let err = engine
            .connect(&Credentials::new("web", 22, "me"), None)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            AuthError::Connection {
                stage: Stage::Target,
                ..
            }
        ));
        assert!(err.to_string().contains("web"));
        assert!(engine.attempts().is_empty());
    }

    #[test]
    fn test_target_failure_closes_jump() {
        let client = FakeClient::default()
            .host("bastion", password_only("jpw"))
            .host("web", password_only("other"));
        let world = client.0.clone();
        let mut engine = AuthEngine::new(client, ScriptedPrompts::answering(&[]));

        let creds = Credentials::new("web", 22, "me").with_password("pw");
        let err = engine
            .connect(&creds, Some(&jump("bastion", "jpw")))
            .err()
            .unwrap();

        assert_eq!(err.stage(), Stage::Target);
        let disconnected = world.lock().unwrap().disconnected.clone();
        assert_eq!(disconnected, vec!["web", "bastion"]);
    }

    #[test]
    fn test_autofill_only_once_per_attempt() {
        let mut attempt = InteractiveAttempt::new(Some("pw"));
        assert_eq!(attempt.autofill("Verification code:"), None);
        assert_eq!(attempt.autofill("Enter PASSCODE:"), Some("pw".to_string()));
        assert_eq!(attempt.autofill("Password:"), None);

        let mut without = InteractiveAttempt::new(None);
        assert_eq!(without.autofill("Password:"), None);
    }

    #[test]
    fn test_empty_challenge_is_answered_without_asking() {
        let client = FakeClient::default().host(
            "web",
            HostScript {
                rounds: vec![vec![]],
                ..HostScript::default()
            },
        );
        let prompts = ScriptedPrompts::answering(&[]);
        let mut engine = AuthEngine::new(client, prompts.clone());

        let conn = engine.connect(&Credentials::new("web", 22, "me"), None).unwrap();

        assert_eq!(conn.method, AuthMethod::Interactive);
        assert!(prompts.seen().is_empty());
    }

    #[test]
    fn test_exhausted_rounds_fall_back_to_password() {
        let codes: Vec<Vec<(Prompt, String)>> = (1..=5)
            .map(|i| vec![prompt("Code:", &i.to_string())])
            .collect();
        let client = FakeClient::default()
            .host(
                "bastion",
                HostScript {
                    password: Some("jpw".into()),
                    rounds: codes,
                    ..HostScript::default()
                },
            )
            .host("web", password_only("pw"));
        let prompts = ScriptedPrompts::answering(&[&["1"], &["2"], &["3"]]);
        let mut engine = AuthEngine::new(client, prompts.clone()).with_policy(AuthPolicy {
            max_interactive_rounds: 3,
            ..AuthPolicy::default()
        });

        let creds = Credentials::new("web", 22, "me").with_password("pw");
        engine.connect(&creds, Some(&jump("bastion", "jpw"))).unwrap();

        assert_eq!(prompts.seen().len(), 3);
        let partial = attempt(AuthMethod::Interactive, Stage::Jump, AttemptResult::Partial);
        assert_eq!(
            &engine.attempts()[..4],
            &[
                partial,
                partial,
                partial,
                attempt(AuthMethod::Password, Stage::Jump, AttemptResult::Success),
            ]
        );
    }

    #[test]
    fn test_partial_password_continues_with_interactive() {
        let client = FakeClient::default().host(
            "web",
            HostScript {
                password: Some("pw".into()),
                password_partial: true,
                password_first: true,
                rounds: vec![vec![prompt("Verification code:", "999")]],
                ..HostScript::default()
            },
        );
        let prompts = ScriptedPrompts::answering(&[&["999"]]);
        let mut engine = AuthEngine::new(client, prompts.clone());

        let creds = Credentials::new("web", 22, "me").with_password("pw");
        let conn = engine.connect(&creds, None).unwrap();

        assert_eq!(conn.method, AuthMethod::Interactive);
        assert_eq!(prompts.seen().len(), 1);
        assert_eq!(
            engine.attempts(),
            &[
                attempt(AuthMethod::Password, Stage::Target, AttemptResult::Failed),
                attempt(AuthMethod::Interactive, Stage::Target, AttemptResult::Failed),
                attempt(AuthMethod::Password, Stage::Target, AttemptResult::Partial),
                attempt(AuthMethod::Interactive, Stage::Target, AttemptResult::Success),
            ]
        );
    }

    #[test]
    fn test_tunnel_failure_closes_jump() {
        let client = FakeClient::default()
            .host(
                "bastion",
                HostScript {
                    password: Some("jpw".into()),
                    tunnel_fails: true,
                    ..HostScript::default()
                },
            )
            .host("web", password_only("pw"));
        let world = client.0.clone();
        let mut engine = AuthEngine::new(client, ScriptedPrompts::answering(&[]));

        let creds = Credentials::new("web", 22, "me").with_password("pw");
        let err = engine
            .connect(&creds, Some(&jump("bastion", "jpw")))
            .err()
            .unwrap();

        assert!(matches!(err, AuthError::Tunnel { .. }));
        assert_eq!(err.stage(), Stage::Jump);
        assert_eq!(engine.state(), AuthState::Failed);
        assert_eq!(world.lock().unwrap().disconnected, vec!["bastion"]);
    }
}
