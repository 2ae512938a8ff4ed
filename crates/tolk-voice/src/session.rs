//! Remote session contract and connection supervision
//!
//! The transport is an opaque bidirectional stream: audio and control events
//! flow back on a channel, each tagged with the [`AttemptId`] of the connect
//! call that produced it. [`ConnectionSupervisor`] owns the attempt counter,
//! the session status, and the retry budget; anything tagged with an attempt
//! that is no longer current is stale and must not touch state.

use crate::error::{ErrorClass, VoiceError, VoiceResult};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shortest credential accepted before a connect is even attempted
pub const MIN_API_KEY_LEN: usize = 10;

/// Backoff before retrying after a transient error on an open session
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(1500);

/// Backoff before retrying a connect that failed outright
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(3000);

/// Automatic retries granted per successful open
const RETRY_BUDGET: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Closed by the idle policy; wakes on speech
    Standby,
    Error,
}

impl SessionStatus {
    /// Socket-style label for diagnostics
    pub fn ws_state(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected | SessionStatus::Error => "CLOSED",
            SessionStatus::Connecting => "CONNECTING",
            SessionStatus::Connected => "OPEN",
            SessionStatus::Standby => "STANDBY",
        }
    }

    /// Nothing is connected or on its way
    pub fn is_dormant(&self) -> bool {
        matches!(self, SessionStatus::Standby | SessionStatus::Disconnected)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Standby => "standby",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Generation number of one connect attempt. 0 is never current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a transport needs to open a session
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub api_key: String,
    pub system_instruction: String,
    pub voice_name: String,
    pub model: String,
}

/// Events a session reports back
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Opened,
    /// Base64 PCM16 at 24 kHz
    ChunkReceived(String),
    TextDelta(String),
    TurnComplete,
    Closed,
    Error(String),
}

/// A session event tagged with the attempt that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub attempt: AttemptId,
    pub event: SessionEvent,
}

impl TransportEvent {
    pub fn new(attempt: AttemptId, event: SessionEvent) -> Self {
        Self { attempt, event }
    }
}

/// Opens sessions against the remote voice API
#[async_trait::async_trait]
pub trait SessionTransport: Send + Sync {
    /// Open a session. Events for it go to `events`, tagged with `attempt`.
    async fn connect(
        &self,
        request: ConnectRequest,
        attempt: AttemptId,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> VoiceResult<Box<dyn SessionHandle>>;
}

/// A live session
pub trait SessionHandle: Send {
    /// Send one base64 PCM16 chunk (16 kHz mono)
    fn send_audio(&self, pcm_base64: &str) -> VoiceResult<()>;

    fn close(&self);
}

/// Ticket for a scheduled retry; only the latest ticket is honoured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryTicket(u64);

/// What to do after the transport reported a problem
#[derive(Debug, Clone, PartialEq)]
pub enum FailureAction {
    /// Stale attempt or known noise: nothing happened
    Ignore,
    /// Close the session and reconnect after `delay`
    Retry {
        ticket: RetryTicket,
        delay: Duration,
        message: String,
    },
    /// Surface the error; no automatic retry
    Surface { message: String },
}

/// Reject missing or obviously truncated credentials before connecting
pub fn validate_api_key(api_key: Option<&str>) -> VoiceResult<&str> {
    match api_key {
        Some(key) if key.trim().len() >= MIN_API_KEY_LEN => Ok(key.trim()),
        _ => Err(VoiceError::Auth(
            "API key is missing or invalid".to_string(),
        )),
    }
}

/// Attempt generations, session status and retry policy
#[derive(Debug)]
pub struct ConnectionSupervisor {
    current: u64,
    last_issued: u64,
    status: SessionStatus,
    retry_budget: u8,
    retry_seq: u64,
    pending_retry: Option<RetryTicket>,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    pub fn new() -> Self {
        Self {
            current: 0,
            last_issued: 0,
            status: SessionStatus::Disconnected,
            retry_budget: RETRY_BUDGET,
            retry_seq: 0,
            pending_retry: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn current_attempt(&self) -> Option<AttemptId> {
        (self.current != 0).then_some(AttemptId(self.current))
    }

    /// Start a new attempt; every earlier attempt becomes stale
    pub fn begin_attempt(&mut self) -> AttemptId {
        self.last_issued += 1;
        self.current = self.last_issued;
        self.status = SessionStatus::Connecting;
        self.pending_retry = None;
        debug!(attempt = self.current, "Connect attempt started");
        AttemptId(self.current)
    }

    pub fn is_current(&self, attempt: AttemptId) -> bool {
        self.current != 0 && attempt.0 == self.current
    }

    /// Deliberate disconnect: nothing in flight may mutate state afterwards
    pub fn invalidate(&mut self) {
        self.current = 0;
        self.pending_retry = None;
        self.status = SessionStatus::Disconnected;
    }

    /// Idle shutdown; like `invalidate` but remembered as standby
    pub fn standby(&mut self) {
        self.invalidate();
        self.status = SessionStatus::Standby;
    }

    /// Credential failure: nothing was attempted
    pub fn auth_failed(&mut self) {
        self.invalidate();
        self.status = SessionStatus::Error;
    }

    /// Returns false for a stale attempt
    pub fn on_opened(&mut self, attempt: AttemptId) -> bool {
        if !self.is_current(attempt) {
            return false;
        }
        info!(attempt = attempt.0, "✅ Session open");
        self.status = SessionStatus::Connected;
        self.retry_budget = RETRY_BUDGET;
        true
    }

    /// Returns true when the close changed the status
    pub fn on_closed(&mut self, attempt: AttemptId) -> bool {
        if !self.is_current(attempt) {
            debug!(attempt = attempt.0, "👻 Stale session closed, ignoring");
            return false;
        }
        info!(attempt = attempt.0, "🔌 Session closed");
        self.current = 0;
        self.status = SessionStatus::Disconnected;
        true
    }

    /// Classify an error reported on a session
    pub fn on_session_error(&mut self, attempt: AttemptId, message: &str) -> FailureAction {
        if !self.is_current(attempt) {
            return FailureAction::Ignore;
        }
        match ErrorClass::of(message) {
            ErrorClass::Ignored => FailureAction::Ignore,
            ErrorClass::Transient => {
                warn!(attempt = attempt.0, "Transient session error: {}", message);
                self.current = 0;
                self.status = SessionStatus::Connecting;
                match self.schedule_retry() {
                    Some(ticket) => FailureAction::Retry {
                        ticket,
                        delay: TRANSIENT_RETRY_DELAY,
                        message: message.to_string(),
                    },
                    None => {
                        self.status = SessionStatus::Error;
                        FailureAction::Surface {
                            message: message.to_string(),
                        }
                    }
                }
            }
            ErrorClass::Fatal => {
                self.current = 0;
                self.status = SessionStatus::Error;
                FailureAction::Surface {
                    message: message.to_string(),
                }
            }
        }
    }

    /// Classify a connect call that failed before the session opened
    pub fn on_connect_failed(&mut self, attempt: AttemptId, error: &VoiceError) -> FailureAction {
        if !self.is_current(attempt) {
            return FailureAction::Ignore;
        }
        let message = error.to_string();
        self.current = 0;
        if matches!(error, VoiceError::Auth(_)) {
            self.status = SessionStatus::Error;
            return FailureAction::Surface { message };
        }

        self.status = SessionStatus::Disconnected;
        match self.schedule_retry() {
            Some(ticket) => FailureAction::Retry {
                ticket,
                delay: CONNECT_RETRY_DELAY,
                message,
            },
            None => FailureAction::Surface { message },
        }
    }

    /// Honour a retry ticket once, if nothing has superseded it
    pub fn take_retry(&mut self, ticket: RetryTicket) -> bool {
        if self.pending_retry == Some(ticket) {
            self.pending_retry = None;
            true
        } else {
            false
        }
    }

    pub fn has_pending_retry(&self) -> bool {
        self.pending_retry.is_some()
    }

    fn schedule_retry(&mut self) -> Option<RetryTicket> {
        if self.retry_budget == 0 {
            return None;
        }
        self.retry_budget -= 1;
        self.retry_seq += 1;
        let ticket = RetryTicket(self.retry_seq);
        self.pending_retry = Some(ticket);
        Some(ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_validation() {
        assert!(validate_api_key(None).is_err());
        assert!(matches!(validate_api_key(Some("short")), Err(VoiceError::Auth(_))));
        assert_eq!(validate_api_key(Some(" AIzaSyExample123 ")).unwrap(), "AIzaSyExample123");
    }

    #[test]
    fn test_superseded_attempt_cannot_mutate_state() {
        let mut sup = ConnectionSupervisor::new();
        let a = sup.begin_attempt();
        let b = sup.begin_attempt();

        assert!(!sup.on_opened(a));
        assert_eq!(sup.status(), SessionStatus::Connecting);
        assert!(!sup.on_closed(a));
        assert_eq!(sup.on_session_error(a, "Internal error"), FailureAction::Ignore);
        assert_eq!(
            sup.on_connect_failed(a, &VoiceError::Transport("refused".into())),
            FailureAction::Ignore
        );
        assert_eq!(sup.status(), SessionStatus::Connecting);
        assert!(!sup.has_pending_retry());

        assert!(sup.on_opened(b));
        assert_eq!(sup.status(), SessionStatus::Connected);
        assert!(!sup.on_closed(a));
        assert_eq!(sup.status(), SessionStatus::Connected);
    }

    #[test]
    fn test_disconnect_invalidates_current_attempt() {
        let mut sup = ConnectionSupervisor::new();
        let a = sup.begin_attempt();
        sup.invalidate();
        assert!(!sup.on_opened(a));
        assert_eq!(sup.status(), SessionStatus::Disconnected);
        assert_eq!(sup.current_attempt(), None);
    }

    #[test]
    fn test_transient_error_retries_once() {
        let mut sup = ConnectionSupervisor::new();
        let a = sup.begin_attempt();
        sup.on_opened(a);

        let ticket = match sup.on_session_error(a, "service unavailable") {
            FailureAction::Retry { ticket, delay, .. } => {
                assert_eq!(delay, TRANSIENT_RETRY_DELAY);
                ticket
            }
            other => panic!("expected retry, got {:?}", other),
        };
        assert!(sup.take_retry(ticket));
        assert!(!sup.take_retry(ticket));

        // retry never opened; the budget is spent
        let b = sup.begin_attempt();
        let action = sup.on_session_error(b, "503 overloaded");
        assert!(matches!(action, FailureAction::Surface { .. }));
        assert_eq!(sup.status(), SessionStatus::Error);
    }

    #[test]
    fn test_open_refills_retry_budget() {
        let mut sup = ConnectionSupervisor::new();
        let a = sup.begin_attempt();
        assert!(matches!(
            sup.on_connect_failed(a, &VoiceError::Transport("refused".into())),
            FailureAction::Retry { delay: CONNECT_RETRY_DELAY, .. }
        ));
        assert_eq!(sup.status(), SessionStatus::Disconnected);

        let b = sup.begin_attempt();
        sup.on_opened(b);
        assert!(matches!(
            sup.on_session_error(b, "Internal error encountered"),
            FailureAction::Retry { .. }
        ));
    }

    #[test]
    fn test_ignored_and_fatal_errors() {
        let mut sup = ConnectionSupervisor::new();
        let a = sup.begin_attempt();
        sup.on_opened(a);
        assert_eq!(
            sup.on_session_error(a, "Operation is not implemented, or supported"),
            FailureAction::Ignore
        );
        assert_eq!(sup.status(), SessionStatus::Connected);

        assert!(matches!(
            sup.on_session_error(a, "Request contains an invalid argument"),
            FailureAction::Surface { .. }
        ));
        assert_eq!(sup.status(), SessionStatus::Error);
    }

    #[test]
    fn test_auth_failure_is_not_retried() {
        let mut sup = ConnectionSupervisor::new();
        let a = sup.begin_attempt();
        let action = sup.on_connect_failed(a, &VoiceError::Auth("bad key".into()));
        assert!(matches!(action, FailureAction::Surface { .. }));
        assert!(!sup.has_pending_retry());
    }

    #[test]
    fn test_new_attempt_cancels_pending_retry() {
        let mut sup = ConnectionSupervisor::new();
        let a = sup.begin_attempt();
        let ticket = match sup.on_connect_failed(a, &VoiceError::Transport("x".into())) {
            FailureAction::Retry { ticket, .. } => ticket,
            other => panic!("expected retry, got {:?}", other),
        };
        sup.begin_attempt();
        assert!(!sup.take_retry(ticket));
    }

    #[test]
    fn test_standby_status() {
        let mut sup = ConnectionSupervisor::new();
        let a = sup.begin_attempt();
        sup.on_opened(a);
        sup.standby();
        assert_eq!(sup.status(), SessionStatus::Standby);
        assert!(sup.status().is_dormant());
        assert!(!sup.on_closed(a));
        assert_eq!(sup.status().ws_state(), "STANDBY");
    }
}
