//! Pure session state machine
//!
//! ```text
//! Disconnected --start--> Connecting{0} --established--> Connected
//! Connecting{n} --connect failed--> Connecting{n+1}   (after backoff)
//! Connecting{n} --retries exhausted / auth refused--> Failed
//! Connected --connection lost--> Connecting{0}
//! any --close requested--> Disconnecting --closed--> Disconnected
//! ```

use std::fmt;
use tracing::{error, info, warn};

/// Why a session gave up for good
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The broker refused the credential; retrying cannot help
    AuthenticationRejected(String),
    /// Every allowed connect attempt failed
    RetriesExhausted { attempts: u32, last_error: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::AuthenticationRejected(reason) => {
                write!(f, "authentication rejected: {reason}")
            }
            FailureCause::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {attempts} connect attempts: {last_error}"),
        }
    }
}

/// Connection state of one credential session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Connect attempt `attempt` (0-indexed) is running or scheduled
    Connecting { attempt: u32 },
    Connected,
    Disconnecting,
    Failed(FailureCause),
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting { .. } => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Failed(_) => "failed",
        }
    }

    /// Only a connected session may carry broker operations
    pub fn can_operate(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionState::Failed(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            SessionState::Failed(cause) => write!(f, "failed ({cause})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectStarted(u32),
    Established,
    ConnectFailed { attempt: u32, reason: String },
    ConnectionLost(String),
    CloseRequested,
    Closed,
    PermanentFailure(FailureCause),
}

/// Next state after `event` (pure function)
pub fn next_state(current: &SessionState, event: &SessionEvent) -> SessionState {
    match (current, event) {
        // Failure is terminal; only an explicit close moves on
        (SessionState::Failed(_), SessionEvent::CloseRequested) => SessionState::Disconnecting,
        (SessionState::Failed(_), SessionEvent::Closed) => SessionState::Disconnected,
        (SessionState::Failed(cause), _) => SessionState::Failed(cause.clone()),

        // An explicit close wins over anything the connection reports meanwhile
        (SessionState::Disconnecting, SessionEvent::Closed) => SessionState::Disconnected,
        (SessionState::Disconnecting, _) => SessionState::Disconnecting,

        (_, SessionEvent::ConnectStarted(attempt)) => SessionState::Connecting { attempt: *attempt },
        (_, SessionEvent::Established) => SessionState::Connected,
        (_, SessionEvent::ConnectFailed { attempt, .. }) => SessionState::Connecting {
            attempt: attempt.saturating_add(1),
        },
        (_, SessionEvent::ConnectionLost(_)) => SessionState::Connecting { attempt: 0 },
        (_, SessionEvent::CloseRequested) => SessionState::Disconnecting,
        (_, SessionEvent::Closed) => SessionState::Disconnected,
        (_, SessionEvent::PermanentFailure(cause)) => SessionState::Failed(cause.clone()),
    }
}

/// Log a state change for `principal` (pure logging function)
pub fn log_state_transition(principal: &str, from: &SessionState, to: &SessionState) {
    if from == to {
        return;
    }
    match (from, to) {
        (SessionState::Connecting { attempt: 0 }, SessionState::Connected) => {
            info!(principal, "Broker session connected");
        }
        (SessionState::Connecting { attempt }, SessionState::Connected) => {
            info!(principal, attempts = attempt + 1, "Broker session reconnected");
        }
        (SessionState::Connected, SessionState::Connecting { .. }) => {
            warn!(principal, "Broker connection lost, reconnecting");
        }
        (_, SessionState::Failed(cause)) => {
            error!(principal, cause = %cause, "Broker session failed permanently");
        }
        (_, SessionState::Disconnected) => {
            info!(principal, "Broker session closed");
        }
        _ => {
            tracing::debug!(principal, from = %from, to = %to, "Session state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let state = SessionState::Disconnected;
        let state = next_state(&state, &SessionEvent::ConnectStarted(0));
        assert_eq!(state, SessionState::Connecting { attempt: 0 });

        let state = next_state(&state, &SessionEvent::Established);
        assert!(state.can_operate());
    }

    #[test]
    fn test_connect_failure_advances_attempt() {
        let state = SessionState::Connecting { attempt: 2 };
        let state = next_state(
            &state,
            &SessionEvent::ConnectFailed {
                attempt: 2,
                reason: "refused".into(),
            },
        );
        assert_eq!(state, SessionState::Connecting { attempt: 3 });
    }

    #[test]
    fn test_loss_restarts_attempt_counter() {
        let state = next_state(
            &SessionState::Connected,
            &SessionEvent::ConnectionLost("heartbeat missed".into()),
        );
        assert_eq!(state, SessionState::Connecting { attempt: 0 });
        assert!(!state.can_operate());
    }

    #[test]
    fn test_loss_during_close_keeps_disconnecting() {
        let state = next_state(
            &SessionState::Disconnecting,
            &SessionEvent::ConnectionLost("socket closed".into()),
        );
        assert_eq!(state, SessionState::Disconnecting);

        let state = next_state(&state, &SessionEvent::Closed);
        assert_eq!(state, SessionState::Disconnected);
    }

    #[test]
    fn test_failed_is_sticky() {
        let cause = FailureCause::AuthenticationRejected("ACCESS_REFUSED".into());
        let failed = SessionState::Failed(cause.clone());

        assert_eq!(
            next_state(&failed, &SessionEvent::Established),
            SessionState::Failed(cause.clone())
        );
        assert_eq!(
            next_state(&failed, &SessionEvent::ConnectStarted(0)),
            SessionState::Failed(cause)
        );
        assert_eq!(
            next_state(&failed, &SessionEvent::CloseRequested),
            SessionState::Disconnecting
        );
    }

    #[test]
    fn test_display_includes_detail() {
        let state = SessionState::Failed(FailureCause::RetriesExhausted {
            attempts: 60,
            last_error: "connection refused".into(),
        });
        let rendered = state.to_string();
        assert!(rendered.contains("60"));
        assert!(rendered.contains("connection refused"));
    }
}
