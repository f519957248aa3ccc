//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Current state of the call session.
///
/// Replaces the boolean-flag call phases of the legacy client
/// (`receivingCall` / `callAccepted` / `callEnded`) with one explicit
/// enumeration, so illegal flag combinations are unrepresentable.
#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub enum CallState {
    /// No call in progress.
    #[default]
    Idle,
    /// Outgoing call: media session created, invite sent or about to be sent.
    Calling { placed_at: DateTime<Utc> },
    /// Incoming call: invite received, ringing locally.
    Ringing { received_at: DateTime<Utc> },
    /// Call answered locally, waiting for the remote stream to arrive.
    ConnectedPending { answered_at: DateTime<Utc> },
    /// Negotiation complete, media flowing.
    Connected { connected_at: DateTime<Utc> },
    /// Transient teardown state; always resolves to `Idle`.
    Ending,
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn can_answer(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    /// True for every state with an active call attempt (anything that
    /// `hang_up` has work to do in).
    pub fn in_call(&self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// State transitions for the call session.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local user placed an outgoing call.
    InvitePlaced,
    /// A call invite arrived from the relay.
    InviteReceived,
    /// Local user answered the ringing call.
    LocalAnswered,
    /// The remote side answered our invite.
    RemoteAnswered,
    /// The media session delivered the remote stream.
    RemoteStreamAttached,
    /// Any teardown path: hangup, remote end, failure, relay loss.
    Teardown,
}

impl CallState {
    /// Compute the state resulting from a transition.
    ///
    /// Returns an error when the transition is not valid in the current
    /// state; the caller decides whether to absorb or propagate it.
    pub fn transition(&self, transition: &CallTransition) -> Result<CallState, InvalidTransition> {
        let next = match (self, transition) {
            (CallState::Idle, CallTransition::InvitePlaced) => CallState::Calling {
                placed_at: Utc::now(),
            },
            (CallState::Idle, CallTransition::InviteReceived) => CallState::Ringing {
                received_at: Utc::now(),
            },
            (CallState::Ringing { .. }, CallTransition::LocalAnswered) => {
                CallState::ConnectedPending {
                    answered_at: Utc::now(),
                }
            }
            (CallState::Calling { .. }, CallTransition::RemoteAnswered) => CallState::Connected {
                connected_at: Utc::now(),
            },
            (CallState::ConnectedPending { .. }, CallTransition::RemoteStreamAttached) => {
                CallState::Connected {
                    connected_at: Utc::now(),
                }
            }
            // The initiator may receive the remote stream after the answer
            // already moved it to Connected; that is a harmless self-loop.
            (CallState::Connected { connected_at }, CallTransition::RemoteStreamAttached) => {
                CallState::Connected {
                    connected_at: *connected_at,
                }
            }
            (
                CallState::Calling { .. }
                | CallState::Ringing { .. }
                | CallState::ConnectedPending { .. }
                | CallState::Connected { .. },
                CallTransition::Teardown,
            ) => CallState::Ending,
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(next)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test complete outgoing call flow.
    /// Flow: Idle → Calling → Connected → Ending
    #[test]
    fn test_outgoing_call_flow() {
        let mut state = CallState::default();
        assert!(state.is_idle());

        state = state.transition(&CallTransition::InvitePlaced).unwrap();
        assert!(matches!(state, CallState::Calling { .. }));

        state = state.transition(&CallTransition::RemoteAnswered).unwrap();
        assert!(state.is_connected());

        // Remote stream after the answer keeps the original connect time.
        let before = state.clone();
        state = state
            .transition(&CallTransition::RemoteStreamAttached)
            .unwrap();
        assert_eq!(state, before);

        state = state.transition(&CallTransition::Teardown).unwrap();
        assert!(matches!(state, CallState::Ending));
    }

    /// Test complete incoming call flow.
    /// Flow: Idle → Ringing → ConnectedPending → Connected
    #[test]
    fn test_incoming_call_flow() {
        let mut state = CallState::default();

        state = state.transition(&CallTransition::InviteReceived).unwrap();
        assert!(state.can_answer());

        state = state.transition(&CallTransition::LocalAnswered).unwrap();
        assert!(matches!(state, CallState::ConnectedPending { .. }));
        assert!(!state.is_connected());

        state = state
            .transition(&CallTransition::RemoteStreamAttached)
            .unwrap();
        assert!(state.is_connected());
    }

    /// Test teardown is reachable from every in-call state.
    #[test]
    fn test_teardown_from_any_in_call_state() {
        let calling = CallState::Idle
            .transition(&CallTransition::InvitePlaced)
            .unwrap();
        let ringing = CallState::Idle
            .transition(&CallTransition::InviteReceived)
            .unwrap();
        let pending = ringing.transition(&CallTransition::LocalAnswered).unwrap();
        let connected = calling.transition(&CallTransition::RemoteAnswered).unwrap();

        for state in [calling, ringing, pending, connected] {
            assert!(matches!(
                state.transition(&CallTransition::Teardown).unwrap(),
                CallState::Ending
            ));
        }
    }

    /// Test invalid state transitions are rejected.
    #[test]
    fn test_invalid_transitions() {
        let idle = CallState::Idle;

        // Nothing to answer or tear down when idle.
        assert!(idle.transition(&CallTransition::LocalAnswered).is_err());
        assert!(idle.transition(&CallTransition::RemoteAnswered).is_err());
        assert!(idle.transition(&CallTransition::Teardown).is_err());
        assert!(
            idle.transition(&CallTransition::RemoteStreamAttached)
                .is_err()
        );

        // A second invite in either direction is rejected mid-call.
        let calling = idle.transition(&CallTransition::InvitePlaced).unwrap();
        assert!(calling.transition(&CallTransition::InvitePlaced).is_err());
        assert!(calling.transition(&CallTransition::InviteReceived).is_err());

        // The callee cannot receive an answer; only the caller can.
        let ringing = idle.transition(&CallTransition::InviteReceived).unwrap();
        assert!(ringing.transition(&CallTransition::RemoteAnswered).is_err());
    }

    /// Test the error carries both sides of the rejected transition.
    #[test]
    fn test_invalid_transition_message() {
        let err = CallState::Idle
            .transition(&CallTransition::Teardown)
            .unwrap_err();
        assert!(err.current_state.contains("Idle"));
        assert!(err.attempted.contains("Teardown"));
        let msg = err.to_string();
        assert!(msg.contains("Teardown") && msg.contains("Idle"));
    }
}
