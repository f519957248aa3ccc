//! The call session entity.

use serde::Serialize;

use super::state::{CallState, CallTransition, InvalidTransition};
use crate::media::{MediaSession, RemoteStream, SignalPayload};

/// The single (lazily populated) call session of a client instance.
///
/// Owns everything scoped to one call attempt: the negotiated state, the
/// remote party, the unconsumed invite signal, the exclusively-owned media
/// session handle, and the remote stream. `reset` is the one teardown
/// primitive; every end-of-call path funnels through it and leaves the
/// session reusable for the next call.
#[derive(Serialize, Default)]
pub struct CallSession {
    pub state: CallState,
    /// The other participant's relay token. Non-empty whenever a call
    /// attempt is in flight; cleared on teardown.
    pub remote_identity: Option<String>,
    /// Human-readable label the caller sent with the invite.
    pub remote_display_name: Option<String>,
    /// Display name we send with our own outgoing invites.
    pub local_display_name: Option<String>,
    /// The invite signal still waiting to be fed into a responder session.
    #[serde(skip)]
    pub pending_signal: Option<SignalPayload>,
    /// Set once this side's single signal payload has gone out; any further
    /// `SignalReady` from the engine is a contract violation and is dropped.
    pub local_signal_sent: bool,
    #[serde(skip)]
    media: Option<Box<dyn MediaSession>>,
    #[serde(skip)]
    pub remote_stream: Option<RemoteStream>,
    /// Bumped on every reset. Media events are tagged with the epoch of the
    /// session that produced them, so events from a torn-down call can be
    /// recognized as stale and discarded.
    epoch: u64,
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("state", &self.state)
            .field("remote_identity", &self.remote_identity)
            .field("remote_display_name", &self.remote_display_name)
            .field("local_signal_sent", &self.local_signal_sent)
            .field("has_media", &self.media.is_some())
            .field("remote_stream", &self.remote_stream)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl CallSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply_transition(
        &mut self,
        transition: CallTransition,
    ) -> Result<(), InvalidTransition> {
        self.state = self.state.transition(&transition)?;
        Ok(())
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn media(&self) -> Option<&dyn MediaSession> {
        self.media.as_deref()
    }

    /// Install the session's media connection. At most one may exist at a
    /// time; installing over a live one is a contract violation.
    pub fn install_media(&mut self, media: Box<dyn MediaSession>) {
        debug_assert!(
            self.media.is_none(),
            "media session installed while one is live"
        );
        self.media = Some(media);
    }

    /// Detach the media session handle for destruction.
    pub fn take_media(&mut self) -> Option<Box<dyn MediaSession>> {
        self.media.take()
    }

    /// Restore `Idle` defaults after teardown.
    ///
    /// The media session must already have been taken and destroyed; any
    /// handle still present is dropped here. Bumps the epoch so in-flight
    /// media events from the old call are discarded on arrival.
    pub fn reset(&mut self) {
        self.media = None;
        self.remote_stream = None;
        self.remote_identity = None;
        self.remote_display_name = None;
        self.local_display_name = None;
        self.pending_signal = None;
        self.local_signal_sent = false;
        self.state = CallState::Idle;
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::CallError;
    use async_trait::async_trait;

    struct NullSession;

    #[async_trait]
    impl MediaSession for NullSession {
        async fn feed_remote_signal(&self, _payload: SignalPayload) -> Result<(), CallError> {
            Ok(())
        }

        async fn destroy(&self) {}
    }

    #[test]
    fn test_reset_restores_idle_defaults() {
        let mut session = CallSession::new();
        session.apply_transition(CallTransition::InviteReceived).unwrap();
        session.remote_identity = Some("B1".into());
        session.remote_display_name = Some("Bob".into());
        session.pending_signal = Some(serde_json::json!({"sdp": "offer"}));
        session.install_media(Box::new(NullSession));
        session.remote_stream = Some(RemoteStream { id: "r1".into() });
        session.local_signal_sent = true;

        let epoch_before = session.epoch();
        session.reset();

        assert!(session.state.is_idle());
        assert!(session.remote_identity.is_none());
        assert!(session.remote_display_name.is_none());
        assert!(session.pending_signal.is_none());
        assert!(session.media().is_none());
        assert!(session.remote_stream.is_none());
        assert!(!session.local_signal_sent);
        assert_eq!(session.epoch(), epoch_before + 1);
    }

    #[test]
    fn test_take_media_empties_handle() {
        let mut session = CallSession::new();
        session.install_media(Box::new(NullSession));
        assert!(session.media().is_some());
        assert!(session.take_media().is_some());
        assert!(session.take_media().is_none());
        assert!(session.media().is_none());
    }
}
