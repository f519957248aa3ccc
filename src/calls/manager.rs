//! Call manager for orchestrating call lifecycle.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, mpsc};

use super::error::CallError;
use super::session::CallSession;
use super::state::{CallState, CallTransition};
use crate::events::{CallConnected, CallEnded, CallFailed, EventBus, IdentityReady, IncomingCall};
use crate::media::{LocalMedia, MediaEngine, MediaEvent, SignalPayload};
use crate::relay::RelayClient;

/// The call state machine.
///
/// Single source of truth for call lifecycle: relay events, UI intents, and
/// media-session events all funnel into it, and it emits the side effects
/// (relay sends, media session creation and destruction, event-bus
/// notifications). One `Mutex<CallSession>` serializes every transition, so
/// no two events ever interleave mid-transition.
pub struct CallManager {
    relay: Arc<RelayClient>,
    media_engine: Arc<dyn MediaEngine>,
    bus: Arc<EventBus>,
    session: Mutex<CallSession>,
    /// This client's relay token; `None` until assigned and again after the
    /// relay connection drops.
    local_identity: RwLock<Option<String>>,
    /// Borrowed capture stream, shared across successive calls. Never
    /// destroyed here.
    local_media: RwLock<Option<Arc<LocalMedia>>>,
    /// Where media-session events re-enter the dispatch loop, tagged with
    /// the epoch of the session that produced them.
    media_tx: mpsc::UnboundedSender<(u64, MediaEvent)>,
}

impl CallManager {
    pub fn new(
        relay: Arc<RelayClient>,
        media_engine: Arc<dyn MediaEngine>,
        bus: Arc<EventBus>,
        media_tx: mpsc::UnboundedSender<(u64, MediaEvent)>,
    ) -> Arc<Self> {
        Arc::new(Self {
            relay,
            media_engine,
            bus,
            session: Mutex::new(CallSession::new()),
            local_identity: RwLock::new(None),
            local_media: RwLock::new(None),
            media_tx,
        })
    }

    /// Install the locally acquired capture stream used by subsequent
    /// sessions. Calls placed without one negotiate receive-only.
    pub async fn set_local_media(&self, media: Arc<LocalMedia>) {
        *self.local_media.write().await = Some(media);
    }

    pub async fn local_identity(&self) -> Option<String> {
        self.local_identity.read().await.clone()
    }

    /// Current call state, for display or test assertions.
    pub async fn current_state(&self) -> CallState {
        self.session.lock().await.state.clone()
    }

    /// Place an outgoing call. Rejected while any call is in flight; only
    /// one attempt may exist at a time.
    pub async fn place_call(
        &self,
        target_identity: &str,
        display_name: Option<String>,
    ) -> Result<(), CallError> {
        if target_identity.is_empty() {
            return Err(CallError::MissingField("targetIdentity"));
        }

        let mut session = self.session.lock().await;
        session.apply_transition(CallTransition::InvitePlaced)?;
        session.remote_identity = Some(target_identity.to_string());
        session.local_display_name = display_name;

        if let Err(e) = self.create_media_session(&mut session, true).await {
            warn!("Could not create initiator media session: {e}");
            session.reset();
            return Err(e);
        }

        info!("Placing call to {target_identity}");
        Ok(())
    }

    /// Answer the currently ringing call.
    pub async fn answer_call(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        session.apply_transition(CallTransition::LocalAnswered)?;

        info!(
            "Answering call from {}",
            session.remote_identity.as_deref().unwrap_or("<unknown>")
        );
        if let Err(e) = self.start_responder(&mut session).await {
            self.fail_call(&mut session, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    async fn start_responder(&self, session: &mut CallSession) -> Result<(), CallError> {
        let pending = session
            .pending_signal
            .take()
            .ok_or(CallError::MissingField("signalPayload"))?;
        self.create_media_session(session, false).await?;
        session
            .media()
            .ok_or_else(|| CallError::NegotiationFailed("media session missing".into()))?
            .feed_remote_signal(pending)
            .await
    }

    /// Hang up the current call. A no-op when idle: voluntary hangup and a
    /// remote-initiated end may race, and both paths must converge safely.
    pub async fn hang_up(&self) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        if session.state.is_idle() {
            debug!("hang_up with no call in progress");
            return Ok(());
        }

        // Best effort; a down relay channel must not block local teardown.
        if let Err(e) = self.relay.send_call_ended().await {
            warn!("Could not notify remote of hangup: {e}");
        }

        if let Some(local) = self.local_media.read().await.as_ref() {
            local.stop_session_tracks();
        }

        self.teardown(&mut session, "local hangup").await;
        let _ = self.bus.call_ended.send(Arc::new(CallEnded));
        Ok(())
    }

    /// Inbound `callInvite`. Invites arriving mid-call are absorbed without
    /// touching the existing call (no call-waiting).
    pub async fn handle_invite(
        &self,
        from_identity: String,
        display_name: Option<String>,
        signal_payload: SignalPayload,
    ) {
        if from_identity.is_empty() {
            warn!("Ignoring call invite without an origin identity");
            return;
        }

        let mut session = self.session.lock().await;
        if session.state.in_call() {
            warn!(
                "Ignoring call invite from {from_identity} while in state {:?}",
                session.state
            );
            return;
        }
        if let Err(e) = session.apply_transition(CallTransition::InviteReceived) {
            warn!("{e}");
            return;
        }

        session.remote_identity = Some(from_identity.clone());
        session.remote_display_name = display_name.clone();
        session.pending_signal = Some(signal_payload);

        info!(
            "Incoming call from {from_identity} ({})",
            display_name.as_deref().unwrap_or("no name")
        );
        let _ = self.bus.incoming_call.send(Arc::new(IncomingCall {
            from_identity,
            from_name: display_name,
        }));
    }

    /// Inbound `callAnswered`. Discarded unless we are the caller and the
    /// answer originates from the party we actually invited; anything else
    /// is a stale message from a call attempt no longer current.
    pub async fn handle_answer(&self, from_identity: &str, signal_payload: SignalPayload) {
        let mut session = self.session.lock().await;
        let expected = matches!(session.state, CallState::Calling { .. })
            && session.remote_identity.as_deref() == Some(from_identity);
        if !expected {
            debug!(
                "Discarding stale callAnswered from {from_identity} (state {:?}, remote {:?})",
                session.state, session.remote_identity
            );
            return;
        }

        let fed = match session.media() {
            Some(media) => media.feed_remote_signal(signal_payload).await,
            None => Err(CallError::NegotiationFailed(
                "no media session to receive the answer".into(),
            )),
        };
        if let Err(e) = fed {
            warn!("Failed to apply answer signal: {e}");
            self.fail_call(&mut session, &e.to_string()).await;
            return;
        }

        if let Err(e) = session.apply_transition(CallTransition::RemoteAnswered) {
            warn!("{e}");
            return;
        }

        info!("Call answered by {from_identity}");
        let _ = self.bus.call_connected.send(Arc::new(CallConnected {
            remote_identity: from_identity.to_string(),
        }));
    }

    /// Inbound `callEnded` from the remote party.
    pub async fn handle_remote_ended(&self) {
        let mut session = self.session.lock().await;
        if session.state.is_idle() {
            // Race with our own hangup; nothing left to do.
            debug!("callEnded with no call in progress");
            return;
        }

        self.teardown(&mut session, "remote ended").await;
        let _ = self.bus.call_ended.send(Arc::new(CallEnded));
    }

    /// The relay connection dropped. The identity token dies with it, and
    /// any in-progress call is torn down without an outbound notice.
    pub async fn handle_relay_lost(&self) {
        *self.local_identity.write().await = None;

        let mut session = self.session.lock().await;
        if session.state.is_idle() {
            return;
        }

        self.teardown(&mut session, "relay connection lost").await;
        let _ = self.bus.call_ended.send(Arc::new(CallEnded));
    }

    /// The relay assigned (or reassigned) this client's identity.
    pub async fn handle_identity_assigned(&self, token: String) {
        info!("Relay assigned identity {token}");
        *self.local_identity.write().await = Some(token.clone());
        let _ = self
            .bus
            .identity_ready
            .send(Arc::new(IdentityReady { token }));
    }

    /// A media event re-entering the state machine. Events whose epoch does
    /// not match the live session belong to a call already torn down.
    pub async fn handle_media_event(&self, epoch: u64, event: MediaEvent) {
        let mut session = self.session.lock().await;
        if epoch != session.epoch() {
            debug!(
                "Discarding media event from torn-down session (epoch {epoch}, live {})",
                session.epoch()
            );
            return;
        }

        match event {
            MediaEvent::SignalReady(payload) => {
                self.handle_signal_ready(&mut session, payload).await;
            }
            MediaEvent::RemoteStream(stream) => match session.state {
                CallState::ConnectedPending { .. } => {
                    if let Err(e) = session.apply_transition(CallTransition::RemoteStreamAttached)
                    {
                        warn!("{e}");
                        return;
                    }
                    session.remote_stream = Some(stream);
                    let remote_identity = session.remote_identity.clone().unwrap_or_default();
                    info!("Remote stream attached; call connected");
                    let _ = self
                        .bus
                        .call_connected
                        .send(Arc::new(CallConnected { remote_identity }));
                }
                CallState::Connected { .. } => {
                    session.remote_stream = Some(stream);
                }
                _ => {
                    warn!("Remote stream arrived in state {:?}", session.state);
                }
            },
            MediaEvent::Error(reason) => {
                if session.state.is_idle() {
                    return;
                }
                warn!("Media session error: {reason}");
                self.fail_call(&mut session, &reason).await;
            }
        }
    }

    /// The engine produced this side's single signal payload: an invite on
    /// the caller side, an answer on the callee side.
    async fn handle_signal_ready(&self, session: &mut CallSession, payload: SignalPayload) {
        if session.local_signal_sent {
            warn!("Dropping extra signal payload; non-trickle sessions produce exactly one");
            return;
        }

        let target = session.remote_identity.clone().unwrap_or_default();
        let from = self.local_identity.read().await.clone().unwrap_or_default();

        let sent = match session.state {
            CallState::Calling { .. } => {
                let name = session.local_display_name.clone();
                self.relay
                    .send_call_invite(&target, &from, name, payload)
                    .await
            }
            CallState::ConnectedPending { .. } => {
                self.relay.send_call_answer(&target, &from, payload).await
            }
            _ => {
                warn!("Signal ready in unexpected state {:?}", session.state);
                return;
            }
        };

        match sent {
            Ok(()) => session.local_signal_sent = true,
            Err(e) => {
                warn!("Could not deliver signal payload: {e}");
                self.fail_call(session, &e.to_string()).await;
            }
        }
    }

    async fn create_media_session(
        &self,
        session: &mut CallSession,
        initiator: bool,
    ) -> Result<(), CallError> {
        let local = self.local_media.read().await.clone();
        if local.is_none() {
            debug!("No local media acquired; negotiating a receive-only session");
        }

        let (media, mut events) = self.media_engine.create_session(initiator, local).await?;
        session.install_media(media);

        let epoch = session.epoch();
        let media_tx = self.media_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if media_tx.send((epoch, event)).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    /// Destroy the media session and restore `Idle` defaults. Idempotent by
    /// construction: callers check for `Idle` first, and `reset` leaves the
    /// session reusable either way.
    async fn teardown(&self, session: &mut CallSession, why: &str) {
        if let Err(e) = session.apply_transition(CallTransition::Teardown) {
            debug!("{e}");
        }
        if let Some(media) = session.take_media() {
            media.destroy().await;
        }
        session.reset();
        info!("Call torn down ({why})");
    }

    async fn fail_call(&self, session: &mut CallSession, reason: &str) {
        self.teardown(session, "failure").await;
        let _ = self.bus.call_failed.send(Arc::new(CallFailed {
            reason: reason.to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayMessage;
    use crate::test_utils::{MockMediaEngine, MockTransport};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Harness {
        manager: Arc<CallManager>,
        transport: Arc<MockTransport>,
        engine: Arc<MockMediaEngine>,
        bus: Arc<EventBus>,
        media_rx: mpsc::UnboundedReceiver<(u64, MediaEvent)>,
    }

    async fn harness() -> Harness {
        let relay = Arc::new(RelayClient::new());
        let transport = Arc::new(MockTransport::new());
        relay.attach_transport(transport.clone()).await;

        let engine = Arc::new(MockMediaEngine::new());
        let bus = Arc::new(EventBus::new());
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let manager = CallManager::new(relay, engine.clone(), bus.clone(), media_tx);
        manager.handle_identity_assigned("A1".to_string()).await;

        Harness {
            manager,
            transport,
            engine,
            bus,
            media_rx,
        }
    }

    /// Feed queued media events back into the manager, as the client's
    /// dispatch loop would.
    async fn pump_media(h: &mut Harness) {
        while let Ok(Some((epoch, event))) =
            timeout(Duration::from_millis(50), h.media_rx.recv()).await
        {
            h.manager.handle_media_event(epoch, event).await;
        }
    }

    #[tokio::test]
    async fn test_place_call_sends_invite_on_signal_ready() {
        let mut h = harness().await;

        h.manager
            .place_call("B1", Some("Alice".to_string()))
            .await
            .unwrap();
        assert!(matches!(
            h.manager.current_state().await,
            CallState::Calling { .. }
        ));

        pump_media(&mut h).await;

        let sent = h.transport.sent_messages();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            RelayMessage::CallInvite {
                target_identity,
                from_identity,
                display_name,
                signal_payload,
            } => {
                assert_eq!(target_identity, "B1");
                assert_eq!(from_identity, "A1");
                assert_eq!(display_name.as_deref(), Some("Alice"));
                assert!(signal_payload.is_object());
            }
            other => panic!("expected invite, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_place_call_rejected_while_in_call() {
        let mut h = harness().await;
        h.manager.place_call("B1", None).await.unwrap();

        let err = h.manager.place_call("C1", None).await.unwrap_err();
        assert!(matches!(err, CallError::InvalidTransition(_)));

        // The original attempt is untouched.
        pump_media(&mut h).await;
        assert!(matches!(
            h.manager.current_state().await,
            CallState::Calling { .. }
        ));
        assert_eq!(h.engine.session_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_target_rejected() {
        let h = harness().await;
        let err = h.manager.place_call("", None).await.unwrap_err();
        assert!(matches!(err, CallError::MissingField("targetIdentity")));
        assert!(h.manager.current_state().await.is_idle());
    }

    #[tokio::test]
    async fn test_incoming_invite_rings_and_answer_connects() {
        let mut h = harness().await;
        let mut incoming = h.bus.incoming_call.subscribe();

        h.manager
            .handle_invite(
                "B1".to_string(),
                Some("Bob".to_string()),
                json!({"sdp": "offer-b"}),
            )
            .await;
        assert!(h.manager.current_state().await.can_answer());

        let ring = incoming.try_recv().unwrap();
        assert_eq!(ring.from_identity, "B1");
        assert_eq!(ring.from_name.as_deref(), Some("Bob"));

        h.manager.answer_call().await.unwrap();
        pump_media(&mut h).await;

        // Responder consumed the invite signal, sent the answer, and the
        // mock engine delivered the remote stream.
        assert!(h.manager.current_state().await.is_connected());
        let sent = h.transport.sent_messages();
        assert!(matches!(
            sent[0],
            RelayMessage::CallAnswered { ref target_identity, ref from_identity, .. }
                if target_identity == "B1" && from_identity == "A1"
        ));

        let session = h.engine.last_session().unwrap();
        assert!(!session.initiator);
        assert_eq!(session.fed_signals()[0]["sdp"], "offer-b");
    }

    #[tokio::test]
    async fn test_invite_while_ringing_is_absorbed() {
        let h = harness().await;

        h.manager
            .handle_invite("B1".to_string(), None, json!({"sdp": "b"}))
            .await;
        h.manager
            .handle_invite("C1".to_string(), None, json!({"sdp": "c"}))
            .await;

        let session = h.manager.session.lock().await;
        assert_eq!(session.remote_identity.as_deref(), Some("B1"));
        assert!(session.state.can_answer());
    }

    #[tokio::test]
    async fn test_stale_answer_discarded() {
        let mut h = harness().await;
        h.manager.place_call("B1", None).await.unwrap();
        pump_media(&mut h).await;

        h.manager.handle_answer("C1", json!({"sdp": "rogue"})).await;

        assert!(matches!(
            h.manager.current_state().await,
            CallState::Calling { .. }
        ));
        assert!(h.engine.last_session().unwrap().fed_signals().is_empty());
    }

    #[tokio::test]
    async fn test_answer_connects_caller() {
        let mut h = harness().await;
        let mut connected = h.bus.call_connected.subscribe();

        h.manager.place_call("B1", None).await.unwrap();
        pump_media(&mut h).await;
        h.manager
            .handle_answer("B1", json!({"sdp": "answer-b"}))
            .await;
        pump_media(&mut h).await;

        assert!(h.manager.current_state().await.is_connected());
        assert_eq!(connected.try_recv().unwrap().remote_identity, "B1");

        // The answer payload reached the initiator session.
        let session = h.engine.last_session().unwrap();
        assert_eq!(session.fed_signals()[0]["sdp"], "answer-b");
        // And the remote stream got attached.
        let call = h.manager.session.lock().await;
        assert!(call.remote_stream.is_some());
    }

    #[tokio::test]
    async fn test_hang_up_is_idempotent_and_notifies() {
        let mut h = harness().await;
        let local = Arc::new(LocalMedia::audio_video());
        h.manager.set_local_media(local.clone()).await;

        h.manager.place_call("B1", None).await.unwrap();
        pump_media(&mut h).await;

        h.manager.hang_up().await.unwrap();
        assert!(h.manager.current_state().await.is_idle());

        let session = h.engine.last_session().unwrap();
        assert_eq!(session.destroy_count(), 1);
        assert!(
            h.transport
                .sent_messages()
                .contains(&RelayMessage::CallEnded)
        );
        // Preview video keeps running; the rest stops.
        assert!(!local.tracks()[0].is_stopped());
        assert!(local.tracks()[1].is_stopped());

        // Second hangup is a harmless no-op.
        h.manager.hang_up().await.unwrap();
        assert_eq!(session.destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_on_invite_fails_call() {
        let mut h = harness().await;
        let mut failed = h.bus.call_failed.subscribe();
        h.transport.fail_sends(true);

        h.manager.place_call("B1", None).await.unwrap();
        pump_media(&mut h).await;

        assert!(h.manager.current_state().await.is_idle());
        let failure = failed.try_recv().unwrap();
        assert!(failure.reason.contains("transport unavailable"));
        assert_eq!(h.engine.last_session().unwrap().destroy_count(), 1);
    }

    #[tokio::test]
    async fn test_media_error_fails_call() {
        let mut h = harness().await;
        let mut failed = h.bus.call_failed.subscribe();

        h.manager.place_call("B1", None).await.unwrap();
        pump_media(&mut h).await;
        h.engine
            .last_session()
            .unwrap()
            .emit(MediaEvent::Error("ice failure".to_string()));
        pump_media(&mut h).await;

        assert!(h.manager.current_state().await.is_idle());
        assert!(failed.try_recv().unwrap().reason.contains("ice failure"));
    }

    #[tokio::test]
    async fn test_stale_media_event_discarded_after_teardown() {
        let mut h = harness().await;

        h.manager.place_call("B1", None).await.unwrap();
        h.manager.hang_up().await.unwrap();

        // The initiator's SignalReady is still queued with the old epoch;
        // delivering it now must not resurrect the call or send an invite.
        pump_media(&mut h).await;
        assert!(h.manager.current_state().await.is_idle());
        assert_eq!(h.transport.sent_messages(), vec![RelayMessage::CallEnded]);
    }

    #[tokio::test]
    async fn test_relay_lost_tears_down_without_notice() {
        let mut h = harness().await;
        let mut ended = h.bus.call_ended.subscribe();

        h.manager.place_call("B1", None).await.unwrap();
        pump_media(&mut h).await;
        h.manager.handle_answer("B1", json!({"sdp": "b"})).await;
        pump_media(&mut h).await;
        assert!(h.manager.current_state().await.is_connected());

        let frames_before = h.transport.sent_messages().len();
        h.manager.handle_relay_lost().await;

        assert!(h.manager.current_state().await.is_idle());
        assert!(h.manager.local_identity().await.is_none());
        assert_eq!(h.transport.sent_messages().len(), frames_before);
        assert!(ended.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_remote_ended_after_local_hangup_is_noop() {
        let mut h = harness().await;
        let mut ended = h.bus.call_ended.subscribe();

        h.manager.place_call("B1", None).await.unwrap();
        pump_media(&mut h).await;
        h.manager.hang_up().await.unwrap();
        assert!(ended.try_recv().is_ok());

        h.manager.handle_remote_ended().await;
        assert!(h.manager.current_state().await.is_idle());
        // No second call_ended for the race loser.
        assert!(ended.try_recv().is_err());
    }
}
