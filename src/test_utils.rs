//! Mock collaborators for unit and integration tests.

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::calls::CallError;
use crate::media::{LocalMedia, MediaEngine, MediaEvent, MediaSession, RemoteStream, SignalPayload};
use crate::relay::RelayMessage;
use crate::transport::{Transport, TransportEvent, TransportFactory};

/// A transport that records every outbound frame instead of sending it.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<String>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail, simulating a down relay channel.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Outbound frames, parsed back into wire messages.
    pub fn sent_messages(&self) -> Vec<RelayMessage> {
        self.sent_frames()
            .iter()
            .map(|f| RelayMessage::parse(f).expect("mock transport holds valid frames"))
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("mock transport is down"));
        }
        self.sent.lock().unwrap().push(frame.to_string());
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// A factory that hands out one pre-built transport and event channel.
///
/// The test keeps the event sender to inject inbound frames and the
/// transport handle to inspect outbound ones.
pub struct MockTransportFactory {
    slot: Mutex<Option<(Arc<MockTransport>, mpsc::Receiver<TransportEvent>)>>,
}

impl MockTransportFactory {
    pub fn new() -> (Self, Arc<MockTransport>, mpsc::Sender<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = Arc::new(MockTransport::new());
        let factory = Self {
            slot: Mutex::new(Some((transport.clone(), event_rx))),
        };
        (factory, transport, event_tx)
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let (transport, event_rx) = self
            .slot
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("mock transport already consumed"))?;
        Ok((transport, event_rx))
    }
}

/// A scripted media session.
///
/// Mimics a non-trickle engine: the initiator produces its signal payload
/// as soon as the session exists; the responder produces one after being
/// fed the remote offer. Feeding a remote signal completes negotiation and
/// delivers the remote stream.
pub struct MockMediaSession {
    pub id: u64,
    pub initiator: bool,
    pub local: Option<Arc<LocalMedia>>,
    events: mpsc::UnboundedSender<MediaEvent>,
    fed: Mutex<Vec<SignalPayload>>,
    destroy_count: AtomicU64,
    fail_feed: AtomicBool,
}

impl MockMediaSession {
    pub fn fed_signals(&self) -> Vec<SignalPayload> {
        self.fed.lock().unwrap().clone()
    }

    pub fn destroy_count(&self) -> u64 {
        self.destroy_count.load(Ordering::SeqCst)
    }

    pub fn fail_feed(&self, fail: bool) {
        self.fail_feed.store(fail, Ordering::SeqCst);
    }

    /// Inject an arbitrary event, e.g. a negotiation error.
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl MediaSession for Arc<MockMediaSession> {
    async fn feed_remote_signal(&self, payload: SignalPayload) -> Result<(), CallError> {
        if self.fail_feed.load(Ordering::SeqCst) {
            return Err(CallError::NegotiationFailed("mock feed failure".into()));
        }

        let first = {
            let mut fed = self.fed.lock().unwrap();
            fed.push(payload);
            fed.len() == 1
        };

        if !self.initiator && first {
            self.emit(MediaEvent::SignalReady(
                json!({"sdp": format!("answer-{}", self.id)}),
            ));
        }
        self.emit(MediaEvent::RemoteStream(RemoteStream {
            id: format!("remote-{}", self.id),
        }));
        Ok(())
    }

    async fn destroy(&self) {
        self.destroy_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Engine producing [`MockMediaSession`]s and keeping handles to them for
/// inspection.
#[derive(Default)]
pub struct MockMediaEngine {
    sessions: Mutex<Vec<Arc<MockMediaSession>>>,
    next_id: AtomicU64,
    fail_create: AtomicBool,
}

impl MockMediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn last_session(&self) -> Option<Arc<MockMediaSession>> {
        self.sessions.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_session(
        &self,
        initiator: bool,
        local: Option<Arc<LocalMedia>>,
    ) -> Result<(Box<dyn MediaSession>, mpsc::UnboundedReceiver<MediaEvent>), CallError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CallError::NegotiationFailed("mock create failure".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = Arc::new(MockMediaSession {
            id,
            initiator,
            local,
            events: event_tx,
            fed: Mutex::new(Vec::new()),
            destroy_count: AtomicU64::new(0),
            fail_feed: AtomicBool::new(false),
        });

        if initiator {
            session.emit(MediaEvent::SignalReady(
                json!({"sdp": format!("offer-{id}")}),
            ));
        }

        self.sessions.lock().unwrap().push(session.clone());
        Ok((Box::new(session), event_rx))
    }
}
