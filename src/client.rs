//! The call client: composition root and event dispatch loop.

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify, mpsc};

use crate::calls::{CallError, CallManager, CallState};
use crate::config::ClientConfig;
use crate::events::EventBus;
use crate::media::{LocalMedia, MediaEngine, MediaEvent};
use crate::relay::{RelayClient, RelayMessage};
use crate::transport::{Transport, TransportEvent, TransportFactory, WebSocketTransportFactory};

/// A connected participant on the call relay.
///
/// Wires the transport, the relay client, the media engine, and the call
/// state machine together, and runs the single dispatch loop that feeds
/// every inbound event — relay frames and media-session events alike —
/// into the [`CallManager`] one at a time.
///
/// There is exactly one registration per inbound event type, made when the
/// loop starts and kept for the life of the connection. The manager decides
/// per event whether it applies to the current call; nothing is
/// re-registered per call attempt.
pub struct CallClient {
    transport_factory: Arc<dyn TransportFactory>,
    relay: Arc<RelayClient>,
    manager: Arc<CallManager>,
    bus: Arc<EventBus>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    /// Parked between connections; the dispatch loop owns it while running.
    media_rx: Mutex<Option<mpsc::UnboundedReceiver<(u64, MediaEvent)>>>,
    is_running: AtomicBool,
    shutdown_notifier: Notify,
}

impl CallClient {
    pub fn new(
        transport_factory: Arc<dyn TransportFactory>,
        media_engine: Arc<dyn MediaEngine>,
    ) -> Arc<Self> {
        let bus = Arc::new(EventBus::new());
        let relay = Arc::new(RelayClient::new());
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let manager = CallManager::new(relay.clone(), media_engine, bus.clone(), media_tx);

        Arc::new(Self {
            transport_factory,
            relay,
            manager,
            bus,
            transport: Mutex::new(None),
            media_rx: Mutex::new(Some(media_rx)),
            is_running: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
        })
    }

    /// A client talking to the given relay over WebSocket.
    pub fn with_config(config: ClientConfig, media_engine: Arc<dyn MediaEngine>) -> Arc<Self> {
        Self::new(
            Arc::new(WebSocketTransportFactory::new(config.relay_url)),
            media_engine,
        )
    }

    /// UI-facing event channels.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Connect to the relay and start dispatching events.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("client is already connected"));
        }

        let (transport, transport_events) = match self.transport_factory.create_transport().await {
            Ok(pair) => pair,
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        *self.transport.lock().await = Some(transport.clone());
        self.relay.attach_transport(transport).await;

        let media_rx = self
            .media_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("dispatch loop already running"))?;

        let client = self.clone();
        tokio::spawn(async move {
            client.dispatch_loop(transport_events, media_rx).await;
        });
        Ok(())
    }

    /// Close the relay connection. Any in-progress call is torn down as if
    /// the relay had dropped.
    pub async fn disconnect(&self) {
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
        self.shutdown_notifier.notify_waiters();
    }

    pub async fn place_call(
        &self,
        target_identity: &str,
        display_name: Option<String>,
    ) -> Result<(), CallError> {
        self.manager.place_call(target_identity, display_name).await
    }

    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.manager.answer_call().await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.manager.hang_up().await
    }

    pub async fn set_local_media(&self, media: Arc<LocalMedia>) {
        self.manager.set_local_media(media).await;
    }

    /// The relay-assigned identity token, once `identityAssigned` arrived.
    pub async fn identity(&self) -> Option<String> {
        self.manager.local_identity().await
    }

    pub async fn call_state(&self) -> CallState {
        self.manager.current_state().await
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut media_rx: mpsc::UnboundedReceiver<(u64, MediaEvent)>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown_notifier.notified() => {
                    debug!("Dispatch loop shutting down");
                    break;
                }
                event = transport_events.recv() => match event {
                    Some(TransportEvent::Connected) => {
                        info!("Relay transport connected");
                    }
                    Some(TransportEvent::FrameReceived(frame)) => {
                        self.dispatch_frame(&frame).await;
                    }
                    Some(TransportEvent::Disconnected) | None => {
                        info!("Relay transport disconnected");
                        break;
                    }
                },
                event = media_rx.recv() => match event {
                    Some((epoch, event)) => {
                        self.manager.handle_media_event(epoch, event).await;
                    }
                    None => break,
                },
            }
        }

        self.relay.detach_transport().await;
        *self.transport.lock().await = None;
        // Losing the relay invalidates the identity and ends any call; this
        // is idempotent when the teardown already happened.
        self.manager.handle_relay_lost().await;

        *self.media_rx.lock().await = Some(media_rx);
        self.is_running.store(false, Ordering::SeqCst);
    }

    async fn dispatch_frame(&self, frame: &str) {
        match RelayMessage::parse(frame) {
            Ok(RelayMessage::IdentityAssigned { token }) => {
                self.manager.handle_identity_assigned(token).await;
            }
            Ok(RelayMessage::CallInvite {
                target_identity,
                from_identity,
                display_name,
                signal_payload,
            }) => {
                // The relay routes by target; a mismatched delivery is a
                // stale or misrouted message.
                let ours = self.manager.local_identity().await;
                if ours.is_some_and(|o| o != target_identity) {
                    debug!("Ignoring callInvite addressed to {target_identity}");
                    return;
                }
                self.manager
                    .handle_invite(from_identity, display_name, signal_payload)
                    .await;
            }
            Ok(RelayMessage::CallAnswered {
                from_identity,
                signal_payload,
                ..
            }) => {
                self.manager
                    .handle_answer(&from_identity, signal_payload)
                    .await;
            }
            Ok(RelayMessage::CallEnded) => {
                self.manager.handle_remote_ended().await;
            }
            Err(e) => {
                warn!("Undecodable relay frame: {e}");
            }
        }
    }
}
