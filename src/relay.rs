//! Signaling relay client.
//!
//! Wraps the message channel to the relay server: typed wire messages in
//! JSON, send operations for the state machine's outbound side effects, and
//! parsing for the inbound side. The relay delivers messages at-least-once
//! and in order between two endpoints for the lifetime of one connection;
//! nothing survives a reconnect, so the dispatch loop treats a transport
//! drop as a remote hangup for any in-progress call.
//!
//! Inbound events have exactly one consumer: the client's dispatch loop,
//! registered once per connection. The legacy client re-registered relay
//! listeners on every call attempt and accumulated duplicate handlers; do
//! not reintroduce per-call registration here.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::calls::CallError;
use crate::media::SignalPayload;
use crate::transport::Transport;

/// A message on the relay wire, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    /// Relay → client, once after connect.
    #[serde(rename_all = "camelCase")]
    IdentityAssigned { token: String },
    /// Caller → relay → callee.
    #[serde(rename_all = "camelCase")]
    CallInvite {
        target_identity: String,
        from_identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        signal_payload: SignalPayload,
    },
    /// Callee → relay → caller. `from_identity` lets the caller discard
    /// answers that do not originate from the party it actually invited.
    #[serde(rename_all = "camelCase")]
    CallAnswered {
        target_identity: String,
        from_identity: String,
        signal_payload: SignalPayload,
    },
    /// Either side → relay → the other party of the current call.
    CallEnded,
}

impl RelayMessage {
    pub fn parse(frame: &str) -> Result<Self, CallError> {
        serde_json::from_str(frame).map_err(|e| CallError::Parse(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, CallError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client side of the relay channel.
///
/// Holds the active transport (if any) and translates state-machine output
/// into wire messages. Owns no call state of its own.
#[derive(Default)]
pub struct RelayClient {
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl RelayClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.write().await = Some(transport);
    }

    pub async fn detach_transport(&self) {
        *self.transport.write().await = None;
    }

    pub async fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().await.clone()
    }

    async fn send(&self, message: &RelayMessage) -> Result<(), CallError> {
        let transport = self
            .transport
            .read()
            .await
            .clone()
            .ok_or_else(|| CallError::TransportUnavailable("relay channel is down".into()))?;
        let frame = message.encode()?;
        transport
            .send_frame(&frame)
            .await
            .map_err(|e| CallError::TransportUnavailable(e.to_string()))
    }

    /// Ask the relay to deliver a call invite to `target_identity`.
    pub async fn send_call_invite(
        &self,
        target_identity: &str,
        from_identity: &str,
        display_name: Option<String>,
        signal_payload: SignalPayload,
    ) -> Result<(), CallError> {
        self.send(&RelayMessage::CallInvite {
            target_identity: target_identity.to_string(),
            from_identity: from_identity.to_string(),
            display_name,
            signal_payload,
        })
        .await
    }

    /// Complete negotiation from the callee side.
    pub async fn send_call_answer(
        &self,
        target_identity: &str,
        from_identity: &str,
        signal_payload: SignalPayload,
    ) -> Result<(), CallError> {
        self.send(&RelayMessage::CallAnswered {
            target_identity: target_identity.to_string(),
            from_identity: from_identity.to_string(),
            signal_payload,
        })
        .await
    }

    /// Tell the current remote party we hung up.
    pub async fn send_call_ended(&self) -> Result<(), CallError> {
        self.send(&RelayMessage::CallEnded).await
    }
}
