//! UI-facing event bus.
//!
//! The call core reports upward exclusively through these typed broadcast
//! channels; it never calls into the embedding application directly.

use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The relay assigned this client its session identity.
#[derive(Debug, Clone)]
pub struct IdentityReady {
    pub token: String,
}

/// Another participant is calling.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub from_identity: String,
    pub from_name: Option<String>,
}

/// Negotiation completed and media is flowing.
#[derive(Debug, Clone)]
pub struct CallConnected {
    pub remote_identity: String,
}

/// The call ended, by either side or by relay loss.
#[derive(Debug, Clone)]
pub struct CallEnded;

/// The call attempt failed and was torn down.
#[derive(Debug, Clone)]
pub struct CallFailed {
    pub reason: String,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (identity_ready, Arc<IdentityReady>),
    (incoming_call, Arc<IncomingCall>),
    (call_connected, Arc<CallConnected>),
    (call_ended, Arc<CallEnded>),
    (call_failed, Arc<CallFailed>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
