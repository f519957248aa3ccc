//! Client core for the Zoomish peer-to-peer video call relay.
//!
//! Two participants discover each other through a relay server that
//! forwards connection-setup messages; once a single invite/answer signal
//! exchange completes, media flows directly between them. This crate owns
//! the signaling side of that handshake: the relay client and the call
//! state machine. Media capture, negotiation internals, and rendering live
//! behind the [`media::MediaEngine`] seam.

pub mod calls;
pub mod client;
pub mod config;
pub mod events;
pub mod media;
pub mod relay;
pub mod transport;

#[doc(hidden)]
pub mod test_utils;

pub use calls::{CallError, CallManager, CallSession, CallState, CallTransition, InvalidTransition};
pub use client::CallClient;
pub use config::ClientConfig;
pub use events::EventBus;
pub use media::{
    LocalMedia, MediaEngine, MediaEvent, MediaSession, MediaTrack, RemoteStream, TrackKind,
};
pub use relay::{RelayClient, RelayMessage};
