//! Call lifecycle: state machine, session entity, and orchestration.
//!
//! # Architecture
//!
//! - [`CallState`] & [`CallTransition`]: the finite state machine for the
//!   call lifecycle
//! - [`CallSession`]: the single in-memory call entity, owner of the media
//!   session handle and remote stream
//! - [`CallManager`]: processes UI intents, relay events, and media events
//!   one at a time and emits the resulting side effects
//! - [`CallError`]: error kinds, split between those absorbed locally and
//!   those that force a teardown

mod error;
mod manager;
mod session;
mod state;

pub use error::CallError;
pub use manager::CallManager;
pub use session::CallSession;
pub use state::{CallState, CallTransition, InvalidTransition};
