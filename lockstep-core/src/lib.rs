//! Shared foundation for the lockstep peer mesh
//!
//! Typed ids, the signaling wire vocabulary, the error taxonomy and
//! configuration used by both the client-side mesh and the server-side
//! relay.

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod signal;

pub use config::Config;
pub use error::{Error, Result};
pub use signal::{IceCandidate, Modality, SdpKind, SessionDescription, SignalMessage};
