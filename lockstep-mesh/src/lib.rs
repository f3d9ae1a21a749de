//! Client-side peer mesh
//!
//! Everything a room member runs locally to hold direct audio/video
//! sessions with the rest of the mesh: the attempt-tier ladder and ICE
//! resolution, the per-peer connection orchestrator, and the local session
//! manager with its lifecycle events. Signaling goes out through a channel
//! the transport collaborator drains; relay events come back in through the
//! session manager's handlers.

pub mod connection;
pub mod events;
pub mod ice;
pub mod media;
pub mod orchestrator;
pub mod session;
pub mod singleflight;
pub mod tier;

#[cfg(test)]
pub mod test_support;

pub use connection::{ConnectionFactory, ConnectionHandle, ConnectionHooks, PeerSessionState};
pub use events::{DisableReason, MeshEvent};
pub use ice::{CredentialFetcher, IceResolver, RtcIceConfig, RtcIceServer, TransportPolicy};
pub use media::{LocalMedia, MediaError, MediaSource};
pub use orchestrator::PeerOrchestrator;
pub use session::LocalSession;
pub use tier::{next_tier, AttemptTier, RelayProfile};
