//! Server-side relay for the lockstep peer mesh
//!
//! Per-room, per-modality membership with soft-real-time capacity
//! enforcement, presence broadcasts, verbatim forwarding of addressed
//! signaling messages, and the cross-process user→session directory the
//! forwarding routes through. The relay sits only in the signaling path;
//! media flows directly between clients.

pub mod directory;
pub mod events;
pub mod hub;
pub mod membership;
pub mod relay;
pub mod turn;

pub use directory::{MemoryDirectory, RedisDirectory, SessionDirectory};
pub use events::RelayEvent;
pub use hub::{RelayHub, SessionRouter};
pub use membership::{MeshKey, MeshMembership};
pub use relay::{JoinOutcome, SignalingRelay};
pub use turn::{TurnCredential, TurnCredentialService};
