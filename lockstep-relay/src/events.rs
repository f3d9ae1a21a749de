//! Events the relay delivers to transport sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lockstep_core::models::{ParticipantId, RoomId};
use lockstep_core::{Modality, SignalMessage};

/// Events pushed to subscribed sessions.
///
/// `Signal` is addressed to exactly one session; the rest fan out to a mesh
/// or to the whole room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Forwarded signaling message, payload untouched
    Signal { message: SignalMessage },

    /// A participant joined a room+modality mesh
    PeerJoined {
        room_id: RoomId,
        modality: Modality,
        participant: ParticipantId,
        display_name: String,
        timestamp: DateTime<Utc>,
    },

    /// A participant left a room+modality mesh
    PeerLeft {
        room_id: RoomId,
        modality: Modality,
        participant: ParticipantId,
        timestamp: DateTime<Utc>,
    },

    /// Live mesh occupancy, sent to the whole room so non-joined users see
    /// it too
    ParticipantCountChanged {
        room_id: RoomId,
        modality: Modality,
        count: usize,
        timestamp: DateTime<Utc>,
    },
}

impl RelayEvent {
    /// Event name for logging
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Signal { .. } => "signal",
            Self::PeerJoined { .. } => "peer_joined",
            Self::PeerLeft { .. } => "peer_left",
            Self::ParticipantCountChanged { .. } => "participant_count_changed",
        }
    }
}
