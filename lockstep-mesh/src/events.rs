//! Lifecycle events exposed to collaborators
//!
//! A finite, typed vocabulary dispatched over a channel; collaborators
//! render whatever state these carry. No string-keyed listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lockstep_core::models::ParticipantId;
use lockstep_core::Modality;

/// Why a session was disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Explicit user action
    Requested,
    /// Idle timer fired with no peers left in the mesh
    IdleTimeout,
}

/// Events emitted by the local session manager and the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeshEvent {
    /// Local session enabled or disabled
    EnabledChanged {
        modality: Modality,
        enabled: bool,
        reason: Option<DisableReason>,
        timestamp: DateTime<Utc>,
    },

    /// Local microphone mute flipped
    MutedChanged { muted: bool, timestamp: DateTime<Utc> },

    /// Local camera flipped
    CameraChanged {
        enabled: bool,
        timestamp: DateTime<Utc>,
    },

    /// A remote participant joined the mesh
    PeerJoined {
        participant: ParticipantId,
        timestamp: DateTime<Utc>,
    },

    /// A remote participant left the mesh
    PeerLeft {
        participant: ParticipantId,
        timestamp: DateTime<Utc>,
    },

    /// Live occupancy for the room, including non-joined observers
    ParticipantCountChanged {
        modality: Modality,
        count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Speaking-state flip for a participant
    SpeakingChanged {
        participant: ParticipantId,
        speaking: bool,
        timestamp: DateTime<Utc>,
    },

    /// A per-peer or session-level failure surfaced to the UI
    Error {
        message: String,
        peer: Option<ParticipantId>,
        timestamp: DateTime<Utc>,
    },
}

impl MeshEvent {
    /// Event name for logging
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::EnabledChanged { .. } => "enabled_changed",
            Self::MutedChanged { .. } => "muted_changed",
            Self::CameraChanged { .. } => "camera_changed",
            Self::PeerJoined { .. } => "peer_joined",
            Self::PeerLeft { .. } => "peer_left",
            Self::ParticipantCountChanged { .. } => "participant_count_changed",
            Self::SpeakingChanged { .. } => "speaking_changed",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = MeshEvent::PeerJoined {
            participant: ParticipantId::from("alice1234567"),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"peer_joined\""));
        assert_eq!(event.event_type(), "peer_joined");
    }

    #[test]
    fn test_disable_reason_roundtrip() {
        let event = MeshEvent::EnabledChanged {
            modality: Modality::Voice,
            enabled: false,
            reason: Some(DisableReason::IdleTimeout),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("idle_timeout"));
    }
}
