use serde::{Deserialize, Serialize};

use super::id::ParticipantId;

/// A room member as seen by the mesh layer.
///
/// Identity and the host flag come from the room/session collaborator; the
/// mesh never mutates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Stable participant id, immutable for the session's lifetime
    pub id: ParticipantId,
    /// Display name shown to other members
    pub display_name: String,
    /// Whether this participant holds the room's host token
    pub is_host: bool,
}

impl Participant {
    #[must_use]
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            is_host: false,
        }
    }

    #[must_use]
    pub fn host(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            is_host: true,
        }
    }
}
