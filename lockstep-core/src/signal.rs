//! Wire types for mesh signaling
//!
//! The relay forwards exactly three kinds of addressed messages — offer,
//! answer, candidate — and never inspects or mutates their payloads.

use serde::{Deserialize, Serialize};

use crate::models::ParticipantId;
use crate::{Error, Result};

/// Media modality of a mesh, keyed independently per room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Voice,
    Video,
}

impl Modality {
    pub const ALL: [Self; 2] = [Self::Voice, Self::Video];

    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Voice => "voice",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session description type
    pub kind: SdpKind,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One discovered network path a peer proposes for the direct connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Full candidate string
    pub candidate: String,
    /// SDP mid
    pub sdp_mid: Option<String>,
    /// SDP mline index
    pub sdp_mline_index: Option<u16>,
}

/// Addressed signaling message exchanged through the relay
///
/// `from` is always server-set on the relay path so a sender cannot forge
/// another participant's identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    /// Offer to establish or renegotiate a connection
    Offer {
        from: ParticipantId,
        to: ParticipantId,
        sdp: SessionDescription,
    },
    /// Answer to an offer
    Answer {
        from: ParticipantId,
        to: ParticipantId,
        sdp: SessionDescription,
    },
    /// ICE candidate for connection establishment
    Candidate {
        from: ParticipantId,
        to: ParticipantId,
        candidate: IceCandidate,
    },
}

impl SignalMessage {
    #[must_use]
    pub const fn from(&self) -> &ParticipantId {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::Candidate { from, .. } => {
                from
            }
        }
    }

    #[must_use]
    pub const fn to(&self) -> &ParticipantId {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Candidate { to, .. } => to,
        }
    }

    /// Message kind for logging
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }

    /// Replace the sender id (relay sets this from the authenticated session)
    pub fn set_from(&mut self, sender: ParticipantId) {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::Candidate { from, .. } => {
                *from = sender;
            }
        }
    }

    /// Reject malformed messages before forwarding
    pub fn validate(&self) -> Result<()> {
        if self.from().as_str().is_empty() {
            return Err(Error::Validation("empty sender id".to_string()));
        }
        if self.to().as_str().is_empty() {
            return Err(Error::Validation("empty target id".to_string()));
        }
        if self.from() == self.to() {
            return Err(Error::Validation("sender addressed itself".to_string()));
        }
        let payload_empty = match self {
            Self::Offer { sdp, .. } | Self::Answer { sdp, .. } => sdp.sdp.is_empty(),
            Self::Candidate { candidate, .. } => candidate.candidate.is_empty(),
        };
        if payload_empty {
            return Err(Error::Validation("empty payload".to_string()));
        }
        Ok(())
    }
}
