//! Attempt-tier ladder
//!
//! The escalation ladder is a pure function over an enumerated tier so it
//! can be tested without any networking. One connection lifetime walks at
//! most three tiers; a soft restart within the first tier is not a tier
//! transition.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection-setup profile: whether traffic may use a relay, a direct
/// path, or either
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayProfile {
    /// Direct-path hints plus relay fallback hints
    Hybrid,
    /// Direct paths only
    DirectOnly,
    /// Relay only; trades latency for near-guaranteed traversal
    RelayOnly,
}

/// One rung of the escalation ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptTier {
    /// Attempt 1: fresh peer, hybrid configuration
    Initial,
    /// Attempt 2: hybrid again, optimizations off after the first failure
    Retuned,
    /// Attempt 3: force everything through the relay
    RelayForced,
}

/// Negotiation deadline re-armed after a soft restart. The restart itself
/// gets a short grace window first; this bounds the renegotiation that
/// follows it.
pub const SOFT_RESTART_REARM_TIMEOUT: Duration = Duration::from_secs(2);

impl AttemptTier {
    /// 1-based attempt number, monotonic within one connection lifetime
    #[must_use]
    pub const fn attempt(&self) -> u8 {
        match self {
            Self::Initial => 1,
            Self::Retuned => 2,
            Self::RelayForced => 3,
        }
    }

    #[must_use]
    pub const fn profile(&self) -> RelayProfile {
        match self {
            Self::Initial | Self::Retuned => RelayProfile::Hybrid,
            Self::RelayForced => RelayProfile::RelayOnly,
        }
    }

    /// Whether this tier forces traffic through a relay
    #[must_use]
    pub const fn relay_forced(&self) -> bool {
        matches!(self, Self::RelayForced)
    }

    /// Deadline for a remote description to arrive before the tier is
    /// abandoned, independent of explicit failure signals
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        match self {
            Self::Initial => Duration::from_secs(5),
            Self::Retuned => Duration::from_secs(4),
            Self::RelayForced => Duration::from_secs(3),
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Initial => "initial",
            Self::Retuned => "retuned",
            Self::RelayForced => "relay_forced",
        }
    }
}

impl std::fmt::Display for AttemptTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Next rung of the ladder, or `None` once it is exhausted.
///
/// `forced` distinguishes an externally forced escalation (timeout or
/// terminal failure) from an ordinary re-check; an unforced call never
/// advances the tier.
#[must_use]
pub const fn next_tier(current: AttemptTier, forced: bool) -> Option<AttemptTier> {
    if !forced {
        return Some(current);
    }
    match current {
        AttemptTier::Initial => Some(AttemptTier::Retuned),
        AttemptTier::Retuned => Some(AttemptTier::RelayForced),
        AttemptTier::RelayForced => None,
    }
}
