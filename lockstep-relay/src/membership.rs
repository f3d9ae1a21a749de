//! Per room+modality mesh membership
//!
//! A membership set exists from the first join until the last leave. Join
//! order is preserved so a joiner's existing-peers list reflects arrival
//! order.

use dashmap::DashMap;

use lockstep_core::models::{ParticipantId, RoomId};
use lockstep_core::Modality;

/// Key for one mesh: a room and a modality
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MeshKey {
    pub room_id: RoomId,
    pub modality: Modality,
}

impl MeshKey {
    #[must_use]
    pub const fn new(room_id: RoomId, modality: Modality) -> Self {
        Self { room_id, modality }
    }
}

/// Membership sets for every active mesh
#[derive(Default)]
pub struct MeshMembership {
    meshes: DashMap<MeshKey, Vec<ParticipantId>>,
}

impl MeshMembership {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Members in join order
    #[must_use]
    pub fn members(&self, key: &MeshKey) -> Vec<ParticipantId> {
        self.meshes
            .get(key)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self, key: &MeshKey) -> usize {
        self.meshes.get(key).map_or(0, |members| members.len())
    }

    #[must_use]
    pub fn is_empty(&self, key: &MeshKey) -> bool {
        self.len(key) == 0
    }

    #[must_use]
    pub fn contains(&self, key: &MeshKey, participant: &ParticipantId) -> bool {
        self.meshes
            .get(key)
            .is_some_and(|members| members.contains(participant))
    }

    /// Add a member; duplicate joins are idempotent
    pub fn insert(&self, key: &MeshKey, participant: ParticipantId) {
        let mut members = self.meshes.entry(key.clone()).or_default();
        if !members.contains(&participant) {
            members.push(participant);
        }
    }

    /// Remove a member; the mesh entry is dropped once empty. Returns
    /// whether the participant was a member.
    pub fn remove(&self, key: &MeshKey, participant: &ParticipantId) -> bool {
        let Some(mut members) = self.meshes.get_mut(key) else {
            return false;
        };

        let before = members.len();
        members.retain(|member| member != participant);
        let removed = members.len() < before;

        if members.is_empty() {
            drop(members);
            self.meshes.remove(key);
        }
        removed
    }

    /// Drop every member not upheld by `keep`, returning the pruned ids
    pub fn retain(
        &self,
        key: &MeshKey,
        keep: impl Fn(&ParticipantId) -> bool,
    ) -> Vec<ParticipantId> {
        let Some(mut members) = self.meshes.get_mut(key) else {
            return Vec::new();
        };

        let mut pruned = Vec::new();
        members.retain(|member| {
            if keep(member) {
                true
            } else {
                pruned.push(member.clone());
                false
            }
        });

        if members.is_empty() {
            drop(members);
            self.meshes.remove(key);
        }
        pruned
    }
}
