//! Presence/capacity relay and signaling forwarder
//!
//! Brokers mesh membership per room+modality and forwards addressed
//! offer/answer/candidate messages between sessions via the shared
//! directory. Capacity enforcement is intentionally eventually consistent:
//! one bounded recheck absorbs a join racing a leave, and a transient
//! one-participant overshoot is accepted instead of a distributed lock.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lockstep_core::config::MeshConfig;
use lockstep_core::models::{Participant, ParticipantId, RoomId, SessionId};
use lockstep_core::{Error, Modality, Result, SignalMessage};

use crate::directory::SessionDirectory;
use crate::events::RelayEvent;
use crate::hub::{RelayHub, SessionRouter};
use crate::membership::{MeshKey, MeshMembership};

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Peers already in the mesh, in join order. The newly joined
    /// participant initiates toward every one of them; the reverse never
    /// happens, so competing offers need no tie-break.
    pub existing_peers: Vec<ParticipantId>,
    /// Mesh occupancy including the joiner
    pub count: usize,
}

/// Per-room, per-modality signaling relay
pub struct SignalingRelay {
    hub: Arc<RelayHub>,
    membership: MeshMembership,
    directory: Arc<dyn SessionDirectory>,
    config: MeshConfig,
}

impl SignalingRelay {
    #[must_use]
    pub fn new(hub: Arc<RelayHub>, directory: Arc<dyn SessionDirectory>, config: MeshConfig) -> Self {
        Self {
            hub,
            membership: MeshMembership::new(),
            directory,
            config,
        }
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<RelayHub> {
        &self.hub
    }

    /// Bind a connected session to its participant and room.
    ///
    /// Called by the transport when a connection authenticates; the
    /// directory write makes this participant addressable from any process.
    pub async fn register_session(
        &self,
        room_id: RoomId,
        participant: Participant,
        session_id: SessionId,
    ) -> Result<mpsc::UnboundedReceiver<RelayEvent>> {
        self.directory.set(&participant.id, &session_id).await?;
        Ok(self.hub.subscribe(room_id, participant, session_id))
    }

    /// Join a room+modality mesh.
    ///
    /// Stale members are pruned before the capacity check. At or above the
    /// cap the check runs once more after a short delay, absorbing a join
    /// that raced a concurrent leave, then rejects with `CapacityExceeded`.
    pub async fn join(
        &self,
        room_id: RoomId,
        modality: Modality,
        participant: ParticipantId,
    ) -> Result<JoinOutcome> {
        let key = MeshKey::new(room_id.clone(), modality);

        self.prune_stale(&key).await;
        if self.membership.len(&key) >= self.config.max_mesh_size {
            tokio::time::sleep(self.config.capacity_recheck()).await;
            self.prune_stale(&key).await;
            if self.membership.len(&key) >= self.config.max_mesh_size {
                info!(
                    room_id = %key.room_id,
                    modality = %modality,
                    participant = %participant,
                    "join rejected, mesh at capacity"
                );
                return Err(Error::CapacityExceeded(format!(
                    "{modality} mesh is full ({} participants)",
                    self.config.max_mesh_size
                )));
            }
        }

        let existing_peers = self.membership.members(&key);
        self.membership.insert(&key, participant.clone());
        let count = self.membership.len(&key);

        info!(
            room_id = %key.room_id,
            modality = %modality,
            participant = %participant,
            peers = existing_peers.len(),
            "participant joined mesh"
        );

        let display_name = self
            .hub
            .participant_info(&participant)
            .map_or_else(|| participant.to_string(), |info| info.display_name);
        let joined = RelayEvent::PeerJoined {
            room_id: room_id.clone(),
            modality,
            participant,
            display_name,
            timestamp: chrono::Utc::now(),
        };
        for peer in &existing_peers {
            self.notify_participant(peer, joined.clone()).await;
        }
        self.broadcast_count(&room_id, modality, count);

        Ok(JoinOutcome {
            existing_peers,
            count,
        })
    }

    /// Leave a mesh; idempotent for non-members
    pub async fn leave(
        &self,
        room_id: RoomId,
        modality: Modality,
        participant: ParticipantId,
    ) -> Result<()> {
        let key = MeshKey::new(room_id.clone(), modality);
        if !self.membership.remove(&key, &participant) {
            return Ok(());
        }

        let count = self.membership.len(&key);
        info!(
            room_id = %room_id,
            modality = %modality,
            participant = %participant,
            remaining = count,
            "participant left mesh"
        );

        let left = RelayEvent::PeerLeft {
            room_id: room_id.clone(),
            modality,
            participant,
            timestamp: chrono::Utc::now(),
        };
        for peer in self.membership.members(&key) {
            self.notify_participant(&peer, left.clone()).await;
        }
        self.broadcast_count(&room_id, modality, count);

        Ok(())
    }

    /// Forward an addressed message to its target's live session.
    ///
    /// The sender id is server-set from the authenticated session, the
    /// payload is never inspected or mutated, and a missing target is an
    /// error the caller must handle — the relay never retries delivery.
    pub async fn relay(&self, sender_session: &SessionId, mut message: SignalMessage) -> Result<()> {
        let sender = self
            .hub
            .participant_for(sender_session)
            .ok_or_else(|| Error::NotFound(format!("unknown session {sender_session}")))?;
        message.set_from(sender);
        message.validate()?;

        let target = message.to().clone();
        let Some(target_session) = self.directory.get_validated(&target).await? else {
            debug!(target = %target, kind = message.kind(), "relay target has no live session");
            return Err(Error::TargetUnavailable(format!(
                "participant {target} has no live session"
            )));
        };

        if self
            .hub
            .send_to_session(&target_session, RelayEvent::Signal { message })
        {
            Ok(())
        } else {
            // The session vanished between lookup and delivery; heal the
            // directory so the next lookup misses cleanly.
            self.directory
                .remove_if_session(&target, &target_session)
                .await?;
            Err(Error::TargetUnavailable(format!(
                "participant {target} disconnected"
            )))
        }
    }

    /// Ungraceful-disconnect sweep.
    ///
    /// The transport calls this from its pre-removal hook, while the
    /// session's room binding is still readable. Runs the same leave path
    /// a graceful leave would.
    pub async fn handle_disconnect(&self, session_id: &SessionId) {
        let Some((room_id, participant)) = self.hub.subscription(session_id) else {
            debug!(session_id = %session_id, "disconnect for unknown session");
            return;
        };

        for modality in Modality::ALL {
            let key = MeshKey::new(room_id.clone(), modality);
            if self.membership.contains(&key, &participant) {
                if let Err(err) = self
                    .leave(room_id.clone(), modality, participant.clone())
                    .await
                {
                    warn!(
                        participant = %participant,
                        modality = %modality,
                        error = %err,
                        "disconnect leave failed"
                    );
                }
            }
        }

        if let Err(err) = self
            .directory
            .remove_if_session(&participant, session_id)
            .await
        {
            warn!(participant = %participant, error = %err, "directory cleanup failed");
        }
        self.hub.unsubscribe(session_id);
    }

    /// Current mesh occupancy
    #[must_use]
    pub fn mesh_size(&self, room_id: &RoomId, modality: Modality) -> usize {
        self.membership
            .len(&MeshKey::new(room_id.clone(), modality))
    }

    /// Drop members whose directory association no longer matches a live
    /// session
    async fn prune_stale(&self, key: &MeshKey) {
        for member in self.membership.members(key) {
            let live = matches!(self.directory.get_validated(&member).await, Ok(Some(_)));
            if !live && self.membership.remove(key, &member) {
                warn!(
                    room_id = %key.room_id,
                    modality = %key.modality,
                    participant = %member,
                    "pruned stale mesh member"
                );
            }
        }
    }

    /// Best-effort targeted notification to one mesh member
    async fn notify_participant(&self, participant: &ParticipantId, event: RelayEvent) {
        match self.directory.get_validated(participant).await {
            Ok(Some(session_id)) => {
                if !self.hub.send_to_session(&session_id, event) {
                    debug!(participant = %participant, "notification target not reachable here");
                }
            }
            Ok(None) => {
                debug!(participant = %participant, "notification target has no live session");
            }
            Err(err) => {
                warn!(participant = %participant, error = %err, "notification lookup failed");
            }
        }
    }

    fn broadcast_count(&self, room_id: &RoomId, modality: Modality, count: usize) {
        self.hub.broadcast_room(
            room_id,
            RelayEvent::ParticipantCountChanged {
                room_id: room_id.clone(),
                modality,
                count,
                timestamp: chrono::Utc::now(),
            },
        );
    }
}
