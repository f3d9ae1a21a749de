//! In-process delivery hub for relay events
//!
//! Routes events to subscribed transport sessions on this process. In a
//! multi-process deployment the transport fabric composes this hub with its
//! own cross-node forwarding; addressed routing stays correct because
//! targets are resolved through the shared directory first.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use lockstep_core::models::{Participant, ParticipantId, RoomId, SessionId};

use crate::events::RelayEvent;

/// Delivery surface the relay speaks to
pub trait SessionRouter: Send + Sync {
    /// Deliver to one session; `false` when it is not reachable here
    fn send_to_session(&self, session_id: &SessionId, event: RelayEvent) -> bool;

    /// Deliver to every subscribed session of a room; returns how many got it
    fn broadcast_room(&self, room_id: &RoomId, event: RelayEvent) -> usize;
}

struct Subscriber {
    room_id: RoomId,
    participant: Participant,
    sender: mpsc::UnboundedSender<RelayEvent>,
}

/// Local subscriber registry
#[derive(Default)]
pub struct RelayHub {
    sessions: DashMap<SessionId, Subscriber>,
    rooms: DashMap<RoomId, Vec<SessionId>>,
}

impl RelayHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session to its room's events; the returned receiver is
    /// the session's downstream channel
    pub fn subscribe(
        &self,
        room_id: RoomId,
        participant: Participant,
        session_id: SessionId,
    ) -> mpsc::UnboundedReceiver<RelayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        info!(
            room_id = %room_id,
            participant = %participant.id,
            session_id = %session_id,
            "session subscribed"
        );

        self.sessions.insert(
            session_id.clone(),
            Subscriber {
                room_id: room_id.clone(),
                participant,
                sender: tx,
            },
        );
        self.rooms
            .entry(room_id)
            .or_default()
            .push(session_id);

        rx
    }

    /// Drop a session's subscription
    pub fn unsubscribe(&self, session_id: &SessionId) {
        if let Some((_, subscriber)) = self.sessions.remove(session_id) {
            if let Some(mut sessions) = self.rooms.get_mut(&subscriber.room_id) {
                sessions.retain(|id| id != session_id);
                if sessions.is_empty() {
                    drop(sessions);
                    self.rooms.remove(&subscriber.room_id);
                    debug!(room_id = %subscriber.room_id, "room has no more sessions, removed");
                }
            }
            info!(
                room_id = %subscriber.room_id,
                participant = %subscriber.participant.id,
                session_id = %session_id,
                "session unsubscribed"
            );
        } else {
            warn!(session_id = %session_id, "attempted to unsubscribe unknown session");
        }
    }

    /// Room and participant a session is bound to
    #[must_use]
    pub fn subscription(&self, session_id: &SessionId) -> Option<(RoomId, ParticipantId)> {
        self.sessions.get(session_id).map(|subscriber| {
            (
                subscriber.room_id.clone(),
                subscriber.participant.id.clone(),
            )
        })
    }

    /// Participant bound to a session, used to server-set message senders
    #[must_use]
    pub fn participant_for(&self, session_id: &SessionId) -> Option<ParticipantId> {
        self.sessions
            .get(session_id)
            .map(|subscriber| subscriber.participant.id.clone())
    }

    /// Identity of a participant with a subscribed session, if any
    #[must_use]
    pub fn participant_info(&self, participant: &ParticipantId) -> Option<Participant> {
        self.sessions
            .iter()
            .find(|entry| &entry.value().participant.id == participant)
            .map(|entry| entry.value().participant.clone())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl SessionRouter for RelayHub {
    fn send_to_session(&self, session_id: &SessionId, event: RelayEvent) -> bool {
        let Some(subscriber) = self.sessions.get(session_id) else {
            return false;
        };

        if subscriber.sender.send(event).is_err() {
            drop(subscriber);
            warn!(session_id = %session_id, "subscriber channel dead, cleaning up");
            self.unsubscribe(session_id);
            return false;
        }
        true
    }

    fn broadcast_room(&self, room_id: &RoomId, event: RelayEvent) -> usize {
        let session_ids = self
            .rooms
            .get(room_id)
            .map(|sessions| sessions.clone())
            .unwrap_or_default();

        let mut sent = 0;
        let mut dead = Vec::new();

        for session_id in session_ids {
            if let Some(subscriber) = self.sessions.get(&session_id) {
                if subscriber.sender.send(event.clone()).is_ok() {
                    sent += 1;
                } else {
                    dead.push(session_id);
                }
            }
        }

        for session_id in dead {
            warn!(session_id = %session_id, "subscriber channel dead, cleaning up");
            self.unsubscribe(&session_id);
        }

        if sent > 0 {
            debug!(
                room_id = %room_id,
                sent,
                event_type = event.event_type(),
                "event broadcast complete"
            );
        }
        sent
    }
}
