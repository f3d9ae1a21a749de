//! User→session directory
//!
//! Maps a participant to its currently active transport session so
//! addressed signaling can be routed regardless of which server process
//! holds either side. Writes are last-writer-wins; no read-modify-write
//! sequences are required. Stale entries self-heal: a lookup that resolves
//! to a session bound to a different participant deletes the entry and
//! reports a miss.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::timeout;
use tracing::{debug, warn};

use lockstep_core::config::RedisConfig;
use lockstep_core::models::{ParticipantId, SessionId};
use lockstep_core::{Error, Result};

/// Timeout for individual Redis operations
const REDIS_OP_TIMEOUT: Duration = Duration::from_secs(5);

/// Safety-net expiry for directory entries; explicit removal on disconnect
/// remains the primary cleanup path
const DIRECTORY_TTL_SECS: u64 = 86_400;

/// Participant → session mapping shared by every relay instance
#[async_trait]
pub trait SessionDirectory: Send + Sync {
    /// Bind a participant to its live session (last writer wins)
    async fn set(&self, participant: &ParticipantId, session: &SessionId) -> Result<()>;

    async fn get(&self, participant: &ParticipantId) -> Result<Option<SessionId>>;

    /// Like `get`, but verifies the reverse binding; a mismatch deletes the
    /// entry and reports a miss
    async fn get_validated(&self, participant: &ParticipantId) -> Result<Option<SessionId>>;

    async fn remove(&self, participant: &ParticipantId) -> Result<()>;

    /// Remove only if the participant is still bound to `session`, so a
    /// disconnect of an old session never clobbers a newer binding
    async fn remove_if_session(
        &self,
        participant: &ParticipantId,
        session: &SessionId,
    ) -> Result<()>;
}

/// Single-process directory, also the test double
#[derive(Default)]
pub struct MemoryDirectory {
    forward: DashMap<ParticipantId, SessionId>,
    reverse: DashMap<SessionId, ParticipantId>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Corrupt the reverse binding, for exercising self-healing in tests
    #[cfg(test)]
    fn poison_reverse(&self, session: &SessionId, participant: ParticipantId) {
        self.reverse.insert(session.clone(), participant);
    }
}

#[async_trait]
impl SessionDirectory for MemoryDirectory {
    async fn set(&self, participant: &ParticipantId, session: &SessionId) -> Result<()> {
        self.forward.insert(participant.clone(), session.clone());
        self.reverse.insert(session.clone(), participant.clone());
        Ok(())
    }

    async fn get(&self, participant: &ParticipantId) -> Result<Option<SessionId>> {
        Ok(self.forward.get(participant).map(|entry| entry.clone()))
    }

    async fn get_validated(&self, participant: &ParticipantId) -> Result<Option<SessionId>> {
        let Some(session) = self.forward.get(participant).map(|entry| entry.clone()) else {
            return Ok(None);
        };

        let bound = self.reverse.get(&session).map(|entry| entry.clone());
        if bound.as_ref() == Some(participant) {
            Ok(Some(session))
        } else {
            warn!(
                participant = %participant,
                session_id = %session,
                "stale directory entry, removing"
            );
            self.forward.remove(participant);
            Ok(None)
        }
    }

    async fn remove(&self, participant: &ParticipantId) -> Result<()> {
        if let Some((_, session)) = self.forward.remove(participant) {
            self.reverse
                .remove_if(&session, |_, bound| bound == participant);
        }
        Ok(())
    }

    async fn remove_if_session(
        &self,
        participant: &ParticipantId,
        session: &SessionId,
    ) -> Result<()> {
        let matches = self
            .forward
            .get(participant)
            .is_some_and(|entry| entry.value() == session);
        if matches {
            self.forward.remove(participant);
            self.reverse
                .remove_if(session, |_, bound| bound == participant);
        }
        Ok(())
    }
}

/// Redis-backed directory shared across server processes
pub struct RedisDirectory {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisDirectory {
    /// Connect using the shared Redis configuration
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = timeout(
            Duration::from_secs(config.connect_timeout_seconds),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| Error::Internal("redis connection timed out".to_string()))??;

        Ok(Self {
            conn,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn participant_key(&self, participant: &ParticipantId) -> String {
        format!("{}directory:participant:{}", self.key_prefix, participant)
    }

    fn session_key(&self, session: &SessionId) -> String {
        format!("{}directory:session:{}", self.key_prefix, session)
    }

    async fn bounded<T>(
        &self,
        what: &'static str,
        op: impl std::future::Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        timeout(REDIS_OP_TIMEOUT, op)
            .await
            .map_err(|_| Error::Internal(format!("redis {what} timed out")))?
    }
}

#[async_trait]
impl SessionDirectory for RedisDirectory {
    async fn set(&self, participant: &ParticipantId, session: &SessionId) -> Result<()> {
        let mut conn = self.conn.clone();
        let forward = self.participant_key(participant);
        let reverse = self.session_key(session);
        let participant = participant.clone();
        let session = session.clone();

        self.bounded("set", async move {
            let _: () = conn
                .set_ex(&forward, session.as_str(), DIRECTORY_TTL_SECS)
                .await?;
            let _: () = conn
                .set_ex(&reverse, participant.as_str(), DIRECTORY_TTL_SECS)
                .await?;
            Ok(())
        })
        .await
    }

    async fn get(&self, participant: &ParticipantId) -> Result<Option<SessionId>> {
        let mut conn = self.conn.clone();
        let forward = self.participant_key(participant);

        self.bounded("get", async move {
            let session: Option<String> = conn.get(&forward).await?;
            Ok(session.map(SessionId::from_string))
        })
        .await
    }

    async fn get_validated(&self, participant: &ParticipantId) -> Result<Option<SessionId>> {
        let Some(session) = self.get(participant).await? else {
            return Ok(None);
        };

        let mut conn = self.conn.clone();
        let forward = self.participant_key(participant);
        let reverse = self.session_key(&session);
        let expected = participant.clone();

        let valid = self
            .bounded("validate", async move {
                let bound: Option<String> = conn.get(&reverse).await?;
                if bound.as_deref() == Some(expected.as_str()) {
                    Ok(true)
                } else {
                    let _: () = conn.del(&forward).await?;
                    Ok(false)
                }
            })
            .await?;

        if valid {
            Ok(Some(session))
        } else {
            warn!(
                participant = %participant,
                session_id = %session,
                "stale directory entry, removed"
            );
            Ok(None)
        }
    }

    async fn remove(&self, participant: &ParticipantId) -> Result<()> {
        let mut conn = self.conn.clone();
        let forward = self.participant_key(participant);
        let prefix = self.key_prefix.clone();

        self.bounded("remove", async move {
            let session: Option<String> = conn.get(&forward).await?;
            let _: () = conn.del(&forward).await?;
            if let Some(session) = session {
                let reverse = format!("{prefix}directory:session:{session}");
                let _: () = conn.del(&reverse).await?;
            }
            Ok(())
        })
        .await?;

        debug!(participant = %participant, "directory entry removed");
        Ok(())
    }

    async fn remove_if_session(
        &self,
        participant: &ParticipantId,
        session: &SessionId,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let forward = self.participant_key(participant);
        let reverse = self.session_key(session);
        let expected = session.clone();

        self.bounded("remove_if_session", async move {
            let bound: Option<String> = conn.get(&forward).await?;
            if bound.as_deref() == Some(expected.as_str()) {
                let _: () = conn.del(&forward).await?;
                let _: () = conn.del(&reverse).await?;
            }
            Ok(())
        })
        .await
    }
}
