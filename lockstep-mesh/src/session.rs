//! Local session lifecycle
//!
//! One `LocalSession` per room+modality. Enablement is single-flight and
//! memoized; teardown is safe on partial state; an epoch counter turns
//! in-flight continuations into no-ops after `disable()`, since in-flight
//! async work cannot be hard-cancelled.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lockstep_core::config::MeshConfig;
use lockstep_core::models::ParticipantId;
use lockstep_core::{Error, Modality, Result};

use crate::events::{DisableReason, MeshEvent};
use crate::media::{LocalMedia, MediaError, MediaSource};
use crate::orchestrator::PeerOrchestrator;
use crate::singleflight::{SingleFlight, SingleFlightError};

struct SessionState {
    enabled: bool,
    media: Option<Arc<LocalMedia>>,
    /// Bumped on every disable; stale continuations compare and bail
    epoch: u64,
    idle_cancel: Option<CancellationToken>,
    /// Mesh members for this modality, tracked from relay notifications
    peers: HashSet<ParticipantId>,
}

/// Debounced threshold meter over audio levels fed by the capture side
struct SpeakingMeter {
    threshold: f32,
    hold: std::time::Duration,
    speaking: bool,
    last_flip: Option<Instant>,
}

impl SpeakingMeter {
    fn new(config: &MeshConfig) -> Self {
        Self {
            threshold: config.speaking_threshold,
            hold: config.speaking_hold(),
            speaking: false,
            last_flip: None,
        }
    }

    fn ingest(&mut self, level: f32) -> Option<bool> {
        let loud = level >= self.threshold;
        if loud == self.speaking {
            return None;
        }
        if let Some(last) = self.last_flip {
            if last.elapsed() < self.hold {
                return None;
            }
        }
        self.speaking = loud;
        self.last_flip = Some(Instant::now());
        Some(loud)
    }

    fn reset(&mut self) {
        self.speaking = false;
        self.last_flip = None;
    }
}

/// Local media session for one modality
pub struct LocalSession {
    local_id: ParticipantId,
    modality: Modality,
    media_source: Arc<dyn MediaSource>,
    orchestrator: Arc<PeerOrchestrator>,
    events: mpsc::UnboundedSender<MeshEvent>,
    config: MeshConfig,
    state: Mutex<SessionState>,
    enable_flight: SingleFlight<String, (), MediaError>,
    speaking: Mutex<SpeakingMeter>,
}

impl LocalSession {
    pub fn new(
        local_id: ParticipantId,
        modality: Modality,
        media_source: Arc<dyn MediaSource>,
        orchestrator: Arc<PeerOrchestrator>,
        events: mpsc::UnboundedSender<MeshEvent>,
        config: MeshConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            modality,
            media_source,
            orchestrator,
            events,
            speaking: Mutex::new(SpeakingMeter::new(&config)),
            config,
            state: Mutex::new(SessionState {
                enabled: false,
                media: None,
                epoch: 0,
                idle_cancel: None,
                peers: HashSet::new(),
            }),
            enable_flight: SingleFlight::new(),
        })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// Acquire local media and mark the session enabled.
    ///
    /// Idempotent: a second call while one is in flight coalesces into it;
    /// a call on an already enabled session is a no-op. Acquisition failure
    /// surfaces as `MediaPermissionDenied` and leaves the session disabled.
    pub async fn enable(self: &Arc<Self>) -> Result<()> {
        let epoch = {
            let state = self.state.lock();
            if state.enabled {
                return Ok(());
            }
            state.epoch
        };

        let session = self.clone();
        let result = self
            .enable_flight
            .do_work(format!("enable:{}", self.modality), async move {
                let media = session.media_source.acquire(session.modality).await?;

                let stale = {
                    let mut state = session.state.lock();
                    if state.epoch != epoch {
                        true
                    } else {
                        state.media = Some(media.clone());
                        state.enabled = true;
                        false
                    }
                };

                if stale {
                    // disable() ran while we were acquiring; drop the media.
                    media.stop();
                    debug!(modality = %session.modality, "enable superseded by disable");
                    return Ok(());
                }

                session.orchestrator.set_local_media(Some(media));
                info!(modality = %session.modality, "local session enabled");
                session.emit(MeshEvent::EnabledChanged {
                    modality: session.modality,
                    enabled: true,
                    reason: None,
                    timestamp: chrono::Utc::now(),
                });
                Ok(())
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(SingleFlightError::Inner(err)) => Err(match err {
                MediaError::PermissionDenied(msg) | MediaError::Unavailable(msg) => {
                    Error::MediaPermissionDenied(msg)
                }
            }),
            Err(SingleFlightError::WorkerFailed) => {
                Err(Error::Internal("enable coalescing failed".to_string()))
            }
        }
    }

    /// Tear the session down: stop local media, remove every peer
    /// connection, clear metering, cancel timers.
    ///
    /// Safe to call on a session that never fully enabled.
    pub async fn disable(self: &Arc<Self>, reason: DisableReason) {
        let (was_enabled, media, idle_cancel) = {
            let mut state = self.state.lock();
            let was_enabled = state.enabled;
            state.enabled = false;
            state.epoch += 1;
            state.peers.clear();
            (was_enabled, state.media.take(), state.idle_cancel.take())
        };

        if let Some(idle_cancel) = idle_cancel {
            idle_cancel.cancel();
        }
        if let Some(media) = media {
            media.stop();
        }

        self.orchestrator.set_local_media(None);
        self.orchestrator.remove_all().await;
        self.speaking.lock().reset();

        if was_enabled {
            info!(modality = %self.modality, reason = ?reason, "local session disabled");
            self.emit(MeshEvent::EnabledChanged {
                modality: self.modality,
                enabled: false,
                reason: Some(reason),
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Flip the microphone flag on local tracks; no renegotiation
    pub fn toggle_mute(&self) -> Result<bool> {
        let media = self
            .state
            .lock()
            .media
            .clone()
            .ok_or_else(|| Error::NotFound("no local media".to_string()))?;

        let enabled = media.toggle_audio();
        let muted = !enabled;
        self.emit(MeshEvent::MutedChanged {
            muted,
            timestamp: chrono::Utc::now(),
        });
        Ok(muted)
    }

    /// Flip the camera flag on local tracks; no renegotiation
    pub fn toggle_camera(&self) -> Result<bool> {
        let media = self
            .state
            .lock()
            .media
            .clone()
            .ok_or_else(|| Error::NotFound("no local media".to_string()))?;

        let enabled = media.toggle_video();
        self.emit(MeshEvent::CameraChanged {
            enabled,
            timestamp: chrono::Utc::now(),
        });
        Ok(enabled)
    }

    /// Initiate connections toward every pre-existing peer after a join.
    ///
    /// The newly joined participant is always the initiator, so competing
    /// offers never happen. A failure toward one peer does not abort the
    /// others.
    pub async fn connect_to_existing(self: &Arc<Self>, peers: &[ParticipantId]) {
        {
            let mut state = self.state.lock();
            for peer in peers {
                state.peers.insert(peer.clone());
            }
            if let Some(idle_cancel) = state.idle_cancel.take() {
                idle_cancel.cancel();
            }
        }

        for peer in peers {
            if let Err(err) = self.orchestrator.initiate(peer).await {
                warn!(peer_id = %peer, error = %err, "failed to initiate toward existing peer");
                self.emit(MeshEvent::Error {
                    message: err.to_string(),
                    peer: Some(peer.clone()),
                    timestamp: chrono::Utc::now(),
                });
            }
        }
    }

    /// A peer joined the mesh; it will initiate toward us
    pub fn handle_peer_joined(self: &Arc<Self>, peer: ParticipantId) {
        {
            let mut state = self.state.lock();
            state.peers.insert(peer.clone());
            if let Some(idle_cancel) = state.idle_cancel.take() {
                idle_cancel.cancel();
                debug!(modality = %self.modality, "idle timer cancelled by join");
            }
        }

        self.emit(MeshEvent::PeerJoined {
            participant: peer,
            timestamp: chrono::Utc::now(),
        });
    }

    /// A peer left the mesh; drop its connection and maybe arm the idle
    /// timer
    pub async fn handle_peer_left(self: &Arc<Self>, peer: ParticipantId) {
        let arm_idle = {
            let mut state = self.state.lock();
            state.peers.remove(&peer);
            state.enabled && state.peers.is_empty()
        };

        self.orchestrator.remove(&peer).await;
        self.emit(MeshEvent::PeerLeft {
            participant: peer,
            timestamp: chrono::Utc::now(),
        });

        if arm_idle {
            self.arm_idle_timer();
        }
    }

    /// Room occupancy changed; forwarded to the UI unmodified
    pub fn handle_participant_count(&self, count: usize) {
        self.emit(MeshEvent::ParticipantCountChanged {
            modality: self.modality,
            count,
            timestamp: chrono::Utc::now(),
        });
    }

    /// Feed one audio-level sample from the capture side
    pub fn ingest_audio_level(&self, level: f32) {
        if !self.is_enabled() {
            return;
        }
        if let Some(speaking) = self.speaking.lock().ingest(level) {
            self.emit(MeshEvent::SpeakingChanged {
                participant: self.local_id.clone(),
                speaking,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Alone in the mesh: auto-leave after the configured idle window
    /// unless someone joins first
    fn arm_idle_timer(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        self.state.lock().idle_cancel = Some(cancel.clone());

        let idle = self.config.idle_leave();
        let weak = Arc::downgrade(self);
        info!(modality = %self.modality, idle_seconds = idle.as_secs(), "idle timer armed");

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(idle) => {
                    let Some(session) = weak.upgrade() else { return };
                    let fire = {
                        let state = session.state.lock();
                        state.enabled && state.peers.is_empty()
                    };
                    if fire {
                        info!(modality = %session.modality, "idle timeout, auto-leaving");
                        session.disable(DisableReason::IdleTimeout).await;
                    }
                }
            }
        });
    }

    fn emit(&self, event: MeshEvent) {
        if self.events.send(event).is_err() {
            debug!("event channel closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use lockstep_core::config::IceConfig;
    use lockstep_core::SignalMessage;

    use crate::ice::{CredentialFetcher, IceResolver};
    use crate::test_support::{FakeFactory, FakeMediaSource, TestFetcher};

    struct Harness {
        session: Arc<LocalSession>,
        source: Arc<FakeMediaSource>,
        factory: Arc<FakeFactory>,
        event_rx: mpsc::UnboundedReceiver<MeshEvent>,
        _signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
    }

    fn harness(source: FakeMediaSource) -> Harness {
        let factory = Arc::new(FakeFactory::default());
        let fetcher: Arc<dyn CredentialFetcher> = Arc::new(TestFetcher);
        let resolver = Arc::new(IceResolver::new(&IceConfig::default(), Some(fetcher)));
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let orchestrator = PeerOrchestrator::new(
            ParticipantId::from("local1234567"),
            factory.clone(),
            resolver,
            signal_tx,
            event_tx.clone(),
            MeshConfig::default(),
        );

        let source = Arc::new(source);
        let session = LocalSession::new(
            ParticipantId::from("local1234567"),
            Modality::Voice,
            source.clone(),
            orchestrator,
            event_tx,
            MeshConfig::default(),
        );

        Harness {
            session,
            source,
            factory,
            event_rx,
            _signal_rx: signal_rx,
        }
    }

    fn bob() -> ParticipantId {
        ParticipantId::from("bob123456789")
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MeshEvent>) -> Vec<MeshEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_concurrent_enables_acquire_once() {
        let h = harness(FakeMediaSource::slow(50));

        let a = {
            let session = h.session.clone();
            tokio::spawn(async move { session.enable().await })
        };
        let b = {
            let session = h.session.clone();
            tokio::spawn(async move { session.enable().await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        assert!(h.session.is_enabled());
        assert_eq!(h.source.acquisitions.load(Ordering::SeqCst), 1);

        // A later call on the enabled session is a no-op.
        h.session.enable().await.unwrap();
        assert_eq!(h.source.acquisitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enable_failure_leaves_session_disabled() {
        let h = harness(FakeMediaSource::failing());

        let err = h.session.enable().await.unwrap_err();
        assert!(matches!(err, Error::MediaPermissionDenied(_)));
        assert!(!h.session.is_enabled());

        // Failure is not memoized; a retry attempts acquisition again.
        let _ = h.session.enable().await;
        assert_eq!(h.source.acquisitions.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disable_is_safe_without_enable() {
        let mut h = harness(FakeMediaSource::ok());

        h.session.disable(DisableReason::Requested).await;
        assert!(!h.session.is_enabled());

        // Never enabled, so no enabled-changed event goes out.
        assert!(drain(&mut h.event_rx)
            .iter()
            .all(|e| !matches!(e, MeshEvent::EnabledChanged { .. })));
    }

    #[tokio::test]
    async fn test_toggles_flip_without_renegotiation() {
        let h = harness(FakeMediaSource::ok());
        h.session.enable().await.unwrap();
        h.session.connect_to_existing(&[bob()]).await;
        let created = h.factory.created();

        assert!(h.session.toggle_mute().unwrap());
        assert!(!h.session.toggle_mute().unwrap());

        // No new connections and no new offers from toggling.
        assert_eq!(h.factory.created(), created);
        assert_eq!(h.factory.handle(0).offers.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_toggle_without_media_errors() {
        let h = harness(FakeMediaSource::ok());
        assert!(matches!(
            h.session.toggle_mute(),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_to_existing_initiates_per_peer() {
        let h = harness(FakeMediaSource::ok());
        h.session.enable().await.unwrap();

        let carol = ParticipantId::from("carol1234567");
        h.session.connect_to_existing(&[bob(), carol]).await;

        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.session.peer_count(), 2);
        // Local media is attached to every initiated connection.
        assert_eq!(h.factory.handle(0).media_attached.load(Ordering::SeqCst), 1);
        assert_eq!(h.factory.handle(1).media_attached.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_fires_and_notifies() {
        let mut h = harness(FakeMediaSource::ok());
        h.session.enable().await.unwrap();
        h.session.handle_peer_joined(bob());
        h.session.handle_peer_left(bob()).await;

        tokio::time::sleep(Duration::from_secs(121)).await;

        assert!(!h.session.is_enabled());
        let events = drain(&mut h.event_rx);
        assert!(events.iter().any(|e| matches!(
            e,
            MeshEvent::EnabledChanged {
                enabled: false,
                reason: Some(DisableReason::IdleTimeout),
                ..
            }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_cancelled_by_join() {
        let mut h = harness(FakeMediaSource::ok());
        h.session.enable().await.unwrap();
        h.session.handle_peer_joined(bob());
        h.session.handle_peer_left(bob()).await;

        // A join strictly before expiry cancels the pending auto-leave.
        tokio::time::sleep(Duration::from_secs(60)).await;
        h.session.handle_peer_joined(bob());
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(h.session.is_enabled());
        let events = drain(&mut h.event_rx);
        assert!(!events.iter().any(|e| matches!(
            e,
            MeshEvent::EnabledChanged { enabled: false, .. }
        )));
    }

    #[tokio::test]
    async fn test_speaking_meter_debounces() {
        let mut h = harness(FakeMediaSource::ok());
        h.session.enable().await.unwrap();
        drain(&mut h.event_rx);

        h.session.ingest_audio_level(0.5);
        h.session.ingest_audio_level(0.6);

        let events = drain(&mut h.event_rx);
        let speaking: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, MeshEvent::SpeakingChanged { .. }))
            .collect();
        assert_eq!(speaking.len(), 1);
    }

    #[tokio::test]
    async fn test_disable_clears_peers_and_connections() {
        let h = harness(FakeMediaSource::ok());
        h.session.enable().await.unwrap();
        h.session.connect_to_existing(&[bob()]).await;
        assert_eq!(h.session.peer_count(), 1);

        h.session.disable(DisableReason::Requested).await;

        assert_eq!(h.session.peer_count(), 0);
        assert!(h.factory.handle(0).closed.load(Ordering::SeqCst));
    }
}
