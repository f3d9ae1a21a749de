//! Peer connection orchestration
//!
//! One entry per remote participant, owned by a single map. Entries are
//! replaced, never mutated, when the escalation ladder advances; the old
//! connection is fully torn down before the replacement is installed.
//! Negotiation deadlines, soft restarts and escalation debounce all run off
//! timers scoped to one entry instance, so a timer outliving its entry is a
//! no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lockstep_core::config::MeshConfig;
use lockstep_core::models::ParticipantId;
use lockstep_core::{Error, IceCandidate, Result, SessionDescription, SignalMessage};

use crate::connection::{ConnectionFactory, ConnectionHandle, ConnectionHooks, PeerSessionState};
use crate::events::MeshEvent;
use crate::ice::IceResolver;
use crate::media::LocalMedia;
use crate::tier::{next_tier, AttemptTier, SOFT_RESTART_REARM_TIMEOUT};

/// State for one remote peer's current connection attempt
struct PeerEntry {
    handle: Arc<dyn ConnectionHandle>,
    tier: AttemptTier,
    is_initiator: bool,
    /// Whether the current attempt forces traffic through a relay
    relay_forced: bool,
    /// One soft restart per ladder walk, consumed on the first failure
    soft_restart_used: bool,
    /// Answer applied at most once per entry instance
    answer_applied: bool,
    remote_desc_set: bool,
    connected: bool,
    /// Candidates held until the remote description exists
    pending_candidates: Vec<IceCandidate>,
    last_escalation: Option<Instant>,
    /// Entry instance id; timers compare it before acting
    instance: u64,
    cancel: CancellationToken,
}

type PeerSlot = Arc<Mutex<PeerEntry>>;

/// Owns every peer connection for one room+modality mesh
pub struct PeerOrchestrator {
    local_id: ParticipantId,
    peers: DashMap<ParticipantId, PeerSlot>,
    factory: Arc<dyn ConnectionFactory>,
    resolver: Arc<IceResolver>,
    signals: mpsc::UnboundedSender<SignalMessage>,
    events: mpsc::UnboundedSender<MeshEvent>,
    config: MeshConfig,
    media: RwLock<Option<Arc<LocalMedia>>>,
    instance_counter: AtomicU64,
    state_tx: mpsc::UnboundedSender<(ParticipantId, u64, PeerSessionState)>,
}

impl PeerOrchestrator {
    pub fn new(
        local_id: ParticipantId,
        factory: Arc<dyn ConnectionFactory>,
        resolver: Arc<IceResolver>,
        signals: mpsc::UnboundedSender<SignalMessage>,
        events: mpsc::UnboundedSender<MeshEvent>,
        config: MeshConfig,
    ) -> Arc<Self> {
        let (state_tx, mut state_rx) = mpsc::unbounded_channel();

        let orchestrator = Arc::new(Self {
            local_id,
            peers: DashMap::new(),
            factory,
            resolver,
            signals,
            events,
            config,
            media: RwLock::new(None),
            instance_counter: AtomicU64::new(0),
            state_tx,
        });

        // Connection hooks are synchronous; ladder reactions run here so a
        // state callback never blocks the connection's own task.
        let weak = Arc::downgrade(&orchestrator);
        tokio::spawn(async move {
            while let Some((peer_id, instance, state)) = state_rx.recv().await {
                let Some(orchestrator) = weak.upgrade() else {
                    break;
                };
                orchestrator.on_peer_state(&peer_id, instance, state).await;
            }
        });

        orchestrator
    }

    /// Install (or clear) the local media attached to every new connection
    pub fn set_local_media(&self, media: Option<Arc<LocalMedia>>) {
        *self.media.write() = media;
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<ParticipantId> {
        self.peers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Current attempt tier for a peer, if one is being negotiated
    #[must_use]
    pub fn peer_tier(&self, id: &ParticipantId) -> Option<AttemptTier> {
        self.peers.get(id).map(|slot| slot.value().lock().tier)
    }

    /// Return the existing connection for `id`, or create one.
    ///
    /// With `force_escalate` the current entry is torn down and replaced at
    /// the next tier; once the ladder is exhausted the peer is removed and
    /// `NegotiationFailed` is returned. Forced escalations are debounced.
    pub async fn obtain_or_create(
        self: &Arc<Self>,
        id: &ParticipantId,
        is_initiator: bool,
        force_escalate: bool,
    ) -> Result<Arc<dyn ConnectionHandle>> {
        if let Some(slot) = self.peers.get(id).map(|entry| entry.value().clone()) {
            if !force_escalate {
                return Ok(slot.lock().handle.clone());
            }

            let (tier, last_escalation, old_handle, old_cancel) = {
                let entry = slot.lock();
                (
                    entry.tier,
                    entry.last_escalation,
                    entry.handle.clone(),
                    entry.cancel.clone(),
                )
            };

            if let Some(last) = last_escalation {
                if last.elapsed() < self.config.escalation_debounce() {
                    debug!(peer_id = %id, "escalation debounced");
                    return Ok(old_handle);
                }
            }

            let Some(tier) = next_tier(tier, true) else {
                warn!(peer_id = %id, "escalation ladder exhausted, removing peer");
                self.remove(id).await;
                let message = format!("all {} attempts exhausted", AttemptTier::RelayForced.attempt());
                self.emit(MeshEvent::Error {
                    message: message.clone(),
                    peer: Some(id.clone()),
                    timestamp: chrono::Utc::now(),
                });
                return Err(Error::NegotiationFailed(message));
            };

            // Old entry is fully torn down before the replacement exists.
            old_cancel.cancel();
            if let Err(err) = old_handle.close().await {
                debug!(peer_id = %id, error = %err, "closing superseded connection");
            }

            let handle = self
                .install(id, tier, is_initiator, Some(Instant::now()))
                .await?;
            info!(
                peer_id = %id,
                tier = %tier,
                attempt = tier.attempt(),
                "peer connection escalated"
            );
            return Ok(handle);
        }

        let handle = self
            .install(id, AttemptTier::Initial, is_initiator, None)
            .await?;
        debug!(peer_id = %id, is_initiator, "peer connection created");
        Ok(handle)
    }

    /// Create a connection toward a pre-existing peer; the joiner is always
    /// the initiator
    pub async fn initiate(self: &Arc<Self>, id: &ParticipantId) -> Result<()> {
        let handle = self.obtain_or_create(id, true, false).await?;
        let offer = handle.create_offer(false).await?;
        self.send_signal(SignalMessage::Offer {
            from: self.local_id.clone(),
            to: id.clone(),
            sdp: offer,
        });
        Ok(())
    }

    /// Apply an incoming offer and answer it.
    ///
    /// Glare guard: an offer is only accepted while the local signaling
    /// state is stable; the non-initiator answers and never re-offers
    /// mid-negotiation.
    pub async fn handle_offer(
        self: &Arc<Self>,
        from: &ParticipantId,
        sdp: SessionDescription,
    ) -> Result<()> {
        let handle = self.obtain_or_create(from, false, false).await?;

        if !handle.signaling_stable() {
            warn!(peer_id = %from, "offer ignored, signaling not stable (glare)");
            return Ok(());
        }

        handle.set_remote_description(sdp).await?;
        self.flush_candidates(from).await;

        let answer = handle.create_answer().await?;
        self.send_signal(SignalMessage::Answer {
            from: self.local_id.clone(),
            to: from.clone(),
            sdp: answer,
        });
        Ok(())
    }

    /// Apply an incoming answer at most once per connection instance
    pub async fn handle_answer(
        self: &Arc<Self>,
        from: &ParticipantId,
        sdp: SessionDescription,
    ) -> Result<()> {
        let slot = self
            .peers
            .get(from)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("no connection for peer {from}")))?;

        let handle = {
            let mut entry = slot.lock();
            if entry.answer_applied {
                debug!(peer_id = %from, "duplicate answer ignored");
                return Ok(());
            }
            entry.answer_applied = true;
            entry.handle.clone()
        };

        match handle.set_remote_description(sdp).await {
            Ok(()) => {
                self.flush_candidates(from).await;
                Ok(())
            }
            Err(err) => {
                // The answer never took effect; let a retransmit try again.
                slot.lock().answer_applied = false;
                Err(err)
            }
        }
    }

    /// Queue or apply a remote candidate.
    ///
    /// Queued before the remote description exists, applied immediately
    /// after; individual apply failures are logged and non-fatal.
    pub async fn add_remote_candidate(
        self: &Arc<Self>,
        from: &ParticipantId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let slot = self
            .peers
            .get(from)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("no connection for peer {from}")))?;

        let apply = {
            let mut entry = slot.lock();
            if entry.remote_desc_set {
                Some(entry.handle.clone())
            } else {
                entry.pending_candidates.push(candidate.clone());
                None
            }
        };

        if let Some(handle) = apply {
            if let Err(err) = handle.add_remote_candidate(candidate).await {
                warn!(peer_id = %from, error = %err, "remote candidate rejected");
            }
        }
        Ok(())
    }

    /// Tear down one peer: detach timers, close the connection, drop the
    /// candidate queue and idempotence guard
    pub async fn remove(&self, id: &ParticipantId) {
        if let Some((_, slot)) = self.peers.remove(id) {
            let (handle, cancel) = {
                let entry = slot.lock();
                (entry.handle.clone(), entry.cancel.clone())
            };
            cancel.cancel();
            if let Err(err) = handle.close().await {
                debug!(peer_id = %id, error = %err, "closing removed connection");
            }
            debug!(peer_id = %id, "peer connection removed");
        }
    }

    /// Tear down every peer connection
    pub async fn remove_all(&self) {
        let ids: Vec<ParticipantId> = self.peer_ids();
        for id in ids {
            self.remove(&id).await;
        }
    }

    /// Create a connection at `tier` and install it, replacing any map entry
    async fn install(
        self: &Arc<Self>,
        id: &ParticipantId,
        tier: AttemptTier,
        is_initiator: bool,
        last_escalation: Option<Instant>,
    ) -> Result<Arc<dyn ConnectionHandle>> {
        let ice_config = self.resolver.resolve(tier.profile()).await?;
        let instance = self.instance_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let hooks = self.hooks_for(id, instance);
        let handle = self.factory.create(ice_config, hooks).await?;

        let media = self.media.read().clone();
        if let Some(media) = media {
            handle.add_local_media(&media).await?;
        }

        let cancel = CancellationToken::new();
        let entry = PeerEntry {
            handle: handle.clone(),
            tier,
            is_initiator,
            relay_forced: tier.relay_forced(),
            soft_restart_used: false,
            answer_applied: false,
            remote_desc_set: false,
            connected: false,
            pending_candidates: Vec::new(),
            last_escalation,
            instance,
            cancel: cancel.clone(),
        };
        self.peers.insert(id.clone(), Arc::new(Mutex::new(entry)));

        self.arm_negotiation_deadline(id.clone(), instance, tier.negotiation_timeout(), cancel);
        Ok(handle)
    }

    fn hooks_for(self: &Arc<Self>, id: &ParticipantId, instance: u64) -> ConnectionHooks {
        let local_id = self.local_id.clone();
        let peer_id = id.clone();
        let signals = self.signals.clone();
        let on_local_candidate = Arc::new(move |candidate: IceCandidate| {
            let message = SignalMessage::Candidate {
                from: local_id.clone(),
                to: peer_id.clone(),
                candidate,
            };
            if signals.send(message).is_err() {
                debug!("signal channel closed, local candidate dropped");
            }
        });

        let peer_id = id.clone();
        let state_tx = self.state_tx.clone();
        let on_state_change = Arc::new(move |state: PeerSessionState| {
            let _ = state_tx.send((peer_id.clone(), instance, state));
        });

        let peer_id = id.clone();
        let on_media = Arc::new(move |kind: String| {
            debug!(peer_id = %peer_id, kind = %kind, "remote media received");
        });

        ConnectionHooks {
            on_local_candidate,
            on_state_change,
            on_media,
        }
    }

    /// Escalation deadline: no remote description by the tier's timeout
    /// forces the ladder forward, independent of explicit failure signals
    fn arm_negotiation_deadline(
        self: &Arc<Self>,
        id: ParticipantId,
        instance: u64,
        timeout: std::time::Duration,
        cancel: CancellationToken,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(timeout) => {
                    let Some(orchestrator) = weak.upgrade() else { return };
                    orchestrator.on_negotiation_deadline(&id, instance).await;
                }
            }
        });
    }

    async fn on_negotiation_deadline(self: &Arc<Self>, id: &ParticipantId, instance: u64) {
        let expired = self.peers.get(id).map(|entry| entry.value().clone()).is_some_and(|slot| {
            let entry = slot.lock();
            entry.instance == instance && !entry.remote_desc_set && !entry.connected
        });

        if expired {
            warn!(peer_id = %id, "negotiation deadline expired, escalating");
            self.escalate(id).await;
        }
    }

    async fn on_peer_state(self: &Arc<Self>, id: &ParticipantId, instance: u64, state: PeerSessionState) {
        let Some(slot) = self.peers.get(id).map(|entry| entry.value().clone()) else {
            return;
        };

        {
            let entry = slot.lock();
            if entry.instance != instance {
                return;
            }
        }

        match state {
            PeerSessionState::Connected => {
                let mut entry = slot.lock();
                entry.connected = true;
                // Healthy again: a future disconnect starts the ladder fresh.
                entry.tier = AttemptTier::Initial;
                entry.relay_forced = false;
                entry.soft_restart_used = false;
                entry.last_escalation = None;
                info!(peer_id = %id, "peer connection healthy");
            }
            PeerSessionState::Failed | PeerSessionState::Disconnected => {
                slot.lock().connected = false;
                self.handle_failure(id, instance, &slot).await;
            }
            PeerSessionState::New | PeerSessionState::Negotiating | PeerSessionState::Closed => {}
        }
    }

    async fn handle_failure(self: &Arc<Self>, id: &ParticipantId, instance: u64, slot: &PeerSlot) {
        enum Action {
            SoftRestart {
                handle: Arc<dyn ConnectionHandle>,
                is_initiator: bool,
            },
            Escalate,
        }

        let action = {
            let mut entry = slot.lock();
            if entry.instance != instance {
                return;
            }
            if entry.tier == AttemptTier::Initial && !entry.soft_restart_used {
                entry.soft_restart_used = true;
                // Renegotiation on the same transport expects a fresh
                // answer; the per-instance guards open back up for it.
                entry.answer_applied = false;
                entry.remote_desc_set = false;
                Action::SoftRestart {
                    handle: entry.handle.clone(),
                    is_initiator: entry.is_initiator,
                }
            } else {
                Action::Escalate
            }
        };

        match action {
            Action::SoftRestart { handle, is_initiator } => {
                info!(peer_id = %id, "attempting soft restart");
                if is_initiator {
                    match handle.create_offer(true).await {
                        Ok(offer) => self.send_signal(SignalMessage::Offer {
                            from: self.local_id.clone(),
                            to: id.clone(),
                            sdp: offer,
                        }),
                        Err(err) => {
                            warn!(peer_id = %id, error = %err, "soft restart offer failed");
                            self.escalate(id).await;
                            return;
                        }
                    }
                }
                self.arm_soft_restart_deadlines(id.clone(), instance);
            }
            Action::Escalate => self.escalate(id).await,
        }
    }

    /// Soft-restart watchdogs: a short grace for the transport to recover
    /// and a bounded deadline for the renegotiated remote description
    fn arm_soft_restart_deadlines(self: &Arc<Self>, id: ParticipantId, instance: u64) {
        let cancel = self
            .peers
            .get(&id)
            .map(|entry| entry.value().lock().cancel.clone())
            .unwrap_or_default();

        let grace = self.config.soft_restart_grace();
        let weak = Arc::downgrade(self);
        let grace_id = id.clone();
        let grace_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = grace_cancel.cancelled() => {}
                () = tokio::time::sleep(grace) => {
                    let Some(orchestrator) = weak.upgrade() else { return };
                    let unresolved = orchestrator
                        .peers
                        .get(&grace_id)
                        .map(|entry| entry.value().clone())
                        .is_some_and(|slot| {
                            let entry = slot.lock();
                            entry.instance == instance && !entry.connected
                        });
                    if unresolved {
                        info!(peer_id = %grace_id, "soft restart did not resolve, escalating");
                        orchestrator.escalate(&grace_id).await;
                    }
                }
            }
        });

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(SOFT_RESTART_REARM_TIMEOUT) => {
                    let Some(orchestrator) = weak.upgrade() else { return };
                    orchestrator.on_negotiation_deadline(&id, instance).await;
                }
            }
        });
    }

    async fn escalate(self: &Arc<Self>, id: &ParticipantId) {
        let Some((is_initiator, instance_before)) = self.peers.get(id).map(|entry| {
            let entry = entry.value().lock();
            (entry.is_initiator, entry.instance)
        }) else {
            return;
        };

        match self.obtain_or_create(id, is_initiator, true).await {
            Ok(handle) => {
                let replaced = self
                    .peers
                    .get(id)
                    .is_some_and(|entry| entry.value().lock().instance != instance_before);
                if is_initiator && replaced {
                    match handle.create_offer(false).await {
                        Ok(offer) => self.send_signal(SignalMessage::Offer {
                            from: self.local_id.clone(),
                            to: id.clone(),
                            sdp: offer,
                        }),
                        Err(err) => {
                            warn!(peer_id = %id, error = %err, "offer after escalation failed");
                        }
                    }
                }
            }
            Err(err) => {
                // Ladder exhausted (error event already emitted) or the
                // replacement could not be created.
                debug!(peer_id = %id, error = %err, "escalation ended");
            }
        }
    }

    /// Mark the remote description applied and drain queued candidates in
    /// arrival order
    async fn flush_candidates(&self, id: &ParticipantId) {
        let Some(slot) = self.peers.get(id).map(|entry| entry.value().clone()) else {
            return;
        };

        let (handle, queued) = {
            let mut entry = slot.lock();
            entry.remote_desc_set = true;
            (entry.handle.clone(), std::mem::take(&mut entry.pending_candidates))
        };

        for candidate in queued {
            if let Err(err) = handle.add_remote_candidate(candidate).await {
                warn!(peer_id = %id, error = %err, "queued candidate rejected");
            }
        }
    }

    fn send_signal(&self, message: SignalMessage) {
        if self.signals.send(message).is_err() {
            debug!("signal channel closed, outbound message dropped");
        }
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
    use std::time::Duration;

    use lockstep_core::config::IceConfig;

    use crate::ice::{CredentialFetcher, TransportPolicy};
    use crate::test_support::{FakeFactory, TestFetcher};

    struct Harness {
        orchestrator: Arc<PeerOrchestrator>,
        factory: Arc<FakeFactory>,
        signal_rx: mpsc::UnboundedReceiver<SignalMessage>,
        event_rx: mpsc::UnboundedReceiver<MeshEvent>,
    }

    fn harness() -> Harness {
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
            event_tx,
            MeshConfig::default(),
        );

        Harness {
            orchestrator,
            factory,
            signal_rx,
            event_rx,
        }
    }

    fn bob() -> ParticipantId {
        ParticipantId::from("bob123456789")
    }

    fn candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 UDP 2130706431 192.168.1.{n} 54321 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    /// Let the state loop drain pending hook firings
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_obtain_or_create_is_idempotent() {
        let h = harness();
        let peer = bob();

        h.orchestrator
            .obtain_or_create(&peer, true, false)
            .await
            .unwrap();
        h.orchestrator
            .obtain_or_create(&peer, true, false)
            .await
            .unwrap();

        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.orchestrator.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_candidates_queue_until_remote_description_then_flush_in_order() {
        let mut h = harness();
        let peer = bob();

        h.orchestrator.initiate(&peer).await.unwrap();
        h.orchestrator
            .add_remote_candidate(&peer, candidate(1))
            .await
            .unwrap();
        h.orchestrator
            .add_remote_candidate(&peer, candidate(2))
            .await
            .unwrap();

        // Nothing applied before the remote description exists
        assert!(h.factory.handle(0).candidates.lock().is_empty());

        h.orchestrator
            .handle_answer(&peer, SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();

        // After it, candidates apply immediately
        h.orchestrator
            .add_remote_candidate(&peer, candidate(3))
            .await
            .unwrap();

        let applied = h.factory.handle(0).candidates.lock().clone();
        assert_eq!(applied.len(), 3);
        assert!(applied[0].candidate.contains("192.168.1.1"));
        assert!(applied[1].candidate.contains("192.168.1.2"));
        assert!(applied[2].candidate.contains("192.168.1.3"));

        // The first outbound message was our offer
        let first = h.signal_rx.recv().await.unwrap();
        assert_eq!(first.kind(), "offer");
    }

    #[tokio::test]
    async fn test_answer_applied_exactly_once() {
        let h = harness();
        let peer = bob();

        h.orchestrator.initiate(&peer).await.unwrap();
        h.orchestrator
            .handle_answer(&peer, SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        h.orchestrator
            .handle_answer(&peer, SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();

        assert_eq!(h.factory.handle(0).remote_descriptions.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_for_unknown_peer_is_not_found() {
        let h = harness();
        let err = h
            .orchestrator
            .handle_answer(&bob(), SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_offer_ignored_while_signaling_not_stable() {
        let mut h = harness();
        let peer = bob();

        // We initiated: local offer outstanding, signaling no longer stable.
        h.orchestrator.initiate(&peer).await.unwrap();
        h.orchestrator
            .handle_offer(&peer, SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();

        // The glare offer was not applied and no answer went out.
        assert!(h.factory.handle(0).remote_descriptions.lock().is_empty());
        let first = h.signal_rx.recv().await.unwrap();
        assert_eq!(first.kind(), "offer");
        assert!(h.signal_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_incoming_offer_is_answered() {
        let mut h = harness();
        let peer = bob();

        h.orchestrator
            .handle_offer(&peer, SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();

        let out = h.signal_rx.recv().await.unwrap();
        assert_eq!(out.kind(), "answer");
        assert_eq!(out.to(), &peer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_restart_then_full_ladder_with_no_fourth_attempt() {
        let mut h = harness();
        let peer = bob();

        h.orchestrator.initiate(&peer).await.unwrap();
        assert_eq!(h.orchestrator.peer_tier(&peer), Some(AttemptTier::Initial));

        // First failure on attempt 1: soft restart, not a new connection.
        h.factory.fire_state(0, PeerSessionState::Failed);
        settle().await;
        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.factory.handle(0).offers.lock().clone(), vec![false, true]);

        // Restart does not resolve within the grace window: attempt 2.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.orchestrator.peer_tier(&peer), Some(AttemptTier::Retuned));
        assert!(h.factory.handle(0).closed.load(Ordering::SeqCst));

        // Attempt 2 fails: attempt 3, relay-only.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        h.factory.fire_state(1, PeerSessionState::Failed);
        settle().await;
        assert_eq!(h.factory.created(), 3);
        assert_eq!(
            h.orchestrator.peer_tier(&peer),
            Some(AttemptTier::RelayForced)
        );
        assert_eq!(
            h.factory.policies.lock().clone(),
            vec![
                TransportPolicy::All,
                TransportPolicy::All,
                TransportPolicy::Relay
            ]
        );

        // Attempt 3 fails: ladder exhausted, peer removed, no 4th attempt.
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        h.factory.fire_state(2, PeerSessionState::Failed);
        settle().await;
        assert_eq!(h.factory.created(), 3);
        assert_eq!(h.orchestrator.peer_count(), 0);

        let mut saw_error = false;
        while let Ok(event) = h.event_rx.try_recv() {
            if matches!(event, MeshEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalation_is_debounced() {
        let h = harness();
        let peer = bob();

        h.orchestrator.initiate(&peer).await.unwrap();

        // Walk to attempt 2 via the failed soft restart.
        h.factory.fire_state(0, PeerSessionState::Failed);
        settle().await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(h.orchestrator.peer_tier(&peer), Some(AttemptTier::Retuned));
        let created = h.factory.created();

        // A failure burst right after the escalation is absorbed.
        h.factory.fire_state(created - 1, PeerSessionState::Failed);
        settle().await;
        assert_eq!(h.factory.created(), created);
        assert_eq!(h.orchestrator.peer_tier(&peer), Some(AttemptTier::Retuned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_deadline_forces_escalation() {
        let h = harness();
        let peer = bob();

        h.orchestrator.initiate(&peer).await.unwrap();
        assert_eq!(h.factory.created(), 1);

        // No remote description within the tier-1 deadline.
        tokio::time::sleep(Duration::from_millis(5_500)).await;

        assert_eq!(h.factory.created(), 2);
        assert_eq!(h.orchestrator.peer_tier(&peer), Some(AttemptTier::Retuned));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_resets_the_ladder() {
        let h = harness();
        let peer = bob();

        h.orchestrator.initiate(&peer).await.unwrap();
        h.factory.fire_state(0, PeerSessionState::Failed);
        settle().await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(h.orchestrator.peer_tier(&peer), Some(AttemptTier::Retuned));

        h.factory.fire_state(1, PeerSessionState::Connected);
        settle().await;

        // Healthy again: a future disconnect starts from attempt 1.
        assert_eq!(h.orchestrator.peer_tier(&peer), Some(AttemptTier::Initial));
    }

    #[tokio::test]
    async fn test_remove_discards_queue_and_guards() {
        let h = harness();
        let peer = bob();

        h.orchestrator.initiate(&peer).await.unwrap();
        h.orchestrator
            .add_remote_candidate(&peer, candidate(1))
            .await
            .unwrap();

        h.orchestrator.remove(&peer).await;
        assert_eq!(h.orchestrator.peer_count(), 0);
        assert!(h.factory.handle(0).closed.load(Ordering::SeqCst));

        // Candidates for a removed peer are rejected, not queued.
        let err = h
            .orchestrator
            .add_remote_candidate(&peer, candidate(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
