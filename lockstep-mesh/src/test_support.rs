//! Shared fakes for exercising the orchestrator and session manager
//! without networking

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use lockstep_core::{IceCandidate, Result, SdpKind, SessionDescription};

use crate::connection::{ConnectionFactory, ConnectionHandle, ConnectionHooks, PeerSessionState};
use crate::ice::{CredentialFetcher, RelayCredential, RtcIceConfig, TransportPolicy};
use crate::media::{LocalMedia, MediaError, MediaSource};

/// Always succeeds with a credential valid for an hour
pub struct TestFetcher;

#[async_trait]
impl CredentialFetcher for TestFetcher {
    async fn fetch(&self) -> anyhow::Result<RelayCredential> {
        Ok(RelayCredential {
            urls: vec!["turn:turn.example.com:3478".to_string()],
            username: "user".to_string(),
            password: "pass".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
    }
}

/// Scriptable in-memory connection
#[derive(Default)]
pub struct FakeHandle {
    pub stable: AtomicBool,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub candidates: Mutex<Vec<IceCandidate>>,
    /// ice_restart flag per created offer
    pub offers: Mutex<Vec<bool>>,
    pub closed: AtomicBool,
    pub media_attached: AtomicU32,
}

impl FakeHandle {
    #[must_use]
    pub fn new() -> Self {
        let handle = Self::default();
        handle.stable.store(true, Ordering::SeqCst);
        handle
    }
}

#[async_trait]
impl ConnectionHandle for FakeHandle {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.offers.lock().push(ice_restart);
        self.stable.store(false, Ordering::SeqCst);
        Ok(SessionDescription::offer("v=0\r\n"))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.stable.store(true, Ordering::SeqCst);
        Ok(SessionDescription::answer("v=0\r\n"))
    }

    async fn set_remote_description(&self, sdp: SessionDescription) -> Result<()> {
        self.stable
            .store(sdp.kind == SdpKind::Answer, Ordering::SeqCst);
        self.remote_descriptions.lock().push(sdp);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn add_local_media(&self, _media: &LocalMedia) -> Result<()> {
        self.media_attached.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn signaling_stable(&self) -> bool {
        self.stable.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Records every created connection, its hooks and its transport policy
#[derive(Default)]
pub struct FakeFactory {
    pub handles: Mutex<Vec<Arc<FakeHandle>>>,
    pub hooks: Mutex<Vec<ConnectionHooks>>,
    pub policies: Mutex<Vec<TransportPolicy>>,
}

impl FakeFactory {
    #[must_use]
    pub fn handle(&self, index: usize) -> Arc<FakeHandle> {
        self.handles.lock()[index].clone()
    }

    pub fn fire_state(&self, index: usize, state: PeerSessionState) {
        let hooks = self.hooks.lock()[index].clone();
        (hooks.on_state_change)(state);
    }

    #[must_use]
    pub fn created(&self) -> usize {
        self.handles.lock().len()
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    async fn create(
        &self,
        config: RtcIceConfig,
        hooks: ConnectionHooks,
    ) -> Result<Arc<dyn ConnectionHandle>> {
        let handle = Arc::new(FakeHandle::new());
        self.handles.lock().push(handle.clone());
        self.hooks.lock().push(hooks);
        self.policies.lock().push(config.policy);
        Ok(handle)
    }
}

/// Media source with a scripted outcome and an acquisition counter
pub struct FakeMediaSource {
    pub acquisitions: AtomicU32,
    pub fail: bool,
    /// Optional artificial latency so tests can race concurrent callers
    pub delay_ms: u64,
}

impl FakeMediaSource {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            acquisitions: AtomicU32::new(0),
            fail: false,
            delay_ms: 0,
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            acquisitions: AtomicU32::new(0),
            fail: true,
            delay_ms: 0,
        }
    }

    #[must_use]
    pub fn slow(delay_ms: u64) -> Self {
        Self {
            acquisitions: AtomicU32::new(0),
            fail: false,
            delay_ms,
        }
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(
        &self,
        _modality: lockstep_core::Modality,
    ) -> std::result::Result<Arc<LocalMedia>, MediaError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail {
            return Err(MediaError::PermissionDenied(
                "microphone access denied".to_string(),
            ));
        }
        Ok(Arc::new(LocalMedia::new(None, None)))
    }
}
