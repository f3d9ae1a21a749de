//! Local media acquisition
//!
//! Capture itself (microphone/camera pipelines) belongs to the platform
//! collaborator; this module owns the track handles and the enabled flags
//! the capture side consults. Toggling a flag never triggers renegotiation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use lockstep_core::Modality;

/// Acquisition failure, cloneable so concurrent callers can share one result
#[derive(Debug, Clone, thiserror::Error)]
pub enum MediaError {
    /// The user denied microphone/camera access
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// No usable capture device
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

/// Handle to acquired local media
///
/// Created once per enabled session and memoized; `disable()` drops it.
pub struct LocalMedia {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
}

impl LocalMedia {
    #[must_use]
    pub fn new(
        audio: Option<Arc<TrackLocalStaticSample>>,
        video: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self {
            audio,
            video,
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
        }
    }

    /// Local tracks to attach to a peer connection
    #[must_use]
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if let Some(audio) = &self.audio {
            tracks.push(audio.clone());
        }
        if let Some(video) = &self.video {
            tracks.push(video.clone());
        }
        tracks
    }

    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Acquire)
    }

    /// Flip the audio flag; the capture pipeline stops feeding samples when
    /// cleared. Returns the new value.
    pub fn toggle_audio(&self) -> bool {
        !self.audio_enabled.fetch_xor(true, Ordering::AcqRel)
    }

    /// Flip the video flag. Returns the new value.
    pub fn toggle_video(&self) -> bool {
        !self.video_enabled.fetch_xor(true, Ordering::AcqRel)
    }

    /// Silence both flags on teardown so a capture pipeline holding a stale
    /// reference stops writing immediately
    pub fn stop(&self) {
        self.audio_enabled.store(false, Ordering::Release);
        self.video_enabled.store(false, Ordering::Release);
    }
}

/// Source of local media, one acquisition per enabled session
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, modality: Modality) -> Result<Arc<LocalMedia>, MediaError>;
}

/// Default source backed by sample-fed static tracks
///
/// The capture collaborator writes samples into the returned tracks; this
/// source only allocates them with the right codec capabilities.
pub struct SampleMediaSource;

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self, modality: Modality) -> Result<Arc<LocalMedia>, MediaError> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                ..Default::default()
            },
            "audio".to_string(),
            "lockstep".to_string(),
        ));

        let video = match modality {
            Modality::Voice => None,
            Modality::Video => Some(Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_string(),
                    ..Default::default()
                },
                "video".to_string(),
                "lockstep".to_string(),
            ))),
        };

        Ok(Arc::new(LocalMedia::new(Some(audio), video)))
    }
}
