//! Media handles exchanged with the capture and rendering collaborators.
//!
//! The session manager never produces samples itself. A [`MediaSource`]
//! hands it tracks to send, and every established session hands back a
//! [`RemoteMedia`] for the renderer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// Which camera to capture from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    User,
    Environment,
}

impl fmt::Display for FacingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FacingMode::User => write!(f, "user"),
            FacingMode::Environment => write!(f, "environment"),
        }
    }
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            FacingMode::User => FacingMode::Environment,
            FacingMode::Environment => FacingMode::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    /// `None` captures no video.
    pub video: Option<FacingMode>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(FacingMode::User),
        }
    }
}

/// Outgoing tracks. Owned by the capture side and shared read-only by every
/// peer session.
#[derive(Clone, Default)]
pub struct LocalMedia {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalMedia {
    pub fn new(
        audio: Option<Arc<TrackLocalStaticSample>>,
        video: Option<Arc<TrackLocalStaticSample>>,
    ) -> Self {
        Self { audio, video }
    }

    /// Opus and VP8 tracks with the given stream id, for a capture pipeline
    /// to write samples into.
    pub fn with_tracks(stream_id: &str, constraints: &MediaConstraints) -> Self {
        let audio = constraints.audio.then(|| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    ..Default::default()
                },
                "audio".to_owned(),
                stream_id.to_owned(),
            ))
        });
        let video = constraints.video.map(|facing| {
            Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    ..Default::default()
                },
                format!("video-{}", facing),
                stream_id.to_owned(),
            ))
        });
        Self::new(audio, video)
    }

    pub fn track(&self, kind: MediaKind) -> Option<Arc<TrackLocalStaticSample>> {
        match kind {
            MediaKind::Audio => self.audio.clone(),
            MediaKind::Video => self.video.clone(),
        }
    }

    pub fn tracks(&self) -> Vec<(MediaKind, Arc<TrackLocalStaticSample>)> {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .filter_map(|kind| self.track(kind).map(|track| (kind, track)))
            .collect()
    }
}

impl fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalMedia")
            .field("audio", &self.audio.as_ref().map(|t| t.id().to_owned()))
            .field("video", &self.video.as_ref().map(|t| t.id().to_owned()))
            .finish()
    }
}

/// Capture collaborator.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia>;
}

/// Produces tracks that nobody writes to. Peers see a connected but silent
/// participant; used by headless clients.
#[derive(Debug, Clone)]
pub struct SilentSource {
    stream_id: String,
}

impl SilentSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl MediaSource for SilentSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia> {
        if !constraints.audio && constraints.video.is_none() {
            return Err(Error::MediaUnavailable(
                "neither audio nor video was requested".to_string(),
            ));
        }
        Ok(LocalMedia::with_tracks(&self.stream_id, constraints))
    }
}

/// The remote side's stream. Tracks are attached as they arrive, so a
/// handle given to the renderer early still sees later tracks.
#[derive(Clone)]
pub struct RemoteMedia {
    stream_id: String,
    tracks: Arc<Mutex<Vec<Arc<TrackRemote>>>>,
    released: Arc<AtomicBool>,
}

impl RemoteMedia {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: Arc::new(Mutex::new(Vec::new())),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Tracks arriving after [`RemoteMedia::release`] are dropped.
    pub fn add_track(&self, track: Arc<TrackRemote>) {
        if !self.is_released() {
            self.tracks.lock().push(track);
        }
    }

    pub fn tracks(&self) -> Vec<Arc<TrackRemote>> {
        self.tracks.lock().clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    /// Drops every remote track held by this handle and its clones.
    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        self.tracks.lock().clear();
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for RemoteMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteMedia")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.track_count())
            .finish()
    }
}
