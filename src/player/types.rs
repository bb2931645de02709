// Core types shared by player adapters

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::frame::FrameBuffer;

/// Playback engines a pair can run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Backend {
    /// The platform's own media element
    #[serde(rename = "native")]
    Native,

    /// hls.js attached through Media Source Extensions
    #[serde(rename = "hls.js")]
    HlsJs,

    /// Shaka Player
    #[serde(rename = "shaka-player")]
    Shaka,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::Native, Backend::HlsJs, Backend::Shaka];

    /// Stable identifier used in correlation ids, config and the CLI
    pub fn id(&self) -> &'static str {
        match self {
            Backend::Native => "native",
            Backend::HlsJs => "hls.js",
            Backend::Shaka => "shaka-player",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Backend::Native => "Native",
            Backend::HlsJs => "HLS.js",
            Backend::Shaka => "Shaka Player",
        }
    }

    /// Failure reason reported when the adapter's capability check fails
    pub fn unsupported_reason(&self) -> String {
        format!("{} not supported", self.display_name())
    }

    /// Failure reason reported for an error on the adapter's own channel
    pub fn fatal_reason(&self) -> &'static str {
        match self {
            Backend::Native => "Player error",
            Backend::HlsJs => "HLS.js fatal error",
            Backend::Shaka => "Shaka Player error",
        }
    }

    /// Log line for an error on the adapter's own channel
    pub fn fatal_log(&self, kind: &str, details: &str) -> String {
        match self {
            Backend::Native => format!("Player Error: {} - {}", kind, details),
            Backend::HlsJs => format!("HLS.js Error: {} - {}", kind, details),
            Backend::Shaka => format!("Shaka Player Error: {}", details),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Backend {
    type Err = PlayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "native" | "video" => Ok(Backend::Native),
            "hls.js" | "hlsjs" | "hls" => Ok(Backend::HlsJs),
            "shaka-player" | "shaka" => Ok(Backend::Shaka),
            other => Err(PlayerError::UnknownBackend(other.to_string())),
        }
    }
}

/// Normalized lifecycle events emitted by an attached player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    /// Enough data is buffered to start playback
    Ready,

    /// The media sink reported an error
    MediaError { code: u16, message: String },

    /// The adapter's own error channel reported a fatal error
    Fatal { kind: String, details: String },

    /// Fine-grained internal event, captured into the timeline
    Timeline {
        kind: String,
        data: serde_json::Value,
    },
}

impl PlayerEvent {
    pub fn timeline(kind: impl Into<String>, data: serde_json::Value) -> Self {
        PlayerEvent::Timeline {
            kind: kind.into(),
            data,
        }
    }

    /// Name used when the event is recorded in a timeline
    pub fn kind(&self) -> &str {
        match self {
            PlayerEvent::Ready => "canplay",
            PlayerEvent::MediaError { .. } => "error",
            PlayerEvent::Fatal { .. } => "fatal",
            PlayerEvent::Timeline { kind, .. } => kind,
        }
    }
}

/// Result type for player operations
pub type PlayerResult<T> = Result<T, PlayerError>;

/// Error types for player operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlayerError {
    #[error("{} is not supported", .0.display_name())]
    Unsupported(Backend),

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("failed to attach player: {0}")]
    Attach(String),

    #[error("{0}")]
    PlayRejected(String),

    #[error("frame error: {0}")]
    Frame(String),
}

#[derive(Debug, Default)]
struct SinkState {
    frame: Option<FrameBuffer>,
    muted: bool,
    detached: bool,
}

/// The media element a player renders into.
///
/// Cloning yields another handle to the same sink.
#[derive(Debug, Clone)]
pub struct MediaSink {
    inner: Arc<Mutex<SinkState>>,
}

impl MediaSink {
    /// Create a fresh, muted sink with no frame
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkState {
                muted: true,
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Show a decoded frame. Ignored once the sink is detached.
    pub fn present(&self, frame: FrameBuffer) {
        let mut state = self.state();
        if !state.detached {
            state.frame = Some(frame);
        }
    }

    /// Intrinsic size of the current frame, `(0, 0)` before the first frame
    pub fn dimensions(&self) -> (u32, u32) {
        self.state()
            .frame
            .as_ref()
            .map(|f| (f.width(), f.height()))
            .unwrap_or((0, 0))
    }

    pub fn is_muted(&self) -> bool {
        self.state().muted
    }

    /// Encode the current frame as PNG
    pub fn capture_png(&self) -> PlayerResult<Vec<u8>> {
        let state = self.state();
        let frame = state
            .frame
            .as_ref()
            .ok_or_else(|| PlayerError::Frame("no frame has been presented".to_string()))?;
        frame.to_png()
    }

    /// Release the sink; later frames are dropped
    pub fn detach(&self) {
        let mut state = self.state();
        state.detached = true;
        state.frame = None;
    }

    pub fn is_detached(&self) -> bool {
        self.state().detached
    }
}

impl Default for MediaSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_ids_round_trip_through_from_str() {
        for backend in Backend::ALL {
            assert_eq!(backend.id().parse::<Backend>().unwrap(), backend);
        }
        assert_eq!("shaka".parse::<Backend>().unwrap(), Backend::Shaka);
        assert!(matches!(
            "flash".parse::<Backend>(),
            Err(PlayerError::UnknownBackend(_))
        ));
    }

    #[test]
    fn test_backend_reasons() {
        assert_eq!(Backend::HlsJs.unsupported_reason(), "HLS.js not supported");
        assert_eq!(Backend::Shaka.fatal_reason(), "Shaka Player error");
        assert_eq!(
            Backend::HlsJs.fatal_log("networkError", "manifestLoadError"),
            "HLS.js Error: networkError - manifestLoadError"
        );
    }

    #[test]
    fn test_backend_serializes_as_id() {
        assert_eq!(
            serde_json::to_string(&Backend::Shaka).unwrap(),
            "\"shaka-player\""
        );
    }

    #[test]
    fn test_sink_dimensions_follow_frames() {
        let sink = MediaSink::new();
        assert!(sink.is_muted());
        assert_eq!(sink.dimensions(), (0, 0));
        assert!(sink.capture_png().is_err());

        sink.present(FrameBuffer::new(64, 36));
        assert_eq!(sink.dimensions(), (64, 36));
        assert!(sink.capture_png().is_ok());

        sink.detach();
        sink.present(FrameBuffer::new(64, 36));
        assert_eq!(sink.dimensions(), (0, 0));
        assert!(sink.is_detached());
    }
}
