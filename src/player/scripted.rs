//! Scripted player used in tests and demos.
//!
//! Each manifest maps to a script of timed steps. Manifests without a script
//! of their own use the default script. The player tracks how many sessions
//! are attached at once so callers can check concurrency limits.

use futures::future::BoxFuture;
use futures::stream;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::adapter::{LoadRequest, PlaybackControl, PlayerAdapter, PlayerSession};
use super::frame::FrameBuffer;
use super::types::{Backend, MediaSink, PlayerError, PlayerEvent, PlayerResult};
use crate::proxy::{NetworkProxy, RequestOrigin};

/// One step of a script
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Sleep before the next step
    Wait(Duration),

    /// Emit a lifecycle event
    Emit(PlayerEvent),

    /// Present a frame of the given size
    Present { width: u32, height: u32 },

    /// Report a network request for this URL through the proxy
    Request(String),
}

impl ScriptStep {
    /// Frame, then ready: the usual happy path
    pub fn plays() -> Vec<ScriptStep> {
        vec![
            ScriptStep::Present {
                width: 64,
                height: 36,
            },
            ScriptStep::Emit(PlayerEvent::Ready),
        ]
    }

    /// The media element rejects the source
    pub fn media_error() -> Vec<ScriptStep> {
        vec![ScriptStep::Emit(PlayerEvent::MediaError {
            code: 4,
            message: "MEDIA_ERR_SRC_NOT_SUPPORTED".to_string(),
        })]
    }

    /// The adapter reports a fatal error on its own channel
    pub fn fatal(details: &str) -> Vec<ScriptStep> {
        vec![ScriptStep::Emit(PlayerEvent::Fatal {
            kind: "networkError".to_string(),
            details: details.to_string(),
        })]
    }

    /// Nothing ever happens
    pub fn silent() -> Vec<ScriptStep> {
        Vec::new()
    }
}

/// Counts attached sessions
#[derive(Debug, Default)]
pub struct LiveGauge {
    live: AtomicUsize,
    peak: AtomicUsize,
    attached: AtomicUsize,
}

impl LiveGauge {
    fn enter(self: &Arc<Self>) -> LiveGuard {
        let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.attached.fetch_add(1, Ordering::SeqCst);
        LiveGuard {
            gauge: Arc::clone(self),
        }
    }

    /// Sessions attached right now
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Most sessions ever attached at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Sessions attached in total
    pub fn attached(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct LiveGuard {
    gauge: Arc<LiveGauge>,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.gauge.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Player that replays scripts instead of loading media
#[derive(Debug, Clone)]
pub struct ScriptedPlayer {
    backend: Backend,
    supported: bool,
    default_script: Vec<ScriptStep>,
    scripts: HashMap<String, Vec<ScriptStep>>,
    play_error: Option<String>,
    proxy: Option<NetworkProxy>,
    gauge: Arc<LiveGauge>,
}

impl ScriptedPlayer {
    /// A player for `backend` whose default script plays
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            supported: true,
            default_script: ScriptStep::plays(),
            scripts: HashMap::new(),
            play_error: None,
            proxy: None,
            gauge: Arc::new(LiveGauge::default()),
        }
    }

    /// Script for manifests without a script of their own
    pub fn default_script(mut self, steps: Vec<ScriptStep>) -> Self {
        self.default_script = steps;
        self
    }

    /// Script for manifests whose URI ends with `suffix`
    pub fn on_manifest(mut self, suffix: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        self.scripts.insert(suffix.into(), steps);
        self
    }

    /// Fail the capability check
    pub fn unsupported(mut self) -> Self {
        self.supported = false;
        self
    }

    /// Reject play() with `message`
    pub fn reject_play(mut self, message: impl Into<String>) -> Self {
        self.play_error = Some(message.into());
        self
    }

    /// Report `Request` steps through `proxy`
    pub fn with_proxy(mut self, proxy: NetworkProxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn gauge(&self) -> Arc<LiveGauge> {
        Arc::clone(&self.gauge)
    }

    fn script_for(&self, manifest: &str) -> Vec<ScriptStep> {
        self.scripts
            .iter()
            .filter(|(suffix, _)| manifest.ends_with(suffix.as_str()))
            .max_by_key(|(suffix, _)| suffix.len())
            .map(|(_, steps)| steps.clone())
            .unwrap_or_else(|| self.default_script.clone())
    }
}

struct ScriptState {
    steps: std::vec::IntoIter<ScriptStep>,
    sink: MediaSink,
    proxy: Option<NetworkProxy>,
    origin: RequestOrigin,
    _guard: LiveGuard,
}

impl PlayerAdapter for ScriptedPlayer {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn is_supported(&self) -> bool {
        self.supported
    }

    fn attach(&self, sink: MediaSink, request: LoadRequest) -> PlayerResult<PlayerSession> {
        let state = ScriptState {
            steps: self.script_for(request.manifest.as_str()).into_iter(),
            sink,
            proxy: self.proxy.clone(),
            origin: request.origin(),
            _guard: self.gauge.enter(),
        };

        let events = stream::unfold(state, |mut state| async move {
            while let Some(step) = state.steps.next() {
                match step {
                    ScriptStep::Wait(d) => tokio::time::sleep(d).await,
                    ScriptStep::Present { width, height } => {
                        state.sink.present(FrameBuffer::with_color(width, height, [0, 0, 255]));
                    }
                    ScriptStep::Request(url) => {
                        if let Some(proxy) = &state.proxy {
                            proxy.record(&url, &state.origin);
                        }
                    }
                    ScriptStep::Emit(event) => return Some((event, state)),
                }
            }
            None
        });

        Ok(PlayerSession {
            events: Box::pin(events),
            control: Box::new(ScriptedControl {
                play_error: self.play_error.clone(),
            }),
        })
    }
}

struct ScriptedControl {
    play_error: Option<String>,
}

impl PlaybackControl for ScriptedControl {
    fn play(&self) -> BoxFuture<'static, PlayerResult<()>> {
        let result = match &self.play_error {
            Some(message) => Err(PlayerError::PlayRejected(message.clone())),
            None => Ok(()),
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::CorrelationId;
    use futures::StreamExt;
    use reqwest::Url;

    fn load(manifest: &str) -> LoadRequest {
        LoadRequest {
            manifest: Url::parse(manifest).unwrap(),
            correlation_id: CorrelationId::from("test"),
            test_name: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_default_script_plays() {
        let player = ScriptedPlayer::new(Backend::Native);
        let sink = MediaSink::new();
        let mut session = player.attach(sink.clone(), load("http://x/a.m3u8")).unwrap();
        assert_eq!(session.events.next().await, Some(PlayerEvent::Ready));
        assert_eq!(sink.dimensions(), (64, 36));
        assert_eq!(session.events.next().await, None);
        assert!(session.control.play().await.is_ok());
    }

    #[tokio::test]
    async fn test_longest_matching_script_wins() {
        let player = ScriptedPlayer::new(Backend::HlsJs)
            .on_manifest(".m3u8", ScriptStep::plays())
            .on_manifest("missing.m3u8", ScriptStep::media_error());
        let mut session = player
            .attach(MediaSink::new(), load("http://x/missing.m3u8"))
            .unwrap();
        assert!(matches!(
            session.events.next().await,
            Some(PlayerEvent::MediaError { code: 4, .. })
        ));
    }

    #[tokio::test]
    async fn test_gauge_tracks_live_sessions() {
        let player = ScriptedPlayer::new(Backend::Native);
        let gauge = player.gauge();
        let a = player.attach(MediaSink::new(), load("http://x/a.m3u8")).unwrap();
        let b = player.attach(MediaSink::new(), load("http://x/b.m3u8")).unwrap();
        assert_eq!(gauge.live(), 2);
        drop(a);
        drop(b);
        assert_eq!(gauge.live(), 0);
        assert_eq!(gauge.peak(), 2);
        assert_eq!(gauge.attached(), 2);
    }

    #[tokio::test]
    async fn test_rejected_play() {
        let player = ScriptedPlayer::new(Backend::Native).reject_play("NotAllowedError");
        let session = player.attach(MediaSink::new(), load("http://x/a.m3u8")).unwrap();
        assert_eq!(
            session.control.play().await,
            Err(PlayerError::PlayRejected("NotAllowedError".to_string()))
        );
    }
}
