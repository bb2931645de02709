//! Execution context: runs one (test case, backend) pair end to end.
//!
//! A context moves `Pending -> Running -> Finished` exactly once. While
//! running it listens to the player's events and to the network requests
//! attributed to its correlation id, bounded by a deadline. Whatever ends the
//! run, the context releases its listeners, tears down the sink and publishes
//! a single record on the bus.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Sleep;
use tracing::{debug, info, instrument, warn};

use crate::bus::{BusResult, Delivery, MessageBus, NetworkSubscription};
use crate::config::RunnerConfig;
use crate::player::{
    Backend, LoadRequest, MediaSink, PlaybackControl, PlayerAdapter, PlayerError, PlayerEvent,
    PlayerEvents, PlayerResult,
};
use crate::record::{FailureKind, RawOutcome, ResultRecord, Status, TimelineEvent};
use crate::request::ExecutionRequest;

/// Timing for one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSettings {
    /// Deadline for the whole pair
    pub timeout: Duration,
    /// Playback time after a successful play() before the pair passes
    pub grace: Duration,
}

impl From<&RunnerConfig> for ContextSettings {
    fn from(config: &RunnerConfig) -> Self {
        Self {
            timeout: config.timeout,
            grace: config.grace,
        }
    }
}

/// Lifecycle of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContextState {
    Pending,
    Running,
    Finished,
}

/// Everything a context listens to. Dropping it detaches the player.
struct ListenerSet {
    events: PlayerEvents,
    control: Box<dyn PlaybackControl>,
    network: NetworkSubscription,
    events_open: bool,
    network_open: bool,
}

impl Drop for ListenerSet {
    fn drop(&mut self) {
        self.control.detach();
    }
}

/// Where the happy path has got to
enum Phase {
    Loading,
    Starting(BoxFuture<'static, PlayerResult<()>>),
    Settling(Pin<Box<Sleep>>),
}

enum Progress {
    Played(PlayerResult<()>),
    Settled,
}

/// Resolves when the current phase completes; never for `Loading`.
async fn advance(phase: &mut Phase) -> Progress {
    match phase {
        Phase::Loading => std::future::pending().await,
        Phase::Starting(play) => Progress::Played(play.await),
        Phase::Settling(grace) => {
            grace.await;
            Progress::Settled
        }
    }
}

/// One isolated run of one pair
pub struct ExecutionContext {
    request: ExecutionRequest,
    adapter: Option<Arc<dyn PlayerAdapter>>,
    bus: Arc<MessageBus>,
    settings: ContextSettings,
    state: ContextState,
    logs: Vec<String>,
    timeline: Vec<TimelineEvent>,
    network: Vec<String>,
}

impl ExecutionContext {
    /// A context for `request`. Without an adapter the backend counts as unsupported.
    pub fn new(
        request: ExecutionRequest,
        adapter: Option<Arc<dyn PlayerAdapter>>,
        bus: Arc<MessageBus>,
        settings: ContextSettings,
    ) -> Self {
        Self {
            request,
            adapter,
            bus,
            settings,
            state: ContextState::Pending,
            logs: Vec::new(),
            timeline: Vec::new(),
            network: Vec::new(),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    fn enter(&mut self, next: ContextState) {
        if next > self.state {
            self.state = next;
        }
    }

    fn log(&mut self, line: impl Into<String>) {
        if self.state != ContextState::Finished {
            self.logs.push(line.into());
        }
    }

    fn capture(&mut self, event: &PlayerEvent) {
        if self.state == ContextState::Finished {
            return;
        }
        let data = match event {
            PlayerEvent::Ready => serde_json::Value::Null,
            PlayerEvent::MediaError { code, message } => {
                serde_json::json!({ "code": code, "message": message })
            }
            PlayerEvent::Fatal { kind, details } => {
                serde_json::json!({ "type": kind, "details": details })
            }
            PlayerEvent::Timeline { data, .. } => data.clone(),
        };
        self.timeline.push(TimelineEvent::now(event.kind(), data));
    }

    /// Run to completion, publish the record and return it
    #[instrument(
        name = "context",
        skip(self),
        fields(correlation_id = %self.request.correlation_id, pair = %self.request.pair())
    )]
    pub async fn run(mut self) -> ResultRecord {
        let sink = MediaSink::new();
        let raw = self.drive(&sink).await;
        self.enter(ContextState::Finished);

        let screenshot = match raw.status {
            Status::Pass => self.screenshot(&sink),
            Status::Fail => None,
        };
        sink.detach();

        let mut record = ResultRecord::from_outcome(raw);
        record.logs = std::mem::take(&mut self.logs);
        record.timeline_events = std::mem::take(&mut self.timeline);
        record.network_requests = std::mem::take(&mut self.network);
        record.screenshot = screenshot;
        let record = record.apply_expectation(self.request.test_case.expected);

        info!(
            status = %record.status,
            reason = record.reason.as_deref().unwrap_or(""),
            "pair finished"
        );
        if let Err(e) = self.bus.deliver(
            self.request.correlation_id.clone(),
            self.request.test_index,
            record.clone(),
        ) {
            warn!(error = %e, "result not published");
        }
        record
    }

    async fn drive(&mut self, sink: &MediaSink) -> RawOutcome {
        let backend = self.request.backend;
        let adapter = self.adapter.clone().filter(|adapter| adapter.is_supported());
        let Some(adapter) = adapter else {
            return self.unsupported(backend);
        };
        self.enter(ContextState::Running);

        let network = self.bus.subscribe_network(self.request.correlation_id.clone());
        let load = LoadRequest {
            manifest: self.request.manifest.clone(),
            correlation_id: self.request.correlation_id.clone(),
            test_name: self.request.test_case.name.clone(),
        };
        self.log(format!("Loading {} with {}", load.manifest, backend.display_name()));

        let session = match adapter.attach(sink.clone(), load) {
            Ok(session) => session,
            Err(PlayerError::Unsupported(_)) => return self.unsupported(backend),
            Err(e) => {
                self.log(format!("Player Error: {}", e));
                return RawOutcome::failed(FailureKind::PlaybackError, backend.fatal_reason());
            }
        };
        let mut listeners = ListenerSet {
            events: session.events,
            control: session.control,
            network,
            events_open: true,
            network_open: true,
        };

        let outcome = self.listen(&mut listeners, backend).await;
        self.network
            .extend(listeners.network.drain().into_iter().map(|r| r.url));
        drop(listeners);
        outcome
    }

    async fn listen(&mut self, listeners: &mut ListenerSet, backend: Backend) -> RawOutcome {
        let deadline = tokio::time::sleep(self.settings.timeout);
        let mut deadline = std::pin::pin!(deadline);
        let mut phase = Phase::Loading;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("deadline expired");
                    return RawOutcome::failed(FailureKind::Timeout, "Timed out");
                }
                progress = advance(&mut phase) => match progress {
                    Progress::Played(Ok(())) => {
                        self.log("Playback started");
                        phase = Phase::Settling(Box::pin(tokio::time::sleep(self.settings.grace)));
                    }
                    Progress::Played(Err(e)) => {
                        self.log(format!("Play promise rejected: {}", e));
                        return RawOutcome::failed(FailureKind::PlaybackError, "Could not play");
                    }
                    Progress::Settled => return RawOutcome::passed(),
                },
                event = listeners.events.next(), if listeners.events_open => {
                    let Some(event) = event else {
                        debug!("player event stream ended");
                        listeners.events_open = false;
                        continue;
                    };
                    self.capture(&event);
                    match event {
                        PlayerEvent::Ready => {
                            if matches!(phase, Phase::Loading) {
                                self.log("Ready to play");
                                phase = Phase::Starting(listeners.control.play());
                            }
                        }
                        PlayerEvent::MediaError { code, message } => {
                            self.log(format!("Video Error: code {}, message: {}", code, message));
                            return RawOutcome::failed(FailureKind::PlaybackError, "Player error");
                        }
                        PlayerEvent::Fatal { kind, details } => {
                            self.log(backend.fatal_log(&kind, &details));
                            return RawOutcome::failed(FailureKind::PlaybackError, backend.fatal_reason());
                        }
                        PlayerEvent::Timeline { .. } => {}
                    }
                }
                request = listeners.network.recv(), if listeners.network_open => match request {
                    Some(request) => self.network.push(request.url),
                    None => listeners.network_open = false,
                },
            }
        }
    }

    fn unsupported(&mut self, backend: Backend) -> RawOutcome {
        self.log(format!("{} is not supported", backend.display_name()));
        RawOutcome::failed(FailureKind::UnsupportedBackend, backend.unsupported_reason())
    }

    fn screenshot(&mut self, sink: &MediaSink) -> Option<String> {
        let (width, height) = sink.dimensions();
        if width == 0 || height == 0 {
            return None;
        }
        match sink.capture_png() {
            Ok(png) => Some(format!("data:image/png;base64,{}", BASE64.encode(png))),
            Err(e) => {
                // Listeners are gone by now; write to the buffer directly.
                self.logs.push(format!("Could not generate screenshot: {}", e));
                None
            }
        }
    }
}

/// A context that has been handed to the scheduler
pub type ContextFuture = BoxFuture<'static, Completion>;

/// A finished context together with the result the bus delivered for it
#[derive(Debug)]
pub struct Completion {
    pub request: ExecutionRequest,
    pub outcome: BusResult<Delivery>,
}

/// Turns requests into running contexts
pub trait Launch {
    fn launch(&self, request: ExecutionRequest) -> ContextFuture;
}

/// Launches contexts on the registered adapters
pub struct Launcher {
    adapters: BTreeMap<Backend, Arc<dyn PlayerAdapter>>,
    bus: Arc<MessageBus>,
    settings: ContextSettings,
}

impl Launcher {
    pub fn new(bus: Arc<MessageBus>, settings: ContextSettings) -> Self {
        Self {
            adapters: BTreeMap::new(),
            bus,
            settings,
        }
    }

    /// Register `adapter` for its backend, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn PlayerAdapter>) {
        self.adapters.insert(adapter.backend(), adapter);
    }

    pub fn adapter(&self, backend: Backend) -> Option<&Arc<dyn PlayerAdapter>> {
        self.adapters.get(&backend)
    }

    pub fn settings(&self) -> ContextSettings {
        self.settings
    }
}

impl Launch for Launcher {
    fn launch(&self, request: ExecutionRequest) -> ContextFuture {
        let waiter = self.bus.expect(request.correlation_id.clone());
        let context = ExecutionContext::new(
            request.clone(),
            self.adapters.get(&request.backend).cloned(),
            Arc::clone(&self.bus),
            self.settings,
        );
        Box::pin(async move {
            context.run().await;
            Completion {
                request,
                outcome: waiter.wait().await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{TestCase, TestIndex};
    use crate::player::{ScriptStep, ScriptedPlayer};
    use crate::proxy::NetworkProxy;
    use crate::request::CorrelationId;
    use pretty_assertions::assert_eq;
    use reqwest::Url;

    fn settings() -> ContextSettings {
        ContextSettings {
            timeout: Duration::from_millis(200),
            grace: Duration::from_millis(10),
        }
    }

    fn request(case: TestCase, backend: Backend) -> ExecutionRequest {
        let manifest = Url::parse("http://localhost:8000/")
            .unwrap()
            .join(&case.manifest_uri)
            .unwrap();
        ExecutionRequest {
            test_case: Arc::new(case),
            test_index: TestIndex(0),
            backend,
            correlation_id: CorrelationId::from("0-native-1"),
            manifest,
        }
    }

    async fn run(player: ScriptedPlayer, case: TestCase) -> ResultRecord {
        let bus = Arc::new(MessageBus::new());
        let backend = player.backend();
        let context = ExecutionContext::new(
            request(case, backend),
            Some(Arc::new(player) as Arc<dyn PlayerAdapter>),
            bus,
            settings(),
        );
        context.run().await
    }

    #[tokio::test]
    async fn test_ready_then_play_passes_with_screenshot() {
        let record = run(ScriptedPlayer::new(Backend::Native), TestCase::new("A", "ok.m3u8")).await;
        assert_eq!(record.status, Status::Pass);
        assert_eq!(record.reason, None);
        assert!(record.screenshot.unwrap().starts_with("data:image/png;base64,"));
        assert_eq!(
            record.logs,
            vec![
                "Loading http://localhost:8000/ok.m3u8 with Native".to_string(),
                "Ready to play".to_string(),
                "Playback started".to_string(),
            ]
        );
        assert_eq!(record.timeline_events[0].kind, "canplay");
    }

    #[tokio::test]
    async fn test_media_error_fails() {
        let player = ScriptedPlayer::new(Backend::Native).default_script(ScriptStep::media_error());
        let record = run(player, TestCase::new("B", "missing.m3u8")).await;
        assert_eq!(record.status, Status::Fail);
        assert_eq!(record.reason.as_deref(), Some("Player error"));
        assert_eq!(record.classification, Some(FailureKind::PlaybackError));
        assert!(record.screenshot.is_none());
    }

    #[tokio::test]
    async fn test_fatal_reason_is_backend_specific() {
        let player = ScriptedPlayer::new(Backend::HlsJs).default_script(ScriptStep::fatal("manifestLoadError"));
        let record = run(player, TestCase::new("B", "missing.m3u8")).await;
        assert_eq!(record.reason.as_deref(), Some("HLS.js fatal error"));
        assert!(record
            .logs
            .contains(&"HLS.js Error: networkError - manifestLoadError".to_string()));
    }

    #[tokio::test]
    async fn test_silent_player_times_out() {
        let player = ScriptedPlayer::new(Backend::Shaka).default_script(ScriptStep::silent());
        let gauge = player.gauge();
        let record = run(player, TestCase::new("C", "slow.m3u8")).await;
        assert_eq!(record.status, Status::Fail);
        assert_eq!(record.reason.as_deref(), Some("Timed out"));
        assert_eq!(record.classification, Some(FailureKind::Timeout));
        assert_eq!(gauge.live(), 0);
    }

    #[tokio::test]
    async fn test_rejected_play_could_not_play() {
        let player = ScriptedPlayer::new(Backend::Native).reject_play("NotAllowedError");
        let record = run(player, TestCase::new("A", "ok.m3u8")).await;
        assert_eq!(record.reason.as_deref(), Some("Could not play"));
        assert!(record
            .logs
            .contains(&"Play promise rejected: NotAllowedError".to_string()));
    }

    #[tokio::test]
    async fn test_error_during_grace_fails() {
        let player = ScriptedPlayer::new(Backend::Native).default_script(vec![
            ScriptStep::Emit(PlayerEvent::Ready),
            ScriptStep::Wait(Duration::from_millis(1)),
            ScriptStep::Emit(PlayerEvent::MediaError {
                code: 3,
                message: "MEDIA_ERR_DECODE".to_string(),
            }),
        ]);
        let case = TestCase::new("A", "ok.m3u8");
        let bus = Arc::new(MessageBus::new());
        let context = ExecutionContext::new(
            request(case, Backend::Native),
            Some(Arc::new(player) as Arc<dyn PlayerAdapter>),
            bus,
            ContextSettings {
                timeout: Duration::from_millis(500),
                grace: Duration::from_millis(100),
            },
        );
        let record = context.run().await;
        assert_eq!(record.reason.as_deref(), Some("Player error"));
    }

    #[tokio::test]
    async fn test_unsupported_backend() {
        let player = ScriptedPlayer::new(Backend::Shaka).unsupported();
        let gauge = player.gauge();
        let record = run(player, TestCase::new("A", "ok.m3u8")).await;
        assert_eq!(record.reason.as_deref(), Some("Shaka Player not supported"));
        assert_eq!(record.classification, Some(FailureKind::UnsupportedBackend));
        assert_eq!(gauge.attached(), 0);
    }

    #[tokio::test]
    async fn test_expected_failure_is_inverted() {
        let player = ScriptedPlayer::new(Backend::Native).default_script(ScriptStep::media_error());
        let record = run(player, TestCase::new("B", "missing.m3u8").expect_failure()).await;
        assert_eq!(record.status, Status::Pass);
        assert_eq!(
            record.reason.as_deref(),
            Some("Player failed as expected: Player error")
        );

        let record = run(
            ScriptedPlayer::new(Backend::Native),
            TestCase::new("B", "missing.m3u8").expect_failure(),
        )
        .await;
        assert_eq!(record.status, Status::Fail);
        assert_eq!(record.reason.as_deref(), Some("Unexpected pass"));
    }

    #[tokio::test]
    async fn test_network_requests_are_scoped_to_the_context() {
        let bus = Arc::new(MessageBus::new());
        let proxy = NetworkProxy::new(bus.clone());
        let player = ScriptedPlayer::new(Backend::Native)
            .with_proxy(proxy.clone())
            .default_script(vec![
                ScriptStep::Request("http://localhost:8000/ok.m3u8".to_string()),
                ScriptStep::Request("http://localhost:8000/seg0.ts".to_string()),
                ScriptStep::Present {
                    width: 8,
                    height: 8,
                },
                ScriptStep::Emit(PlayerEvent::Ready),
            ]);
        proxy.record(
            "http://localhost:8000/other.m3u8",
            &crate::proxy::RequestOrigin::explicit("someone-else".into()),
        );
        let context = ExecutionContext::new(
            request(TestCase::new("A", "ok.m3u8"), Backend::Native),
            Some(Arc::new(player) as Arc<dyn PlayerAdapter>),
            bus.clone(),
            settings(),
        );
        let record = context.run().await;
        assert_eq!(
            record.network_requests,
            vec![
                "http://localhost:8000/ok.m3u8".to_string(),
                "http://localhost:8000/seg0.ts".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_launcher_publishes_through_the_bus() {
        let bus = Arc::new(MessageBus::new());
        let mut launcher = Launcher::new(bus.clone(), settings());
        launcher.register(Arc::new(ScriptedPlayer::new(Backend::Native)));

        let completion = launcher
            .launch(request(TestCase::new("A", "ok.m3u8"), Backend::Native))
            .await;
        let delivery = completion.outcome.unwrap();
        assert_eq!(delivery.result.status, Status::Pass);
        assert_eq!(bus.stats().results_delivered, 1);

        let missing = launcher
            .launch(ExecutionRequest {
                correlation_id: "1-hls.js-1".into(),
                ..request(TestCase::new("A", "ok.m3u8"), Backend::HlsJs)
            })
            .await;
        assert_eq!(
            missing.outcome.unwrap().result.reason.as_deref(),
            Some("HLS.js not supported")
        );
    }
}
