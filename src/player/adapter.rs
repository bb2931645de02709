//! Player adapter abstraction.
//!
//! Every backend is reached through the same capability interface:
//! - `is_supported()` is checked before anything is loaded
//! - `attach()` binds a manifest to a media sink and yields a [`PlayerSession`]
//! - the session's event stream carries ready/error/timeline signals
//! - the session's control starts playback once ready

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::Url;

use super::types::{Backend, MediaSink, PlayerEvent, PlayerResult};
use crate::proxy::RequestOrigin;
use crate::request::CorrelationId;

/// What an adapter is asked to load
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Fully resolved manifest URI
    pub manifest: Url,
    /// Correlation id of the owning execution context
    pub correlation_id: CorrelationId,
    /// Display name of the test case, used for captions
    pub test_name: String,
}

impl LoadRequest {
    /// Origin to tag network requests made on behalf of this load
    pub fn origin(&self) -> RequestOrigin {
        RequestOrigin::explicit(self.correlation_id.clone())
    }
}

/// Stream of lifecycle events for one attached player
pub type PlayerEvents = BoxStream<'static, PlayerEvent>;

/// Playback control for one attached player
pub trait PlaybackControl: Send {
    /// Start playback. Resolves once playback has started or was rejected.
    fn play(&self) -> BoxFuture<'static, PlayerResult<()>>;

    /// Release backend resources. Called exactly once when the owning
    /// context finishes.
    fn detach(&self) {}
}

/// A player bound to a media sink
pub struct PlayerSession {
    pub events: PlayerEvents,
    pub control: Box<dyn PlaybackControl>,
}

/// Trait for player backends
///
/// Implementations:
/// - `HttpProbePlayer` loads manifests over the network proxy
/// - `ScriptedPlayer` replays scripted events for tests and demos
pub trait PlayerAdapter: Send + Sync {
    /// Which backend this adapter drives
    fn backend(&self) -> Backend;

    /// Capability check performed before load
    fn is_supported(&self) -> bool {
        true
    }

    /// Attach to `sink` and begin loading `request.manifest`
    fn attach(&self, sink: MediaSink, request: LoadRequest) -> PlayerResult<PlayerSession>;
}

/// Playback control for adapters whose play() always succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptPlay;

impl PlaybackControl for AcceptPlay {
    fn play(&self) -> BoxFuture<'static, PlayerResult<()>> {
        Box::pin(async { Ok(()) })
    }
}
