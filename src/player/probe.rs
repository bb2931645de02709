//! Player that checks a manifest is reachable and well-formed.
//!
//! The probe fetches the playlist and the first resource it references through
//! the network proxy. It decodes nothing: once both fetches succeed it paints a
//! test card into the sink and reports ready. Failures are reported the way the
//! real backend would surface them.

use futures::StreamExt;
use futures::stream;
use reqwest::Url;
use serde_json::json;
use tracing::debug;

use super::adapter::{AcceptPlay, LoadRequest, PlayerAdapter, PlayerSession};
use super::frame::{FrameBuffer, TEST_CARD_HEIGHT, TEST_CARD_WIDTH};
use super::types::{Backend, MediaSink, PlayerEvent, PlayerResult};
use crate::proxy::{NetworkProxy, ProxyResponse, RequestOrigin};

/// First line of every HLS playlist
const PLAYLIST_TAG: &str = "#EXTM3U";

/// Which fetch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Manifest,
    Resource,
}

/// Probe-based adapter for one backend
#[derive(Debug, Clone)]
pub struct HttpProbePlayer {
    backend: Backend,
    proxy: NetworkProxy,
}

impl HttpProbePlayer {
    pub fn new(backend: Backend, proxy: NetworkProxy) -> Self {
        Self { backend, proxy }
    }
}

impl PlayerAdapter for HttpProbePlayer {
    fn backend(&self) -> Backend {
        self.backend
    }

    fn attach(&self, sink: MediaSink, request: LoadRequest) -> PlayerResult<PlayerSession> {
        let probe = probe(self.backend, self.proxy.clone(), sink, request);
        let events = stream::once(probe).flat_map(stream::iter);
        Ok(PlayerSession {
            events: Box::pin(events),
            control: Box::new(AcceptPlay),
        })
    }
}

async fn probe(
    backend: Backend,
    proxy: NetworkProxy,
    sink: MediaSink,
    request: LoadRequest,
) -> Vec<PlayerEvent> {
    let origin = request.origin();
    let mut events = Vec::new();

    let manifest = match fetch(&proxy, &request.manifest, &origin).await {
        Ok(response) => response,
        Err(detail) => {
            events.push(load_error(backend, Stage::Manifest, 1001, &detail));
            return events;
        }
    };

    let text = manifest.text();
    if !text.trim_start_matches('\u{feff}').starts_with(PLAYLIST_TAG) {
        events.push(load_error(
            backend,
            Stage::Manifest,
            4000,
            "response is not an HLS playlist",
        ));
        return events;
    }
    events.push(PlayerEvent::timeline(
        "manifestLoaded",
        json!({ "url": manifest.url.as_str(), "bytes": manifest.body.len() }),
    ));

    if let Some(uri) = first_uri(&text) {
        let resource = match manifest.url.join(uri) {
            Ok(url) => url,
            Err(e) => {
                events.push(load_error(backend, Stage::Resource, 1000, &e.to_string()));
                return events;
            }
        };
        match fetch(&proxy, &resource, &origin).await {
            Ok(response) => events.push(PlayerEvent::timeline(
                "resourceLoaded",
                json!({ "url": response.url.as_str(), "status": response.status }),
            )),
            Err(detail) => {
                events.push(load_error(backend, Stage::Resource, 1001, &detail));
                return events;
            }
        }
    } else {
        debug!(manifest = %request.manifest, "playlist references no resources");
    }

    sink.present(FrameBuffer::test_card(
        TEST_CARD_WIDTH,
        TEST_CARD_HEIGHT,
        &request.test_name,
    ));
    events.push(PlayerEvent::Ready);
    events
}

async fn fetch(proxy: &NetworkProxy, url: &Url, origin: &RequestOrigin) -> Result<ProxyResponse, String> {
    proxy
        .fetch(url, origin)
        .await
        .and_then(ProxyResponse::error_for_status)
        .map_err(|e| e.to_string())
}

/// First URI line of a playlist: a media segment or a variant stream
fn first_uri(playlist: &str) -> Option<&str> {
    playlist
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
}

fn load_error(backend: Backend, stage: Stage, shaka_code: u16, detail: &str) -> PlayerEvent {
    match backend {
        Backend::Native => {
            let (code, name) = match stage {
                Stage::Manifest => (4, "MEDIA_ERR_SRC_NOT_SUPPORTED"),
                Stage::Resource => (2, "MEDIA_ERR_NETWORK"),
            };
            PlayerEvent::MediaError {
                code,
                message: format!("{}: {}", name, detail),
            }
        }
        Backend::HlsJs => PlayerEvent::Fatal {
            kind: "networkError".to_string(),
            details: match stage {
                Stage::Manifest => "manifestLoadError".to_string(),
                Stage::Resource => "fragLoadError".to_string(),
            },
        },
        Backend::Shaka => PlayerEvent::Fatal {
            kind: match stage {
                Stage::Manifest if shaka_code >= 4000 => "MANIFEST".to_string(),
                _ => "NETWORK".to_string(),
            },
            details: format!("Shaka error {} ({})", shaka_code, detail),
        },
    }
}
