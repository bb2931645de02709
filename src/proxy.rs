//! Network proxy for fetches made while a pair runs.
//!
//! Every fetch is republished on the bus as a `network_request` tagged with
//! the correlation id of the context that made it. Adapters pass that id
//! explicitly; when they cannot, it is inferred from the `testId` query
//! parameter of the referring document. Inference is best-effort: an
//! unattributed request is still published, it just shows up in no context's
//! network tab.
//!
//! Playlist responses are re-served with the HLS content type regardless of
//! what the origin sent.

use chrono::Utc;
use reqwest::Url;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::bus::{MessageBus, NetworkRequest};
use crate::config::MANIFEST_EXTENSION;
use crate::request::CorrelationId;

/// Content type served for HLS playlists
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Query parameter carrying the correlation id in referrer URLs
pub const TEST_ID_PARAM: &str = "testId";

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Error types for proxy operations
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported URL scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Who made a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOrigin {
    /// Correlation id propagated by the adapter
    pub correlation_id: Option<CorrelationId>,
    /// URL of the requesting document
    pub referrer: Option<Url>,
}

impl RequestOrigin {
    /// A request made on behalf of a known context
    pub fn explicit(id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(id),
            referrer: None,
        }
    }

    /// A request whose only clue is the requesting document's URL
    pub fn from_referrer(referrer: Url) -> Self {
        Self {
            correlation_id: None,
            referrer: Some(referrer),
        }
    }

    /// A request not made on behalf of any context
    pub fn detached() -> Self {
        Self::default()
    }

    /// The correlation id to tag this request with, if one can be found
    pub fn attributed_id(&self) -> Option<CorrelationId> {
        if let Some(id) = &self.correlation_id {
            return Some(id.clone());
        }
        self.referrer.as_ref().and_then(|referrer| {
            referrer
                .query_pairs()
                .find(|(key, _)| key == TEST_ID_PARAM)
                .map(|(_, value)| CorrelationId::from(value.into_owned()))
                .filter(|id| !id.as_str().is_empty())
        })
    }
}

/// A fetched resource
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub url: Url,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Fail on non-2xx statuses
    pub fn error_for_status(self) -> ProxyResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ProxyError::Status {
                url: self.url.to_string(),
                status: self.status,
            })
        }
    }
}

/// Whether `url` names an HLS playlist
pub fn is_playlist(url: &str) -> bool {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.ends_with(MANIFEST_EXTENSION)
}

/// Intercepting fetcher that reports every request on the bus
#[derive(Debug, Clone)]
pub struct NetworkProxy {
    client: reqwest::Client,
    bus: Arc<MessageBus>,
}

impl NetworkProxy {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self::with_client(reqwest::Client::new(), bus)
    }

    pub fn with_client(client: reqwest::Client, bus: Arc<MessageBus>) -> Self {
        Self { client, bus }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    /// Publish a request without performing it.
    ///
    /// Used by adapters whose fetches happen somewhere the proxy cannot see.
    pub fn record(&self, url: &str, origin: &RequestOrigin) {
        let test_id = origin.attributed_id();
        if test_id.is_none() {
            debug!(url, "network request could not be attributed to a test");
        }
        self.bus.publish_network(NetworkRequest {
            url: url.to_string(),
            test_id,
            timestamp: Utc::now(),
        });
    }

    /// Fetch `url` and publish the request.
    ///
    /// A missing local file is reported as a 404 response, matching what an
    /// HTTP origin would answer.
    pub async fn fetch(&self, url: &Url, origin: &RequestOrigin) -> ProxyResult<ProxyResponse> {
        self.record(url.as_str(), origin);

        let mut response = match url.scheme() {
            "http" | "https" => self.fetch_http(url).await?,
            "file" => fetch_file(url).await?,
            other => return Err(ProxyError::UnsupportedScheme(other.to_string())),
        };

        if response.is_success() && is_playlist(url.as_str()) {
            response.content_type = Some(PLAYLIST_CONTENT_TYPE.to_string());
        }
        debug!(url = %url, status = response.status, "proxied fetch");
        Ok(response)
    }

    async fn fetch_http(&self, url: &Url) -> ProxyResult<ProxyResponse> {
        let to_error = |source| ProxyError::Request {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url.clone()).send().await.map_err(to_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let final_url = response.url().clone();
        let body = response.bytes().await.map_err(to_error)?.to_vec();
        Ok(ProxyResponse {
            url: final_url,
            status,
            content_type,
            body,
        })
    }
}

async fn fetch_file(url: &Url) -> ProxyResult<ProxyResponse> {
    let path = url
        .to_file_path()
        .map_err(|_| ProxyError::UnsupportedScheme(format!("{} (non-local file URL)", url.scheme())))?;
    match tokio::fs::read(&path).await {
        Ok(body) => Ok(ProxyResponse {
            url: url.clone(),
            status: 200,
            content_type: None,
            body,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProxyResponse {
            url: url.clone(),
            status: 404,
            content_type: None,
            body: Vec::new(),
        }),
        Err(source) => Err(ProxyError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_id_wins_over_referrer() {
        let mut origin = RequestOrigin::from_referrer(
            Url::parse("http://localhost/runner.html?testIndex=1&testId=from-ref").unwrap(),
        );
        assert_eq!(origin.attributed_id(), Some("from-ref".into()));
        origin.correlation_id = Some("explicit".into());
        assert_eq!(origin.attributed_id(), Some("explicit".into()));
    }

    #[test]
    fn test_unattributable_origins() {
        let no_param =
            RequestOrigin::from_referrer(Url::parse("http://localhost/runner.html?player=native").unwrap());
        assert_eq!(no_param.attributed_id(), None);
        let empty = RequestOrigin::from_referrer(Url::parse("http://localhost/?testId=").unwrap());
        assert_eq!(empty.attributed_id(), None);
        assert_eq!(RequestOrigin::detached().attributed_id(), None);
    }

    #[test]
    fn test_is_playlist() {
        assert!(is_playlist("http://x/a/b.m3u8"));
        assert!(is_playlist("http://x/a/b.m3u8?token=1"));
        assert!(is_playlist("file:///tmp/local.m3u8#start"));
        assert!(!is_playlist("http://x/a/seg0.ts"));
        assert!(!is_playlist("http://x/a.m3u8.ts"));
    }

    #[tokio::test]
    async fn test_file_fetch_publishes_and_sets_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ok.m3u8");
        std::fs::write(&path, "#EXTM3U\n").unwrap();
        let url = Url::from_file_path(&path).unwrap();

        let bus = Arc::new(MessageBus::new());
        let mut sub = bus.subscribe_network("ctx".into());
        let proxy = NetworkProxy::new(bus.clone());

        let response = proxy
            .fetch(&url, &RequestOrigin::explicit("ctx".into()))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.content_type.as_deref(), Some(PLAYLIST_CONTENT_TYPE));
        assert_eq!(response.text(), "#EXTM3U\n");
        assert_eq!(sub.recv().await.unwrap().url, url.to_string());
    }

    #[tokio::test]
    async fn test_missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("missing.m3u8")).unwrap();
        let proxy = NetworkProxy::new(Arc::new(MessageBus::new()));
        let response = proxy.fetch(&url, &RequestOrigin::detached()).await.unwrap();
        assert_eq!(response.status, 404);
        assert!(response.content_type.is_none());
        assert!(matches!(
            response.error_for_status(),
            Err(ProxyError::Status { status: 404, .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let proxy = NetworkProxy::new(Arc::new(MessageBus::new()));
        let url = Url::parse("ftp://example.com/a.m3u8").unwrap();
        assert!(matches!(
            proxy.fetch(&url, &RequestOrigin::detached()).await,
            Err(ProxyError::UnsupportedScheme(s)) if s == "ftp"
        ));
    }
}
