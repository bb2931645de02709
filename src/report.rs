//! Diagnostics for finished pairs.
//!
//! A pair report bundles the record with the text of every playlist the pair
//! fetched. Playlists are re-fetched through the proxy; a failed fetch is
//! shown in place of the text and never changes the pair's status.

use serde::Serialize;
use std::fmt::Write as _;

use crate::aggregate::{PairEntry, PairStatus, RunCounters};
use crate::bus::BusStats;
use crate::catalog::Expected;
use crate::proxy::{self, NetworkProxy, ProxyResponse, RequestOrigin};
use crate::record::{FailureKind, ResultRecord};
use crate::request::PairKey;

/// Diagnostic views of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportTab {
    Network,
    Manifests,
    Timeline,
    Logs,
    Screenshot,
}

impl ReportTab {
    pub const ALL: [ReportTab; 5] = [
        ReportTab::Network,
        ReportTab::Manifests,
        ReportTab::Timeline,
        ReportTab::Logs,
        ReportTab::Screenshot,
    ];

    pub fn title(&self) -> &'static str {
        match self {
            ReportTab::Network => "Network",
            ReportTab::Manifests => "Manifests",
            ReportTab::Timeline => "Timeline",
            ReportTab::Logs => "Logs",
            ReportTab::Screenshot => "Screenshot",
        }
    }
}

/// Text of one captured playlist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestText {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureKind>,
}

impl ManifestText {
    fn fetched(url: &str, text: String) -> Self {
        Self {
            url: url.to_string(),
            text: Some(text),
            error: None,
            classification: None,
        }
    }

    fn failed(url: &str, error: impl Into<String>) -> Self {
        Self {
            url: url.to_string(),
            text: None,
            error: Some(error.into()),
            classification: Some(FailureKind::NetworkFetchError),
        }
    }
}

/// Captured URLs that name playlists, first occurrence order, no duplicates
pub fn manifest_urls(network_requests: &[String]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for url in network_requests {
        if proxy::is_playlist(url) && !urls.contains(url) {
            urls.push(url.clone());
        }
    }
    urls
}

/// Fetch the text of every playlist in `network_requests`
pub async fn fetch_manifests(proxy: &NetworkProxy, network_requests: &[String]) -> Vec<ManifestText> {
    let mut manifests = Vec::new();
    for url in manifest_urls(network_requests) {
        let parsed = match reqwest::Url::parse(&url) {
            Ok(parsed) => parsed,
            Err(e) => {
                manifests.push(ManifestText::failed(&url, e.to_string()));
                continue;
            }
        };
        let fetched = proxy
            .fetch(&parsed, &RequestOrigin::detached())
            .await
            .and_then(ProxyResponse::error_for_status);
        manifests.push(match fetched {
            Ok(response) => ManifestText::fetched(&url, response.text()),
            Err(e) => ManifestText::failed(&url, e.to_string()),
        });
    }
    manifests
}

/// Everything known about one pair
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairReport {
    pub pair: PairKey,
    pub test_name: String,
    pub manifest: String,
    pub expected: Expected,
    pub status: PairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ResultRecord>,
    pub manifests: Vec<ManifestText>,
}

impl PairReport {
    /// Report without playlist texts
    pub fn from_entry(pair: PairKey, entry: &PairEntry) -> Self {
        Self {
            pair,
            test_name: entry.test_case.name.clone(),
            manifest: entry.test_case.manifest_uri.clone(),
            expected: entry.test_case.expected,
            status: entry.status,
            record: entry.record.clone(),
            manifests: Vec::new(),
        }
    }

    /// Report with playlist texts fetched through `proxy`
    pub async fn build(pair: PairKey, entry: &PairEntry, proxy: &NetworkProxy) -> Self {
        let mut report = Self::from_entry(pair, entry);
        if let Some(record) = &report.record {
            report.manifests = fetch_manifests(proxy, &record.network_requests).await;
        }
        report
    }

    /// One-line status, e.g. `FAIL (Timed out)`
    pub fn summary(&self) -> String {
        let status = match self.status {
            PairStatus::Queued => "QUEUED",
            PairStatus::Running => "RUNNING",
            PairStatus::Pass => "PASS",
            PairStatus::Fail => "FAIL",
        };
        match self.record.as_ref().and_then(|r| r.reason.as_deref()) {
            Some(reason) => format!("{} ({})", status, reason),
            None => status.to_string(),
        }
    }

    pub fn render_tab(&self, tab: ReportTab) -> String {
        let Some(record) = &self.record else {
            return "No result yet".to_string();
        };
        let mut out = String::new();
        match tab {
            ReportTab::Network => {
                if record.network_requests.is_empty() {
                    out.push_str("No network requests captured");
                }
                for url in &record.network_requests {
                    let _ = writeln!(out, "{}", url);
                }
            }
            ReportTab::Manifests => {
                if self.manifests.is_empty() {
                    out.push_str("No manifests captured");
                }
                for manifest in &self.manifests {
                    let _ = writeln!(out, "--- {} ---", manifest.url);
                    match (&manifest.text, &manifest.error) {
                        (Some(text), _) => {
                            let _ = writeln!(out, "{}", text.trim_end());
                        }
                        (None, Some(error)) => {
                            let _ = writeln!(out, "Failed to fetch manifest: {}", error);
                        }
                        (None, None) => {}
                    }
                }
            }
            ReportTab::Timeline => {
                if record.timeline_events.is_empty() {
                    out.push_str("No events recorded");
                }
                for event in &record.timeline_events {
                    let _ = write!(out, "{} {}", event.timestamp.format("%H:%M:%S%.3f"), event.kind);
                    if !event.data.is_null() {
                        let _ = write!(out, " {}", event.data);
                    }
                    out.push('\n');
                }
            }
            ReportTab::Logs => {
                if record.logs.is_empty() {
                    out.push_str("No logs");
                }
                for line in &record.logs {
                    let _ = writeln!(out, "{}", line);
                }
            }
            ReportTab::Screenshot => match &record.screenshot {
                Some(data_url) => {
                    let _ = write!(out, "PNG data URL ({} bytes)", data_url.len());
                }
                None => out.push_str("No screenshot available"),
            },
        }
        out
    }
}

/// Report for a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub generation: u64,
    pub counters: RunCounters,
    pub bus: BusStats,
    pub pairs: Vec<PairReport>,
}

impl RunReport {
    /// Plain-text table: one row per pair, then the counters
    pub fn summary_table(&self) -> String {
        let name_width = self
            .pairs
            .iter()
            .map(|p| p.test_name.len())
            .max()
            .unwrap_or(0)
            .max(9);
        let mut out = String::new();
        let _ = writeln!(out, "{:<5} {:<nw$} {:<13} RESULT", "INDEX", "TEST CASE", "BACKEND", nw = name_width);
        for pair in &self.pairs {
            let _ = writeln!(
                out,
                "{:<5} {:<nw$} {:<13} {}",
                pair.pair.test_index.0,
                pair.test_name,
                pair.pair.backend.id(),
                pair.summary(),
                nw = name_width
            );
        }
        let c = &self.counters;
        let _ = writeln!(
            out,
            "\nTotal: {}  Passed: {}  Failed: {}  Running: {}",
            c.total, c.passed, c.failed, c.running
        );
        out
    }
}
