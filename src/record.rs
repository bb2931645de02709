//! Result records produced by execution contexts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::catalog::Expected;

/// Published outcome of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pass => "PASS",
            Status::Fail => "FAIL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of how a record came to its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The adapter reported a media or fatal error, or play() was rejected.
    PlaybackError,
    /// The deadline expired before a terminal lifecycle event.
    Timeout,
    /// The adapter's capability check failed before load.
    UnsupportedBackend,
    /// Fetching diagnostic content failed. Never affects status.
    NetworkFetchError,
    /// The case was expected to fail but played.
    UnexpectedPass,
    /// The case was expected to fail and did.
    ExpectedFailureConfirmed,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::PlaybackError => "playback error",
            FailureKind::Timeout => "timeout",
            FailureKind::UnsupportedBackend => "unsupported backend",
            FailureKind::NetworkFetchError => "network fetch error",
            FailureKind::UnexpectedPass => "unexpected pass",
            FailureKind::ExpectedFailureConfirmed => "expected failure confirmed",
        };
        f.write_str(s)
    }
}

/// One entry in a pair's event timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TimelineEvent {
    pub fn now(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind: kind.into(),
            data,
        }
    }
}

/// Outcome of the state machine before diagnostics and inversion are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutcome {
    pub status: Status,
    pub reason: Option<String>,
    pub kind: Option<FailureKind>,
}

impl RawOutcome {
    pub fn passed() -> Self {
        Self {
            status: Status::Pass,
            reason: None,
            kind: None,
        }
    }

    pub fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            status: Status::Fail,
            reason: Some(reason.into()),
            kind: Some(kind),
        }
    }
}

/// The single result of one execution context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<FailureKind>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub timeline_events: Vec<TimelineEvent>,
    #[serde(default)]
    pub network_requests: Vec<String>,
    /// PNG frame as a `data:image/png;base64,` URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
}

impl ResultRecord {
    pub fn from_outcome(outcome: RawOutcome) -> Self {
        Self {
            status: outcome.status,
            reason: outcome.reason,
            classification: outcome.kind,
            logs: Vec::new(),
            timeline_events: Vec::new(),
            network_requests: Vec::new(),
            screenshot: None,
        }
    }

    /// Flip the status of a record whose test case is expected to fail.
    ///
    /// Records of cases expected to pass are returned untouched.
    pub fn apply_expectation(mut self, expected: Expected) -> Self {
        if expected == Expected::Pass {
            return self;
        }
        match self.status {
            Status::Fail => {
                let raw = self.reason.take().unwrap_or_else(|| "unknown".to_string());
                self.status = Status::Pass;
                self.reason = Some(format!("Player failed as expected: {}", raw));
                self.classification = Some(FailureKind::ExpectedFailureConfirmed);
            }
            Status::Pass => {
                self.status = Status::Fail;
                self.reason = Some("Unexpected pass".to_string());
                self.classification = Some(FailureKind::UnexpectedPass);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_expected_pass_is_untouched() {
        let record = ResultRecord::from_outcome(RawOutcome::failed(FailureKind::Timeout, "Timed out"));
        let published = record.clone().apply_expectation(Expected::Pass);
        assert_eq!(published, record);
    }

    #[test]
    fn test_expected_failure_confirmed() {
        let record =
            ResultRecord::from_outcome(RawOutcome::failed(FailureKind::PlaybackError, "Player error"));
        let published = record.apply_expectation(Expected::Fail);
        assert_eq!(published.status, Status::Pass);
        assert_eq!(
            published.reason.as_deref(),
            Some("Player failed as expected: Player error")
        );
        assert_eq!(
            published.classification,
            Some(FailureKind::ExpectedFailureConfirmed)
        );
    }

    #[test]
    fn test_unexpected_pass() {
        let published = ResultRecord::from_outcome(RawOutcome::passed()).apply_expectation(Expected::Fail);
        assert_eq!(published.status, Status::Fail);
        assert_eq!(published.reason.as_deref(), Some("Unexpected pass"));
    }

    #[test]
    fn test_inversion_is_involutive_on_status_only() {
        let original = ResultRecord::from_outcome(RawOutcome::passed());
        let twice = original
            .clone()
            .apply_expectation(Expected::Fail)
            .apply_expectation(Expected::Fail);
        assert_eq!(twice.status, original.status);
        assert_ne!(twice.reason, original.reason);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let mut record = ResultRecord::from_outcome(RawOutcome::passed());
        record.network_requests.push("http://x/a.m3u8".to_string());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "PASS");
        assert!(json.get("networkRequests").is_some());
        assert!(json.get("timelineEvents").is_some());
        assert!(json.get("reason").is_none());
    }
}
