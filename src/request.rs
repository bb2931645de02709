//! Identifiers and the request handed to an execution context.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::catalog::{TestCase, TestIndex};
use crate::player::Backend;

/// Join key between a dispatched request and its out-of-band result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Build an id from a dispatch sequence number, the backend and a timestamp.
    ///
    /// The sequence number alone keeps ids unique within a process; backend and
    /// timestamp make them readable in logs and unique across restarts.
    pub fn generate(sequence: u64, backend: Backend, at: DateTime<Utc>) -> Self {
        Self(format!(
            "{}-{}-{}",
            sequence,
            backend.id(),
            at.timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A (test case, backend) pair as tracked by the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    pub test_index: TestIndex,
    pub backend: Backend,
}

impl PairKey {
    pub fn new(test_index: TestIndex, backend: Backend) -> Self {
        Self {
            test_index,
            backend,
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.test_index, self.backend)
    }
}

/// One unit of work: run `test_case` on `backend`, report under `correlation_id`.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub test_case: Arc<TestCase>,
    pub test_index: TestIndex,
    pub backend: Backend,
    pub correlation_id: CorrelationId,
    /// Manifest URI resolved against the configured base URL.
    pub manifest: Url,
}

impl ExecutionRequest {
    pub fn pair(&self) -> PairKey {
        PairKey::new(self.test_index, self.backend)
    }
}

/// Hands out correlation ids with a monotonically increasing sequence.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: u64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self, backend: Backend) -> CorrelationId {
        let id = CorrelationId::generate(self.next, backend, Utc::now());
        self.next += 1;
        id
    }
}
