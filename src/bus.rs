//! Message bus between execution contexts and the orchestrator.
//!
//! Two independent kinds of traffic share the bus:
//! - `test_result`: one record per correlation id, delivered at most once to
//!   the consumer that registered for it
//! - `network_request`: broadcast to every context; each keeps the requests
//!   attributed to its own correlation id
//!
//! A consumer registers with [`MessageBus::expect`] and awaits the returned
//! [`ResultWaiter`]; delivery resolves it directly. Results that arrive before
//! anyone registered are parked in a mailbox until picked up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::catalog::TestIndex;
use crate::record::ResultRecord;
use crate::request::CorrelationId;

/// Default capacity of the network broadcast channel
const DEFAULT_NETWORK_CAPACITY: usize = 1024;

/// A fetch observed by the network proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub url: String,
    /// Best-effort attribution; `None` when the origin could not be inferred
    #[serde(rename = "testId")]
    pub test_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
}

/// Wire shape of everything posted on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    NetworkRequest(NetworkRequest),
    TestResult {
        #[serde(rename = "testId")]
        test_id: CorrelationId,
        result: ResultRecord,
        #[serde(rename = "testIndex")]
        test_index: TestIndex,
    },
}

/// A result as handed to its waiting consumer
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub test_index: TestIndex,
    pub result: ResultRecord,
}

/// What happened to a delivered result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Handed to a registered waiter
    Delivered,
    /// Parked in the mailbox until someone asks for it
    Stored,
    /// Nobody will ever ask for it; dropped
    Discarded,
}

/// Result type for bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Error types for bus operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("a result for {0} was already delivered")]
    Duplicate(CorrelationId),

    #[error("no result will arrive for {0}: it was abandoned")]
    Abandoned(CorrelationId),
}

/// Snapshot of bus counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    pub results_delivered: u64,
    pub results_discarded: u64,
    pub duplicates_rejected: u64,
    pub network_published: u64,
}

#[derive(Debug, Default)]
struct StatsInner {
    results_delivered: AtomicU64,
    results_discarded: AtomicU64,
    duplicates_rejected: AtomicU64,
    network_published: AtomicU64,
}

#[derive(Debug, Default)]
struct Correlation {
    waiters: HashMap<CorrelationId, oneshot::Sender<Delivery>>,
    mailbox: HashMap<CorrelationId, Delivery>,
    delivered: HashSet<CorrelationId>,
    abandoned: HashSet<CorrelationId>,
}

/// Process-wide result and network channel
#[derive(Debug)]
pub struct MessageBus {
    network: broadcast::Sender<NetworkRequest>,
    correlation: Mutex<Correlation>,
    stats: StatsInner,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_NETWORK_CAPACITY)
    }

    /// Create a bus whose network channel holds `capacity` unread messages
    /// per subscriber before the slowest one starts losing them.
    pub fn with_capacity(capacity: usize) -> Self {
        let (network, _) = broadcast::channel(capacity.max(1));
        Self {
            network,
            correlation: Mutex::new(Correlation::default()),
            stats: StatsInner::default(),
        }
    }

    fn correlation(&self) -> MutexGuard<'_, Correlation> {
        self.correlation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Post any bus message
    pub fn post(&self, message: BusMessage) -> BusResult<DeliveryOutcome> {
        match message {
            BusMessage::NetworkRequest(request) => {
                self.publish_network(request);
                Ok(DeliveryOutcome::Delivered)
            }
            BusMessage::TestResult {
                test_id,
                result,
                test_index,
            } => self.deliver(test_id, test_index, result),
        }
    }

    /// Deliver the result for `id`. A second delivery for the same id is rejected.
    pub fn deliver(
        &self,
        id: CorrelationId,
        test_index: TestIndex,
        result: ResultRecord,
    ) -> BusResult<DeliveryOutcome> {
        let mut correlation = self.correlation();
        if !correlation.delivered.insert(id.clone()) {
            self.stats.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(correlation_id = %id, "rejecting duplicate result");
            return Err(BusError::Duplicate(id));
        }

        let delivery = Delivery { test_index, result };

        if correlation.abandoned.remove(&id) {
            self.stats.results_discarded.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %id, "discarding result for abandoned request");
            return Ok(DeliveryOutcome::Discarded);
        }

        match correlation.waiters.remove(&id) {
            Some(waiter) => match waiter.send(delivery) {
                Ok(()) => {
                    self.stats.results_delivered.fetch_add(1, Ordering::Relaxed);
                    Ok(DeliveryOutcome::Delivered)
                }
                Err(_) => {
                    self.stats.results_discarded.fetch_add(1, Ordering::Relaxed);
                    debug!(correlation_id = %id, "waiter went away, discarding result");
                    Ok(DeliveryOutcome::Discarded)
                }
            },
            None => {
                correlation.mailbox.insert(id, delivery);
                Ok(DeliveryOutcome::Stored)
            }
        }
    }

    /// Register interest in the result for `id`.
    ///
    /// If the result is already parked in the mailbox the waiter resolves
    /// immediately. Registering again replaces the previous waiter, which then
    /// resolves with [`BusError::Abandoned`].
    pub fn expect(&self, id: CorrelationId) -> ResultWaiter {
        let (tx, rx) = oneshot::channel();
        let mut correlation = self.correlation();
        correlation.abandoned.remove(&id);
        match correlation.mailbox.remove(&id) {
            Some(delivery) => {
                self.stats.results_delivered.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(delivery);
            }
            None => {
                correlation.waiters.insert(id.clone(), tx);
            }
        }
        ResultWaiter { id, rx }
    }

    /// Give up on `id`: its waiter resolves as abandoned and a late result is dropped.
    pub fn abandon(&self, id: &CorrelationId) {
        let mut correlation = self.correlation();
        correlation.waiters.remove(id);
        if correlation.mailbox.remove(id).is_some() {
            self.stats.results_discarded.fetch_add(1, Ordering::Relaxed);
        } else if !correlation.delivered.contains(id) {
            correlation.abandoned.insert(id.clone());
        }
    }

    /// Forget `id` entirely. Only for ids whose context has finished and whose
    /// result will never be consumed again; a later delivery is treated as new.
    pub fn retire(&self, id: &CorrelationId) {
        let mut correlation = self.correlation();
        correlation.waiters.remove(id);
        correlation.delivered.remove(id);
        correlation.abandoned.remove(id);
        if correlation.mailbox.remove(id).is_some() {
            self.stats.results_discarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of results parked without a waiter
    pub fn pending_results(&self) -> usize {
        self.correlation().mailbox.len()
    }

    /// Number of ids the bus still remembers as delivered or abandoned
    pub fn tracked_ids(&self) -> usize {
        let correlation = self.correlation();
        correlation.delivered.len() + correlation.abandoned.len()
    }

    /// Broadcast a network request to every subscribed context
    pub fn publish_network(&self, request: NetworkRequest) {
        self.stats.network_published.fetch_add(1, Ordering::Relaxed);
        // No subscribers simply means no context is listening right now.
        let _ = self.network.send(request);
    }

    /// Subscribe to network requests attributed to `id`
    pub fn subscribe_network(&self, id: CorrelationId) -> NetworkSubscription {
        NetworkSubscription {
            id,
            rx: self.network.subscribe(),
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            results_delivered: self.stats.results_delivered.load(Ordering::Relaxed),
            results_discarded: self.stats.results_discarded.load(Ordering::Relaxed),
            duplicates_rejected: self.stats.duplicates_rejected.load(Ordering::Relaxed),
            network_published: self.stats.network_published.load(Ordering::Relaxed),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Pending result for one correlation id
#[derive(Debug)]
pub struct ResultWaiter {
    id: CorrelationId,
    rx: oneshot::Receiver<Delivery>,
}

impl ResultWaiter {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the delivery
    pub async fn wait(self) -> BusResult<Delivery> {
        self.rx.await.map_err(|_| BusError::Abandoned(self.id))
    }
}

/// Network requests for one correlation id
#[derive(Debug)]
pub struct NetworkSubscription {
    id: CorrelationId,
    rx: broadcast::Receiver<NetworkRequest>,
}

impl NetworkSubscription {
    /// Next request attributed to this subscription's id.
    ///
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<NetworkRequest> {
        loop {
            match self.rx.recv().await {
                Ok(request) if request.test_id.as_ref() == Some(&self.id) => return Some(request),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(correlation_id = %self.id, missed = n, "network subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Requests for this id that are already buffered, without waiting
    pub fn drain(&mut self) -> Vec<NetworkRequest> {
        let mut requests = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(request) if request.test_id.as_ref() == Some(&self.id) => requests.push(request),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return requests,
            }
        }
    }
}
