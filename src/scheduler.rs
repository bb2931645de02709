//! Bounded-concurrency dispatcher for execution contexts.
//!
//! Queued requests start in queue order, at most `limit` at a time, and may
//! complete in any order; every completion frees a slot that is refilled
//! greedily on the next poll. Requests dispatched with
//! [`Scheduler::dispatch_now`] bypass both the queue and the limit.
//!
//! All contexts are futures polled from the caller's task.

use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use std::collections::VecDeque;
use tracing::debug;

use crate::context::{Completion, Launch};
use crate::request::{CorrelationId, ExecutionRequest};

/// How a live context was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Queued,
    Bypass,
}

type Tagged = BoxFuture<'static, (Slot, Completion)>;

pub struct Scheduler {
    queue: VecDeque<ExecutionRequest>,
    limit: usize,
    live: FuturesUnordered<Tagged>,
    queued_live: usize,
    peak_queued_live: usize,
    started: Vec<ExecutionRequest>,
}

impl Scheduler {
    /// A scheduler running at most `limit` queued contexts at once (at least 1)
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            limit: limit.max(1),
            live: FuturesUnordered::new(),
            queued_live: 0,
            peak_queued_live: 0,
            started: Vec::new(),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn enqueue(&mut self, request: ExecutionRequest) {
        self.queue.push_back(request);
    }

    /// Start `request` immediately, ignoring the queue and the limit
    pub fn dispatch_now(&mut self, request: ExecutionRequest, launcher: &dyn Launch) {
        debug!(correlation_id = %request.correlation_id, "dispatching outside the queue");
        self.start(Slot::Bypass, request, launcher);
    }

    /// Start queued requests while capacity allows
    pub fn refill(&mut self, launcher: &dyn Launch) {
        while self.queued_live < self.limit {
            let Some(request) = self.queue.pop_front() else {
                break;
            };
            self.queued_live += 1;
            self.peak_queued_live = self.peak_queued_live.max(self.queued_live);
            self.start(Slot::Queued, request, launcher);
        }
    }

    fn start(&mut self, slot: Slot, request: ExecutionRequest, launcher: &dyn Launch) {
        self.started.push(request.clone());
        let context = launcher.launch(request);
        self.live.push(context.map(move |completion| (slot, completion)).boxed());
    }

    /// Refill, then wait for the next context to finish.
    ///
    /// Returns `None` once nothing is live and the queue is empty. Dropping
    /// the returned future loses nothing: contexts started by the refill stay
    /// live and will be returned by a later call.
    pub async fn next_completion(&mut self, launcher: &dyn Launch) -> Option<Completion> {
        self.refill(launcher);
        let (slot, completion) = self.live.next().await?;
        if slot == Slot::Queued {
            self.queued_live -= 1;
        }
        Some(completion)
    }

    /// Requests started since the last call, in start order
    pub fn take_started(&mut self) -> Vec<ExecutionRequest> {
        std::mem::take(&mut self.started)
    }

    /// Number of contexts currently running
    pub fn live(&self) -> usize {
        self.live.len()
    }

    /// Number of requests waiting for a slot
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.live.is_empty() && self.queue.is_empty()
    }

    /// Drop every request that has not started yet, returning them
    pub fn clear_queue(&mut self) -> Vec<ExecutionRequest> {
        self.queue.drain(..).collect()
    }

    /// Remove one queued request before it starts
    pub fn cancel_queued(&mut self, id: &CorrelationId) -> Option<ExecutionRequest> {
        let position = self.queue.iter().position(|r| &r.correlation_id == id)?;
        self.queue.remove(position)
    }

    /// Most queued contexts ever running at once
    pub fn peak(&self) -> usize {
        self.peak_queued_live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusResult, Delivery};
    use crate::catalog::{TestCase, TestIndex};
    use crate::context::ContextFuture;
    use crate::player::Backend;
    use crate::record::{RawOutcome, ResultRecord};
    use pretty_assertions::assert_eq;
    use reqwest::Url;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Later indices finish sooner, so completions arrive out of start order.
    struct TimedLauncher {
        live: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl TimedLauncher {
        fn new() -> Self {
            Self {
                live: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Launch for TimedLauncher {
        fn launch(&self, request: ExecutionRequest) -> ContextFuture {
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let live = Arc::clone(&self.live);
            let delay = Duration::from_millis(10 * (5 - request.test_index.0.rem_euclid(5)) as u64);
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                live.fetch_sub(1, Ordering::SeqCst);
                let outcome: BusResult<Delivery> = Ok(Delivery {
                    test_index: request.test_index,
                    result: ResultRecord::from_outcome(RawOutcome::passed()),
                });
                Completion { request, outcome }
            })
        }
    }

    fn request(index: i64) -> ExecutionRequest {
        ExecutionRequest {
            test_case: Arc::new(TestCase::new(format!("case {}", index), "a.m3u8")),
            test_index: TestIndex(index),
            backend: Backend::Native,
            correlation_id: CorrelationId::from(format!("{}-native-0", index)),
            manifest: Url::parse("http://localhost/a.m3u8").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_limit_is_respected_and_every_request_runs_once() {
        let launcher = TimedLauncher::new();
        let mut scheduler = Scheduler::new(2);
        for i in 0..6 {
            scheduler.enqueue(request(i));
        }

        let mut completed = Vec::new();
        while let Some(completion) = scheduler.next_completion(&launcher).await {
            completed.push(completion.request.test_index.0);
        }

        let started: Vec<i64> = scheduler
            .take_started()
            .iter()
            .map(|r| r.test_index.0)
            .collect();
        assert_eq!(started, vec![0, 1, 2, 3, 4, 5]);
        completed.sort();
        assert_eq!(completed, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(scheduler.peak(), 2);
        assert_eq!(launcher.peak.load(Ordering::SeqCst), 2);
        assert!(scheduler.is_idle());
    }

    #[tokio::test]
    async fn test_limit_below_one_is_clamped() {
        let launcher = TimedLauncher::new();
        let mut scheduler = Scheduler::new(0);
        assert_eq!(scheduler.limit(), 1);
        scheduler.enqueue(request(0));
        scheduler.enqueue(request(1));
        while scheduler.next_completion(&launcher).await.is_some() {}
        assert_eq!(launcher.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bypass_ignores_limit() {
        let launcher = TimedLauncher::new();
        let mut scheduler = Scheduler::new(1);
        scheduler.enqueue(request(0));
        scheduler.enqueue(request(1));
        scheduler.dispatch_now(request(7), &launcher);
        scheduler.dispatch_now(request(8), &launcher);
        scheduler.refill(&launcher);
        assert_eq!(scheduler.live(), 3);
        assert_eq!(scheduler.queued(), 1);
        while scheduler.next_completion(&launcher).await.is_some() {}
        assert_eq!(scheduler.peak(), 1);
    }

    #[tokio::test]
    async fn test_clear_and_cancel_queue() {
        let mut scheduler = Scheduler::new(1);
        for i in 0..3 {
            scheduler.enqueue(request(i));
        }
        let cancelled = scheduler.cancel_queued(&"1-native-0".into()).unwrap();
        assert_eq!(cancelled.test_index, TestIndex(1));
        assert!(scheduler.cancel_queued(&"1-native-0".into()).is_none());
        assert_eq!(scheduler.clear_queue().len(), 2);
        assert!(scheduler.is_idle());
        assert!(scheduler.next_completion(&TimedLauncher::new()).await.is_none());
    }
}
