//! Orchestrator: owns the run state and exposes the run controls.
//!
//! All contexts are polled from whichever task drives the orchestrator
//! (`step`, `drain` or `serve`). Counters change only while a completion is
//! being consumed or a control is being applied.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::aggregate::{PairEntry, RecordOutcome, ResultAggregator, RunCounters};
use crate::bus::{BusError, MessageBus};
use crate::catalog::{self, Catalog, CatalogError, TestCase, TestIndex};
use crate::config::{ConfigError, RunnerConfig};
use crate::context::{Completion, ContextSettings, Launcher};
use crate::player::{Backend, HttpProbePlayer, PlayerAdapter, PlayerError};
use crate::proxy::NetworkProxy;
use crate::report::{PairReport, RunReport};
use crate::request::{CorrelationId, ExecutionRequest, IdGenerator, PairKey};
use crate::scheduler::Scheduler;

/// Result type for orchestrator operations
pub type RunResult<T> = Result<T, RunError>;

/// Error types for orchestrator operations
#[derive(Debug, Error)]
pub enum RunError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Player(#[from] PlayerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pair {0} has not been run yet")]
    NotRun(PairKey),
}

/// Where an ad-hoc manifest comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdHocSource {
    /// A manifest URL, absolute or relative to the base URL
    Uri(String),
    /// A local playlist file
    File(PathBuf),
}

/// Commands accepted by [`Orchestrator::serve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunControl {
    RunAll,
    RunPair { index: TestIndex, backend: Backend },
    Rerun { index: TestIndex, backend: Backend },
    AddAdHoc(AdHocSource),
    SetEnabled { index: TestIndex, enabled: bool },
}

pub struct Orchestrator {
    config: RunnerConfig,
    catalog: Catalog,
    bus: Arc<MessageBus>,
    proxy: NetworkProxy,
    launcher: Launcher,
    scheduler: Scheduler,
    aggregator: ResultAggregator,
    ids: IdGenerator,
}

impl Orchestrator {
    /// An orchestrator with no adapters; every backend reports as unsupported
    /// until one is registered.
    pub fn new(config: RunnerConfig, catalog: Catalog) -> Self {
        let bus = Arc::new(MessageBus::new());
        let proxy = NetworkProxy::new(Arc::clone(&bus));
        let launcher = Launcher::new(Arc::clone(&bus), ContextSettings::from(&config));
        let scheduler = Scheduler::new(config.concurrency);
        Self {
            config,
            catalog,
            bus,
            proxy,
            launcher,
            scheduler,
            aggregator: ResultAggregator::new(),
            ids: IdGenerator::new(),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn PlayerAdapter>) -> Self {
        self.launcher.register(adapter);
        self
    }

    /// Register an [`HttpProbePlayer`] for every backend
    pub fn with_probe_players(mut self) -> Self {
        for backend in Backend::ALL {
            self.launcher
                .register(Arc::new(HttpProbePlayer::new(backend, self.proxy.clone())));
        }
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut Catalog {
        &mut self.catalog
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn proxy(&self) -> &NetworkProxy {
        &self.proxy
    }

    fn make_request(
        &mut self,
        test_index: TestIndex,
        backend: Backend,
        test_case: Arc<TestCase>,
    ) -> RunResult<ExecutionRequest> {
        let manifest = catalog::resolve_manifest(&test_case.manifest_uri, &self.config.base_url)?;
        Ok(ExecutionRequest {
            correlation_id: self.ids.next_id(backend),
            test_case,
            test_index,
            backend,
            manifest,
        })
    }

    /// Make `request` the pair's current request, cancelling whatever it replaces
    fn supersede(&mut self, request: &ExecutionRequest) {
        let settled = self
            .aggregator
            .get(&request.pair())
            .filter(|entry| entry.status.is_terminal())
            .map(|entry| entry.current_id.clone());
        let replaced = self.aggregator.register(
            request.pair(),
            request.correlation_id.clone(),
            Arc::clone(&request.test_case),
        );
        if let Some(old) = replaced {
            // A request cancelled before launch never delivers, so there is nothing to abandon.
            if self.scheduler.cancel_queued(&old).is_none() {
                debug!(pair = %request.pair(), correlation_id = %old, "abandoning superseded request");
                self.bus.abandon(&old);
            }
        }
        if let Some(old) = settled {
            self.bus.retire(&old);
        }
    }

    /// Queue every enabled case on every enabled backend, replacing any
    /// run in progress. Returns the number of pairs queued.
    #[instrument(skip(self))]
    pub fn run_all(&mut self) -> RunResult<usize> {
        let mut requests = Vec::new();
        let cases: Vec<(TestIndex, Arc<TestCase>)> = self
            .catalog
            .enabled()
            .map(|(index, case)| (index, Arc::clone(case)))
            .collect();
        let backends = self.config.backends.clone();
        for (index, case) in cases {
            for &backend in &backends {
                requests.push(self.make_request(index, backend, Arc::clone(&case))?);
            }
        }

        let never_started: HashSet<CorrelationId> = self
            .scheduler
            .clear_queue()
            .into_iter()
            .map(|r| r.correlation_id)
            .collect();
        for id in self.aggregator.settled_ids() {
            self.bus.retire(&id);
        }
        for id in self.aggregator.reset() {
            if !never_started.contains(&id) {
                self.bus.abandon(&id);
            }
        }

        let queued = requests.len();
        for request in requests {
            self.supersede(&request);
            self.scheduler.enqueue(request);
        }
        info!(
            pairs = queued,
            generation = self.aggregator.generation(),
            limit = self.scheduler.limit(),
            "run started"
        );
        Ok(queued)
    }

    /// Run one pair now, outside the queue and the concurrency limit
    #[instrument(skip(self))]
    pub fn run_pair(&mut self, index: TestIndex, backend: Backend) -> RunResult<CorrelationId> {
        let case = Arc::clone(self.catalog.require(index)?);
        let request = self.make_request(index, backend, case)?;
        let id = request.correlation_id.clone();
        self.supersede(&request);
        self.scheduler.dispatch_now(request, &self.launcher);
        Ok(id)
    }

    /// Run a pair that has run before, replacing its previous result
    pub fn rerun_pair(&mut self, index: TestIndex, backend: Backend) -> RunResult<CorrelationId> {
        let key = PairKey::new(index, backend);
        if self.aggregator.get(&key).is_none() {
            return Err(RunError::NotRun(key));
        }
        self.run_pair(index, backend)
    }

    /// Add an ad-hoc case and run it on every enabled backend
    pub fn add_ad_hoc(&mut self, source: AdHocSource) -> RunResult<TestIndex> {
        let case = match source {
            AdHocSource::Uri(uri) => catalog::ad_hoc_from_uri(&uri),
            AdHocSource::File(path) => catalog::ad_hoc_from_file(&path)?,
        };
        let index = self.catalog.add_ad_hoc(case);
        info!(index = %index, "ad-hoc test added");
        for backend in self.config.backends.clone() {
            self.run_pair(index, backend)?;
        }
        Ok(index)
    }

    pub fn apply(&mut self, control: RunControl) -> RunResult<()> {
        match control {
            RunControl::RunAll => {
                self.run_all()?;
            }
            RunControl::RunPair { index, backend } => {
                self.run_pair(index, backend)?;
            }
            RunControl::Rerun { index, backend } => {
                self.rerun_pair(index, backend)?;
            }
            RunControl::AddAdHoc(source) => {
                self.add_ad_hoc(source)?;
            }
            RunControl::SetEnabled { index, enabled } => self.catalog.set_enabled(index, enabled),
        }
        Ok(())
    }

    fn note_started(&mut self) {
        for request in self.scheduler.take_started() {
            self.aggregator
                .mark_started(request.pair(), &request.correlation_id);
        }
    }

    fn consume(&mut self, completion: Completion) {
        let Completion { request, outcome } = completion;
        let key = request.pair();
        match outcome {
            Ok(delivery) => {
                match self
                    .aggregator
                    .record(key, &request.correlation_id, delivery.result)
                {
                    RecordOutcome::Applied(status) => {
                        debug!(pair = %key, %status, "result consumed")
                    }
                    RecordOutcome::Stale => {
                        debug!(pair = %key, correlation_id = %request.correlation_id, "stale result discarded")
                    }
                }
            }
            Err(BusError::Abandoned(id)) => {
                debug!(correlation_id = %id, "abandoned context finished");
                self.bus.retire(&id);
            }
            Err(e) => warn!(pair = %key, error = %e, "result lost"),
        }
    }

    /// Consume one completion. Returns `false` once nothing is running or queued.
    pub async fn step(&mut self) -> bool {
        let completion = self.scheduler.next_completion(&self.launcher).await;
        self.note_started();
        match completion {
            Some(completion) => {
                self.consume(completion);
                true
            }
            None => false,
        }
    }

    /// Run until every queued and dispatched pair has finished
    pub async fn drain(&mut self) -> RunCounters {
        while self.step().await {}
        let counters = self.counters();
        info!(
            total = counters.total,
            finished = counters.finished(),
            passed = counters.passed,
            failed = counters.failed,
            "run finished"
        );
        counters
    }

    /// Apply controls from `commands` while driving contexts. Returns once the
    /// channel is closed and nothing is left to run.
    pub async fn serve(&mut self, mut commands: mpsc::UnboundedReceiver<RunControl>) {
        let mut open = true;
        loop {
            self.note_started();
            if !open && self.scheduler.is_idle() {
                break;
            }
            tokio::select! {
                command = commands.recv(), if open => match command {
                    Some(control) => {
                        if let Err(e) = self.apply(control) {
                            warn!(error = %e, "run control failed");
                        }
                    }
                    None => open = false,
                },
                completion = self.scheduler.next_completion(&self.launcher), if !self.scheduler.is_idle() => {
                    self.note_started();
                    if let Some(completion) = completion {
                        self.consume(completion);
                    }
                }
                else => break,
            }
        }
    }

    pub fn counters(&self) -> RunCounters {
        self.aggregator.counters()
    }

    /// Contexts currently running, queued or not
    pub fn live(&self) -> usize {
        self.scheduler.live()
    }

    pub fn queued(&self) -> usize {
        self.scheduler.queued()
    }

    /// Most queued contexts that ever ran at once
    pub fn peak_concurrency(&self) -> usize {
        self.scheduler.peak()
    }

    pub fn pair(&self, index: TestIndex, backend: Backend) -> Option<&PairEntry> {
        self.aggregator.get(&PairKey::new(index, backend))
    }

    /// Diagnostics for one pair, with the text of the playlists it fetched
    pub async fn pair_report(&self, index: TestIndex, backend: Backend) -> Option<PairReport> {
        let key = PairKey::new(index, backend);
        let entry = self.aggregator.get(&key)?;
        Some(PairReport::build(key, entry, &self.proxy).await)
    }

    /// Report for the current generation
    pub async fn report(&self, with_manifests: bool) -> RunReport {
        let mut pairs = Vec::new();
        for (key, entry) in self.aggregator.entries() {
            pairs.push(if with_manifests {
                PairReport::build(*key, entry, &self.proxy).await
            } else {
                PairReport::from_entry(*key, entry)
            });
        }
        RunReport {
            generation: self.aggregator.generation(),
            counters: self.counters(),
            bus: self.bus.stats(),
            pairs,
        }
    }
}
