//! HLS conformance - run HLS test manifests against playback backends.
//!
//! This crate provides:
//! - A test catalog of HLS manifests with expected outcomes
//! - Player adapters behind one trait (probe-based and scripted)
//! - Isolated execution contexts with deadlines and expected-failure inversion
//! - A correlation bus, a bounded-concurrency scheduler and run aggregation
//! - Per-pair diagnostics, session output and the codec support matrix
//!
//! # Example
//!
//! ```rust,no_run
//! use hls_conformance::{Catalog, Orchestrator, RunnerConfig};
//!
//! # async fn demo() -> Result<(), hls_conformance::RunError> {
//! let mut orchestrator =
//!     Orchestrator::new(RunnerConfig::defaults(), Catalog::builtin()).with_probe_players();
//! orchestrator.run_all()?;
//! let counters = orchestrator.drain().await;
//! println!("{} of {} passed", counters.passed, counters.total);
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod bus;
pub mod catalog;
pub mod config;
pub mod context;
pub mod player;
pub mod proxy;
pub mod record;
pub mod report;
pub mod request;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod support;

// Re-export catalog and record types
pub use catalog::{Catalog, CatalogError, CatalogResult, Expected, TestCase, TestIndex};
pub use record::{FailureKind, ResultRecord, Status, TimelineEvent};
pub use request::{CorrelationId, ExecutionRequest, PairKey};

// Re-export players
pub use player::{
    Backend, HttpProbePlayer, MediaSink, PlayerAdapter, PlayerError, PlayerEvent, ScriptStep,
    ScriptedPlayer,
};

// Re-export the engine
pub use aggregate::{PairStatus, RunCounters};
pub use bus::{BusError, MessageBus};
pub use config::{ConfigError, RunnerConfig};
pub use context::{ContextSettings, ExecutionContext};
pub use proxy::NetworkProxy;
pub use report::{PairReport, ReportTab, RunReport};
pub use runner::{AdHocSource, Orchestrator, RunControl, RunError, RunResult};
pub use scheduler::Scheduler;

// Re-export session management
pub use session::{Session, SessionError, cleanup_old_sessions};

// Re-export the support matrix
pub use support::{GridKind, SupportGrid, TableProbe, TypeSupportProbe};
