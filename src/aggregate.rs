//! Run-level counters and per-pair outcomes.
//!
//! Counters are only ever changed by a registration (dispatch or rerun), a
//! start, or a consumed record, each of which adjusts them by the delta it
//! causes. A run-all starts a new generation from zero.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::catalog::TestCase;
use crate::record::{ResultRecord, Status};
use crate::request::{CorrelationId, PairKey};

/// Run-level counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    /// Pairs registered in this generation
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Started contexts whose result has not been consumed or abandoned
    pub running: usize,
}

impl RunCounters {
    /// Pairs with a terminal result
    pub fn finished(&self) -> usize {
        self.passed + self.failed
    }
}

/// Where a pair is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Queued,
    Running,
    Pass,
    Fail,
}

impl PairStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PairStatus::Pass | PairStatus::Fail)
    }

    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }
}

impl From<Status> for PairStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Pass => PairStatus::Pass,
            Status::Fail => PairStatus::Fail,
        }
    }
}

/// Latest state of one pair
#[derive(Debug, Clone)]
pub struct PairEntry {
    pub test_case: Arc<TestCase>,
    /// Id of the only request whose result still counts
    pub current_id: CorrelationId,
    pub status: PairStatus,
    pub record: Option<ResultRecord>,
}

/// What `record` did with a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Applied(Status),
    /// Superseded by a rerun or a newer run; counters untouched
    Stale,
}

#[derive(Debug, Default)]
pub struct ResultAggregator {
    generation: u64,
    counters: RunCounters,
    pairs: BTreeMap<PairKey, PairEntry>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation. Returns the ids that were still in flight.
    pub fn reset(&mut self) -> Vec<CorrelationId> {
        let in_flight = self.in_flight_ids();
        self.generation += 1;
        self.counters = RunCounters::default();
        self.pairs.clear();
        in_flight
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Make `id` the current request of `key`.
    ///
    /// A pair seen for the first time adds to `total`. A pair that already
    /// has an entry gives back whatever it was counted as. Returns the id
    /// that was superseded while still in flight, if any.
    pub fn register(
        &mut self,
        key: PairKey,
        id: CorrelationId,
        test_case: Arc<TestCase>,
    ) -> Option<CorrelationId> {
        let entry = PairEntry {
            test_case,
            current_id: id,
            status: PairStatus::Queued,
            record: None,
        };
        let Some(previous) = self.pairs.insert(key, entry) else {
            self.counters.total += 1;
            return None;
        };
        match previous.status {
            PairStatus::Pass => self.counters.passed -= 1,
            PairStatus::Fail => self.counters.failed -= 1,
            PairStatus::Running => self.counters.running -= 1,
            PairStatus::Queued => {}
        }
        debug!(pair = %key, status = ?previous.status, "pair superseded");
        previous
            .status
            .is_in_flight()
            .then_some(previous.current_id)
    }

    /// Note that the context for `id` has started
    pub fn mark_started(&mut self, key: PairKey, id: &CorrelationId) {
        if let Some(entry) = self.pairs.get_mut(&key) {
            if &entry.current_id == id && entry.status == PairStatus::Queued {
                entry.status = PairStatus::Running;
                self.counters.running += 1;
            }
        }
    }

    /// Consume the published record for `id`
    pub fn record(&mut self, key: PairKey, id: &CorrelationId, record: ResultRecord) -> RecordOutcome {
        let Some(entry) = self.pairs.get_mut(&key) else {
            return RecordOutcome::Stale;
        };
        if &entry.current_id != id || entry.status.is_terminal() {
            return RecordOutcome::Stale;
        }
        if entry.status == PairStatus::Running {
            self.counters.running -= 1;
        }
        let status = record.status;
        match status {
            Status::Pass => self.counters.passed += 1,
            Status::Fail => self.counters.failed += 1,
        }
        entry.status = status.into();
        entry.record = Some(record);
        RecordOutcome::Applied(status)
    }

    pub fn counters(&self) -> RunCounters {
        self.counters
    }

    pub fn get(&self, key: &PairKey) -> Option<&PairEntry> {
        self.pairs.get(key)
    }

    /// Every pair in (test index, backend) order
    pub fn entries(&self) -> impl Iterator<Item = (&PairKey, &PairEntry)> {
        self.pairs.iter()
    }

    /// Current ids of pairs without a terminal result
    pub fn in_flight_ids(&self) -> Vec<CorrelationId> {
        self.pairs
            .values()
            .filter(|entry| entry.status.is_in_flight())
            .map(|entry| entry.current_id.clone())
            .collect()
    }

    /// Current ids of pairs whose result has been consumed
    pub fn settled_ids(&self) -> Vec<CorrelationId> {
        self.pairs
            .values()
            .filter(|entry| entry.status.is_terminal())
            .map(|entry| entry.current_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TestIndex;
    use crate::player::Backend;
    use crate::record::{FailureKind, RawOutcome};
    use pretty_assertions::assert_eq;

    fn key(index: i64) -> PairKey {
        PairKey::new(TestIndex(index), Backend::Native)
    }

    fn case() -> Arc<TestCase> {
        Arc::new(TestCase::new("A", "ok.m3u8"))
    }

    fn pass() -> ResultRecord {
        ResultRecord::from_outcome(RawOutcome::passed())
    }

    fn fail() -> ResultRecord {
        ResultRecord::from_outcome(RawOutcome::failed(FailureKind::Timeout, "Timed out"))
    }

    fn counters(total: usize, passed: usize, failed: usize, running: usize) -> RunCounters {
        RunCounters {
            total,
            passed,
            failed,
            running,
        }
    }

    #[test]
    fn test_register_start_record() {
        let mut agg = ResultAggregator::new();
        agg.register(key(0), "a".into(), case());
        agg.register(key(1), "b".into(), case());
        assert_eq!(agg.counters(), counters(2, 0, 0, 0));

        agg.mark_started(key(0), &"a".into());
        agg.mark_started(key(1), &"b".into());
        assert_eq!(agg.counters(), counters(2, 0, 0, 2));

        assert_eq!(agg.record(key(0), &"a".into(), pass()), RecordOutcome::Applied(Status::Pass));
        assert_eq!(agg.record(key(1), &"b".into(), fail()), RecordOutcome::Applied(Status::Fail));
        assert_eq!(agg.counters(), counters(2, 1, 1, 0));
        assert_eq!(agg.get(&key(1)).unwrap().status, PairStatus::Fail);
    }

    #[test]
    fn test_rerun_of_passed_pair_reverses_count() {
        let mut agg = ResultAggregator::new();
        agg.register(key(0), "a".into(), case());
        agg.mark_started(key(0), &"a".into());
        agg.record(key(0), &"a".into(), pass());

        assert_eq!(agg.register(key(0), "a2".into(), case()), None);
        assert_eq!(agg.counters(), counters(1, 0, 0, 0));
        agg.mark_started(key(0), &"a2".into());
        agg.record(key(0), &"a2".into(), fail());
        assert_eq!(agg.counters(), counters(1, 0, 1, 0));
    }

    #[test]
    fn test_rerun_of_running_pair_releases_slot_and_ignores_late_result() {
        let mut agg = ResultAggregator::new();
        agg.register(key(0), "a".into(), case());
        agg.mark_started(key(0), &"a".into());

        assert_eq!(agg.register(key(0), "a2".into(), case()), Some("a".into()));
        assert_eq!(agg.counters(), counters(1, 0, 0, 0));
        assert_eq!(agg.record(key(0), &"a".into(), pass()), RecordOutcome::Stale);
        assert_eq!(agg.counters(), counters(1, 0, 0, 0));
    }

    #[test]
    fn test_reset_starts_new_generation() {
        let mut agg = ResultAggregator::new();
        agg.register(key(0), "a".into(), case());
        agg.register(key(1), "b".into(), case());
        agg.record(key(1), &"b".into(), pass());

        assert_eq!(agg.settled_ids(), vec![CorrelationId::from("b")]);
        assert_eq!(agg.reset(), vec![CorrelationId::from("a")]);
        assert!(agg.settled_ids().is_empty());
        assert_eq!(agg.generation(), 1);
        assert_eq!(agg.counters(), RunCounters::default());
        assert_eq!(agg.record(key(0), &"a".into(), pass()), RecordOutcome::Stale);
    }

    #[test]
    fn test_duplicate_record_is_stale() {
        let mut agg = ResultAggregator::new();
        agg.register(key(0), "a".into(), case());
        agg.record(key(0), &"a".into(), pass());
        assert_eq!(agg.record(key(0), &"a".into(), fail()), RecordOutcome::Stale);
        assert_eq!(agg.counters(), counters(1, 1, 0, 0));
    }
}
