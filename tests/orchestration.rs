//! End-to-end runs through the orchestrator

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use hls_conformance::bus::{BusError, BusMessage};
use hls_conformance::config;
use hls_conformance::record::RawOutcome;
use hls_conformance::{
    AdHocSource, Backend, Catalog, FailureKind, Orchestrator, PairStatus, ResultRecord,
    RunCounters, RunnerConfig, ScriptStep, ScriptedPlayer, Status, TestCase, TestIndex,
};
use pretty_assertions::assert_eq;

fn fast_config() -> RunnerConfig {
    RunnerConfig::defaults()
        .timeout(Duration::from_millis(400))
        .grace(Duration::from_millis(5))
        .backends([Backend::Native])
}

fn counters(total: usize, passed: usize, failed: usize) -> RunCounters {
    RunCounters {
        total,
        passed,
        failed,
        running: 0,
    }
}

#[tokio::test]
async fn test_expected_failure_counts_as_pass() {
    let catalog = Catalog::new(vec![
        TestCase::new("A", "ok.m3u8"),
        TestCase::new("B", "missing.m3u8").expect_failure(),
    ]);
    let player =
        ScriptedPlayer::new(Backend::Native).on_manifest("missing.m3u8", ScriptStep::media_error());
    let mut orchestrator =
        Orchestrator::new(fast_config().concurrency(2), catalog).with_adapter(Arc::new(player));

    orchestrator.run_all().unwrap();
    assert_eq!(orchestrator.drain().await, counters(2, 2, 0));

    let a = orchestrator.pair(TestIndex(0), Backend::Native).unwrap();
    let a = a.record.as_ref().unwrap();
    assert_eq!(a.status, Status::Pass);
    assert!(a.screenshot.as_deref().unwrap().starts_with("data:image/png;base64,"));

    let b = orchestrator.pair(TestIndex(1), Backend::Native).unwrap();
    assert_eq!(b.status, PairStatus::Pass);
    let b = b.record.as_ref().unwrap();
    assert_eq!(b.classification, Some(FailureKind::ExpectedFailureConfirmed));
    assert!(b.screenshot.is_none());
    assert!(b.logs.iter().any(|l| l.starts_with("Video Error: code 4")));
}

#[tokio::test]
async fn test_concurrency_limit_is_respected() {
    let cases = (0..6)
        .map(|i| TestCase::new(format!("case {}", i), format!("case{}.m3u8", i)))
        .collect();
    let mut script = vec![ScriptStep::Wait(Duration::from_millis(20))];
    script.extend(ScriptStep::plays());
    let player = ScriptedPlayer::new(Backend::Native).default_script(script);
    let gauge = player.gauge();
    let mut orchestrator = Orchestrator::new(fast_config().concurrency(2), Catalog::new(cases))
        .with_adapter(Arc::new(player));

    orchestrator.run_all().unwrap();
    assert_eq!(orchestrator.queued(), 6);
    assert_eq!(orchestrator.drain().await, counters(6, 6, 0));

    assert_eq!(gauge.attached(), 6);
    assert!(gauge.peak() <= 2, "peak {} exceeds limit", gauge.peak());
    assert!(orchestrator.peak_concurrency() <= 2);
    assert_eq!(orchestrator.live(), 0);
}

#[tokio::test]
async fn test_silent_player_times_out() {
    let catalog = Catalog::new(vec![TestCase::new("stall", "stall.m3u8")]);
    let player = ScriptedPlayer::new(Backend::Native).default_script(ScriptStep::silent());
    let config = fast_config().timeout(Duration::from_millis(50));
    let mut orchestrator = Orchestrator::new(config, catalog).with_adapter(Arc::new(player));

    orchestrator.run_all().unwrap();
    assert_eq!(orchestrator.drain().await, counters(1, 0, 1));

    let record = orchestrator.pair(TestIndex(0), Backend::Native).unwrap();
    let record = record.record.as_ref().unwrap();
    assert_eq!(record.reason.as_deref(), Some("Timed out"));
    assert_eq!(record.classification, Some(FailureKind::Timeout));
}

#[tokio::test]
async fn test_rerun_replaces_previous_outcome() {
    let catalog = Catalog::new(vec![TestCase::new("A", "a.m3u8"), TestCase::new("B", "b.m3u8")]);
    let player = ScriptedPlayer::new(Backend::Native).on_manifest("b.m3u8", ScriptStep::fatal("x"));
    let mut orchestrator = Orchestrator::new(fast_config(), catalog).with_adapter(Arc::new(player));
    orchestrator.run_all().unwrap();
    assert_eq!(orchestrator.drain().await, counters(2, 1, 1));

    // The failed result is withdrawn as soon as the rerun is issued.
    orchestrator.rerun_pair(TestIndex(1), Backend::Native).unwrap();
    assert_eq!(orchestrator.counters().failed, 0);
    assert_eq!(orchestrator.counters().total, 2);

    assert_eq!(orchestrator.drain().await, counters(2, 1, 1));
    let b = orchestrator.pair(TestIndex(1), Backend::Native).unwrap();
    assert_eq!(b.status, PairStatus::Fail);
}

fn slow_player() -> ScriptedPlayer {
    let mut script = vec![ScriptStep::Wait(Duration::from_millis(100))];
    script.extend(ScriptStep::plays());
    ScriptedPlayer::new(Backend::Native).default_script(script)
}

fn two_cases() -> Catalog {
    Catalog::new(vec![TestCase::new("A", "a.m3u8"), TestCase::new("B", "b.m3u8")])
}

#[tokio::test]
async fn test_rerun_of_started_pair_discards_late_result() {
    let mut orchestrator = Orchestrator::new(fast_config().concurrency(2), two_cases())
        .with_adapter(Arc::new(slow_player()));
    orchestrator.run_all().unwrap();

    // Both contexts start, neither finishes.
    let stepped = tokio::time::timeout(Duration::from_millis(20), orchestrator.step()).await;
    assert!(stepped.is_err());
    assert_eq!(orchestrator.live(), 2);

    orchestrator.rerun_pair(TestIndex(0), Backend::Native).unwrap();
    assert_eq!(orchestrator.live(), 3);

    assert_eq!(orchestrator.drain().await, counters(2, 2, 0));
    assert_eq!(orchestrator.bus().stats().results_discarded, 1);
    assert_eq!(orchestrator.bus().tracked_ids(), 2);
    assert_eq!(
        orchestrator.pair(TestIndex(0), Backend::Native).unwrap().status,
        PairStatus::Pass
    );
}

#[tokio::test]
async fn test_run_all_while_running_starts_new_generation() {
    let mut orchestrator = Orchestrator::new(fast_config().concurrency(1), two_cases())
        .with_adapter(Arc::new(slow_player()));
    orchestrator.run_all().unwrap();

    // A starts, B waits for the slot.
    let stepped = tokio::time::timeout(Duration::from_millis(20), orchestrator.step()).await;
    assert!(stepped.is_err());
    assert_eq!(orchestrator.live(), 1);
    assert_eq!(orchestrator.queued(), 1);

    assert_eq!(orchestrator.run_all().unwrap(), 2);
    assert_eq!(orchestrator.counters(), counters(2, 0, 0));
    assert_eq!(orchestrator.queued(), 2);

    assert_eq!(orchestrator.drain().await, counters(2, 2, 0));
    assert_eq!(orchestrator.bus().stats().results_discarded, 1);
    assert_eq!(orchestrator.bus().tracked_ids(), 2);
    assert!(orchestrator.peak_concurrency() <= 1);
}

#[tokio::test]
async fn test_duplicate_result_is_rejected() {
    let orchestrator = Orchestrator::new(fast_config(), Catalog::builtin());
    let bus = orchestrator.bus();
    let waiter = bus.expect("7-native-1".into());
    let message = || BusMessage::TestResult {
        test_id: "7-native-1".into(),
        result: ResultRecord::from_outcome(RawOutcome::passed()),
        test_index: TestIndex(0),
    };
    assert!(bus.post(message()).is_ok());
    assert_eq!(
        bus.post(message()),
        Err(BusError::Duplicate("7-native-1".into()))
    );
    assert_eq!(waiter.wait().await.unwrap().result.status, Status::Pass);
    assert_eq!(bus.stats().duplicates_rejected, 1);
}

#[tokio::test]
async fn test_probe_players_against_http_origin() {
    let mut server = mockito::Server::new_async().await;
    let _manifest = server
        .mock("GET", "/ok.m3u8")
        .with_status(200)
        .with_body("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n")
        .create_async()
        .await;
    let _segment = server
        .mock("GET", "/seg0.ts")
        .with_status(200)
        .with_body(vec![0x47u8; 188])
        .create_async()
        .await;
    let _missing = server
        .mock("GET", "/missing.m3u8")
        .with_status(404)
        .create_async()
        .await;

    let catalog = Catalog::new(vec![
        TestCase::new("A", "ok.m3u8"),
        TestCase::new("B", "missing.m3u8").expect_failure(),
    ]);
    let config = RunnerConfig::defaults()
        .timeout(Duration::from_secs(5))
        .grace(Duration::from_millis(5))
        .base_url(config::parse_base_url(&server.url()).unwrap())
        .backends([Backend::Native, Backend::HlsJs]);
    let mut orchestrator = Orchestrator::new(config, catalog).with_probe_players();

    orchestrator.run_all().unwrap();
    assert_eq!(orchestrator.drain().await, counters(4, 4, 0));

    let hls = orchestrator.pair(TestIndex(0), Backend::HlsJs).unwrap();
    let hls = hls.record.as_ref().unwrap();
    assert!(hls.network_requests.iter().any(|u| u.ends_with("/ok.m3u8")));
    assert!(hls.network_requests.iter().any(|u| u.ends_with("/seg0.ts")));
    assert!(hls.timeline_events.iter().any(|e| e.kind == "manifestLoaded"));

    let report = orchestrator
        .pair_report(TestIndex(0), Backend::Native)
        .await
        .unwrap();
    assert_eq!(report.manifests.len(), 1);
    assert!(report.manifests[0].text.as_deref().unwrap().starts_with("#EXTM3U"));
}

#[tokio::test]
async fn test_ad_hoc_local_playlist() {
    let dir = tempfile::tempdir().unwrap();
    let playlist = dir.path().join("local.m3u8");
    fs::write(&playlist, "#EXTM3U\n#EXTINF:4.0,\nseg0.ts\n#EXT-X-ENDLIST\n").unwrap();
    fs::write(dir.path().join("seg0.ts"), [0x47u8; 188]).unwrap();

    let mut orchestrator =
        Orchestrator::new(fast_config().timeout(Duration::from_secs(5)), Catalog::new(Vec::new()))
            .with_probe_players();
    let index = orchestrator.add_ad_hoc(AdHocSource::File(playlist)).unwrap();
    assert!(index.is_ad_hoc());
    assert_eq!(orchestrator.drain().await, counters(1, 1, 0));
}
