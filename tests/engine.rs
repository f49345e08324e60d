use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use downpour::{
    AlwaysOnline, ControlOutcome, DesiredState, Engine, EngineConfig, EngineError, FailureKind,
    FetchOutcome, FetchSpec, Fetcher, FinalizeRecord, HistorySink, JobRequest, JobStatus,
    NullHistory, ProgressHandle,
};

/// Fetch adapter driven by a per-url script of outcomes. Unscripted
/// attempts succeed after the configured delay. Honors pause, cancel and
/// skip through the control channel and tracks concurrency for assertions.
struct ScriptedFetcher {
    script: Mutex<HashMap<String, VecDeque<FetchOutcome>>>,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
    active_urls: Mutex<HashMap<String, usize>>,
    same_url_overlap: AtomicBool,
    selectors: Mutex<Vec<(u32, String)>>,
}

impl ScriptedFetcher {
    fn new(delay: Duration) -> Self {
        Self {
            script: Mutex::new(HashMap::new()),
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            active_urls: Mutex::new(HashMap::new()),
            same_url_overlap: AtomicBool::new(false),
            selectors: Mutex::new(Vec::new()),
        }
    }

    fn script(self, url: &str, outcomes: Vec<FetchOutcome>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(url.to_string(), outcomes.into());
        self
    }

    fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn selectors(&self) -> Vec<(u32, String)> {
        self.selectors.lock().unwrap().clone()
    }

    async fn run(
        &self,
        spec: &FetchSpec,
        ctl: &mut watch::Receiver<DesiredState>,
    ) -> FetchOutcome {
        let sleep = tokio::time::sleep(self.delay);
        tokio::pin!(sleep);
        let mut paused = false;
        loop {
            tokio::select! {
                () = &mut sleep, if !paused => {
                    return self
                        .script
                        .lock()
                        .unwrap()
                        .get_mut(&spec.request.url)
                        .and_then(|q| q.pop_front())
                        .unwrap_or(FetchOutcome::Success(None));
                }
                changed = ctl.changed() => {
                    if changed.is_err() {
                        return FetchOutcome::Cancelled;
                    }
                    match *ctl.borrow_and_update() {
                        DesiredState::Cancel => return FetchOutcome::Cancelled,
                        DesiredState::Skip => return FetchOutcome::Skipped,
                        DesiredState::Pause => paused = true,
                        DesiredState::Run => {
                            paused = false;
                            sleep.as_mut().reset(tokio::time::Instant::now() + self.delay);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        spec: FetchSpec,
        mut ctl: watch::Receiver<DesiredState>,
        _progress: ProgressHandle,
    ) -> FetchOutcome {
        self.selectors
            .lock()
            .unwrap()
            .push((spec.attempt, spec.format_selector.clone()));

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        {
            let mut urls = self.active_urls.lock().unwrap();
            let slot = urls.entry(spec.request.url.clone()).or_insert(0);
            *slot += 1;
            if *slot > 1 {
                self.same_url_overlap.store(true, Ordering::SeqCst);
            }
        }

        let outcome = self.run(&spec, &mut ctl).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        if let Some(slot) = self.active_urls.lock().unwrap().get_mut(&spec.request.url) {
            *slot -= 1;
        }
        outcome
    }
}

#[derive(Default)]
struct RecordingHistory {
    records: Mutex<Vec<FinalizeRecord>>,
}

impl HistorySink for RecordingHistory {
    fn record(&self, record: &FinalizeRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

fn engine_with(fetcher: Arc<ScriptedFetcher>, workers: usize, retry_ceiling: u32) -> Engine {
    let config = EngineConfig {
        workers,
        retry_ceiling,
        ..Default::default()
    };
    Engine::with_collaborators(config, fetcher, Arc::new(NullHistory), Arc::new(AlwaysOnline))
}

fn request(url: &str) -> JobRequest {
    JobRequest::new(url)
}

async fn drained(engine: &Engine) {
    tokio::time::timeout(Duration::from_secs(10), engine.wait_idle())
        .await
        .expect("engine did not go idle");
}

#[tokio::test]
async fn worker_pool_bounds_concurrency() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(50)));
    let engine = engine_with(fetcher.clone(), 2, 1);

    let requests = (0..8)
        .map(|i| request(&format!("https://example.com/v{i}")))
        .collect();
    let ids = engine.submit(requests, None).unwrap();
    drained(&engine).await;

    assert!(fetcher.peak_concurrency() <= 2, "peak {}", fetcher.peak_concurrency());
    for id in ids {
        assert_eq!(engine.status(id).unwrap().status, JobStatus::Completed);
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn same_output_identity_never_runs_concurrently() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(40)));
    let engine = engine_with(fetcher.clone(), 4, 1);

    let requests = (0..4).map(|_| request("https://example.com/same")).collect();
    engine.submit(requests, None).unwrap();
    drained(&engine).await;

    assert!(!fetcher.same_url_overlap.load(Ordering::SeqCst));
    engine.shutdown().await;
}

#[tokio::test]
async fn cancelling_queued_job_consumes_no_attempt() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(300)));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let ids = engine
        .submit(
            vec![request("https://example.com/a"), request("https://example.com/b")],
            None,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.cancel(ids[1]), ControlOutcome::Applied);
    let snap = engine.status(ids[1]).unwrap();
    assert_eq!(snap.status, JobStatus::Cancelled);
    assert_eq!(snap.attempts, 0);
    assert!(snap.finished_at.is_some());

    drained(&engine).await;
    assert_eq!(engine.status(ids[0]).unwrap().status, JobStatus::Completed);
    engine.shutdown().await;
}

#[tokio::test]
async fn cancelling_running_job_stops_promptly() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_secs(30)));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let ids = engine.submit(vec![request("https://example.com/a")], None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    assert_eq!(engine.cancel(ids[0]), ControlOutcome::Applied);
    drained(&engine).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let snap = engine.status(ids[0]).unwrap();
    assert_eq!(snap.status, JobStatus::Cancelled);
    assert_eq!(snap.attempts, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn repeated_cancel_is_idempotent() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_secs(30)));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let ids = engine.submit(vec![request("https://example.com/a")], None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.cancel(ids[0]), ControlOutcome::Applied);
    assert_eq!(engine.cancel(ids[0]), ControlOutcome::Applied);
    drained(&engine).await;
    assert_eq!(engine.cancel(ids[0]), ControlOutcome::Applied);
    // A different terminal verb on a settled job is rejected.
    assert_eq!(engine.skip(ids[0]), ControlOutcome::InvalidTransition);
    engine.shutdown().await;
}

#[tokio::test]
async fn skip_lands_in_its_own_terminal_state() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_secs(30)));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let ids = engine.submit(vec![request("https://example.com/a")], None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.skip(ids[0]), ControlOutcome::Applied);
    drained(&engine).await;
    assert_eq!(engine.status(ids[0]).unwrap().status, JobStatus::Skipped);
    engine.shutdown().await;
}

#[tokio::test]
async fn recoverable_failures_stop_at_the_retry_ceiling() {
    let fetcher = Arc::new(
        ScriptedFetcher::new(Duration::from_millis(10)).script(
            "https://example.com/flaky",
            vec![
                FetchOutcome::Recoverable(FailureKind::TransientNetwork),
                FetchOutcome::Recoverable(FailureKind::TransientNetwork),
                FetchOutcome::Recoverable(FailureKind::TransientNetwork),
            ],
        ),
    );
    let engine = engine_with(fetcher.clone(), 1, 3);

    let ids = engine
        .submit(vec![request("https://example.com/flaky")], None)
        .unwrap();
    drained(&engine).await;

    let snap = engine.status(ids[0]).unwrap();
    assert_eq!(snap.status, JobStatus::Failed);
    assert_eq!(snap.attempts, 3);
    assert_eq!(snap.last_failure, Some(FailureKind::RetryCeilingExceeded));
    engine.shutdown().await;
}

#[tokio::test]
async fn retry_walks_the_fallback_ladder() {
    let fetcher = Arc::new(
        ScriptedFetcher::new(Duration::from_millis(10)).script(
            "https://example.com/picky",
            vec![FetchOutcome::Recoverable(FailureKind::FormatUnavailable)],
        ),
    );
    let engine = engine_with(fetcher.clone(), 1, 3);

    let mut req = request("https://example.com/picky");
    req.quality = "1080p".to_string();
    let ids = engine.submit(vec![req], None).unwrap();
    drained(&engine).await;

    let snap = engine.status(ids[0]).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.attempts, 2);

    let selectors = fetcher.selectors();
    assert_eq!(selectors.len(), 2);
    assert!(selectors[0].1.starts_with("bv*[height<=1080]+ba"));
    assert_eq!(
        selectors[1].1,
        "best[height<=1080][ext=mp4]/best[height<=1080]/best"
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn fatal_failure_skips_the_retry_budget() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(10)).script(
        "https://example.com/bad",
        vec![FetchOutcome::Fatal(FailureKind::InvalidInput)],
    ));
    let engine = engine_with(fetcher.clone(), 1, 3);

    let ids = engine.submit(vec![request("https://example.com/bad")], None).unwrap();
    drained(&engine).await;

    let snap = engine.status(ids[0]).unwrap();
    assert_eq!(snap.status, JobStatus::Failed);
    assert_eq!(snap.attempts, 1);
    assert_eq!(snap.last_failure, Some(FailureKind::InvalidInput));
    engine.shutdown().await;
}

#[tokio::test]
async fn pause_and_resume_round_trip_completes() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(200)));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let ids = engine.submit(vec![request("https://example.com/a")], None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.pause(ids[0]), ControlOutcome::Applied);
    assert_eq!(engine.status(ids[0]).unwrap().status, JobStatus::Paused);
    // Pausing a paused job stays a no-op.
    assert_eq!(engine.pause(ids[0]), ControlOutcome::Applied);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(engine.resume(ids[0]), ControlOutcome::Applied);

    drained(&engine).await;
    let snap = engine.status(ids[0]).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.attempts, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn pausing_queued_job_holds_it_until_resume() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(100)));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let ids = engine
        .submit(
            vec![request("https://example.com/a"), request("https://example.com/b")],
            None,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(engine.pause(ids[1]), ControlOutcome::Applied);
    tokio::time::sleep(Duration::from_millis(200)).await;
    // The first job is long done; the paused one never started.
    assert_eq!(engine.status(ids[0]).unwrap().status, JobStatus::Completed);
    let snap = engine.status(ids[1]).unwrap();
    assert_eq!(snap.status, JobStatus::Paused);
    assert_eq!(snap.attempts, 0);

    assert_eq!(engine.resume(ids[1]), ControlOutcome::Applied);
    drained(&engine).await;
    assert_eq!(engine.status(ids[1]).unwrap().status, JobStatus::Completed);
    engine.shutdown().await;
}

#[tokio::test]
async fn interrupted_attempt_does_not_consume_the_budget() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(10)).script(
        "https://example.com/a",
        vec![FetchOutcome::Interrupted],
    ));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let ids = engine.submit(vec![request("https://example.com/a")], None).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snap = engine.status(ids[0]).unwrap();
    assert_eq!(snap.status, JobStatus::Paused);

    assert_eq!(engine.resume(ids[0]), ControlOutcome::Applied);
    drained(&engine).await;
    let snap = engine.status(ids[0]).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.attempts, 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn mixed_batch_reports_each_terminal_state() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(150)).script(
        "https://example.com/bad",
        vec![FetchOutcome::Fatal(FailureKind::InvalidInput)],
    ));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let batch = Uuid::new_v4();
    let ids = engine
        .submit(
            vec![
                request("https://example.com/good"),
                request("https://example.com/bad"),
                request("https://example.com/doomed"),
            ],
            Some(batch),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(engine.cancel(ids[2]), ControlOutcome::Applied);
    drained(&engine).await;

    let snaps = engine.batch_status(batch);
    assert_eq!(snaps.len(), 3);
    assert_eq!(engine.status(ids[0]).unwrap().status, JobStatus::Completed);
    assert_eq!(engine.status(ids[1]).unwrap().status, JobStatus::Failed);
    assert_eq!(engine.status(ids[2]).unwrap().status, JobStatus::Cancelled);
    engine.shutdown().await;
}

#[tokio::test]
async fn every_terminal_job_reaches_the_history_sink() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(10)).script(
        "https://example.com/bad",
        vec![FetchOutcome::Fatal(FailureKind::AccessDenied)],
    ));
    let history = Arc::new(RecordingHistory::default());
    let config = EngineConfig {
        workers: 2,
        retry_ceiling: 1,
        ..Default::default()
    };
    let engine =
        Engine::with_collaborators(config, fetcher, history.clone(), Arc::new(AlwaysOnline));

    engine
        .submit(
            vec![request("https://example.com/good"), request("https://example.com/bad")],
            None,
        )
        .unwrap();
    drained(&engine).await;
    engine.shutdown().await;

    let records = history.records.lock().unwrap();
    assert_eq!(records.len(), 2);
    let mut statuses: Vec<JobStatus> = records.iter().map(|r| r.status).collect();
    statuses.sort_by_key(|s| format!("{s:?}"));
    assert_eq!(statuses, vec![JobStatus::Completed, JobStatus::Failed]);
}

#[tokio::test]
async fn rejected_submission_leaves_no_snapshot() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_millis(10)));
    let engine = engine_with(fetcher, 1, 1);
    engine.shutdown().await;

    assert!(matches!(
        engine.submit(vec![request("https://example.com/v")], None),
        Err(EngineError::EngineClosed)
    ));
    assert!(engine.list().is_empty());
    engine.submit(vec![request("   ")], None).unwrap_err();
    assert!(engine.list().is_empty());
}

#[tokio::test]
async fn cancel_all_sweeps_queued_and_running() {
    let fetcher = Arc::new(ScriptedFetcher::new(Duration::from_secs(30)));
    let engine = engine_with(fetcher.clone(), 1, 1);

    let ids = engine
        .submit(
            vec![
                request("https://example.com/a"),
                request("https://example.com/b"),
                request("https://example.com/c"),
            ],
            None,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(engine.cancel_all(), 3);
    drained(&engine).await;
    for id in ids {
        assert_eq!(engine.status(id).unwrap().status, JobStatus::Cancelled);
    }
    engine.shutdown().await;
}
