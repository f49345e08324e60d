use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::error::{EngineError, FailureKind};
use crate::core::history::{HistorySink, NullHistory};
use crate::core::network::{Reachability, TcpProbe};
use crate::core::policy::{RetryDecision, RetryPolicy};
use crate::core::process::{self, FetchSpec, FetchToolConfig, Fetcher, YtDlpFetcher};
use crate::core::progress::ProgressReporter;
use crate::core::queue::JobQueue;
use crate::models::{
    ControlOutcome, DesiredState, FetchOutcome, Job, JobRequest, JobSnapshot, JobStatus,
    PlaylistEntry, ProgressEvent,
};

/// Two jobs resolving to the same output identity must never run at the
/// same time.
fn collision_key(request: &JobRequest) -> String {
    format!(
        "{}|{}|{}",
        request.output_dir.display(),
        request.filename_template,
        request.url
    )
}

struct JobEntry {
    job: Job,
    ctl: watch::Sender<DesiredState>,
    /// True while a fetch attempt is in flight for this job.
    active: bool,
}

/// Download orchestration engine: accepts jobs, dispatches them to a fixed
/// worker pool, applies the retry policy and exposes the control plane.
///
/// Lock order is jobs before queue; the queue never reaches back into the
/// job table.
pub struct Engine {
    inner: Arc<EngineInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct EngineInner {
    config: EngineConfig,
    policy: RetryPolicy,
    fetcher: Arc<dyn Fetcher>,
    history: Arc<dyn HistorySink>,
    reachability: Arc<dyn Reachability>,
    queue: JobQueue,
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
    reporter: ProgressReporter,
    idle: Notify,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let fetcher = Arc::new(YtDlpFetcher::new(FetchToolConfig::from(&config)));
        Self::with_collaborators(
            config,
            fetcher,
            Arc::new(NullHistory),
            Arc::new(TcpProbe::default()),
        )
    }

    /// Full-fat constructor with explicit collaborators. `new` wires the
    /// production set.
    pub fn with_collaborators(
        config: EngineConfig,
        fetcher: Arc<dyn Fetcher>,
        history: Arc<dyn HistorySink>,
        reachability: Arc<dyn Reachability>,
    ) -> Self {
        let worker_count = config.workers.max(1);
        let policy = RetryPolicy::new(config.retry_ceiling.max(1), Default::default());
        let reporter = ProgressReporter::new(config.progress_capacity);

        let inner = Arc::new(EngineInner {
            config,
            policy,
            fetcher,
            history,
            reachability,
            queue: JobQueue::new(),
            jobs: Mutex::new(HashMap::new()),
            reporter,
            idle: Notify::new(),
        });

        let mut workers = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let inner = inner.clone();
            workers.push(tokio::spawn(async move {
                debug!(worker, "worker started");
                while let Some((id, key)) = inner.queue.dequeue().await {
                    if inner.hold_for_network(id).await {
                        inner.run_job(id).await;
                    }
                    inner.queue.release(&key);
                }
                debug!(worker, "worker stopped");
            }));
        }
        info!(workers = worker_count, "engine started");

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    // --- Intake ---

    /// Submits a batch of requests, returning one job id per request in
    /// order. The whole batch is rejected on the first invalid request.
    pub fn submit(
        &self,
        requests: Vec<JobRequest>,
        batch: Option<Uuid>,
    ) -> Result<Vec<Uuid>, EngineError> {
        for request in &requests {
            let url = request.url.trim();
            if url.is_empty() {
                return Err(EngineError::ValidationFailed("empty url".into()));
            }
        }
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            ids.push(self.inner.submit_one(request, batch)?);
        }
        Ok(ids)
    }

    /// Expands a playlist URL into individual entries without downloading.
    pub async fn expand_playlist(&self, url: &str) -> Result<Vec<PlaylistEntry>, EngineError> {
        process::probe_playlist(&self.inner.config.yt_dlp_path, url).await
    }

    // --- Control Plane ---

    pub fn pause(&self, id: Uuid) -> ControlOutcome {
        self.inner.pause(id)
    }

    pub fn resume(&self, id: Uuid) -> ControlOutcome {
        self.inner.resume(id)
    }

    pub fn cancel(&self, id: Uuid) -> ControlOutcome {
        self.inner.request_stop(id, JobStatus::Cancelled)
    }

    /// Skip is cancel with a distinct terminal state, so batch reports can
    /// tell operator choice apart from abandonment.
    pub fn skip(&self, id: Uuid) -> ControlOutcome {
        self.inner.request_stop(id, JobStatus::Skipped)
    }

    pub fn pause_all(&self) -> usize {
        self.inner.apply_all(|inner, id| inner.pause(id))
    }

    pub fn resume_all(&self) -> usize {
        self.inner.apply_all(|inner, id| inner.resume(id))
    }

    pub fn cancel_all(&self) -> usize {
        self.inner
            .apply_all(|inner, id| inner.request_stop(id, JobStatus::Cancelled))
    }

    // --- Queries ---

    pub fn status(&self, id: Uuid) -> Option<JobSnapshot> {
        self.inner.reporter.snapshot(id)
    }

    pub fn list(&self) -> Vec<JobSnapshot> {
        self.inner.reporter.snapshot_all()
    }

    pub fn batch_status(&self, batch: Uuid) -> Vec<JobSnapshot> {
        self.inner.reporter.snapshot_batch(batch)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.reporter.subscribe()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Resolves once every known job is terminal and the backlog is empty.
    /// A paused job is not terminal, so a caller that paused work must
    /// resume or cancel it for this to resolve.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stops intake, cancels everything still pending or running, and waits
    /// for the worker pool to drain.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        let leftover = self.inner.queue.close();
        for id in leftover {
            self.inner.finalize_with(id, JobStatus::Cancelled);
        }
        for id in self.inner.non_terminal_ids() {
            let _ = self.inner.request_stop(id, JobStatus::Cancelled);
        }
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                error!("worker task aborted: {}", e);
            }
        }
        info!("engine stopped");
    }
}

impl EngineInner {
    fn submit_one(&self, request: JobRequest, batch: Option<Uuid>) -> Result<Uuid, EngineError> {
        let id = Uuid::new_v4();
        let job = Job::new(id, batch, request);
        let key = collision_key(&job.request);
        let snapshot = job.snapshot();
        let (ctl, _) = watch::channel(DesiredState::Run);

        self.reporter.register(snapshot);
        {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.insert(
                id,
                JobEntry {
                    job,
                    ctl,
                    active: false,
                },
            );
        }
        if let Err(e) = self.queue.enqueue(id, key) {
            self.jobs.lock().unwrap().remove(&id);
            self.reporter.unregister(id);
            return Err(e);
        }
        debug!(%id, "job submitted");
        Ok(id)
    }

    /// Holds a dispatched job until the network is reachable. Returns false
    /// when the job should not run after all; any finalization has then
    /// already happened.
    async fn hold_for_network(&self, id: Uuid) -> bool {
        let mut held = false;
        loop {
            if self.reachability.is_online().await {
                return true;
            }
            let desired = {
                let jobs = self.jobs.lock().unwrap();
                match jobs.get(&id) {
                    Some(entry) if entry.job.status == JobStatus::Queued => *entry.ctl.borrow(),
                    // Paused or finalized while held; nothing left to run.
                    _ => return false,
                }
            };
            match desired {
                DesiredState::Cancel => {
                    self.finalize_with(id, JobStatus::Cancelled);
                    return false;
                }
                DesiredState::Skip => {
                    self.finalize_with(id, JobStatus::Skipped);
                    return false;
                }
                _ => {}
            }
            if !held {
                warn!(%id, "network unreachable, holding dispatch");
                held = true;
            }
            tokio::time::sleep(self.config.reachability_poll()).await;
        }
    }

    async fn run_job(&self, id: Uuid) {
        let (spec, ctl_rx) = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(entry) = jobs.get_mut(&id) else { return };
            if entry.job.status != JobStatus::Queued {
                // Paused or stopped between dispatch and start.
                return;
            }
            let desired = *entry.ctl.borrow();
            match desired {
                DesiredState::Cancel => {
                    drop(jobs);
                    self.finalize_with(id, JobStatus::Cancelled);
                    return;
                }
                DesiredState::Skip => {
                    drop(jobs);
                    self.finalize_with(id, JobStatus::Skipped);
                    return;
                }
                _ => {}
            }
            entry.job.attempts += 1;
            entry.job.transition(JobStatus::Running);
            entry.active = true;
            let attempt = entry.job.attempts - 1;
            let spec = FetchSpec {
                id,
                request: entry.job.request.clone(),
                attempt,
                format_selector: self.policy.format_for(&entry.job.request, attempt),
            };
            (spec, entry.ctl.subscribe())
        };

        self.reporter.started(id, spec.attempt + 1);

        // The attempt runs in its own task so a panicking fetch adapter
        // takes down one attempt, not the worker.
        let fetcher = self.fetcher.clone();
        let progress = self.reporter.handle(id);
        let attempt_task = tokio::spawn(async move { fetcher.fetch(spec, ctl_rx, progress).await });
        let outcome = match attempt_task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(%id, "fetch attempt task failed: {}", e);
                FetchOutcome::Fatal(FailureKind::Internal)
            }
        };

        self.settle(id, outcome);
    }

    /// Applies one attempt's outcome to the job.
    fn settle(&self, id: Uuid, outcome: FetchOutcome) {
        enum Next {
            Finalize,
            Requeue { attempt: u32, kind: FailureKind, key: String },
            Keep,
        }

        let next = {
            let mut jobs = self.jobs.lock().unwrap();
            let Some(entry) = jobs.get_mut(&id) else { return };
            entry.active = false;
            let job = &mut entry.job;
            match outcome {
                FetchOutcome::Success(path) => {
                    // A pause or cancel that raced completion loses; the
                    // finished file stands.
                    job.output_path = path;
                    if job.status == JobStatus::Paused {
                        job.transition(JobStatus::Running);
                    }
                    job.transition(JobStatus::Completed);
                    Next::Finalize
                }
                FetchOutcome::Cancelled => {
                    job.transition(JobStatus::Cancelled);
                    Next::Finalize
                }
                FetchOutcome::Skipped => {
                    job.transition(JobStatus::Skipped);
                    Next::Finalize
                }
                FetchOutcome::Interrupted => {
                    // Torn down for a pause without a verdict; the attempt
                    // does not count and the job waits for resume.
                    job.attempts = job.attempts.saturating_sub(1);
                    if job.status == JobStatus::Running {
                        job.transition(JobStatus::Paused);
                    }
                    Next::Keep
                }
                FetchOutcome::Fatal(kind) => {
                    job.last_failure = Some(kind);
                    if job.status == JobStatus::Paused {
                        job.transition(JobStatus::Running);
                    }
                    job.transition(JobStatus::Failed);
                    Next::Finalize
                }
                FetchOutcome::Recoverable(kind) => {
                    job.last_failure = Some(kind);
                    if job.status == JobStatus::Paused {
                        // Attempt already consumed; resume will requeue.
                        Next::Keep
                    } else {
                        match self.policy.decide(job.attempts, kind) {
                            RetryDecision::Retry => {
                                job.transition(JobStatus::Retrying);
                                job.transition(JobStatus::Queued);
                                Next::Requeue {
                                    attempt: job.attempts,
                                    kind,
                                    key: collision_key(&job.request),
                                }
                            }
                            RetryDecision::GiveUp => {
                                job.last_failure = Some(FailureKind::RetryCeilingExceeded);
                                job.transition(JobStatus::Failed);
                                Next::Finalize
                            }
                        }
                    }
                }
            }
        };

        match next {
            Next::Finalize => self.finalize(id),
            Next::Requeue { attempt, kind, key } => {
                info!(%id, attempt, ?kind, "attempt failed, requeueing");
                self.reporter.retrying(id, attempt, kind);
                if self.queue.enqueue(id, key).is_err() {
                    self.finalize_with(id, JobStatus::Cancelled);
                }
            }
            Next::Keep => self.reporter.status(id, JobStatus::Paused),
        }
    }

    /// Applies a terminal transition, then finalizes.
    fn finalize_with(&self, id: Uuid, status: JobStatus) {
        {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(entry) = jobs.get_mut(&id) {
                if !entry.job.transition(status) {
                    return;
                }
            } else {
                return;
            }
        }
        self.finalize(id);
    }

    /// Publishes a job's terminal state to the reporter and the history
    /// sink. Called exactly once per job, after the terminal transition.
    fn finalize(&self, id: Uuid) {
        let record = {
            let jobs = self.jobs.lock().unwrap();
            match jobs.get(&id) {
                Some(entry) => crate::models::FinalizeRecord::from_job(&entry.job),
                None => return,
            }
        };
        debug!(%id, status = ?record.status, attempts = record.attempts, "job finalized");
        self.reporter
            .finished(id, record.status, record.output_path.clone(), record.failure);
        self.history.record(&record);
        if self.is_idle() {
            self.idle.notify_waiters();
        }
    }

    fn is_idle(&self) -> bool {
        let jobs = self.jobs.lock().unwrap();
        jobs.values().all(|entry| entry.job.status.is_terminal()) && self.queue.is_empty()
    }

    fn non_terminal_ids(&self) -> Vec<Uuid> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|entry| !entry.job.status.is_terminal())
            .map(|entry| entry.job.id)
            .collect()
    }

    fn apply_all(&self, op: impl Fn(&Self, Uuid) -> ControlOutcome) -> usize {
        self.non_terminal_ids()
            .into_iter()
            .filter(|&id| op(self, id) == ControlOutcome::Applied)
            .count()
    }

    fn pause(&self, id: Uuid) -> ControlOutcome {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(entry) = jobs.get_mut(&id) else {
            return ControlOutcome::NotFound;
        };
        match entry.job.status {
            JobStatus::Paused => ControlOutcome::Applied,
            JobStatus::Queued => {
                // Pull it from the backlog; if a worker already took it the
                // control channel is observed before the attempt starts.
                self.queue.remove(id);
                entry.ctl.send_replace(DesiredState::Pause);
                entry.job.transition(JobStatus::Paused);
                self.reporter.status(id, JobStatus::Paused);
                ControlOutcome::Applied
            }
            JobStatus::Running => {
                entry.ctl.send_replace(DesiredState::Pause);
                entry.job.transition(JobStatus::Paused);
                self.reporter.status(id, JobStatus::Paused);
                ControlOutcome::Applied
            }
            _ => ControlOutcome::InvalidTransition,
        }
    }

    fn resume(&self, id: Uuid) -> ControlOutcome {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(entry) = jobs.get_mut(&id) else {
            return ControlOutcome::NotFound;
        };
        match entry.job.status {
            JobStatus::Paused => {
                entry.ctl.send_replace(DesiredState::Run);
                if entry.active {
                    // The suspended process picks up where it left off.
                    entry.job.transition(JobStatus::Running);
                    self.reporter.status(id, JobStatus::Running);
                } else {
                    entry.job.transition(JobStatus::Queued);
                    self.reporter.status(id, JobStatus::Queued);
                    let key = collision_key(&entry.job.request);
                    if self.queue.enqueue(id, key).is_err() {
                        entry.job.transition(JobStatus::Cancelled);
                        drop(jobs);
                        self.finalize(id);
                        return ControlOutcome::Applied;
                    }
                }
                ControlOutcome::Applied
            }
            JobStatus::Queued | JobStatus::Running => ControlOutcome::Applied,
            _ => ControlOutcome::InvalidTransition,
        }
    }

    fn request_stop(&self, id: Uuid, target: JobStatus) -> ControlOutcome {
        let desired = if target == JobStatus::Skipped {
            DesiredState::Skip
        } else {
            DesiredState::Cancel
        };
        let mut jobs = self.jobs.lock().unwrap();
        let Some(entry) = jobs.get_mut(&id) else {
            return ControlOutcome::NotFound;
        };
        let status = entry.job.status;
        if status.is_terminal() {
            // Stopping an already-stopped job the same way is a no-op.
            return if status == target {
                ControlOutcome::Applied
            } else {
                ControlOutcome::InvalidTransition
            };
        }
        entry.ctl.send_replace(desired);
        let direct = match status {
            // A pending job never reaches a worker once excised here; a
            // paused job with no live attempt has no worker either.
            JobStatus::Queued => self.queue.remove(id),
            JobStatus::Paused => !entry.active,
            _ => false,
        };
        if direct {
            entry.job.transition(target);
            drop(jobs);
            self.finalize(id);
        }
        // Otherwise a worker observes the channel and settles the job.
        ControlOutcome::Applied
    }
}
