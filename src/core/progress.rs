use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use crate::core::error::FailureKind;
use crate::models::{JobSnapshot, JobStatus, ProgressEvent};

/// In-flight progress figures reported by a fetch adapter.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub percent: Option<f64>,
    pub bytes_downloaded: Option<u64>,
    pub bytes_total: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub phase: Option<String>,
}

/// Aggregates per-job progress into a queryable snapshot table and a push
/// stream. Emission never blocks a worker: the stream is a broadcast channel
/// where lagged subscribers lose the oldest (intermediate) updates, while
/// the snapshot table always holds the latest state including terminal
/// outcomes.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

struct ReporterInner {
    snapshots: Mutex<HashMap<Uuid, JobSnapshot>>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            inner: Arc::new(ReporterInner {
                snapshots: Mutex::new(HashMap::new()),
                tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.tx.subscribe()
    }

    /// Bound handle a fetch adapter uses to emit updates for one job.
    pub fn handle(&self, id: Uuid) -> ProgressHandle {
        ProgressHandle {
            id,
            reporter: self.clone(),
        }
    }

    pub fn register(&self, snapshot: JobSnapshot) {
        let id = snapshot.id;
        self.inner
            .snapshots
            .lock()
            .unwrap()
            .insert(id, snapshot);
        let _ = self.inner.tx.send(ProgressEvent::Queued { id });
    }

    /// Drops a job's snapshot again. Used when a submission is rolled back
    /// before the job ever becomes dispatchable.
    pub fn unregister(&self, id: Uuid) {
        self.inner.snapshots.lock().unwrap().remove(&id);
    }

    pub fn status(&self, id: Uuid, status: JobStatus) {
        let mut snapshots = self.inner.snapshots.lock().unwrap();
        if let Some(snap) = snapshots.get_mut(&id) {
            snap.status = status;
        }
    }

    pub fn started(&self, id: Uuid, attempt: u32) {
        {
            let mut snapshots = self.inner.snapshots.lock().unwrap();
            if let Some(snap) = snapshots.get_mut(&id) {
                snap.status = JobStatus::Running;
                snap.attempts = attempt;
                if snap.started_at.is_none() {
                    snap.started_at = Some(chrono::Utc::now());
                }
            }
        }
        let _ = self.inner.tx.send(ProgressEvent::Started { id, attempt });
    }

    /// Records an in-flight update. Intermediate broadcasts are coalesced:
    /// an event goes out only when the percentage moved at least half a
    /// point or the phase changed.
    pub fn progress(&self, id: Uuid, update: ProgressUpdate) {
        let emit = {
            let mut snapshots = self.inner.snapshots.lock().unwrap();
            match snapshots.get_mut(&id) {
                Some(snap) => {
                    let moved = match (update.percent, snap.percent) {
                        (Some(new), Some(old)) => (new - old).abs() >= 0.5 || new >= 99.9,
                        (Some(_), None) => true,
                        (None, _) => false,
                    };
                    let phase_changed =
                        update.phase.is_some() && update.phase != snap.phase;

                    if update.percent.is_some() {
                        snap.percent = update.percent;
                    }
                    if update.bytes_downloaded.is_some() {
                        snap.bytes_downloaded = update.bytes_downloaded;
                    }
                    if update.bytes_total.is_some() {
                        snap.bytes_total = update.bytes_total;
                    }
                    if update.speed.is_some() {
                        snap.speed = update.speed.clone();
                    }
                    if update.eta.is_some() {
                        snap.eta = update.eta.clone();
                    }
                    if update.phase.is_some() {
                        snap.phase = update.phase.clone();
                    }
                    moved || phase_changed
                }
                None => false,
            }
        };
        if emit {
            let _ = self.inner.tx.send(ProgressEvent::Progress {
                id,
                percent: update.percent,
                bytes_downloaded: update.bytes_downloaded,
                bytes_total: update.bytes_total,
                speed: update.speed,
                eta: update.eta,
                phase: update.phase,
            });
        }
    }

    pub fn retrying(&self, id: Uuid, attempt: u32, failure: FailureKind) {
        {
            let mut snapshots = self.inner.snapshots.lock().unwrap();
            if let Some(snap) = snapshots.get_mut(&id) {
                snap.status = JobStatus::Queued;
                snap.last_failure = Some(failure);
                snap.percent = None;
                snap.speed = None;
                snap.eta = None;
                snap.phase = None;
            }
        }
        let _ = self.inner.tx.send(ProgressEvent::Retrying {
            id,
            attempt,
            failure,
        });
    }

    pub fn finished(
        &self,
        id: Uuid,
        status: JobStatus,
        output_path: Option<PathBuf>,
        failure: Option<FailureKind>,
    ) {
        {
            let mut snapshots = self.inner.snapshots.lock().unwrap();
            if let Some(snap) = snapshots.get_mut(&id) {
                snap.status = status;
                snap.output_path = output_path.clone();
                snap.last_failure = failure;
                snap.finished_at = Some(chrono::Utc::now());
                if status == JobStatus::Completed {
                    snap.percent = Some(100.0);
                }
            }
        }
        let _ = self.inner.tx.send(ProgressEvent::Finished {
            id,
            status,
            output_path,
            failure,
        });
    }

    pub fn snapshot(&self, id: Uuid) -> Option<JobSnapshot> {
        self.inner.snapshots.lock().unwrap().get(&id).cloned()
    }

    pub fn snapshot_all(&self) -> Vec<JobSnapshot> {
        self.inner
            .snapshots
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    pub fn snapshot_batch(&self, batch: Uuid) -> Vec<JobSnapshot> {
        self.inner
            .snapshots
            .lock()
            .unwrap()
            .values()
            .filter(|snap| snap.batch == Some(batch))
            .cloned()
            .collect()
    }
}

/// Per-job emission handle passed into a fetch adapter invocation.
#[derive(Clone)]
pub struct ProgressHandle {
    id: Uuid,
    reporter: ProgressReporter,
}

impl ProgressHandle {
    pub fn update(&self, update: ProgressUpdate) {
        self.reporter.progress(self.id, update);
    }
}
