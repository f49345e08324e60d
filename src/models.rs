use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::FailureKind;

/// Lifecycle states of a job. Completed, Failed, Cancelled and Skipped are
/// terminal; no transition leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    Retrying,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Skipped
        )
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running | Paused | Cancelled | Skipped)
                | (Running, Completed | Failed | Cancelled | Skipped | Paused | Retrying)
                | (Paused, Running | Queued | Cancelled | Skipped)
                | (Retrying, Queued | Failed | Cancelled | Skipped)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaFormat {
    Audio,
    Video,
}

/// Immutable request fields of one download, fixed at submission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub url: String,
    pub format: MediaFormat,
    /// Quality selector: "best", "1080p", "192k", ...
    pub quality: String,
    pub output_dir: PathBuf,
    pub filename_template: String,
    pub playlist: bool,
    pub restrict_filenames: bool,
    pub check_certificate: bool,
    pub cookie_file: Option<PathBuf>,
    /// Extra post-processing arguments handed to the media toolchain.
    pub postprocessor_args: Vec<String>,
    pub use_accelerator: bool,
}

impl JobRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            format: MediaFormat::Video,
            quality: "best".to_string(),
            output_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            filename_template: "%(title)s.%(ext)s".to_string(),
            playlist: false,
            restrict_filenames: false,
            check_certificate: true,
            cookie_file: None,
            postprocessor_args: Vec::new(),
            use_accelerator: false,
        }
    }
}

/// One requested download: immutable request plus run state owned by the
/// engine. Status is only ever mutated through `transition`.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub batch: Option<Uuid>,
    pub request: JobRequest,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_failure: Option<FailureKind>,
    pub bytes_downloaded: Option<u64>,
    pub bytes_total: Option<u64>,
    pub output_path: Option<PathBuf>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: Uuid, batch: Option<Uuid>, request: JobRequest) -> Self {
        Self {
            id,
            batch,
            request,
            status: JobStatus::Queued,
            attempts: 0,
            last_failure: None,
            bytes_downloaded: None,
            bytes_total: None,
            output_path: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Applies `next` if the state machine allows it, stamping timestamps on
    /// first start and on reaching a terminal state. Returns false (leaving
    /// the job untouched) for an illegal transition.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition(next) {
            return false;
        }
        self.status = next;
        if next == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            batch: self.batch,
            url: self.request.url.clone(),
            status: self.status,
            attempts: self.attempts,
            last_failure: self.last_failure,
            percent: None,
            bytes_downloaded: self.bytes_downloaded,
            bytes_total: self.bytes_total,
            speed: None,
            eta: None,
            phase: None,
            output_path: self.output_path.clone(),
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Point-in-time view of a job, queryable without touching the job table.
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub id: Uuid,
    pub batch: Option<Uuid>,
    pub url: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_failure: Option<FailureKind>,
    pub percent: Option<f64>,
    pub bytes_downloaded: Option<u64>,
    pub bytes_total: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub phase: Option<String>,
    pub output_path: Option<PathBuf>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Desired run state requested through the control plane, carried on a
/// per-job watch channel into the fetch adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Run,
    Pause,
    Cancel,
    Skip,
}

/// Result of a control plane call. Invalid requests are reported, never
/// raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    NotFound,
    InvalidTransition,
}

/// Terminal outcome of one fetch attempt, produced exactly once per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(Option<PathBuf>),
    Recoverable(FailureKind),
    Fatal(FailureKind),
    Cancelled,
    Skipped,
    /// The attempt was torn down without a verdict (pause on a platform
    /// without native process suspension). Does not consume an attempt.
    Interrupted,
}

/// Live update pushed to subscribers. Intermediate `Progress` events may be
/// coalesced under backpressure; terminal `Finished` events are always
/// reflected in the snapshot table.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    Queued {
        id: Uuid,
    },
    Started {
        id: Uuid,
        attempt: u32,
    },
    Progress {
        id: Uuid,
        percent: Option<f64>,
        bytes_downloaded: Option<u64>,
        bytes_total: Option<u64>,
        speed: Option<String>,
        eta: Option<String>,
        phase: Option<String>,
    },
    Retrying {
        id: Uuid,
        attempt: u32,
        failure: FailureKind,
    },
    Finished {
        id: Uuid,
        status: JobStatus,
        output_path: Option<PathBuf>,
        failure: Option<FailureKind>,
    },
}

/// Record emitted to the history collaborator on every terminal state. The
/// engine never reads these back.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeRecord {
    pub id: Uuid,
    pub batch: Option<Uuid>,
    pub request: JobRequest,
    pub status: JobStatus,
    pub output_path: Option<PathBuf>,
    pub failure: Option<FailureKind>,
    pub attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl FinalizeRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            batch: job.batch,
            request: job.request.clone(),
            status: job.status,
            output_path: job.output_path.clone(),
            failure: job.last_failure,
            attempts: job.attempts,
            enqueued_at: job.enqueued_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

/// One entry discovered while expanding a playlist URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub id: Option<String>,
    pub url: String,
    pub title: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in [
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
            JobStatus::Skipped,
        ] {
            for next in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Paused,
                JobStatus::Retrying,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
                JobStatus::Skipped,
            ] {
                assert!(!terminal.can_transition(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn queued_job_can_be_cancelled_before_start() {
        let mut job = Job::new(Uuid::new_v4(), None, JobRequest::new("https://example.com/v"));
        assert!(job.transition(JobStatus::Cancelled));
        assert_eq!(job.attempts, 0);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn invalid_transition_leaves_job_untouched() {
        let mut job = Job::new(Uuid::new_v4(), None, JobRequest::new("https://example.com/v"));
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Completed));
        let finished = job.finished_at;
        assert!(!job.transition(JobStatus::Paused));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.finished_at, finished);
    }

    #[test]
    fn pause_resume_round_trip() {
        let mut job = Job::new(Uuid::new_v4(), None, JobRequest::new("https://example.com/v"));
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Paused));
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Completed));
    }

    #[test]
    fn retry_goes_through_retrying_back_to_queued() {
        let mut job = Job::new(Uuid::new_v4(), None, JobRequest::new("https://example.com/v"));
        assert!(job.transition(JobStatus::Running));
        assert!(job.transition(JobStatus::Retrying));
        assert!(job.transition(JobStatus::Queued));
        assert!(job.transition(JobStatus::Running));
    }

    #[test]
    fn started_at_stamped_once() {
        let mut job = Job::new(Uuid::new_v4(), None, JobRequest::new("https://example.com/v"));
        assert!(job.transition(JobStatus::Running));
        let first = job.started_at;
        assert!(first.is_some());
        assert!(job.transition(JobStatus::Retrying));
        assert!(job.transition(JobStatus::Queued));
        assert!(job.transition(JobStatus::Running));
        assert_eq!(job.started_at, first);
    }
}
