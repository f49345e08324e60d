//! Concurrent download orchestration engine.
//!
//! Jobs are submitted as [`JobRequest`]s, dispatched to a bounded worker
//! pool, and driven through a fetch adapter wrapping the external download
//! toolchain. The [`Engine`] owns scheduling, the retry/fallback policy and
//! the pause/resume/cancel control plane; progress is observable through
//! snapshots and a broadcast event stream.

pub mod config;
pub mod core;
pub mod models;

pub use crate::config::{app_dir, ConfigManager, EngineConfig};
pub use crate::core::error::{EngineError, FailureKind};
pub use crate::core::history::{HistorySink, JsonHistory, NullHistory};
pub use crate::core::manager::Engine;
pub use crate::core::network::{AlwaysOnline, NetworkStatus, Reachability, TcpProbe};
pub use crate::core::policy::{FallbackLadder, RetryPolicy};
pub use crate::core::process::{FetchSpec, FetchToolConfig, Fetcher, YtDlpFetcher};
pub use crate::core::progress::{ProgressHandle, ProgressReporter, ProgressUpdate};
pub use crate::models::{
    ControlOutcome, DesiredState, FetchOutcome, FinalizeRecord, Job, JobRequest, JobSnapshot,
    JobStatus, MediaFormat, PlaylistEntry, ProgressEvent,
};
