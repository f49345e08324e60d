use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::core::error::{EngineError, FailureKind};
use crate::core::progress::{ProgressHandle, ProgressUpdate};
use crate::models::{DesiredState, FetchOutcome, JobRequest, MediaFormat, PlaylistEntry};

// --- Regex Definitions ---

// [download] 12.3% of ~1.23MiB at 5.55MiB/s ETA 00:18
static PROGRESS_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\]\s+(?P<percentage>[\d\.]+)%\s+of\s+~?\s*(?P<size>[^\s]+)(?:\s+at\s+(?P<speed>[^\s]+(?:\s+B/s)?))?(?:\s+ETA\s+(?P<eta>[^\s]+))?").unwrap()
});

// [download] Destination: path/to/Title.f123.mp4
static DESTINATION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[download\]\s+Destination:\s+(?P<filename>.+)$").unwrap());

// [download] path/to/file has already been downloaded
static ALREADY_DOWNLOADED_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\[download\]\s+(?:Destination:\s+)?(?P<filename>.+?)\s+has already been downloaded")
        .unwrap()
});

// [Merger] Merging formats into "path/to/file.mp4"
static MERGER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\[Merger\]\s+Merging formats into\s+"?(?P<filename>.+?)"?$"#).unwrap()
});

// [ExtractAudio] Destination: path/to/file.mp3
static EXTRACT_AUDIO_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[ExtractAudio\]\s+Destination:\s+(?P<filename>.+)$").unwrap());

// [Metadata] Adding metadata to: path/to/file
static METADATA_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[Metadata\]\s+Adding metadata to:\s+(?P<filename>.+)$").unwrap());

// [Thumbnails] Downloading thumbnail ... or [EmbedThumbnail] ...
static THUMBNAIL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(?:Thumbnails|EmbedThumbnail)\]").unwrap());

// [FixupM3u8] Fixing output file
static FIXUP_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\[(?:Fixup\w+)\]").unwrap());

// Intermediate stream suffix in merge downloads: "Title.f137" -> "Title"
static FRAGMENT_STEM_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"\.f\d+$").unwrap());

const ARTIFACT_SUFFIXES: &[&str] = &[
    ".part", ".ytdl", ".tmp", ".temp", ".m4s", ".ts", ".webp", ".jpg", ".png",
];

/// Parameters of one fetch attempt: the job's immutable request plus the
/// attempt-specific format selector chosen by the retry policy.
#[derive(Debug, Clone)]
pub struct FetchSpec {
    pub id: Uuid,
    pub request: JobRequest,
    /// Zero-based attempt index.
    pub attempt: u32,
    pub format_selector: String,
}

/// Runs one fetch attempt to a single terminal outcome, streaming progress
/// and obeying the desired-state channel. The engine talks to the external
/// world only through this seam.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        spec: FetchSpec,
        ctl: watch::Receiver<DesiredState>,
        progress: ProgressHandle,
    ) -> FetchOutcome;
}

#[derive(Debug, Clone)]
pub struct FetchToolConfig {
    pub yt_dlp_bin: PathBuf,
    pub aria2c_bin: PathBuf,
    pub ffmpeg_bin: Option<PathBuf>,
    pub stall_timeout: Duration,
    pub keep_partial: bool,
}

impl From<&EngineConfig> for FetchToolConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            yt_dlp_bin: cfg.yt_dlp_path.clone(),
            aria2c_bin: cfg.aria2c_path.clone(),
            ffmpeg_bin: cfg.ffmpeg_path.clone(),
            stall_timeout: cfg.stall_timeout(),
            keep_partial: cfg.keep_partial,
        }
    }
}

/// Production fetch adapter wrapping the yt-dlp process.
pub struct YtDlpFetcher {
    cfg: FetchToolConfig,
    aria2c_ok: OnceCell<bool>,
}

impl YtDlpFetcher {
    pub fn new(cfg: FetchToolConfig) -> Self {
        Self {
            cfg,
            aria2c_ok: OnceCell::new(),
        }
    }

    /// The accelerator is best-effort: probed once, and silently skipped
    /// when the binary is absent.
    fn accelerator_available(&self) -> bool {
        *self.aria2c_ok.get_or_init(|| {
            let ok = std::process::Command::new(&self.cfg.aria2c_bin)
                .arg("--version")
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if !ok {
                info!("accelerator binary not found, using direct transport");
            }
            ok
        })
    }

    fn build_command(&self, spec: &FetchSpec) -> Command {
        let req = &spec.request;
        let template = req.output_dir.join(&req.filename_template);

        let mut cmd = Command::new(&self.cfg.yt_dlp_bin);
        cmd.arg(&req.url)
            .arg("-o")
            .arg(&template)
            .arg("--newline")
            .arg("--no-warnings");

        if req.playlist {
            cmd.arg("--yes-playlist");
        } else {
            cmd.arg("--no-playlist");
        }
        if req.restrict_filenames {
            cmd.arg("--restrict-filenames");
        }
        if !req.check_certificate {
            cmd.arg("--no-check-certificate");
        }
        if let Some(cookies) = &req.cookie_file {
            cmd.arg("--cookies").arg(cookies);
        }
        if let Some(ffmpeg) = &self.cfg.ffmpeg_bin {
            cmd.arg("--ffmpeg-location").arg(ffmpeg);
        }

        cmd.arg("-f").arg(&spec.format_selector);
        match req.format {
            MediaFormat::Audio => {
                let digits: String =
                    req.quality.chars().filter(|c| c.is_ascii_digit()).collect();
                let bitrate = if digits.is_empty() { "192" } else { &digits };
                cmd.arg("-x")
                    .arg("--audio-format")
                    .arg("mp3")
                    .arg("--audio-quality")
                    .arg(format!("{}K", bitrate))
                    .arg("--embed-metadata")
                    .arg("--embed-thumbnail");
            }
            MediaFormat::Video => {
                cmd.arg("--merge-output-format")
                    .arg("mp4")
                    .arg("--embed-metadata");
            }
        }

        if !req.postprocessor_args.is_empty() {
            cmd.arg("--postprocessor-args")
                .arg(format!("ffmpeg:{}", req.postprocessor_args.join(" ")));
        }

        if req.use_accelerator && self.accelerator_available() {
            cmd.arg("--downloader")
                .arg("aria2c")
                .arg("--downloader-args")
                .arg("aria2c:-x 16 -s 16 -k 1M");
        }

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    fn cleanup(&self, dir: &Path, state: &RunState) {
        if self.cfg.keep_partial {
            return;
        }
        cleanup_artifacts(dir, state.cleanup_stem().as_deref());
    }
}

#[async_trait]
impl Fetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        spec: FetchSpec,
        mut ctl: watch::Receiver<DesiredState>,
        progress: ProgressHandle,
    ) -> FetchOutcome {
        match *ctl.borrow() {
            DesiredState::Cancel => return FetchOutcome::Cancelled,
            DesiredState::Skip => return FetchOutcome::Skipped,
            _ => {}
        }

        let req = &spec.request;
        if !req.url.starts_with("http://") && !req.url.starts_with("https://") {
            warn!(id = %spec.id, url = %req.url, "rejecting non-http url");
            return FetchOutcome::Fatal(FailureKind::InvalidInput);
        }
        if let Err(e) = fs::create_dir_all(&req.output_dir) {
            error!(id = %spec.id, "cannot create output directory: {}", e);
            return FetchOutcome::Fatal(FailureKind::DiskWrite);
        }

        let mut cmd = self.build_command(&spec);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(id = %spec.id, "failed to spawn fetch tool: {}", e);
                return FetchOutcome::Fatal(FailureKind::Internal);
            }
        };
        debug!(id = %spec.id, attempt = spec.attempt + 1, "fetch process started");

        // --- Output Handling ---

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill().await;
            return FetchOutcome::Fatal(FailureKind::Internal);
        };
        let Some(stderr) = child.stderr.take() else {
            let _ = child.kill().await;
            return FetchOutcome::Fatal(FailureKind::Internal);
        };

        let (tx, mut rx) = mpsc::channel::<String>(100);

        let tx_out = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx_out.send(line).await.is_err() {
                    break;
                }
            }
        });

        let tx_err = tx.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx_err.send(line).await.is_err() {
                    break;
                }
            }
        });

        drop(tx);

        let mut state = RunState::default();
        let mut captured_logs: Vec<String> = Vec::new();
        let mut paused = false;

        let stall_timeout = self.cfg.stall_timeout;
        let stall = tokio::time::sleep(stall_timeout);
        tokio::pin!(stall);

        loop {
            tokio::select! {
                maybe_line = rx.recv() => {
                    match maybe_line {
                        Some(line) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            captured_logs.push(trimmed.to_string());
                            if captured_logs.len() > 50 {
                                captured_logs.remove(0);
                            }
                            stall.as_mut().reset(Instant::now() + stall_timeout);
                            if let Some(update) = state.interpret_line(trimmed) {
                                progress.update(update);
                            }
                        }
                        None => break,
                    }
                }
                changed = ctl.changed() => {
                    let desired = if changed.is_ok() {
                        *ctl.borrow_and_update()
                    } else {
                        // Control side dropped: the engine is tearing down.
                        DesiredState::Cancel
                    };
                    match desired {
                        DesiredState::Run => {
                            #[cfg(unix)]
                            if paused {
                                if let Some(pid) = child.id() {
                                    send_signal(pid, nix::sys::signal::Signal::SIGCONT);
                                }
                                paused = false;
                                stall.as_mut().reset(Instant::now() + stall_timeout);
                            }
                        }
                        DesiredState::Pause => {
                            #[cfg(unix)]
                            {
                                if let Some(pid) = child.id() {
                                    send_signal(pid, nix::sys::signal::Signal::SIGSTOP);
                                }
                                paused = true;
                            }
                            #[cfg(not(unix))]
                            {
                                // No native suspension: tear the process
                                // down and let the engine re-dispatch from
                                // the partial file.
                                let _ = child.kill().await;
                                return FetchOutcome::Interrupted;
                            }
                        }
                        DesiredState::Cancel | DesiredState::Skip => {
                            #[cfg(unix)]
                            if paused {
                                if let Some(pid) = child.id() {
                                    send_signal(pid, nix::sys::signal::Signal::SIGCONT);
                                }
                            }
                            let _ = child.kill().await;
                            self.cleanup(&req.output_dir, &state);
                            return if desired == DesiredState::Skip {
                                FetchOutcome::Skipped
                            } else {
                                FetchOutcome::Cancelled
                            };
                        }
                    }
                }
                () = &mut stall, if !paused => {
                    warn!(id = %spec.id, "no output for {:?}, treating as stalled", stall_timeout);
                    let _ = child.kill().await;
                    self.cleanup(&req.output_dir, &state);
                    return FetchOutcome::Recoverable(FailureKind::StalledTransfer);
                }
            }
        }

        // --- Process Result ---

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                error!(id = %spec.id, "failed to reap fetch process: {}", e);
                return FetchOutcome::Fatal(FailureKind::Internal);
            }
        };

        if status.success() {
            return FetchOutcome::Success(state.final_path.clone());
        }

        let context = captured_logs.join("\n");
        let kind = classify_failure(&context);
        debug!(
            id = %spec.id,
            code = status.code().unwrap_or(-1),
            ?kind,
            "fetch process failed"
        );
        self.cleanup(&req.output_dir, &state);
        if kind.is_recoverable() {
            FetchOutcome::Recoverable(kind)
        } else {
            FetchOutcome::Fatal(kind)
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::{sys::signal, unistd::Pid};
    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), signal) {
        warn!("failed to send {:?} to process {}: {}", signal, pid, e);
    }
}

// --- Stream Interpretation ---

/// Accumulated view of one attempt's output stream.
#[derive(Debug, Default)]
struct RunState {
    percent: f64,
    bytes_total: Option<u64>,
    speed: Option<String>,
    eta: Option<String>,
    phase: Option<String>,
    final_path: Option<PathBuf>,
}

impl RunState {
    fn interpret_line(&mut self, line: &str) -> Option<ProgressUpdate> {
        if let Some(caps) = METADATA_REGEX.captures(line) {
            if let Some(f) = caps.name("filename") {
                self.final_path = Some(PathBuf::from(f.as_str()));
            }
            self.phase = Some("Writing Metadata".to_string());
            if self.percent < 100.0 {
                self.percent = 99.0;
            }
        } else if THUMBNAIL_REGEX.is_match(line) {
            self.phase = Some("Embedding Thumbnail".to_string());
            if self.percent < 100.0 {
                self.percent = 99.0;
            }
        } else if let Some(caps) = MERGER_REGEX.captures(line) {
            if let Some(f) = caps.name("filename") {
                self.final_path = Some(PathBuf::from(f.as_str()));
            }
            self.phase = Some("Merging Formats".to_string());
            self.percent = 100.0;
            self.eta = Some("Done".to_string());
        } else if let Some(caps) = EXTRACT_AUDIO_REGEX.captures(line) {
            if let Some(f) = caps.name("filename") {
                self.final_path = Some(PathBuf::from(f.as_str()));
            }
            self.phase = Some("Extracting Audio".to_string());
            self.percent = 100.0;
            self.eta = Some("Done".to_string());
        } else if FIXUP_REGEX.is_match(line) {
            self.phase = Some("Fixing Container".to_string());
        } else if let Some(caps) = ALREADY_DOWNLOADED_REGEX.captures(line) {
            if let Some(f) = caps.name("filename") {
                self.final_path = Some(PathBuf::from(f.as_str()));
            }
            self.phase = Some("Finished".to_string());
            self.percent = 100.0;
            self.eta = Some("Done".to_string());
        } else if let Some(caps) = DESTINATION_REGEX.captures(line) {
            if let Some(f) = caps.name("filename") {
                self.final_path = Some(PathBuf::from(f.as_str()));
            }
            self.phase = Some("Downloading".to_string());
        } else if let Some(caps) = PROGRESS_REGEX.captures(line) {
            let percentage = caps
                .name("percentage")
                .and_then(|m| m.as_str().parse::<f64>().ok())?;
            self.percent = percentage;
            if let Some(size) = caps.name("size") {
                if let Some(total) = parse_size(size.as_str()) {
                    self.bytes_total = Some(total);
                }
            }
            if let Some(speed) = caps.name("speed") {
                let s = speed.as_str();
                if s != "Unknown" && !s.contains("N/A") {
                    self.speed = Some(s.to_string());
                }
            }
            if let Some(eta) = caps.name("eta") {
                let e = eta.as_str();
                if e != "Unknown" {
                    self.eta = Some(e.to_string());
                }
            }
            let in_postprocess = matches!(
                self.phase.as_deref(),
                Some("Merging Formats" | "Extracting Audio" | "Writing Metadata" | "Embedding Thumbnail")
            );
            if !in_postprocess {
                self.phase = Some("Downloading".to_string());
            }
        } else {
            return None;
        }

        let bytes_downloaded = self
            .bytes_total
            .map(|total| ((total as f64) * self.percent / 100.0) as u64);
        Some(ProgressUpdate {
            percent: Some(self.percent),
            bytes_downloaded,
            bytes_total: self.bytes_total,
            speed: self.speed.clone(),
            eta: self.eta.clone(),
            phase: self.phase.clone(),
        })
    }

    /// Filename stem used to match partial-download leftovers, with the
    /// intermediate stream suffix stripped.
    fn cleanup_stem(&self) -> Option<String> {
        let path = self.final_path.as_ref()?;
        let stem = path.file_stem()?.to_string_lossy();
        Some(FRAGMENT_STEM_REGEX.replace(&stem, "").to_string())
    }
}

/// Removes partial output of a failed attempt so a retry never merges a
/// corrupt file.
fn cleanup_artifacts(dir: &Path, stem: Option<&str>) {
    let Some(stem) = stem else { return };
    let Ok(entries) = fs::read_dir(dir) else { return };
    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(stem) {
            continue;
        }
        let rest = &name[stem.len()..];
        let leftover =
            ARTIFACT_SUFFIXES.iter().any(|s| rest.ends_with(s)) || rest.starts_with(".f");
        if leftover && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
            debug!("cleanup: removed {:?}", entry.path());
        }
    }
    if removed > 0 {
        info!("cleanup: removed {} partial artifact(s) for {:?}", removed, stem);
    }
}

/// Failure classification from the fetch tool's captured output, per the
/// engine's error taxonomy.
pub fn classify_failure(log: &str) -> FailureKind {
    let text = log.to_lowercase();

    if text.contains("requested format is not available")
        || text.contains("format is not available")
        || text.contains("no video formats")
    {
        FailureKind::FormatUnavailable
    } else if text.contains("ffmpeg not found")
        || text.contains("ffmpeg is not installed")
        || text.contains("ffprobe")
        || text.contains("postprocessing")
    {
        FailureKind::MergeCodecMissing
    } else if text.contains("is not a valid url")
        || text.contains("unsupported url")
        || text.contains("invalid url")
        || text.contains("http error 404")
        || text.contains("video unavailable")
    {
        FailureKind::InvalidInput
    } else if text.contains("sign in")
        || text.contains("login required")
        || text.contains("http error 403")
        || text.contains("access denied")
        || text.contains("private video")
        || text.contains("not available in your country")
    {
        FailureKind::AccessDenied
    } else if text.contains("no space left")
        || text.contains("permission denied")
        || text.contains("read-only file system")
        || text.contains("disk full")
    {
        FailureKind::DiskWrite
    } else {
        // Timeouts, connection resets, DNS hiccups and anything we cannot
        // name: worth another attempt.
        FailureKind::TransientNetwork
    }
}

/// Parses a human size such as "1.23MiB" or "~512.00KiB" into bytes.
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().trim_start_matches('~');
    let pos = s.find(|c: char| c.is_ascii_alphabetic())?;
    let (num, unit) = s.split_at(pos);
    let value: f64 = num.parse().ok()?;
    let mult: f64 = match unit.trim_end_matches("/s") {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        _ => return None,
    };
    Some((value * mult) as u64)
}

// --- Playlist Probing ---

/// Expands a URL into its playlist entries (or a single entry for a plain
/// video URL) without downloading anything.
pub async fn probe_playlist(yt_dlp: &Path, url: &str) -> Result<Vec<PlaylistEntry>, EngineError> {
    let mut cmd = Command::new(yt_dlp);
    cmd.arg("--flat-playlist")
        .arg("--dump-single-json")
        .arg("--no-warnings")
        .arg(url)
        .stdin(Stdio::null());

    let output = tokio::time::timeout(Duration::from_secs(30), cmd.output())
        .await
        .map_err(|_| EngineError::ValidationFailed("playlist probe timed out".into()))??;

    if !output.status.success() {
        return Err(EngineError::ProcessFailed {
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    let parsed: serde_json::Value = serde_json::from_str(&String::from_utf8_lossy(&output.stdout))?;

    let mut entries = Vec::new();
    if let Some(entries_arr) = parsed.get("entries").and_then(|e| e.as_array()) {
        for entry in entries_arr {
            if let Some(u) = entry.get("url").and_then(|s| s.as_str()) {
                entries.push(PlaylistEntry {
                    id: entry
                        .get("id")
                        .and_then(|s| s.as_str())
                        .map(|s| s.to_string()),
                    url: u.to_string(),
                    title: entry
                        .get("title")
                        .and_then(|s| s.as_str())
                        .unwrap_or("Unknown")
                        .to_string(),
                });
            }
        }
    } else {
        // Single video fallback.
        entries.push(PlaylistEntry {
            id: parsed
                .get("id")
                .and_then(|s| s.as_str())
                .map(|s| s.to_string()),
            url: parsed
                .get("webpage_url")
                .and_then(|s| s.as_str())
                .unwrap_or(url)
                .to_string(),
            title: parsed
                .get("title")
                .and_then(|s| s.as_str())
                .unwrap_or("Unknown")
                .to_string(),
        });
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_progress_line() {
        let mut state = RunState::default();
        let update = state
            .interpret_line("[download]  12.3% of ~1.00MiB at 5.55MiB/s ETA 00:18")
            .unwrap();
        assert_eq!(update.percent, Some(12.3));
        assert_eq!(update.bytes_total, Some(1024 * 1024));
        assert_eq!(update.bytes_downloaded, Some(128974));
        assert_eq!(update.speed.as_deref(), Some("5.55MiB/s"));
        assert_eq!(update.eta.as_deref(), Some("00:18"));
        assert_eq!(update.phase.as_deref(), Some("Downloading"));
    }

    #[test]
    fn destination_line_sets_final_path() {
        let mut state = RunState::default();
        state
            .interpret_line("[download] Destination: /tmp/A Title.f137.mp4")
            .unwrap();
        assert_eq!(
            state.final_path.as_deref(),
            Some(Path::new("/tmp/A Title.f137.mp4"))
        );
        assert_eq!(state.cleanup_stem().as_deref(), Some("A Title"));
    }

    #[test]
    fn merger_line_marks_completion() {
        let mut state = RunState::default();
        let update = state
            .interpret_line(r#"[Merger] Merging formats into "/tmp/A Title.mp4""#)
            .unwrap();
        assert_eq!(update.percent, Some(100.0));
        assert_eq!(update.phase.as_deref(), Some("Merging Formats"));
        assert_eq!(state.final_path.as_deref(), Some(Path::new("/tmp/A Title.mp4")));
    }

    #[test]
    fn progress_during_postprocess_keeps_phase() {
        let mut state = RunState::default();
        state
            .interpret_line(r#"[Merger] Merging formats into "/tmp/x.mp4""#)
            .unwrap();
        let update = state
            .interpret_line("[download]  99.0% of 1.00MiB at 1.00MiB/s ETA 00:01")
            .unwrap();
        assert_eq!(update.phase.as_deref(), Some("Merging Formats"));
    }

    #[test]
    fn unrelated_lines_produce_no_update() {
        let mut state = RunState::default();
        assert!(state.interpret_line("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn classifies_recoverable_failures() {
        assert_eq!(
            classify_failure("ERROR: Requested format is not available"),
            FailureKind::FormatUnavailable
        );
        assert_eq!(
            classify_failure("ERROR: unable to download video data: The read operation timed out"),
            FailureKind::TransientNetwork
        );
        assert_eq!(
            classify_failure("ERROR: ffmpeg not found. Please install"),
            FailureKind::MergeCodecMissing
        );
    }

    #[test]
    fn classifies_fatal_failures() {
        assert_eq!(
            classify_failure("ERROR: 'not-a-url' is not a valid URL"),
            FailureKind::InvalidInput
        );
        assert_eq!(
            classify_failure("ERROR: Sign in to confirm your age"),
            FailureKind::AccessDenied
        );
        assert_eq!(
            classify_failure("OSError: No space left on device"),
            FailureKind::DiskWrite
        );
    }

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("1.00MiB"), Some(1024 * 1024));
        assert_eq!(parse_size("~512.00KiB"), Some(512 * 1024));
        assert_eq!(parse_size("2GB"), Some(2_000_000_000));
        assert_eq!(parse_size("garbage"), None);
    }

    #[test]
    fn cleanup_removes_only_partial_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let make = |name: &str| fs::write(dir.path().join(name), b"x").unwrap();
        make("A Title.mp4.part");
        make("A Title.f137.mp4");
        make("A Title.webp");
        make("A Title.mp4");
        make("Other.mp4.part");

        cleanup_artifacts(dir.path(), Some("A Title"));

        assert!(!dir.path().join("A Title.mp4.part").exists());
        assert!(!dir.path().join("A Title.f137.mp4").exists());
        assert!(!dir.path().join("A Title.webp").exists());
        assert!(dir.path().join("A Title.mp4").exists());
        assert!(dir.path().join("Other.mp4.part").exists());
    }
}
