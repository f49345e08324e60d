use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// --- Configuration Structs ---

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EngineConfig {
    /// Fixed worker pool size.
    pub workers: usize,
    /// Maximum total attempts per job, first try included.
    pub retry_ceiling: u32,
    /// No fetch-tool output for this long counts as a stalled transfer.
    pub stall_timeout_secs: u64,
    /// Keep partial output files of cancelled jobs instead of deleting them.
    pub keep_partial: bool,
    /// Poll interval while dispatch is held for reachability.
    pub reachability_poll_secs: u64,
    /// Buffered capacity of the progress broadcast channel.
    pub progress_capacity: usize,
    pub yt_dlp_path: PathBuf,
    pub aria2c_path: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry_ceiling: 3,
            stall_timeout_secs: 60,
            keep_partial: false,
            reachability_poll_secs: 5,
            progress_capacity: 256,
            yt_dlp_path: PathBuf::from("yt-dlp"),
            aria2c_path: PathBuf::from("aria2c"),
            ffmpeg_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn reachability_poll(&self) -> Duration {
        Duration::from_secs(self.reachability_poll_secs)
    }
}

/// Root directory for config, logs and history.
pub fn app_dir() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".downpour")
}

// --- Manager ---

pub struct ConfigManager {
    config: Mutex<EngineConfig>,
    file_path: PathBuf,
}

impl ConfigManager {
    pub fn new() -> Self {
        let config_dir = app_dir();
        let file_path = config_dir.join("config.json");

        if !config_dir.exists() {
            let _ = fs::create_dir_all(&config_dir);
        }

        let config = Self::load_from_disk(&file_path).unwrap_or_default();

        Self {
            config: Mutex::new(config),
            file_path,
        }
    }

    fn load_from_disk(path: &PathBuf) -> Option<EngineConfig> {
        if !path.exists() {
            return None;
        }

        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str::<EngineConfig>(&content) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                tracing::warn!("Error parsing config.json: {}. Using defaults.", e);
                let _ = fs::rename(path, path.with_extension("json.bak"));
                None
            }
        }
    }

    pub fn save(&self) -> Result<(), crate::core::error::EngineError> {
        let config = self.config.lock().unwrap();
        let json = serde_json::to_string_pretty(&*config)?;
        fs::write(&self.file_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> EngineConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn update(&self, config: EngineConfig) {
        let mut cfg = self.config.lock().unwrap();
        *cfg = config;
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
