use std::fs;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

use crate::config::app_dir;

pub type LogHandle = reload::Handle<EnvFilter, Registry>;

pub struct LogManager {
    // The guard must stay alive or file logging stops immediately.
    _guard: WorkerGuard,
    // Allows swapping the filter (log level) at runtime.
    reload_handle: LogHandle,
}

impl LogManager {
    pub fn init(log_level: &str) -> Self {
        let log_dir = app_dir().join("logs");

        if !log_dir.exists() {
            let _ = fs::create_dir_all(&log_dir);
        }

        let file_appender = tracing_appender::rolling::daily(&log_dir, "engine.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // JSON file layer plus pretty console layer, behind one reloadable
        // filter.
        let file_layer = fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);

        let stdout_layer = fmt::layer().pretty().with_writer(std::io::stdout);

        let initial_filter =
            EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

        let (filter_layer, reload_handle) = reload::Layer::new(initial_filter);

        tracing_subscriber::registry()
            .with(filter_layer)
            .with(file_layer)
            .with(stdout_layer)
            .init();

        info!("Logging initialized at level: {}", log_level);
        info!("Log directory: {:?}", log_dir);

        Self {
            _guard: guard,
            reload_handle,
        }
    }

    pub fn set_level(&self, level: &str) -> Result<(), String> {
        let new_filter = EnvFilter::try_new(level)
            .map_err(|e| format!("Invalid log level '{}': {}", level, e))?;

        self.reload_handle
            .reload(new_filter)
            .map_err(|e| format!("Failed to reload log level: {}", e))?;

        info!("Log level dynamically changed to: {}", level);
        Ok(())
    }
}
