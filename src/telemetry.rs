//! Structured logging setup.
//!
//! Priority for the filter: `RUST_LOG` > configured `log_level` > "info".
//! Human-readable output goes to stderr; when a log directory is given, a
//! JSON copy of every event is appended to `<log_dir>/pipeline.log`.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_NAME: &str = "pipeline.log";

/// Initialize the global subscriber. The returned guard must be held for the
/// life of the process so buffered file output is flushed on exit.
pub fn init_telemetry(log_level: &str, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_filter = format!("warn,remediate={}", log_level);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact();

    match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .with(fmt::layer().json().with_current_span(true).with_writer(writer))
                .try_init()
                .ok();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stderr_layer)
                .try_init()
                .ok();
            None
        }
    }
}
