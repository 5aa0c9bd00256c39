//! Ambient structured logging. A thin convenience wrapper around
//! `tracing-subscriber`/`tracing-appender` — the loop itself only ever calls
//! `tracing::{trace,debug,warn}!`, this module just gives applications embedding the
//! loop a one-call way to wire those events to stdout or a rolling log file.
//!
//! Logging is **disabled** until one of the functions here is called; embedding
//! applications that already run their own subscriber should simply not call this
//! module at all.

use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Where log events should go.
#[derive(Debug, Clone)]
pub enum LogTarget {
    Stdout,
    /// Rolling daily file under `directory`, with the given file-name prefix.
    File { directory: String, prefix: String },
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub target: LogTarget,
    /// Anything accepted by `tracing_subscriber::EnvFilter`, e.g. `"reactor_loop=debug"`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { target: LogTarget::Stdout, filter: "info".to_string() }
    }
}

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs a global subscriber per `config`. Idempotent: subsequent calls are no-ops,
/// since `tracing::subscriber::set_global_default` can only succeed once per process.
/// Returns the `tracing-appender` worker guard when logging to a file — callers must
/// keep it alive for the process lifetime or buffered lines are lost on drop.
pub fn init_global(config: LoggingConfig) -> Option<WorkerGuard> {
    let mut guard = None;
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));
        match config.target {
            LogTarget::Stdout => {
                let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            }
            LogTarget::File { directory, prefix } => {
                let appender = tracing_appender::rolling::daily(directory, prefix);
                let (writer, worker_guard) = tracing_appender::non_blocking(appender);
                let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).try_init();
                guard = Some(worker_guard);
            }
        }
    });
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_targets_stdout_at_info() {
        let config = LoggingConfig::default();
        assert!(matches!(config.target, LogTarget::Stdout));
        assert_eq!(config.filter, "info");
    }
}
