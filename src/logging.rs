//! Diagnostic tracing for the orchestrator.
//!
//! Tracing is for operators: stderr output filtered by `RUST_LOG`, plus a
//! daily-rolled JSON log under `.shipwright/logs/` when that directory exists.
//! Outcome records and the run state are product artifacts written by
//! `audit` and `orchestrator::state`, unaffected by the filter.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FILE_PREFIX: &str = "shipwright.log";

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "info" } else { "warn" }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. Calling this twice is harmless: the second
/// installation is ignored.
pub fn init(verbose: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let stderr = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(filter);

    match log_dir.filter(|dir| dir.is_dir()) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(EnvFilter::new("info"));
            let _ = tracing_subscriber::registry()
                .with(stderr)
                .with(file)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::registry().with(stderr).try_init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_raises_default_level() {
        assert_eq!(default_directive(false), "warn");
        assert_eq!(default_directive(true), "info");
    }
}
