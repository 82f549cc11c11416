use std::path::Path;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use vmlet_shared::errors::{VmletError, VmletResult};

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

/// `RUST_LOG`, or `info`.
pub fn env_filter() -> VmletResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| VmletError::Config(format!("bad log filter: {}", e)))
}

/// Log to `{logs_dir}/{file_name}` with daily rotation.
///
/// The returned guard flushes the background writer when dropped; keep it
/// alive for the life of the process.
pub fn init_logging(logs_dir: &Path, file_name: &str) -> VmletResult<WorkerGuard> {
    std::fs::create_dir_all(logs_dir).map_err(|e| {
        VmletError::Storage(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    register_to_tracing(non_blocking, env_filter()?);
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_creates_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let logs = tmp.path().join("logs");
        let guard = init_logging(&logs, "test.log").unwrap();
        tracing::info!("hello");
        drop(guard);
        assert!(logs.is_dir());
    }
}
