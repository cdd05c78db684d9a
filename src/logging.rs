use std::fs;

use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::paths;

/// Initializes the tracing subscriber with layered output:
/// 1. Stderr: human-readable, filtered by `RUST_LOG` or a verbosity default.
/// 2. File: full JSON debug logs to `data/logs/run-<id>.log` when a run id is
///    supplied, so a run leaves a diagnosable trail.
///
/// Returns a WorkerGuard that must be held by main() so file logs are flushed.
pub fn init(
    verbose: bool,
    run_id: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_env_filter(verbose));

    let (file_layer, guard) = if let Some(id) = run_id {
        let log_dir = paths::log_dir();
        if let Err(error) = fs::create_dir_all(&log_dir) {
            eprintln!(
                "Warning: failed to create log dir {}: {error}",
                log_dir.display()
            );
            (None, None)
        } else {
            let file_appender = tracing_appender::rolling::never(&log_dir, format!("run-{id}.log"));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer = fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(Targets::new().with_default(tracing::Level::DEBUG));

            (Some(layer), Some(guard))
        }
    } else {
        (None, None)
    };

    let stderr_layer: Box<dyn Layer<Registry> + Send + Sync> = if verbose {
        Box::new(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_target(false)
                .with_filter(stderr_filter),
        )
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}

fn default_env_filter(verbose: bool) -> EnvFilter {
    let spec = if verbose {
        "promptbatch=debug,info"
    } else {
        "promptbatch=info,warn"
    };
    EnvFilter::new(spec)
}
