use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes logging with a console layer and a daily-rotated JSON file layer.
///
/// `RUST_LOG` overrides the default filter (`info` for the library and the
/// calling binary). The returned guard flushes the file writer when dropped,
/// so binaries keep it alive in `main`.
pub fn init_logging(service: &str, log_dir: &str) -> WorkerGuard {
    let _ = fs::create_dir_all(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{}.log", service));
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_target(false).with_writer(std::io::stdout);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("noa_cobros=info,{}=info", service.replace('-', "_"))));

    // try_init: a second call (tests, embedded use) keeps the first subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init();

    guard
}
