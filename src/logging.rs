//! Logging setup: stderr plus a daily rolling file.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global subscriber.
///
/// Both outputs use RUST_LOG when set, `default_level` otherwise. Stdout is
/// left to command output. The returned guard flushes the file writer and
/// must live until the program exits.
pub fn init(default_level: &str, log_dir: &Path) -> WorkerGuard {
  let file_appender = tracing_appender::rolling::daily(log_dir, "offcache.log");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .with_filter(env_filter(default_level)),
    )
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(env_filter(default_level)),
    )
    .init();

  guard
}

fn env_filter(default_level: &str) -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
