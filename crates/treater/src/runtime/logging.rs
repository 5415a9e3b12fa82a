use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber with optional JSON output and an
/// optional daily-rolling log file. Records from the `log` facade are
/// forwarded too. Keep the returned guard alive to flush the file writer.
pub fn init_tracing(json_output: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,treater=debug,treat_core=debug,treat_io=debug")
    });

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "treater.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let base = tracing_subscriber::registry().with(filter).with(file_layer);
    if json_output {
        base.with(fmt::layer().json()).init();
    } else {
        base.with(fmt::layer().pretty()).init();
    }
    guard
}
