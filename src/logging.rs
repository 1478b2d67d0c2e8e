//! Tracing setup shared by the two entry points.
//!
//! `run` passes the log directory: the supervisor, the management channel
//! and the control server then log at `info` to stderr, and to
//! `<logs>/vm-supervisor.log` when `VMSUP_LOG=1`. `ctl` passes `None` and
//! only surfaces warnings. `RUST_LOG` overrides either default.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FILE: &str = "vm-supervisor.log";
const FILE_LOG_ENV: &str = "VMSUP_LOG";

/// Keeps the file writer alive; dropping it flushes buffered lines.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Default directive when `RUST_LOG` is unset.
fn default_directive(log_dir: Option<&Path>) -> &'static str {
    match log_dir {
        Some(_) => "info",
        None => "warn",
    }
}

pub fn init(log_dir: Option<&Path>) -> LogGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(log_dir)));

    let file_enabled = std::env::var(FILE_LOG_ENV).as_deref() == Ok("1");
    let (file_layer, file_guard) = match log_dir.filter(|_| file_enabled) {
        Some(dir) => {
            let _ = std::fs::create_dir_all(dir);
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE));
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    LogGuard {
        _file_guard: file_guard,
    }
}
