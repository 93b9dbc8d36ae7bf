//! Process-wide logging setup.
//!
//! Pipeline processes run under a supervisor that scrapes JSON logs, so JSON
//! is the default; `LOG_FORMAT=text` switches to the human-readable form for
//! local runs. The filter comes from `RUST_LOG` (default `info`).

use tracing_subscriber::EnvFilter;

/// Initialize logging for the named component.
///
/// `service` tags the first line of every process so interleaved logs from
/// the pipeline daemons stay attributable. Safe to call multiple times
/// (subsequent calls are no-ops).
pub fn init(service: &'static str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let text = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("text"))
        .unwrap_or(false);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if text {
        builder.try_init()
    } else {
        builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .try_init()
    };

    if installed.is_ok() {
        tracing::info!(service, "logging initialized");
    }
}
