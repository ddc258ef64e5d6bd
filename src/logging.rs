//! Diagnostic logging on stderr.
//!
//! `RUST_LOG` selects the filter (default `timeport=warn`); set
//! `TIMEPORT_LOG_FORMAT=json` for one JSON object per event. Command results
//! go to stdout, so logs never mix with them.

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "timeport=warn";

fn json_requested() -> bool {
    std::env::var("TIMEPORT_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json_requested() {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}
