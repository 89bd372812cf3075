//! Tracing setup for the gt binary.

use tracing_subscriber::EnvFilter;

/// Guard returned by [`init`]; keep it alive for the process lifetime.
pub struct Telemetry;

/// Initialise the tracing subscriber once. Respects `GT_LOG` (env-filter
/// syntax), defaulting to warnings only so command output stays clean.
pub fn init() -> Telemetry {
    let filter = EnvFilter::try_from_env("GT_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));

    // Ignore the error if a subscriber is already installed (tests).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    Telemetry
}
