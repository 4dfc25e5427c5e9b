//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::EnvFilter;

/// Environment variable which, when set, turns on debug output by default.
pub const DEBUG_ENV: &str = "DEBUG_M2SQ";

/// Initialize tracing with the default configuration.
///
/// Output goes to stderr.  `RUST_LOG` takes precedence; otherwise
/// `level` is used, falling back to `warn` (or `debug` if [`DEBUG_ENV`] is set).
pub fn initialize_tracing(level: Option<&str>) {
    let default = level.unwrap_or_else(|| {
        if std::env::var_os(DEBUG_ENV).is_some() {
            "debug"
        } else {
            "warn"
        }
    });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    // Don't fail if a subscriber was already installed (e.g. in tests).
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .try_init();
}
