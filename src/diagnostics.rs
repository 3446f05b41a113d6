//! Console diagnostic stream.
//!
//! The engine reports patch installation, degraded installs, callback failures and rejected
//! class definitions as [`tracing`] events under the `classweave` target. Inside a host that has
//! no subscriber of its own, [`init_console`] routes them to stderr.
//!
//! The output is informational only and not a stable, machine-parseable format.

use tracing_subscriber::EnvFilter;

/// Environment variable holding an [`EnvFilter`] directive, e.g. `classweave=debug`.
pub const LOG_ENV: &str = "CLASSWEAVE_LOG";

/// Filter used when [`LOG_ENV`] is unset or invalid.
pub const DEFAULT_FILTER: &str = "classweave=info";

/// Installs a stderr `fmt` subscriber as the global default.
///
/// Returns `false` when a global subscriber was already installed, either by the embedder or
/// by an earlier call. The existing subscriber is left untouched in that case.
pub fn init_console() -> bool {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .is_ok()
}
