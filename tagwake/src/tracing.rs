//! Logging setup.
//!
//! Modules import the macros through [`prelude`] so the backing facade can
//! change in one place.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

const DEFAULT_DIRECTIVE: &str = "tagwake=info";

/// Install the global subscriber.
///
/// Logs go to the systemd journal when the process was started by systemd
/// (detected via `JOURNAL_STREAM`), and to stderr otherwise. `RUST_LOG`
/// overrides the default filter.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    if std::env::var_os("JOURNAL_STREAM").is_some() {
        match tracing_journald::layer() {
            Ok(journald) => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(journald)
                    .init();
                return;
            }
            Err(e) => eprintln!("journald unavailable, logging to stderr: {e}"),
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_timer(fmt::time::LocalTime::rfc_3339()),
        )
        .init();
}
