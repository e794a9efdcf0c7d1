use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Initializes the global `tracing` subscriber once at daemon startup, grounded on the
/// teacher's `utils::setup_logging`: an `EnvFilter` defaulting to `info`, a compact
/// human-readable formatter carrying target/thread-id/file/line.
pub fn setup_logging() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_file(true)
                .compact(),
        )
        .with(env_filter)
        .init();

    Ok(())
}
