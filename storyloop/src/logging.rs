//! stderr diagnostics.
//!
//! storyloop writes to two places. The event channel (see `io::emitter`) is
//! the protocol: JSON lines on stdout or the `--output` file, written no matter
//! what `RUST_LOG` says. Everything in this module is commentary for a human
//! watching the terminal, and a monitor must never parse it for run state.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "storyloop=info";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber: compact lines on stderr.
///
/// `RUST_LOG=storyloop=debug` also shows every emitted event kind and each
/// tool detail as it streams.
pub fn init() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
