//! Subscriber setup for binaries and tests embedding the pilot crates.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, with `default_level`
/// applied on top. Returns `false` if a global subscriber was already set.
pub fn init(default_level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_target(false)
        .try_init()
        .is_ok()
}
