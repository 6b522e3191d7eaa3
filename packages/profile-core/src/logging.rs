//! Tracing setup for binaries and tests that embed the profile core.

/// Default filter when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,profile_core=debug";

/// Install a fmt subscriber filtered by `RUST_LOG`
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .try_init();
}
