//! # Tracing Setup
//!
//! Installs the process-wide `tracing` subscriber.
//!
//! Filter comes from `RUST_LOG`; without it the engine logs at debug and
//! everything else at info.

use tracing_subscriber::EnvFilter;

/// Default directives when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,tally=debug,tally_sync=debug,sqlx=warn";

/// Initializes the fmt subscriber.
///
/// Returns false if a global subscriber was already installed (tests, or a
/// host application that sets up its own).
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_tracing();
        assert!(!init_tracing());
    }
}
