//! Logging configuration for the interop runtime
//!
//! The runtime logs through the `log` facade. Binaries and tests pick a
//! backend here; `env_logger` is the default.
//!
//! # Usage
//!
//! ```rust,ignore
//! use interop_runtime::logging;
//!
//! // Initialize with default level (Warn)
//! logging::init();
//!
//! // Or initialize from RUST_LOG environment variable
//! logging::init_from_env();
//!
//! // Or initialize with a specific level
//! logging::init_with_level(log::LevelFilter::Debug);
//! ```
//!
//! # Log Levels
//!
//! - `error!` - Binding failures at the C boundary
//! - `warn!` - Manifest symbols that failed to resolve
//! - `info!` - Manifest loading and binding summaries
//! - `debug!` - Table construction and trampoline resolution
//! - `trace!` - Individual token and symbol lookups
//!
//! # Environment Variable
//!
//! ```bash
//! RUST_LOG=debug interop check bindings.json
//! RUST_LOG=interop_runtime::trampoline=trace interop check bindings.json
//! ```

use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize logging with sensible defaults (Warn level).
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Warn);
}

/// Initialize logging with a specific level.
///
/// This only initializes once; subsequent calls are no-ops.
pub fn init_with_level(level: LevelFilter) {
    INIT.call_once(|| {
        let _ = Builder::new()
            .filter_level(level)
            .format(|buf, record| {
                writeln!(
                    buf,
                    "[{:5}] {} - {}",
                    record.level(),
                    record.target(),
                    record.args()
                )
            })
            .try_init();
    });
}

/// Initialize logging from the RUST_LOG environment variable.
///
/// If RUST_LOG is not set, defaults to Warn level.
pub fn init_from_env() {
    INIT.call_once(|| {
        let _ = Builder::from_env(env_logger::Env::default().default_filter_or("warn")).try_init();
    });
}

/// Initialize logging for tests.
///
/// Output is captured by the test harness.
pub fn init_test() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Warn)
        .is_test(true)
        .try_init();
}

/// Whether one of the `init*` functions other than `init_test` has run.
pub fn is_initialized() -> bool {
    INIT.is_completed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test();
        init_test();
        init_test();
    }

    #[test]
    fn test_init_marks_initialized() {
        init_test();
        init();
        init_with_level(LevelFilter::Debug);
        assert!(is_initialized());
    }
}
