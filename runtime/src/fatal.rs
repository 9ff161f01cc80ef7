//! Binding failures at the C boundary
//!
//! Generated trampolines have no error channel back to native callers, so a
//! failure to bind there is reported here and ends the process. Library
//! code returns [`BindError`] instead and never comes through this module.

use std::sync::atomic::{AtomicU64, Ordering};

use log::error;

use crate::error::BindError;

/// Global counter for reported binding failures
static BINDING_FAILURE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Log a binding failure and return its sequence number (starting at 1).
pub fn report_failure(err: &BindError, site: &str) -> u64 {
    let count = BINDING_FAILURE_COUNT.fetch_add(1, Ordering::SeqCst) + 1;
    error!("[BINDING FAILURE #{:04}] {} in {}", count, err, site);
    count
}

/// Total number of binding failures reported so far
pub fn failure_count() -> u64 {
    BINDING_FAILURE_COUNT.load(Ordering::SeqCst)
}

/// Report `err` and terminate.
///
/// Aborts the process, or panics when the `panic-on-binding-failure`
/// feature is enabled.
#[cold]
pub fn binding_failure(err: &BindError, site: &str) -> ! {
    let count = report_failure(err, site);

    #[cfg(feature = "panic-on-binding-failure")]
    {
        panic!("binding failure #{} in {}: {}", count, site, err);
    }

    #[cfg(not(feature = "panic-on-binding-failure"))]
    {
        eprintln!("fatal: binding failure #{} in {}: {}", count, site, err);
        std::process::abort();
    }
}
