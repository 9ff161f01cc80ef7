//! Built-in `libSystem.Native` exports
//!
//! A handful of real OS entry points so manifests naming them can bind
//! in-process. Each is registered under its module with
//! [`register_symbol!`](crate::register_symbol) and exposed through
//! [`builtin_libraries`].

#![allow(non_snake_case)]

use std::ffi::{c_int, c_void};
use std::time::{SystemTime, UNIX_EPOCH};

use interop_abi::{FunctionPtr, LibraryRegistry, NativeLibrary};

use crate::symbols::RuntimeSymbol;

pub const SYSTEM_NATIVE: &str = "libSystem.Native";
pub const COMPRESSION_NATIVE: &str = "libSystem.IO.Compression.Native";
pub const GLOBALIZATION_NATIVE: &str = "libSystem.Globalization.Native";

/// 100ns ticks between 0001-01-01 and the Unix epoch
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

// ============================================================================
// errno
// ============================================================================

#[cfg(any(target_os = "linux", target_os = "emscripten"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno_location()
}

#[cfg(target_os = "android")]
unsafe fn errno_location() -> *mut c_int {
    libc::__errno()
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    libc::__error()
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "emscripten",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
unsafe fn errno_location() -> *mut c_int {
    thread_local! {
        static ERRNO: std::cell::Cell<c_int> = const { std::cell::Cell::new(0) };
    }
    ERRNO.with(|e| e.as_ptr())
}

/// Current thread's errno
#[no_mangle]
pub extern "C" fn SystemNative_GetErrNo() -> i32 {
    // SAFETY: errno_location points at this thread's errno.
    unsafe { *errno_location() }
}

#[no_mangle]
pub extern "C" fn SystemNative_SetErrNo(value: i32) {
    // SAFETY: errno_location points at this thread's errno.
    unsafe { *errno_location() = value }
}

// ============================================================================
// Memory
// ============================================================================

/// Allocate `size` bytes with the C allocator
#[no_mangle]
pub extern "C" fn SystemNative_Malloc(size: usize) -> *mut c_void {
    // SAFETY: malloc accepts any size and reports failure with null.
    unsafe { libc::malloc(size) }
}

/// # Safety
/// `ptr` must be null or come from `SystemNative_Malloc` and not be freed yet.
#[no_mangle]
pub unsafe extern "C" fn SystemNative_Free(ptr: *mut c_void) {
    libc::free(ptr)
}

// ============================================================================
// Time
// ============================================================================

/// Monotonic timestamp in nanoseconds
#[cfg(unix)]
#[no_mangle]
pub extern "C" fn SystemNative_GetTimestamp() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: ts is a valid out-parameter.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0;
    }
    (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
#[no_mangle]
pub extern "C" fn SystemNative_GetTimestamp() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Wall clock time in 100ns ticks since 0001-01-01 UTC
#[no_mangle]
pub extern "C" fn SystemNative_GetSystemTimeAsTicks() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH_TICKS + (since.as_nanos() / 100) as i64,
        Err(_) => UNIX_EPOCH_TICKS,
    }
}

// ============================================================================
// Scheduling
// ============================================================================

/// CPU the calling thread runs on, or -1 when unknown
#[cfg(target_os = "linux")]
#[no_mangle]
pub extern "C" fn SystemNative_SchedGetCpu() -> i32 {
    // SAFETY: sched_getcpu has no preconditions.
    unsafe { libc::sched_getcpu() }
}

#[cfg(not(target_os = "linux"))]
#[no_mangle]
pub extern "C" fn SystemNative_SchedGetCpu() -> i32 {
    -1
}

crate::register_symbol!(SYSTEM_NATIVE, "SystemNative_GetErrNo", SystemNative_GetErrNo);
crate::register_symbol!(SYSTEM_NATIVE, "SystemNative_SetErrNo", SystemNative_SetErrNo);
crate::register_symbol!(SYSTEM_NATIVE, "SystemNative_Malloc", SystemNative_Malloc);
crate::register_symbol!(SYSTEM_NATIVE, "SystemNative_Free", SystemNative_Free);
crate::register_symbol!(SYSTEM_NATIVE, "SystemNative_GetTimestamp", SystemNative_GetTimestamp);
crate::register_symbol!(SYSTEM_NATIVE, "SystemNative_GetSystemTimeAsTicks", SystemNative_GetSystemTimeAsTicks);
crate::register_symbol!(SYSTEM_NATIVE, "SystemNative_SchedGetCpu", SystemNative_SchedGetCpu);

// ============================================================================
// Module buckets
// ============================================================================

/// A module whose exports are the `register_symbol!` entries linked under
/// its name. A module nothing registers into has no exports.
pub struct LinkedModule {
    name: &'static str,
}

impl LinkedModule {
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl NativeLibrary for LinkedModule {
    fn name(&self) -> &str {
        self.name
    }

    fn exports(&self) -> Vec<(&'static str, FunctionPtr)> {
        let mut exports: Vec<_> = inventory::iter::<RuntimeSymbol>
            .into_iter()
            .filter(|sym| sym.module == Some(self.name))
            .map(|sym| (sym.name, sym.ptr))
            .collect();
        exports.sort_by_key(|(name, _)| *name);
        exports
    }
}

/// The native modules this runtime provides: `libSystem.Native` plus the
/// compression and globalization buckets, which are empty.
pub fn builtin_libraries() -> LibraryRegistry {
    let mut registry = LibraryRegistry::new();
    for name in [SYSTEM_NATIVE, COMPRESSION_NATIVE, GLOBALIZATION_NATIVE] {
        // Names are distinct and LinkedModule has no load hook.
        let _ = registry.register(Box::new(LinkedModule::new(name)));
    }
    registry
}
