//! ABI vocabulary for native/managed binding tables
//!
//! This crate holds the pieces every binding table agrees on: untyped
//! function pointers, dispatch tokens, invocation flags, signature
//! descriptors, and the static record layouts that declaration macros emit.
//!
//! # Static Table Declaration
//!
//! Internal calls are declared as one composite record per token, so a
//! token can never drift away from its function pointer or flags:
//!
//! ```rust,ignore
//! use interop_abi::declare_icalls;
//!
//! declare_icalls! {
//!     CORLIB_ICALLS;
//!     // token, symbol,                                   flags,        function,            params          => return
//!     161,  "ves_icall_System_Array_InternalCreate",      NONE,         array_internal_create, [Ptr, Ptr, I32] => Void;
//!     178,  "ves_icall_System_Array_GetLengthInternal_raw", USES_HANDLES, array_get_length,  [I32, I32, I32] => I32;
//! }
//! ```
//!
//! Named imports are declared as sentinel-terminated repr(C) arrays that a
//! C-side resolver can scan directly:
//!
//! ```rust,ignore
//! use interop_abi::declare_imports;
//!
//! declare_imports! {
//!     LIBSYSTEM_NATIVE_IMPORTS;
//!     "SystemNative_GetErrNo" => system_native_get_errno,
//!     "SystemNative_SetErrNo" => system_native_set_errno,
//! }
//! ```

use std::ffi::{c_char, c_void, CStr};
use std::fmt;

pub mod signature;

pub use signature::{native_type, NativeFn, NativeKind, NativeReturn, NativeType, Signature, MAX_ARITY};

/// Thread-safe function pointer wrapper
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionPtr(*const u8);

unsafe impl Send for FunctionPtr {}
unsafe impl Sync for FunctionPtr {}

impl FunctionPtr {
    pub const fn new(ptr: *const u8) -> Self {
        FunctionPtr(ptr)
    }

    pub const fn null() -> Self {
        FunctionPtr(std::ptr::null())
    }

    pub fn from_raw(ptr: *const c_void) -> Self {
        FunctionPtr(ptr as *const u8)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.0
    }

    pub fn as_raw(&self) -> *const c_void {
        self.0 as *const c_void
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl fmt::Debug for FunctionPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionPtr({:p})", self.0)
    }
}

/// Stable key of one native-callable operation.
///
/// Tokens are assigned by the metadata catalog, are sparse, and are never
/// reused within one registry version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u32);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token {}", self.0)
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

/// Per-entry invocation mode.
///
/// Only [`InvokeFlags::USES_HANDLES`] is defined. Every other bit is
/// reserved and rejected when a dispatch table is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InvokeFlags(u8);

impl InvokeFlags {
    /// Safe to call directly
    pub const NONE: InvokeFlags = InvokeFlags(0);
    /// Handle-based wrapper; the call must be bracketed by a cooperative
    /// transition supplied by the host.
    pub const USES_HANDLES: InvokeFlags = InvokeFlags(0x04);

    const DEFINED: u8 = Self::USES_HANDLES.0;

    pub const fn from_bits(bits: u8) -> Self {
        InvokeFlags(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: InvokeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn needs_transition(self) -> bool {
        self.contains(Self::USES_HANDLES)
    }

    /// Bits set that carry no defined meaning.
    pub const fn reserved_bits(self) -> u8 {
        self.0 & !Self::DEFINED
    }
}

impl fmt::Display for InvokeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.needs_transition() {
            write!(f, "uses-handles")
        } else if self.0 == 0 {
            write!(f, "none")
        } else {
            write!(f, "{:#04x}", self.0)
        }
    }
}

// ============================================================================
// Internal Call Descriptor
// ============================================================================

/// One statically declared internal call.
///
/// Token, function, flags and signature tags live in a single record; see
/// [`declare_icalls!`].
pub struct IcallDesc {
    pub token: u32,
    pub name: &'static str,
    pub func: FunctionPtr,
    pub flags: InvokeFlags,
    /// Return type tag (native_type::*)
    pub return_type: u8,
    pub param_count: u8,
    /// Parameter type tags (native_type::*), first `param_count` entries valid
    pub param_types: [u8; MAX_ARITY],
}

impl IcallDesc {
    /// Zero-padded tag array for [`declare_icalls!`]. More than
    /// [`MAX_ARITY`] tags fails const evaluation.
    #[doc(hidden)]
    pub const fn param_tags(tags: &[u8]) -> [u8; MAX_ARITY] {
        assert!(tags.len() <= MAX_ARITY, "icall declares too many parameters");
        let mut padded = [0u8; MAX_ARITY];
        let mut i = 0;
        while i < tags.len() {
            padded[i] = tags[i];
            i += 1;
        }
        padded
    }

    pub fn signature(&self) -> Result<Signature, String> {
        let count = self.param_count as usize;
        if count > MAX_ARITY {
            return Err(format!("{}: parameter count {} out of range", self.name, count));
        }
        Signature::from_tags(self.return_type, &self.param_types[..count])
    }
}

// ============================================================================
// Named Import Record (crosses the C boundary)
// ============================================================================

/// `{ name, func }` pair of a sentinel-terminated import array.
///
/// Layout matches the C `PinvokeImport` struct. A record whose name is null
/// terminates the array.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawImport {
    pub name: *const c_char,
    pub func: *const c_void,
}

// SAFETY: RawImport holds pointers to static strings and functions only.
unsafe impl Send for RawImport {}
unsafe impl Sync for RawImport {}

impl RawImport {
    pub const SENTINEL: RawImport = RawImport {
        name: std::ptr::null(),
        func: std::ptr::null(),
    };

    pub fn is_sentinel(&self) -> bool {
        self.name.is_null()
    }

    /// Symbol name of a non-sentinel record.
    ///
    /// # Safety
    /// `name` must point to a NUL-terminated string that outlives `'a`.
    pub unsafe fn name<'a>(&self) -> Option<&'a str> {
        if self.name.is_null() {
            return None;
        }
        CStr::from_ptr(self.name).to_str().ok()
    }
}

// ============================================================================
// Native Libraries
// ============================================================================

/// A named native library that exports symbols to the import tables.
///
/// Implement this to provide a module bucket such as `libSystem.Native`.
pub trait NativeLibrary: Send + Sync {
    /// Module name the managed side binds against (e.g., "libSystem.Native")
    fn name(&self) -> &str;

    /// Exported (symbol, function pointer) pairs. May be empty.
    fn exports(&self) -> Vec<(&'static str, FunctionPtr)>;

    /// Called when the library is registered (optional)
    fn on_load(&self) -> Result<(), String> {
        Ok(())
    }

    /// Called when the library is unregistered (optional)
    fn on_unload(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Registry of native libraries, keyed by module name
pub struct LibraryRegistry {
    libraries: Vec<Box<dyn NativeLibrary>>,
}

impl LibraryRegistry {
    pub fn new() -> Self {
        Self {
            libraries: Vec::new(),
        }
    }

    /// Register a native library
    pub fn register(&mut self, library: Box<dyn NativeLibrary>) -> Result<(), String> {
        let name = library.name();

        if self.libraries.iter().any(|l| l.name() == name) {
            return Err(format!("Library '{}' is already registered", name));
        }

        library.on_load()?;

        self.libraries.push(library);
        Ok(())
    }

    /// Remove a library, running its unload hook
    pub fn unregister(&mut self, name: &str) -> Result<(), String> {
        let pos = self
            .libraries
            .iter()
            .position(|l| l.name() == name)
            .ok_or_else(|| format!("Library '{}' is not registered", name))?;
        let library = self.libraries.remove(pos);
        library.on_unload()
    }

    pub fn list_libraries(&self) -> Vec<&str> {
        self.libraries.iter().map(|l| l.name()).collect()
    }

    pub fn get_library(&self, name: &str) -> Option<&dyn NativeLibrary> {
        self.libraries
            .iter()
            .find(|l| l.name() == name)
            .map(|l| &**l as &dyn NativeLibrary)
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn NativeLibrary> {
        self.libraries.iter().map(|l| &**l as &dyn NativeLibrary)
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Declaration Macros
// ============================================================================

/// Declare a static table of internal call descriptors.
///
/// # Syntax
///
/// ```rust,ignore
/// declare_icalls! {
///     TABLE_NAME;
///     // token, symbol,  flags,        function, [ParamTypes...] => ReturnType;
///     161, "c_symbol",  NONE,         my_fn,    [Ptr, I32]      => Void;
///     178, "c_symbol2", USES_HANDLES, my_fn2,   []              => I32;
/// }
/// ```
///
/// **Type tokens**: `Void`, `I32`, `U32`, `I64`, `U64`, `F32`, `F64`, `Ptr`
///
/// **Flag tokens**: `NONE`, `USES_HANDLES`
#[macro_export]
macro_rules! declare_icalls {
    (
        $name:ident;
        $($token:literal, $symbol:literal, $flags:ident, $func:path,
          [$($ptype:ident),*] => $rtype:ident;)*
    ) => {
        static $name: &[$crate::IcallDesc] = &[
            $(
                $crate::IcallDesc {
                    token: $token,
                    name: $symbol,
                    func: $crate::FunctionPtr::new($func as *const u8),
                    flags: $crate::InvokeFlags::$flags,
                    return_type: $crate::_nt!($rtype),
                    param_count: <[u8]>::len(&[$($crate::_nt!($ptype)),*]) as u8,
                    param_types: $crate::IcallDesc::param_tags(&[$($crate::_nt!($ptype)),*]),
                },
            )*
        ];
    };
}

/// Declare a sentinel-terminated import array for one native module.
///
/// The generated `static` is a `&[RawImport]` whose last record is
/// [`RawImport::SENTINEL`]. An empty body yields just the sentinel.
#[macro_export]
macro_rules! declare_imports {
    (
        $name:ident;
        $($symbol:literal => $func:path),* $(,)?
    ) => {
        static $name: &[$crate::RawImport] = &[
            $(
                $crate::RawImport {
                    name: concat!($symbol, "\0").as_ptr() as *const ::std::ffi::c_char,
                    func: $func as *const ::std::ffi::c_void,
                },
            )*
            $crate::RawImport::SENTINEL,
        ];
    };
}

// ---------------------------------------------------------------------------
// Internal helper macros (exported for cross-crate macro use)
// ---------------------------------------------------------------------------

#[doc(hidden)]
#[macro_export]
macro_rules! _nt {
    (Void) => { $crate::native_type::VOID };
    (I32) => { $crate::native_type::I32 };
    (U32) => { $crate::native_type::U32 };
    (I64) => { $crate::native_type::I64 };
    (U64) => { $crate::native_type::U64 };
    (F32) => { $crate::native_type::F32 };
    (F64) => { $crate::native_type::F64 };
    (Ptr) => { $crate::native_type::PTR };
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn forty_two() -> i32 {
        42
    }

    extern "C" fn identity(x: i64) -> i64 {
        x
    }

    declare_icalls! {
        TEST_ICALLS;
        161, "test_forty_two", NONE, forty_two, [] => I32;
        178, "test_identity_raw", USES_HANDLES, identity, [I64] => I64;
    }

    extern "C" fn sum8(a: i32, b: i32, c: i32, d: i32, e: i32, f: i32, g: i32, h: i32) -> i32 {
        a + b + c + d + e + f + g + h
    }

    declare_icalls! {
        WIDE_ICALLS;
        9163, "test_sum8", NONE, sum8, [I32, I32, I32, I32, I32, I32, I32, I32] => I32;
    }

    declare_imports! {
        TEST_IMPORTS;
        "forty_two" => forty_two,
        "identity" => identity,
    }

    declare_imports! {
        EMPTY_IMPORTS;
    }

    struct TestLibrary(&'static str);

    impl NativeLibrary for TestLibrary {
        fn name(&self) -> &str {
            self.0
        }

        fn exports(&self) -> Vec<(&'static str, FunctionPtr)> {
            vec![("forty_two", FunctionPtr::new(forty_two as *const u8))]
        }
    }

    #[test]
    fn test_flags_semantics() {
        assert!(!InvokeFlags::NONE.needs_transition());
        assert!(InvokeFlags::USES_HANDLES.needs_transition());
        assert_eq!(InvokeFlags::from_bits(4), InvokeFlags::USES_HANDLES);
        assert_eq!(InvokeFlags::from_bits(0x05).reserved_bits(), 0x01);
        assert_eq!(InvokeFlags::USES_HANDLES.reserved_bits(), 0);
    }

    #[test]
    fn test_declared_icalls_keep_token_and_pointer_together() {
        assert_eq!(TEST_ICALLS.len(), 2);

        let first = &TEST_ICALLS[0];
        assert_eq!(first.token, 161);
        assert_eq!(first.func, FunctionPtr::new(forty_two as *const u8));
        assert_eq!(first.flags, InvokeFlags::NONE);
        assert_eq!(first.signature().unwrap(), Signature::new(NativeKind::I32, vec![]).unwrap());

        let second = &TEST_ICALLS[1];
        assert_eq!(second.token, 178);
        assert!(second.flags.needs_transition());
        assert_eq!(second.signature().unwrap().params(), &[NativeKind::I64]);
    }

    #[test]
    fn test_param_tags_are_zero_padded() {
        assert_eq!(TEST_ICALLS[0].param_count, 0);
        assert_eq!(TEST_ICALLS[0].param_types, [0u8; MAX_ARITY]);
        assert_eq!(TEST_ICALLS[1].param_count, 1);
        assert_eq!(TEST_ICALLS[1].param_types[0], native_type::I64);
        assert!(TEST_ICALLS[1].param_types[1..].iter().all(|t| *t == 0));

        let wide = &WIDE_ICALLS[0];
        assert_eq!(wide.param_count as usize, MAX_ARITY);
        assert_eq!(wide.param_types, [native_type::I32; MAX_ARITY]);
        assert_eq!(wide.signature().unwrap().arity(), MAX_ARITY);
    }

    #[test]
    fn test_declared_imports_are_sentinel_terminated() {
        assert_eq!(TEST_IMPORTS.len(), 3);
        assert!(TEST_IMPORTS[2].is_sentinel());
        assert_eq!(unsafe { TEST_IMPORTS[0].name() }, Some("forty_two"));
        assert_eq!(TEST_IMPORTS[1].func, identity as *const c_void);

        assert_eq!(EMPTY_IMPORTS.len(), 1);
        assert!(EMPTY_IMPORTS[0].is_sentinel());
    }

    #[test]
    fn test_library_registry_rejects_duplicates() {
        let mut registry = LibraryRegistry::new();
        registry.register(Box::new(TestLibrary("libFoo"))).unwrap();
        assert!(registry.register(Box::new(TestLibrary("libFoo"))).is_err());
        registry.register(Box::new(TestLibrary("libBar"))).unwrap();

        assert_eq!(registry.list_libraries(), vec!["libFoo", "libBar"]);
        assert_eq!(registry.get_library("libBar").unwrap().exports().len(), 1);

        registry.unregister("libFoo").unwrap();
        assert!(registry.get_library("libFoo").is_none());
        assert!(registry.unregister("libFoo").is_err());
    }
}
