//! Interop Runtime Library
//!
//! Binding tables for calls crossing the native/managed boundary.
//!
//! # Architecture
//!
//! - **Managed to native by token**: [`dispatch::IcallTable`] maps the sparse
//!   tokens of one assembly to function pointers and invocation flags.
//! - **Managed to native by name**: [`pinvoke::PinvokeTables`] maps
//!   (module, symbol) pairs to function pointers. Modules may be empty.
//! - **Native to managed**: [`trampoline::TrampolineTable`] binds each slot
//!   lazily through the host on first call, then calls through the cached
//!   entry with a per-arity signature.
//!
//! Tables are described by a JSON [`manifest::Manifest`], bound against a
//! [`symbols::SymbolSource`] by [`binder::Binder`], and can be rendered back
//! to C by [`emit`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use interop_runtime::{Binder, Manifest, StaticSymbols};
//!
//! let manifest = Manifest::load(path)?;
//! let bound = Binder::new(&manifest)?.bind(&StaticSymbols::collect())?;
//! let entry = bound.icalls().lookup("corlib", Token(161))?;
//! ```

pub mod binder;
pub mod dispatch;
pub mod emit;
pub mod error;
pub mod fatal;
pub mod logging;
pub mod manifest;
pub mod pinvoke;
pub mod symbols;
pub mod system_native;
pub mod trampoline;

// Used by register_symbol!
#[doc(hidden)]
pub use inventory;

pub use interop_abi::{
    FunctionPtr, IcallDesc, InvokeFlags, LibraryRegistry, NativeFn, NativeKind, NativeLibrary, RawImport, Signature,
    Token,
};

pub use binder::{Binder, BoundTables};
pub use dispatch::{CoopTransition, DispatchEntry, IcallTable, IcallTables, NoTransition};
pub use emit::EmitOptions;
pub use error::{BindError, Result};
pub use manifest::Manifest;
pub use pinvoke::{ExportedImports, ImportEntry, ImportModule, PinvokeTables};
pub use symbols::{Chain, SharedLibrary, StaticSymbols, SymbolMap, SymbolSource};
pub use system_native::builtin_libraries;
pub use trampoline::{InterpArgs, ManagedHost, ResolvedEntry, TrampolineDesc, TrampolineTable};
