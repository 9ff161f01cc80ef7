//! Symbol sources
//!
//! A [`SymbolSource`] answers "which function implements `symbol` in
//! `module`?" for the binder. Internal calls pass no module; named imports
//! pass their module bucket.
//!
//! Functions linked into the process register themselves with
//! [`register_symbol!`] and are collected by [`StaticSymbols`]. Symbols
//! from shared objects are found through [`SharedLibrary`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use interop_abi::{FunctionPtr, LibraryRegistry};
use libloading::Library;
use log::{debug, warn};

use crate::error::{BindError, Result};

/// Runtime symbol for inventory-based registration
pub struct RuntimeSymbol {
    /// Module bucket, or `None` for internal calls
    pub module: Option<&'static str>,
    pub name: &'static str,
    pub ptr: FunctionPtr,
}

inventory::collect!(RuntimeSymbol);

/// Register a function linked into this process.
///
/// ```rust,ignore
/// register_symbol!("ves_icall_System_GC_GetTotalMemory", gc_total_memory);
/// register_symbol!("libSystem.Native", "SystemNative_GetErrNo", system_native_get_errno);
/// ```
#[macro_export]
macro_rules! register_symbol {
    ($name:expr, $func:path) => {
        $crate::inventory::submit! {
            $crate::symbols::RuntimeSymbol {
                module: None,
                name: $name,
                ptr: $crate::FunctionPtr::new($func as *const u8),
            }
        }
    };
    ($module:expr, $name:expr, $func:path) => {
        $crate::inventory::submit! {
            $crate::symbols::RuntimeSymbol {
                module: Some($module),
                name: $name,
                ptr: $crate::FunctionPtr::new($func as *const u8),
            }
        }
    };
}

/// Something that can produce function pointers by name.
pub trait SymbolSource {
    fn resolve(&self, module: Option<&str>, symbol: &str) -> Option<FunctionPtr>;

    /// Like [`resolve`](Self::resolve), plus a handle that keeps the code
    /// behind the pointer mapped.
    ///
    /// Sources whose symbols live as long as the process return no handle.
    fn resolve_pinned(&self, module: Option<&str>, symbol: &str) -> Option<(FunctionPtr, Option<Arc<Library>>)> {
        self.resolve(module, symbol).map(|ptr| (ptr, None))
    }
}

impl<T: SymbolSource + ?Sized> SymbolSource for Box<T> {
    fn resolve(&self, module: Option<&str>, symbol: &str) -> Option<FunctionPtr> {
        (**self).resolve(module, symbol)
    }

    fn resolve_pinned(&self, module: Option<&str>, symbol: &str) -> Option<(FunctionPtr, Option<Arc<Library>>)> {
        (**self).resolve_pinned(module, symbol)
    }
}

// ============================================================================
// Link-time registrations
// ============================================================================

/// Snapshot of every `register_symbol!` entry linked into the process.
///
/// A module-qualified query also matches entries registered without a
/// module. When two registrations share a (module, name) the later one in
/// link order is kept and a warning is logged.
pub struct StaticSymbols {
    unscoped: HashMap<&'static str, FunctionPtr>,
    by_module: HashMap<&'static str, HashMap<&'static str, FunctionPtr>>,
}

impl StaticSymbols {
    pub fn collect() -> Self {
        Self::from_registrations(inventory::iter::<RuntimeSymbol>)
    }

    fn from_registrations<'a>(registrations: impl IntoIterator<Item = &'a RuntimeSymbol>) -> Self {
        let mut symbols = Self {
            unscoped: HashMap::new(),
            by_module: HashMap::new(),
        };
        for sym in registrations {
            let bucket = match sym.module {
                Some(module) => symbols.by_module.entry(module).or_default(),
                None => &mut symbols.unscoped,
            };
            if let Some(previous) = bucket.insert(sym.name, sym.ptr) {
                if previous != sym.ptr {
                    warn!(
                        "Symbol '{}' in {} registered twice; keeping {:?} over {:?}",
                        sym.name,
                        sym.module.unwrap_or("<icalls>"),
                        sym.ptr,
                        previous
                    );
                }
            }
        }
        debug!("Collected {} statically registered symbols", symbols.len());
        symbols
    }

    pub fn len(&self) -> usize {
        self.unscoped.len() + self.by_module.values().map(HashMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registered (module, symbol) pairs
    pub fn names(&self) -> impl Iterator<Item = (Option<&'static str>, &'static str)> + '_ {
        let unscoped = self.unscoped.keys().map(|name| (None, *name));
        let scoped = self
            .by_module
            .iter()
            .flat_map(|(module, names)| names.keys().map(move |name| (Some(*module), *name)));
        unscoped.chain(scoped)
    }
}

impl SymbolSource for StaticSymbols {
    fn resolve(&self, module: Option<&str>, symbol: &str) -> Option<FunctionPtr> {
        module
            .and_then(|module| self.by_module.get(module))
            .and_then(|names| names.get(symbol))
            .or_else(|| self.unscoped.get(symbol))
            .copied()
    }
}

// ============================================================================
// Explicit maps
// ============================================================================

/// Symbols supplied directly by the host
#[derive(Debug, Default, Clone)]
pub struct SymbolMap {
    symbols: HashMap<(Option<String>, String), FunctionPtr>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol visible from every module.
    pub fn insert(&mut self, symbol: impl Into<String>, ptr: FunctionPtr) -> &mut Self {
        self.symbols.insert((None, symbol.into()), ptr);
        self
    }

    /// Register a symbol inside one module bucket.
    pub fn insert_in(&mut self, module: impl Into<String>, symbol: impl Into<String>, ptr: FunctionPtr) -> &mut Self {
        self.symbols.insert((Some(module.into()), symbol.into()), ptr);
        self
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl SymbolSource for SymbolMap {
    fn resolve(&self, module: Option<&str>, symbol: &str) -> Option<FunctionPtr> {
        if let Some(module) = module {
            if let Some(ptr) = self.symbols.get(&(Some(module.to_string()), symbol.to_string())) {
                return Some(*ptr);
            }
        }
        self.symbols.get(&(None, symbol.to_string())).copied()
    }
}

impl SymbolSource for LibraryRegistry {
    fn resolve(&self, module: Option<&str>, symbol: &str) -> Option<FunctionPtr> {
        let find = |library: &dyn interop_abi::NativeLibrary| {
            library
                .exports()
                .into_iter()
                .find(|(name, _)| *name == symbol)
                .map(|(_, ptr)| ptr)
        };

        match module {
            Some(module) => self.get_library(module).and_then(find),
            None => self.iter().find_map(find),
        }
    }
}

// ============================================================================
// Shared libraries
// ============================================================================

/// Symbols exported by a shared object loaded at runtime.
///
/// Every module name is served from the same library unless the source is
/// restricted with [`SharedLibrary::for_module`]. Tables bound from it hold
/// a handle to the library, so it stays loaded after the source is dropped.
pub struct SharedLibrary {
    path: PathBuf,
    module: Option<String>,
    library: Arc<Library>,
}

impl SharedLibrary {
    pub fn open(path: &Path) -> Result<Self> {
        // SAFETY: loading runs the library's initializers; the caller names
        // a library built to be loaded into this process.
        let library = unsafe {
            Library::new(path).map_err(|e| BindError::Io(format!("Failed to load {}: {}", path.display(), e)))?
        };
        debug!("Loaded shared library {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            module: None,
            library: Arc::new(library),
        })
    }

    /// Only answer queries for `module` (and module-less queries).
    pub fn for_module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn handle(&self) -> Arc<Library> {
        Arc::clone(&self.library)
    }
}

impl SymbolSource for SharedLibrary {
    fn resolve(&self, module: Option<&str>, symbol: &str) -> Option<FunctionPtr> {
        if let (Some(wanted), Some(mine)) = (module, self.module.as_deref()) {
            if wanted != mine {
                return None;
            }
        }

        // SAFETY: the symbol is only read as an address, never called here.
        let ptr: *const () = unsafe {
            let symbol: libloading::Symbol<*const ()> = self.library.get(symbol.as_bytes()).ok()?;
            *symbol
        };

        if ptr.is_null() {
            None
        } else {
            Some(FunctionPtr::new(ptr as *const u8))
        }
    }

    fn resolve_pinned(&self, module: Option<&str>, symbol: &str) -> Option<(FunctionPtr, Option<Arc<Library>>)> {
        self.resolve(module, symbol).map(|ptr| (ptr, Some(self.handle())))
    }
}

// ============================================================================
// Chains
// ============================================================================

/// Sources consulted in order; the first hit wins.
#[derive(Default)]
pub struct Chain {
    sources: Vec<Box<dyn SymbolSource>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: impl SymbolSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn push(&mut self, source: impl SymbolSource + 'static) {
        self.sources.push(Box::new(source));
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl SymbolSource for Chain {
    fn resolve(&self, module: Option<&str>, symbol: &str) -> Option<FunctionPtr> {
        self.sources.iter().find_map(|s| s.resolve(module, symbol))
    }

    fn resolve_pinned(&self, module: Option<&str>, symbol: &str) -> Option<(FunctionPtr, Option<Arc<Library>>)> {
        self.sources.iter().find_map(|s| s.resolve_pinned(module, symbol))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interop_abi::NativeLibrary;

    extern "C" fn registered_icall() -> i32 {
        7
    }

    extern "C" fn registered_import() -> i32 {
        9
    }

    crate::register_symbol!("test_registered_icall", registered_icall);
    crate::register_symbol!("libTest", "test_registered_import", registered_import);

    fn ptr(value: usize) -> FunctionPtr {
        FunctionPtr::new(value as *const u8)
    }

    #[test]
    fn test_static_symbols_collects_registrations() {
        let symbols = StaticSymbols::collect();

        let icall = symbols.resolve(None, "test_registered_icall").unwrap();
        assert_eq!(icall, FunctionPtr::new(registered_icall as *const u8));

        // Module-less registrations are visible from every module
        assert_eq!(symbols.resolve(Some("libTest"), "test_registered_icall"), Some(icall));

        let import = symbols.resolve(Some("libTest"), "test_registered_import").unwrap();
        assert_eq!(import, FunctionPtr::new(registered_import as *const u8));
        assert!(symbols.resolve(Some("libOther"), "test_registered_import").is_none());
        assert!(symbols.resolve(None, "test_registered_import").is_none());
    }

    #[test]
    fn test_duplicate_registration_keeps_one_entry() {
        let registrations = [
            RuntimeSymbol {
                module: Some("libFoo"),
                name: "bar",
                ptr: ptr(0x10),
            },
            RuntimeSymbol {
                module: Some("libFoo"),
                name: "bar",
                ptr: ptr(0x20),
            },
            RuntimeSymbol {
                module: None,
                name: "bar",
                ptr: ptr(0x30),
            },
        ];

        let symbols = StaticSymbols::from_registrations(&registrations);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols.resolve(Some("libFoo"), "bar"), Some(ptr(0x20)));
        assert_eq!(symbols.resolve(Some("libOther"), "bar"), Some(ptr(0x30)));
        assert_eq!(symbols.resolve(None, "bar"), Some(ptr(0x30)));

        let mut names: Vec<_> = symbols.names().collect();
        names.sort();
        assert_eq!(names, vec![(None, "bar"), (Some("libFoo"), "bar")]);
    }

    #[test]
    fn test_symbol_map_prefers_module_entry() {
        let mut map = SymbolMap::new();
        map.insert("shared", ptr(0x10)).insert_in("libFoo", "shared", ptr(0x20));

        assert_eq!(map.resolve(Some("libFoo"), "shared"), Some(ptr(0x20)));
        assert_eq!(map.resolve(Some("libBar"), "shared"), Some(ptr(0x10)));
        assert_eq!(map.resolve(None, "shared"), Some(ptr(0x10)));
        assert_eq!(map.resolve(None, "missing"), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_chain_first_hit_wins() {
        let mut first = SymbolMap::new();
        first.insert("a", ptr(0x1));
        let mut second = SymbolMap::new();
        second.insert("a", ptr(0x2)).insert("b", ptr(0x3));

        let chain = Chain::new().with(first).with(second);

        assert_eq!(chain.resolve(None, "a"), Some(ptr(0x1)));
        assert_eq!(chain.resolve(None, "b"), Some(ptr(0x3)));
        assert_eq!(chain.resolve(None, "c"), None);
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_library_registry_as_source() {
        struct Foo;
        impl NativeLibrary for Foo {
            fn name(&self) -> &str {
                "libFoo"
            }
            fn exports(&self) -> Vec<(&'static str, FunctionPtr)> {
                vec![("bar", FunctionPtr::new(0x40 as *const u8))]
            }
        }

        let mut registry = LibraryRegistry::new();
        registry.register(Box::new(Foo)).unwrap();

        assert_eq!(registry.resolve(Some("libFoo"), "bar"), Some(ptr(0x40)));
        assert_eq!(registry.resolve(None, "bar"), Some(ptr(0x40)));
        assert_eq!(registry.resolve(Some("libEmpty"), "bar"), None);
    }

    #[test]
    fn test_missing_shared_library_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("libdoesnotexist.so");
        match SharedLibrary::open(&missing) {
            Err(BindError::Io(msg)) => assert!(msg.contains("libdoesnotexist")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("loading a missing library should fail"),
        }
    }
}
