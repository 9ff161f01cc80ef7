//! Named import tables (P/Invoke)
//!
//! Maps a native module name (e.g. `libSystem.Native`) to the symbols it
//! exports. A module with no exports is an explicit, empty bucket rather
//! than a missing one, so asking for its symbols succeeds with nothing.
//!
//! For C-side consumers the tables can be exported in the classic layout:
//! one `{name, func}` array per module ending in a `{NULL, NULL}` sentinel,
//! plus a parallel array of module names.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};

use indexmap::IndexMap;
use log::{debug, trace};

use interop_abi::{FunctionPtr, LibraryRegistry, RawImport};

use crate::error::{BindError, Result};

/// One exported symbol
#[derive(Debug, Clone, PartialEq)]
pub struct ImportEntry {
    symbol: String,
    func: FunctionPtr,
    /// Managed assembly that imports the symbol, kept for diagnostics
    assembly: Option<String>,
}

impl ImportEntry {
    pub fn new(symbol: impl Into<String>, func: FunctionPtr) -> Self {
        Self {
            symbol: symbol.into(),
            func,
            assembly: None,
        }
    }

    pub fn with_assembly(mut self, assembly: impl Into<String>) -> Self {
        self.assembly = Some(assembly.into());
        self
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn func(&self) -> FunctionPtr {
        self.func
    }

    pub fn assembly(&self) -> Option<&str> {
        self.assembly.as_deref()
    }
}

/// The exports of one native module
#[derive(Debug, Clone)]
pub struct ImportModule {
    name: String,
    entries: Vec<ImportEntry>,
    index: HashMap<String, usize>,
}

impl ImportModule {
    /// A module with zero exports
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Build a module, rejecting duplicate or unrepresentable symbol names.
    pub fn build(name: impl Into<String>, entries: impl IntoIterator<Item = ImportEntry>) -> Result<Self> {
        let mut module = Self::empty(name);
        for entry in entries {
            module.push(entry)?;
        }
        Ok(module)
    }

    /// Read a sentinel-terminated `{name, func}` array.
    ///
    /// # Safety
    /// Every record before the sentinel must carry a valid NUL-terminated
    /// name.
    pub unsafe fn from_raw(name: impl Into<String>, table: &[RawImport]) -> Result<Self> {
        let mut module = Self::empty(name);
        for record in table {
            if record.is_sentinel() {
                debug!("Read {} imports for '{}'", module.len(), module.name);
                return Ok(module);
            }
            let symbol = record.name().ok_or_else(|| {
                BindError::Manifest(format!("non UTF-8 symbol name in '{}'", module.name))
            })?;
            module.push(ImportEntry::new(symbol, FunctionPtr::from_raw(record.func)))?;
        }
        Err(BindError::Manifest(format!(
            "import table for '{}' has no sentinel",
            module.name
        )))
    }

    fn push(&mut self, entry: ImportEntry) -> Result<()> {
        if entry.symbol.is_empty() || entry.symbol.contains('\0') {
            return Err(BindError::Manifest(format!(
                "invalid symbol name {:?} in '{}'",
                entry.symbol, self.name
            )));
        }
        if self.index.contains_key(&entry.symbol) {
            return Err(BindError::DuplicateSymbol {
                module: self.name.clone(),
                symbol: entry.symbol,
            });
        }
        self.index.insert(entry.symbol.clone(), self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, symbol: &str) -> Option<&ImportEntry> {
        self.index.get(symbol).map(|&i| &self.entries[i])
    }

    /// Exports in declaration order
    pub fn entries(&self) -> &[ImportEntry] {
        &self.entries
    }
}

/// Import buckets of every native module
#[derive(Debug, Clone, Default)]
pub struct PinvokeTables {
    modules: IndexMap<String, ImportModule>,
}

impl PinvokeTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, module: ImportModule) -> Result<()> {
        if module.name.is_empty() || module.name.contains('\0') {
            return Err(BindError::Manifest(format!("invalid module name {:?}", module.name)));
        }
        if self.modules.contains_key(&module.name) {
            return Err(BindError::Manifest(format!(
                "native module '{}' declared twice",
                module.name
            )));
        }
        self.modules.insert(module.name.clone(), module);
        Ok(())
    }

    /// One bucket per registered library, in registration order.
    pub fn from_libraries(registry: &LibraryRegistry) -> Result<Self> {
        let mut tables = Self::new();
        for library in registry.iter() {
            let entries = library
                .exports()
                .into_iter()
                .map(|(symbol, func)| ImportEntry::new(symbol, func));
            tables.insert(ImportModule::build(library.name(), entries)?)?;
        }
        Ok(tables)
    }

    pub fn module(&self, name: &str) -> Result<&ImportModule> {
        self.modules
            .get(name)
            .ok_or_else(|| BindError::UnknownModule(name.to_string()))
    }

    /// Exports of `module`; empty for a module with zero exports.
    pub fn symbols(&self, module: &str) -> Result<&[ImportEntry]> {
        Ok(self.module(module)?.entries())
    }

    /// Resolve a (module, symbol) pair.
    pub fn lookup(&self, module: &str, symbol: &str) -> Result<FunctionPtr> {
        let entry = self.modules.get(module).and_then(|m| m.get(symbol));
        match entry {
            Some(entry) => {
                trace!("{}!{} -> {:?}", module, symbol, entry.func);
                Ok(entry.func)
            }
            None => Err(BindError::UnresolvedSymbol {
                module: module.to_string(),
                symbol: symbol.to_string(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ImportModule> {
        self.modules.values()
    }

    /// Lay the tables out as sentinel-terminated C arrays.
    pub fn export(&self) -> Result<ExportedImports> {
        let mut exported = ExportedImports::default();

        for module in self.modules.values() {
            let module_name = to_c_string(&module.name)?;
            let mut records = Vec::with_capacity(module.len() + 1);
            for entry in &module.entries {
                let symbol = to_c_string(&entry.symbol)?;
                records.push(RawImport {
                    name: symbol.as_ptr(),
                    func: entry.func.as_raw(),
                });
                exported.strings.push(symbol);
            }
            records.push(RawImport::SENTINEL);

            exported.module_names.push(module_name.as_ptr());
            exported.strings.push(module_name);
            exported.tables.push(records);
        }

        Ok(exported)
    }
}

fn to_c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| BindError::Manifest(format!("name {:?} contains NUL", s)))
}

/// Owned C layout of the import tables.
///
/// Pointers handed out stay valid for as long as this value lives.
#[derive(Default)]
pub struct ExportedImports {
    /// Backing storage for every name pointer below
    strings: Vec<CString>,
    tables: Vec<Vec<RawImport>>,
    module_names: Vec<*const c_char>,
}

impl ExportedImports {
    pub fn module_count(&self) -> usize {
        self.tables.len()
    }

    /// `pinvoke_tables[]`: one sentinel-terminated array per module
    pub fn table_ptrs(&self) -> Vec<*const RawImport> {
        self.tables.iter().map(|t| t.as_ptr()).collect()
    }

    /// `pinvoke_names[]`, parallel to [`ExportedImports::table_ptrs`]
    pub fn module_names(&self) -> &[*const c_char] {
        &self.module_names
    }

    /// Sentinel-terminated records of the module at `index`
    pub fn table(&self, index: usize) -> Option<&[RawImport]> {
        self.tables.get(index).map(|t| t.as_slice())
    }

    /// Resolve through the C layout, scanning each array to its sentinel.
    pub fn resolve(&self, module: &CStr, symbol: &CStr) -> Option<*const c_void> {
        let index = self
            .module_names
            .iter()
            .position(|&name| unsafe { CStr::from_ptr(name) } == module)?;

        self.tables[index]
            .iter()
            .take_while(|record| !record.is_sentinel())
            .find(|record| unsafe { CStr::from_ptr(record.name) } == symbol)
            .map(|record| record.func)
    }
}
