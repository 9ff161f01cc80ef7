//! Manifest binding
//!
//! [`Binder`] turns a validated [`Manifest`] into live tables by resolving
//! every named function through a [`SymbolSource`]. Binding is all or
//! nothing: a manifest symbol that cannot be resolved fails the bind.
//!
//! Symbols taken from a shared library pin it: [`BoundTables`] keeps the
//! library loaded for as long as the tables exist.

use std::sync::Arc;

use libloading::Library;
use log::{info, warn};

use interop_abi::FunctionPtr;

use crate::dispatch::{DispatchEntry, IcallTable, IcallTables};
use crate::error::{BindError, Result};
use crate::manifest::Manifest;
use crate::pinvoke::{ImportEntry, ImportModule, PinvokeTables};
use crate::symbols::SymbolSource;
use crate::trampoline::{ManagedHost, TrampolineTable};

/// Dispatch and import tables bound from one manifest
pub struct BoundTables {
    icalls: IcallTables,
    pinvoke: PinvokeTables,
    // Dropped after the tables that point into them.
    libraries: Vec<Arc<Library>>,
}

impl BoundTables {
    pub fn icalls(&self) -> &IcallTables {
        &self.icalls
    }

    pub fn pinvoke(&self) -> &PinvokeTables {
        &self.pinvoke
    }

    /// Shared libraries the tables point into
    pub fn libraries(&self) -> &[Arc<Library>] {
        &self.libraries
    }
}

impl std::fmt::Debug for BoundTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundTables")
            .field("icalls", &self.icalls)
            .field("pinvoke", &self.pinvoke)
            .field("libraries", &self.libraries.len())
            .finish()
    }
}

/// Pins collected while resolving, one per distinct library
#[derive(Default)]
struct Pins(Vec<Arc<Library>>);

impl Pins {
    fn keep(&mut self, library: Option<Arc<Library>>) {
        if let Some(library) = library {
            if !self.0.iter().any(|held| Arc::ptr_eq(held, &library)) {
                self.0.push(library);
            }
        }
    }
}

pub struct Binder<'m> {
    manifest: &'m Manifest,
}

impl<'m> Binder<'m> {
    /// Validate `manifest` and prepare to bind it.
    pub fn new(manifest: &'m Manifest) -> Result<Self> {
        manifest.validate()?;
        Ok(Self { manifest })
    }

    pub fn manifest(&self) -> &Manifest {
        self.manifest
    }

    /// Resolve every internal call and named import.
    ///
    /// Every missing symbol is logged; the first one is returned as
    /// `UnresolvedSymbol`.
    pub fn bind(&self, source: &dyn SymbolSource) -> Result<BoundTables> {
        let mut missing = Vec::new();
        let mut pins = Pins::default();

        let mut icalls = IcallTables::new();
        for def in &self.manifest.icalls {
            let mut entries = Vec::with_capacity(def.entries.len());
            for icall in &def.entries {
                let Some(func) = resolve_pinned(source, None, &icall.name, &mut pins) else {
                    warn!("Unresolved icall '{}' ({}) in '{}'", icall.name, icall.token(), def.assembly);
                    missing.push((def.assembly.clone(), icall.name.clone()));
                    continue;
                };

                let mut entry = DispatchEntry::new(icall.token(), &icall.name, func, icall.flags());
                if let Some(signature) = icall.signature()? {
                    entry = entry.with_signature(signature);
                }
                entries.push(entry);
            }
            icalls.insert(IcallTable::build(&def.assembly, entries)?)?;
        }

        let mut pinvoke = PinvokeTables::new();
        for def in &self.manifest.pinvoke {
            let mut entries = Vec::with_capacity(def.imports.len());
            for import in &def.imports {
                let Some(func) = resolve_pinned(source, Some(&def.module), &import.symbol, &mut pins) else {
                    warn!("Unresolved import '{}' in module '{}'", import.symbol, def.module);
                    missing.push((def.module.clone(), import.symbol.clone()));
                    continue;
                };

                let mut entry = ImportEntry::new(&import.symbol, func);
                if let Some(assembly) = &import.assembly {
                    entry = entry.with_assembly(assembly);
                }
                entries.push(entry);
            }
            pinvoke.insert(ImportModule::build(&def.module, entries)?)?;
        }

        if let Some((module, symbol)) = missing.into_iter().next() {
            return Err(BindError::UnresolvedSymbol { module, symbol });
        }

        info!(
            "Bound {} icall tables and {} import modules ({} shared libraries)",
            icalls.len(),
            pinvoke.len(),
            pins.0.len()
        );

        Ok(BoundTables {
            icalls,
            pinvoke,
            libraries: pins.0,
        })
    }

    /// Build the trampoline table for the manifest's native-to-managed
    /// slots.
    ///
    /// Each slot's native entry point is looked up in `source` under its C
    /// trampoline name; slots without one are still callable through the
    /// table.
    pub fn trampolines(&self, host: impl ManagedHost + 'static, source: &dyn SymbolSource) -> Result<TrampolineTable> {
        let descs = self
            .manifest
            .trampolines
            .iter()
            .map(|def| {
                let desc = def.desc()?;
                Ok(match resolve(source, None, &desc.c_name()) {
                    Some(entry) => desc.with_native_entry(entry),
                    None => desc,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        TrampolineTable::new(descs, host)
    }
}

fn resolve(source: &dyn SymbolSource, module: Option<&str>, symbol: &str) -> Option<FunctionPtr> {
    source.resolve(module, symbol).filter(|ptr| !ptr.is_null())
}

fn resolve_pinned(
    source: &dyn SymbolSource,
    module: Option<&str>,
    symbol: &str,
    pins: &mut Pins,
) -> Option<FunctionPtr> {
    let (ptr, library) = source.resolve_pinned(module, symbol)?;
    if ptr.is_null() {
        return None;
    }
    pins.keep(library);
    Some(ptr)
}
