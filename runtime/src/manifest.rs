//! Binding manifest
//!
//! The manifest is the build-time description of every native-callable
//! function: internal calls by token, named imports by module, and
//! native-to-managed trampolines. It is plain JSON:
//!
//! ```json
//! {
//!     "icalls": [
//!         {
//!             "assembly": "corlib",
//!             "entries": [
//!                 { "token": 161, "name": "ves_icall_System_Array_InternalCreate",
//!                   "returns": "void", "params": ["ptr", "ptr", "i32", "ptr", "ptr"] },
//!                 { "token": 178, "name": "ves_icall_System_Array_GetLengthInternal_raw",
//!                   "flags": 4, "returns": "i32", "params": ["i32", "i32", "i32"] }
//!             ]
//!         }
//!     ],
//!     "pinvoke": [
//!         {
//!             "module": "libSystem.Native",
//!             "imports": [
//!                 { "symbol": "SystemNative_GetErrNo", "returns": "i32",
//!                   "assembly": "System.Private.CoreLib" }
//!             ]
//!         },
//!         { "module": "libSystem.Globalization.Native", "imports": [] }
//!     ],
//!     "trampolines": [
//!         { "assembly": "System.Private.CoreLib", "namespace": "System.Threading",
//!           "type": "ThreadPool", "method": "BackgroundJobHandler", "arg_count": 0 }
//!     ]
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use log::info;
use serde::Deserialize;

use interop_abi::{InvokeFlags, Signature, Token, MAX_ARITY};

use crate::error::{BindError, Result};
use crate::trampoline::{c_ident, is_c_ident, is_c_literal_safe, TrampolineDesc};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub icalls: Vec<IcallTableDef>,

    #[serde(default)]
    pub pinvoke: Vec<ImportModuleDef>,

    #[serde(default)]
    pub trampolines: Vec<TrampolineDef>,
}

/// Internal calls of one managed assembly
#[derive(Debug, Clone, Deserialize)]
pub struct IcallTableDef {
    /// Assembly short name (e.g., "corlib")
    pub assembly: String,

    #[serde(default)]
    pub entries: Vec<IcallDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IcallDef {
    pub token: u32,

    /// Native symbol implementing the call
    pub name: String,

    /// Raw invocation flag bits
    #[serde(default)]
    pub flags: u8,

    /// Return kind; the entry carries no signature when absent
    #[serde(default)]
    pub returns: Option<String>,

    #[serde(default)]
    pub params: Vec<String>,
}

impl IcallDef {
    pub fn token(&self) -> Token {
        Token(self.token)
    }

    pub fn flags(&self) -> InvokeFlags {
        InvokeFlags::from_bits(self.flags)
    }

    pub fn signature(&self) -> Result<Option<Signature>> {
        parse_signature(&self.name, self.returns.as_deref(), &self.params)
    }
}

/// One named module bucket. `imports` may be empty.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportModuleDef {
    pub module: String,

    #[serde(default)]
    pub imports: Vec<ImportDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportDef {
    pub symbol: String,

    #[serde(default)]
    pub returns: Option<String>,

    #[serde(default)]
    pub params: Vec<String>,

    /// Managed assembly that declared the import
    #[serde(default)]
    pub assembly: Option<String>,
}

impl ImportDef {
    pub fn signature(&self) -> Result<Option<Signature>> {
        parse_signature(&self.symbol, self.returns.as_deref(), &self.params)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrampolineDef {
    pub assembly: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(rename = "type")]
    pub type_name: String,

    pub method: String,

    pub arg_count: usize,

    #[serde(default)]
    pub returns: Option<String>,

    /// Argument kinds; must have `arg_count` entries when present
    #[serde(default)]
    pub params: Option<Vec<String>>,
}

impl TrampolineDef {
    pub fn key(&self) -> String {
        TrampolineDesc::interp_key(&self.assembly, &self.type_name, &self.method)
    }

    /// Build the runtime descriptor for this slot.
    pub fn desc(&self) -> Result<TrampolineDesc> {
        if self.arg_count > MAX_ARITY {
            return Err(BindError::Manifest(format!(
                "trampoline '{}' takes {} arguments, at most {} are supported",
                self.key(),
                self.arg_count,
                MAX_ARITY
            )));
        }

        let desc = TrampolineDesc::new(
            &self.assembly,
            &self.namespace,
            &self.type_name,
            &self.method,
            self.arg_count,
        );

        let signature = match (&self.returns, &self.params) {
            (None, None) => None,
            (returns, params) => {
                let params = params.clone().unwrap_or_default();
                if params.len() != self.arg_count {
                    return Err(BindError::Manifest(format!(
                        "trampoline '{}' declares arg_count {} but lists {} params",
                        self.key(),
                        self.arg_count,
                        params.len()
                    )));
                }
                parse_signature(&self.key(), Some(returns.as_deref().unwrap_or("void")), &params)?
            }
        };

        match signature {
            Some(signature) => desc.with_signature(signature),
            None => Ok(desc),
        }
    }
}

fn parse_signature(name: &str, returns: Option<&str>, params: &[String]) -> Result<Option<Signature>> {
    match returns {
        None if params.is_empty() => Ok(None),
        None => Err(BindError::Manifest(format!("'{}' lists params but no return kind", name))),
        Some(ret) => Signature::parse(ret, params)
            .map(Some)
            .map_err(|e| BindError::Manifest(format!("'{}': {}", name, e))),
    }
}

impl Manifest {
    /// Read and parse a manifest file. The result is not validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BindError::Io(format!("Failed to read {}: {}", path.display(), e)))?;

        let manifest = serde_json::from_str::<Manifest>(&content)
            .map_err(|e| BindError::Manifest(format!("Invalid JSON in {}: {}", path.display(), e)))?;

        info!(
            "Loaded manifest {}: {} icalls, {} imports, {} trampolines",
            path.display(),
            manifest.icall_count(),
            manifest.import_count(),
            manifest.trampolines.len()
        );

        Ok(manifest)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| BindError::Manifest(format!("Invalid JSON: {}", e)))
    }

    pub fn icall_count(&self) -> usize {
        self.icalls.iter().map(|t| t.entries.len()).sum()
    }

    pub fn import_count(&self) -> usize {
        self.pinvoke.iter().map(|m| m.imports.len()).sum()
    }

    /// Check the manifest for everything that would fail a bind before any
    /// symbol is resolved.
    pub fn validate(&self) -> Result<()> {
        let mut assemblies = HashSet::new();
        let mut assembly_idents = HashMap::new();
        for table in &self.icalls {
            if !assemblies.insert(table.assembly.as_str()) {
                return Err(BindError::Manifest(format!(
                    "icall table '{}' is declared twice",
                    table.assembly
                )));
            }
            claim_ident(&mut assembly_idents, "icall tables", &table.assembly)?;

            let mut tokens = HashSet::new();
            for entry in &table.entries {
                if !tokens.insert(entry.token) {
                    return Err(BindError::DuplicateToken {
                        assembly: table.assembly.clone(),
                        token: entry.token(),
                    });
                }
                if entry.flags().reserved_bits() != 0 {
                    return Err(BindError::InvalidFlags {
                        name: entry.name.clone(),
                        bits: entry.flags().reserved_bits(),
                    });
                }
                require_ident("icall", &entry.name)?;
                entry.signature()?;
            }
        }

        let mut modules = HashSet::new();
        let mut module_idents = HashMap::new();
        for module in &self.pinvoke {
            if !modules.insert(module.module.as_str()) {
                return Err(BindError::Manifest(format!(
                    "import module '{}' is declared twice",
                    module.module
                )));
            }
            require_literal("import module", &module.module)?;
            claim_ident(&mut module_idents, "import modules", &module.module)?;

            let mut symbols = HashSet::new();
            for import in &module.imports {
                if !symbols.insert(import.symbol.as_str()) {
                    return Err(BindError::DuplicateSymbol {
                        module: module.module.clone(),
                        symbol: import.symbol.clone(),
                    });
                }
                require_ident("import", &import.symbol)?;
                if let Some(assembly) = &import.assembly {
                    require_literal("assembly", assembly)?;
                }
                import.signature()?;
            }
        }

        let mut keys = HashSet::new();
        let mut c_names = HashMap::new();
        for trampoline in &self.trampolines {
            for part in [&trampoline.assembly, &trampoline.namespace, &trampoline.type_name, &trampoline.method] {
                require_literal("trampoline", part)?;
            }
            let desc = trampoline.desc()?;
            if !keys.insert(desc.key().to_string()) {
                return Err(BindError::DuplicateTrampoline(desc.key().to_string()));
            }
            if let Some(other) = c_names.insert(desc.c_name(), desc.key().to_string()) {
                return Err(BindError::Manifest(format!(
                    "trampolines '{}' and '{}' both emit as '{}'",
                    other,
                    desc.key(),
                    desc.c_name()
                )));
            }
        }

        Ok(())
    }
}

/// Names that map to the same C identifier would emit the same array.
fn claim_ident<'a>(seen: &mut HashMap<String, &'a str>, what: &str, name: &'a str) -> Result<()> {
    let ident = c_ident(name);
    match seen.insert(ident.clone(), name) {
        Some(other) if other != name => Err(BindError::Manifest(format!(
            "{} '{}' and '{}' both emit as C identifier '{}'",
            what, other, name, ident
        ))),
        _ => Ok(()),
    }
}

fn require_ident(what: &str, name: &str) -> Result<()> {
    if is_c_ident(name) {
        Ok(())
    } else {
        Err(BindError::Manifest(format!("{} name '{}' is not a C identifier", what, name)))
    }
}

fn require_literal(what: &str, text: &str) -> Result<()> {
    if is_c_literal_safe(text) {
        Ok(())
    } else {
        Err(BindError::Manifest(format!(
            "{} name {:?} cannot be written into a C string literal",
            what, text
        )))
    }
}
