//! C table emission
//!
//! Renders a [`Manifest`] into the C sources a native build links against:
//!
//! - the internal call table (`icall-table.h`): sorted token array,
//!   prototypes, function array and flag array per assembly
//! - the named import table (`pinvoke-table.h`): prototypes, one
//!   `{NULL, NULL}`-terminated `PinvokeImport` array per module, and the
//!   parallel `pinvoke_tables` / `pinvoke_names` arrays
//! - the native-to-interp block: descriptor array, one entry typedef and
//!   trampoline per slot, and the `_funcs` / `_map` lookup arrays
//!
//! Every array is produced from the same composite manifest entry, so the
//! parallel C arrays always agree with each other.

use std::collections::HashSet;
use std::fmt::{self, Write};

use interop_abi::{NativeKind, Signature};

use crate::error::{BindError, Result};
use crate::manifest::{IcallTableDef, Manifest};
use crate::trampoline::{c_ident, is_c_ident, TrampolineDesc};

const GENERATED_BANNER: &str = "// GENERATED FILE, DO NOT MODIFY";

/// Names the host side of the generated trampolines
#[derive(Debug, Clone)]
pub struct EmitOptions {
    /// C function called with (assembly, namespace, type, method, arg count)
    /// when a slot is still unbound
    pub resolve_hook: String,

    /// C type of the per-slot descriptor (`func` and `arg` members)
    pub ftndesc_type: String,

    /// Lines placed before the native-to-interp block
    pub includes: Vec<String>,
}

impl Default for EmitOptions {
    fn default() -> Self {
        Self {
            resolve_hook: "interop_resolve_managed_entry".to_string(),
            ftndesc_type: "InterpFtnDesc".to_string(),
            includes: Vec::new(),
        }
    }
}

fn fmt_err(e: fmt::Error) -> BindError {
    BindError::Io(format!("failed to render C table: {}", e))
}

fn prototype(name: &str, signature: Option<Signature>) -> String {
    match signature {
        Some(signature) => signature.c_declaration(name),
        None => format!("void {} ();", name),
    }
}

// ============================================================================
// Internal call table
// ============================================================================

/// Render `icall-table.h`.
pub fn render_icall_table(manifest: &Manifest) -> Result<String> {
    manifest.validate()?;

    let mut out = String::new();
    for table in &manifest.icalls {
        write_icall_table(&mut out, table)?;
    }
    Ok(out)
}

fn write_icall_table(out: &mut String, table: &IcallTableDef) -> Result<()> {
    let ident = c_ident(&table.assembly);
    let mut entries: Vec<_> = table.entries.iter().collect();
    entries.sort_by_key(|e| e.token);

    let mut prototypes = Vec::with_capacity(entries.len());
    for entry in &entries {
        prototypes.push(prototype(&entry.name, entry.signature()?));
    }

    (|| -> fmt::Result {
        writeln!(out, "#define ICALL_TABLE_{} 1", ident)?;
        writeln!(out)?;

        writeln!(out, "static int {}_icall_indexes [] = {{", ident)?;
        for entry in &entries {
            writeln!(out, "{},", entry.token)?;
        }
        writeln!(out, "}};")?;

        for line in &prototypes {
            writeln!(out, "{}", line)?;
        }

        writeln!(out, "static void *{}_icall_funcs [] = {{", ident)?;
        for entry in &entries {
            writeln!(out, "// token {},", entry.token)?;
            writeln!(out, "{},", entry.name)?;
        }
        writeln!(out, "}};")?;

        writeln!(out, "static uint8_t {}_icall_flags [] = {{", ident)?;
        for entry in &entries {
            writeln!(out, "{},", entry.flags)?;
        }
        writeln!(out, "}};")
    })()
    .map_err(fmt_err)
}

// ============================================================================
// Named import table
// ============================================================================

/// Render `pinvoke-table.h`.
pub fn render_pinvoke_table(manifest: &Manifest) -> Result<String> {
    manifest.validate()?;

    let mut declared = HashSet::new();
    let mut prototypes = Vec::new();
    for module in &manifest.pinvoke {
        for import in &module.imports {
            if declared.insert(import.symbol.as_str()) {
                prototypes.push(prototype(&import.symbol, import.signature()?));
            }
        }
    }

    let mut out = String::new();
    (|| -> fmt::Result {
        writeln!(out, "{}", GENERATED_BANNER)?;
        writeln!(out)?;
        for line in &prototypes {
            writeln!(out)?;
            writeln!(out, "{}", line)?;
        }

        for module in &manifest.pinvoke {
            writeln!(out, "static PinvokeImport {}_imports [] = {{", c_ident(&module.module))?;
            for import in &module.imports {
                write!(out, "    {{\"{}\", {}}},", import.symbol, import.symbol)?;
                match &import.assembly {
                    Some(assembly) => writeln!(out, " // {}", assembly)?,
                    None => writeln!(out)?,
                }
            }
            writeln!(out, "    {{NULL, NULL}}")?;
            writeln!(out, "}};")?;
        }
        writeln!(out)?;

        let tables: Vec<String> = manifest
            .pinvoke
            .iter()
            .map(|m| format!("(void*){}_imports", c_ident(&m.module)))
            .collect();
        writeln!(out, "static void *pinvoke_tables[] = {{")?;
        writeln!(out, "    {}", tables.join(", "))?;
        writeln!(out, "}};")?;
        writeln!(out)?;

        let names: Vec<String> = manifest.pinvoke.iter().map(|m| format!("\"{}\"", m.module)).collect();
        writeln!(out, "static char *pinvoke_names[] =  {{")?;
        writeln!(out, "    {}", names.join(", "))?;
        writeln!(out, "}};")
    })()
    .map_err(fmt_err)?;

    Ok(out)
}

// ============================================================================
// Native-to-interp trampolines
// ============================================================================

/// Render the native-to-interp block.
///
/// Slot `i` of the C descriptor array is trampoline `i` of the manifest,
/// the same index the runtime [`crate::trampoline::TrampolineTable`] uses.
pub fn render_interp_table(manifest: &Manifest, options: &EmitOptions) -> Result<String> {
    manifest.validate()?;
    for name in [&options.resolve_hook, &options.ftndesc_type] {
        if !is_c_ident(name) {
            return Err(BindError::Manifest(format!("'{}' is not a C identifier", name)));
        }
    }

    let descs = manifest
        .trampolines
        .iter()
        .map(|t| t.desc())
        .collect::<Result<Vec<_>>>()?;

    let mut out = String::new();
    (|| -> fmt::Result {
        for include in &options.includes {
            writeln!(out, "{}", include)?;
        }
        if descs.is_empty() {
            return Ok(());
        }

        writeln!(
            out,
            "{} wasm_native_to_interp_ftndescs[{}] = {{}};",
            options.ftndesc_type,
            descs.len()
        )?;
        for (slot, desc) in descs.iter().enumerate() {
            write_trampoline(&mut out, slot, desc, options)?;
        }
        writeln!(out)?;

        let funcs: Vec<String> = descs.iter().map(|d| d.c_name()).collect();
        writeln!(out, "static void *wasm_native_to_interp_funcs[] = {{")?;
        writeln!(out, "    {}", funcs.join(", "))?;
        writeln!(out, "}};")?;
        writeln!(out)?;

        let keys: Vec<String> = descs.iter().map(|d| format!("\"{}\"", d.key())).collect();
        writeln!(out, "// these strings need to match the keys generated in get_native_to_interp")?;
        writeln!(out, "static const char *wasm_native_to_interp_map[] = {{")?;
        writeln!(out, "    {}", keys.join(", "))?;
        writeln!(out, "}};")
    })()
    .map_err(fmt_err)?;

    Ok(out)
}

fn write_trampoline(out: &mut String, slot: usize, desc: &TrampolineDesc, options: &EmitOptions) -> fmt::Result {
    let ret = desc.return_kind();
    let has_result = ret != NativeKind::Void;
    let param_types: Vec<&str> = match desc.signature() {
        Some(signature) => signature.params().iter().map(|k| k.c_name()).collect(),
        None => vec![NativeKind::Ptr.c_name(); desc.arg_count()],
    };

    let sig = format!("WasmInterpEntrySig_{}", slot);
    let entry = format!("wasm_native_to_interp_ftndescs [{}]", slot);

    // result pointer, one pointer per argument, context
    let width = usize::from(has_result) + desc.arg_count() + 1;
    writeln!(out, "typedef void (*{}) ({});", sig, vec!["int*"; width].join(", "))?;

    let params: Vec<String> = param_types
        .iter()
        .enumerate()
        .map(|(i, ty)| format!("{} arg{}", ty, i))
        .collect();
    writeln!(out, "{} {} ({}) {{ ", ret.c_name(), desc.c_name(), params.join(", "))?;
    if has_result {
        writeln!(out, "  {} res;", ret.c_name())?;
    }

    writeln!(out, "  if (!({}){}.func) {{", sig, entry)?;
    writeln!(
        out,
        "   {} (\"{}\",\"{}\", \"{}\", \"{}\", {});",
        options.resolve_hook,
        desc.assembly(),
        desc.namespace(),
        desc.type_name(),
        desc.method(),
        desc.arg_count()
    )?;
    writeln!(out, "  }}")?;

    let mut call_args = Vec::with_capacity(width);
    if has_result {
        call_args.push("(int*)&res".to_string());
    }
    call_args.extend((0..desc.arg_count()).map(|i| format!("(int*)&arg{}", i)));
    call_args.push(format!("{}.arg", entry));
    writeln!(out, "  (({}){}.func) ({});", sig, entry, call_args.join(", "))?;

    if has_result {
        writeln!(out, "  return res;")?;
    }
    writeln!(out, "}}")?;
    writeln!(out)
}
