//! interop - build and inspect native/managed binding tables
//!
//! # Usage
//!
//! ```bash
//! # Validate a manifest and bind it against the built-in exports
//! interop check bindings.json
//!
//! # Also resolve symbols from a shared library
//! interop check bindings.json --library ./libnative.so
//!
//! # Render the C tables
//! interop emit bindings.json --table icall -o icall-table.h
//! interop emit bindings.json --table pinvoke -o pinvoke-table.h
//! interop emit bindings.json --table interp --resolve-hook mono_wasm_marshal_get_managed_wrapper
//!
//! # Summarize a manifest
//! interop info bindings.json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use std::path::{Path, PathBuf};
use std::process;

use interop_abi::MAX_ARITY;
use interop_runtime::emit::{self, EmitOptions};
use interop_runtime::{builtin_libraries, logging, Binder, Chain, Manifest, SharedLibrary, StaticSymbols};

#[derive(Parser)]
#[command(name = "interop")]
#[command(version = "0.1.0")]
#[command(about = "Native/managed binding table tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a manifest and bind every symbol it names
    Check {
        /// Path to the binding manifest
        manifest: PathBuf,

        /// Shared library to resolve symbols from (repeatable)
        #[arg(short, long = "library")]
        libraries: Vec<PathBuf>,

        /// Enable verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Render C tables from a manifest
    Emit {
        /// Path to the binding manifest
        manifest: PathBuf,

        /// Which table to render
        #[arg(long, value_enum)]
        table: TableKind,

        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// C function trampolines call to resolve an unbound slot
        #[arg(long)]
        resolve_hook: Option<String>,

        /// C type of the trampoline descriptor array
        #[arg(long)]
        ftndesc_type: Option<String>,
    },

    /// Show a summary of a manifest
    Info {
        /// Path to the binding manifest
        manifest: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TableKind {
    /// Internal calls by token (icall-table.h)
    Icall,
    /// Named imports by module (pinvoke-table.h)
    Pinvoke,
    /// Native-to-interp trampolines
    Interp,
}

#[derive(ValueEnum, Clone, Debug)]
enum OutputFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    if let Commands::Check { verbose: true, .. } = cli.command {
        logging::init_with_level(log::LevelFilter::Debug);
    } else {
        logging::init_from_env();
    }

    let result = match cli.command {
        Commands::Check { manifest, libraries, verbose } => check_manifest(&manifest, &libraries, verbose),
        Commands::Emit {
            manifest,
            table,
            output,
            resolve_hook,
            ftndesc_type,
        } => emit_table(&manifest, table, output, resolve_hook, ftndesc_type),
        Commands::Info { manifest, format } => show_info(&manifest, format),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn load(path: &Path) -> Result<Manifest, String> {
    if !path.exists() {
        return Err(format!("File not found: {}", path.display()));
    }
    Manifest::load(path).map_err(|e| e.to_string())
}

fn check_manifest(path: &Path, libraries: &[PathBuf], verbose: bool) -> Result<(), String> {
    println!("Checking {}...", path.display());

    let manifest = load(path)?;
    let binder = Binder::new(&manifest).map_err(|e| e.to_string())?;
    println!("  Manifest: OK");

    let mut sources = Chain::new().with(StaticSymbols::collect()).with(builtin_libraries());
    for library in libraries {
        sources.push(SharedLibrary::open(library).map_err(|e| e.to_string())?);
        info!("Resolving symbols from {}", library.display());
    }

    let bound = binder.bind(&sources).map_err(|e| e.to_string())?;

    for table in bound.icalls().iter() {
        println!("  icalls[{}]: {} entries bound", table.assembly(), table.len());
        if verbose {
            for entry in table.entries() {
                println!("    {:>6}  {:<13} {}", entry.token().0, entry.flags().to_string(), entry.name());
            }
        }
    }

    for module in bound.pinvoke().iter() {
        println!("  pinvoke[{}]: {} imports bound", module.name(), module.len());
        if verbose {
            for entry in module.entries() {
                match entry.assembly() {
                    Some(assembly) => println!("    {}  ({})", entry.symbol(), assembly),
                    None => println!("    {}", entry.symbol()),
                }
            }
        }
    }

    if !bound.libraries().is_empty() {
        println!("  Shared libraries in use: {}", bound.libraries().len());
    }
    println!("  Trampolines: {} slots (bound lazily at run time)", manifest.trampolines.len());
    Ok(())
}

fn emit_table(
    path: &Path,
    table: TableKind,
    output: Option<PathBuf>,
    resolve_hook: Option<String>,
    ftndesc_type: Option<String>,
) -> Result<(), String> {
    let manifest = load(path)?;

    let mut options = EmitOptions::default();
    if let Some(hook) = resolve_hook {
        options.resolve_hook = hook;
    }
    if let Some(ty) = ftndesc_type {
        options.ftndesc_type = ty;
    }

    let rendered = match table {
        TableKind::Icall => emit::render_icall_table(&manifest),
        TableKind::Pinvoke => emit::render_pinvoke_table(&manifest),
        TableKind::Interp => emit::render_interp_table(&manifest, &options),
    }
    .map_err(|e| e.to_string())?;

    match output {
        Some(out) => {
            std::fs::write(&out, rendered).map_err(|e| format!("Failed to write {}: {}", out.display(), e))?;
            println!("Wrote {:?} table to {}", table, out.display());
        }
        None => print!("{}", rendered),
    }

    Ok(())
}

fn show_info(path: &Path, format: OutputFormat) -> Result<(), String> {
    let manifest = load(path)?;
    manifest.validate().map_err(|e| e.to_string())?;

    let empty_modules = manifest.pinvoke.iter().filter(|m| m.imports.is_empty()).count();
    let handle_calls = manifest
        .icalls
        .iter()
        .flat_map(|t| &t.entries)
        .filter(|e| e.flags().needs_transition())
        .count();

    match format {
        OutputFormat::Text => {
            println!("Manifest {}", path.display());
            println!("  Icall tables:    {}", manifest.icalls.len());
            for table in &manifest.icalls {
                println!("    {:<20} {} entries", table.assembly, table.entries.len());
            }
            println!("  Icalls:          {} ({} use handles)", manifest.icall_count(), handle_calls);
            println!("  Import modules:  {} ({} empty)", manifest.pinvoke.len(), empty_modules);
            for module in &manifest.pinvoke {
                println!("    {:<32} {} imports", module.module, module.imports.len());
            }
            println!("  Trampolines:     {}", manifest.trampolines.len());
            for trampoline in &manifest.trampolines {
                println!("    {} ({} args)", trampoline.key(), trampoline.arg_count);
            }
            println!("  Max arity:       {}", MAX_ARITY);
        }
        OutputFormat::Json => {
            println!("{{");
            println!("  \"icall_tables\": {},", manifest.icalls.len());
            println!("  \"icalls\": {},", manifest.icall_count());
            println!("  \"handle_icalls\": {},", handle_calls);
            println!("  \"import_modules\": {},", manifest.pinvoke.len());
            println!("  \"empty_modules\": {},", empty_modules);
            println!("  \"imports\": {},", manifest.import_count());
            println!("  \"trampolines\": {}", manifest.trampolines.len());
            println!("}}");
        }
    }

    Ok(())
}
