use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use interop_runtime::emit::{render_icall_table, render_interp_table, render_pinvoke_table};
use interop_runtime::{
    builtin_libraries, register_symbol, BindError, Binder, Chain, EmitOptions, InvokeFlags, Manifest, NativeFn,
    NoTransition, SharedLibrary, StaticSymbols, SymbolMap, Token,
};

extern "C" fn gc_get_collection_count(generation: i32) -> i32 {
    generation * 10
}

extern "C" fn monitor_wait_raw(a: i32, b: i32, c: i32) -> i32 {
    a + b + c
}

register_symbol!("ves_icall_System_GC_GetCollectionCount", gc_get_collection_count);
register_symbol!("ves_icall_System_Threading_Monitor_Monitor_wait_raw", monitor_wait_raw);

const TEST_ERRNO: i32 = 11;

const MANIFEST: &str = r#"{
    "icalls": [{
        "assembly": "corlib",
        "entries": [
            { "token": 9163, "name": "ves_icall_System_Threading_Monitor_Monitor_wait_raw",
              "flags": 4, "returns": "i32", "params": ["i32", "i32", "i32"] },
            { "token": 537, "name": "ves_icall_System_GC_GetCollectionCount",
              "returns": "i32", "params": ["i32"] }
        ]
    }],
    "pinvoke": [
        { "module": "libSystem.Native", "imports": [
            { "symbol": "SystemNative_GetErrNo", "returns": "int32_t",
              "assembly": "System.Private.CoreLib" },
            { "symbol": "SystemNative_SetErrNo", "returns": "void", "params": ["int32_t"],
              "assembly": "System.Private.CoreLib" },
            { "symbol": "SystemNative_GetTimestamp", "returns": "uint64_t",
              "assembly": "System.Private.CoreLib" }
        ]},
        { "module": "libSystem.IO.Compression.Native", "imports": [] },
        { "module": "libSystem.Globalization.Native", "imports": [] }
    ],
    "trampolines": [
        { "assembly": "System.Private.CoreLib", "namespace": "System.Threading",
          "type": "TimerQueue", "method": "TimerHandler", "arg_count": 0 }
    ]
}"#;

fn write_manifest() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(MANIFEST.as_bytes()).unwrap();
    file
}

fn sources() -> Chain {
    Chain::new().with(StaticSymbols::collect()).with(builtin_libraries())
}

#[test]
fn test_manifest_binds_against_linked_symbols() {
    interop_runtime::logging::init_test();

    let file = write_manifest();
    let manifest = Manifest::load(file.path()).unwrap();
    let bound = Binder::new(&manifest).unwrap().bind(&sources()).unwrap();

    assert!(bound.libraries().is_empty());

    let corlib = bound.icalls().get("corlib").unwrap();
    assert_eq!(
        corlib.entries().iter().map(|e| e.token()).collect::<Vec<_>>(),
        vec![Token(537), Token(9163)]
    );

    let count = unsafe {
        corlib.invoke::<extern "C" fn(i32) -> i32, _>(Token(537), &NoTransition, |f| f(2))
    }
    .unwrap();
    assert_eq!(count, 20);

    let wait = corlib.lookup(Token(9163)).unwrap();
    assert_eq!(wait.flags(), InvokeFlags::USES_HANDLES);

    // Recorded signature rejects the wrong Rust shape
    let wrong = unsafe { corlib.typed::<extern "C" fn(i32) -> i32>(Token(9163)) };
    assert!(matches!(wrong, Err(BindError::SignatureMismatch { .. })));

    let set_errno = bound.pinvoke().lookup("libSystem.Native", "SystemNative_SetErrNo").unwrap();
    let get_errno = bound.pinvoke().lookup("libSystem.Native", "SystemNative_GetErrNo").unwrap();
    unsafe {
        let set = <extern "C" fn(i32) as NativeFn>::from_ptr(set_errno);
        let get = <extern "C" fn() -> i32 as NativeFn>::from_ptr(get_errno);
        set(TEST_ERRNO);
        assert_eq!(get(), TEST_ERRNO);
        set(0);
    }

    assert!(bound.pinvoke().symbols("libSystem.Globalization.Native").unwrap().is_empty());
    assert!(matches!(
        bound.pinvoke().lookup("libSystem.Globalization.Native", "GlobalizationNative_LoadICU"),
        Err(BindError::UnresolvedSymbol { .. })
    ));
}

#[test]
fn test_unknown_symbol_fails_the_bind() {
    let json = MANIFEST.replace("SystemNative_GetTimestamp", "SystemNative_NotImplemented");
    let manifest = Manifest::from_json(&json).unwrap();

    let err = Binder::new(&manifest).unwrap().bind(&sources()).unwrap_err();
    assert_eq!(
        err,
        BindError::UnresolvedSymbol {
            module: "libSystem.Native".to_string(),
            symbol: "SystemNative_NotImplemented".to_string()
        }
    );

    // An explicit map can fill the gap
    let mut extra = SymbolMap::new();
    extra.insert_in(
        "libSystem.Native",
        "SystemNative_NotImplemented",
        interop_runtime::FunctionPtr::new(0x10 as *const u8),
    );
    let chain = sources().with(extra);
    assert!(Binder::new(&manifest).unwrap().bind(&chain).is_ok());
}

#[cfg(target_os = "linux")]
#[test]
fn test_bound_tables_keep_shared_library_loaded() {
    let json = r#"{ "pinvoke": [{ "module": "libc", "imports": [
        { "symbol": "getpid", "returns": "i32" }
    ]}] }"#;
    let manifest = Manifest::from_json(json).unwrap();

    let (bound, library) = {
        let shared = SharedLibrary::open(Path::new("libc.so.6")).unwrap().for_module("libc");
        let library = Arc::downgrade(&shared.handle());
        let chain = Chain::new().with(shared);
        (Binder::new(&manifest).unwrap().bind(&chain).unwrap(), library)
    };

    // The source is gone; the tables hold the only handle
    assert_eq!(bound.libraries().len(), 1);
    assert_eq!(library.strong_count(), 1);

    let getpid = bound.pinvoke().lookup("libc", "getpid").unwrap();
    let pid = unsafe { <extern "C" fn() -> i32 as NativeFn>::from_ptr(getpid)() };
    assert_eq!(pid as u32, std::process::id());

    drop(bound);
    assert!(library.upgrade().is_none());
}

#[test]
fn test_emitted_tables_match_manifest() {
    let file = write_manifest();
    let manifest = Manifest::load(file.path()).unwrap();

    let icalls = render_icall_table(&manifest).unwrap();
    let indexes = icalls.find("537,").unwrap();
    assert!(indexes < icalls.find("9163,").unwrap());
    assert!(icalls.contains("static uint8_t corlib_icall_flags [] = {\n0,\n4,\n};"));

    let pinvoke = render_pinvoke_table(&manifest).unwrap();
    assert!(pinvoke.contains("uint64_t SystemNative_GetTimestamp ();"));
    assert!(pinvoke.contains("void SystemNative_SetErrNo (int32_t);"));
    assert_eq!(pinvoke.matches("{NULL, NULL}").count(), 3);

    let interp = render_interp_table(&manifest, &EmitOptions::default()).unwrap();
    assert!(interp.contains("void wasm_native_to_interp_System_Threading_System_Private_CoreLib_TimerQueue_TimerHandler () { "));
    assert!(interp.contains("\"System_Private_CoreLib_TimerQueue_TimerHandler\""));
}
