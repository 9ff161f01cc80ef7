use std::cell::Cell;
use std::ffi::CString;

use interop_runtime::{
    BindError, CoopTransition, DispatchEntry, FunctionPtr, IcallTable, ImportEntry, ImportModule, InvokeFlags,
    NativeFn, NoTransition, PinvokeTables, Token,
};

extern "C" fn fn_a(x: i32) -> i32 {
    x + 1
}

extern "C" fn fn_b(x: i32, y: i32) -> i32 {
    x * y
}

fn ptr_of<F: NativeFn>(f: F) -> FunctionPtr {
    f.to_ptr()
}

/// Minimal deterministic shuffle (LCG driven Fisher-Yates)
fn shuffle<T>(items: &mut [T], mut seed: u64) {
    for i in (1..items.len()).rev() {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let j = (seed >> 33) as usize % (i + 1);
        items.swap(i, j);
    }
}

#[derive(Default)]
struct CountingTransition {
    depth: Cell<i32>,
    entered: Cell<u32>,
}

impl CoopTransition for CountingTransition {
    fn enter(&self) {
        self.depth.set(self.depth.get() + 1);
        self.entered.set(self.entered.get() + 1);
    }

    fn leave(&self) {
        self.depth.set(self.depth.get() - 1);
    }
}

#[test]
fn test_token_dispatch_scenario() {
    let a = ptr_of(fn_a as extern "C" fn(i32) -> i32);
    let b = ptr_of(fn_b as extern "C" fn(i32, i32) -> i32);

    let table = IcallTable::build(
        "corlib",
        vec![
            DispatchEntry::new(Token(5), "fn_a", a, InvokeFlags::NONE),
            DispatchEntry::new(Token(12), "fn_b", b, InvokeFlags::USES_HANDLES),
        ],
    )
    .unwrap();

    let five = table.lookup(Token(5)).unwrap();
    assert_eq!((five.func(), five.flags()), (a, InvokeFlags::NONE));

    let twelve = table.lookup(Token(12)).unwrap();
    assert_eq!((twelve.func(), twelve.flags()), (b, InvokeFlags::USES_HANDLES));

    assert_eq!(
        table.lookup(Token(7)).unwrap_err(),
        BindError::UnknownToken {
            assembly: "corlib".to_string(),
            token: Token(7)
        }
    );
}

#[test]
fn test_invoke_brackets_handle_calls() {
    let table = IcallTable::build(
        "corlib",
        vec![
            DispatchEntry::new(Token(5), "fn_a", ptr_of(fn_a as extern "C" fn(i32) -> i32), InvokeFlags::NONE),
            DispatchEntry::new(
                Token(12),
                "fn_b",
                ptr_of(fn_b as extern "C" fn(i32, i32) -> i32),
                InvokeFlags::USES_HANDLES,
            ),
        ],
    )
    .unwrap();

    let transition = CountingTransition::default();

    let direct = unsafe {
        table.invoke::<extern "C" fn(i32) -> i32, _>(Token(5), &transition, |f| {
            assert_eq!(transition.depth.get(), 0);
            f(41)
        })
    }
    .unwrap();
    assert_eq!(direct, 42);
    assert_eq!(transition.entered.get(), 0);

    let wrapped = unsafe {
        table.invoke::<extern "C" fn(i32, i32) -> i32, _>(Token(12), &transition, |f| {
            assert_eq!(transition.depth.get(), 1);
            f(6, 7)
        })
    }
    .unwrap();
    assert_eq!(wrapped, 42);
    assert_eq!(transition.entered.get(), 1);
    assert_eq!(transition.depth.get(), 0);

    let missing = unsafe { table.invoke::<extern "C" fn(i32) -> i32, _>(Token(7), &NoTransition, |f| f(0)) };
    assert!(matches!(missing, Err(BindError::UnknownToken { .. })));
}

#[test]
fn test_registration_order_does_not_matter() {
    let tokens: Vec<u32> = vec![161, 174, 175, 181, 185, 359, 418, 537, 542, 576, 9163];
    let entries: Vec<DispatchEntry> = tokens
        .iter()
        .map(|&t| {
            let flags = if t % 2 == 0 { InvokeFlags::USES_HANDLES } else { InvokeFlags::NONE };
            DispatchEntry::new(Token(t), format!("icall_{}", t), FunctionPtr::new(t as usize as *const u8), flags)
        })
        .collect();

    let reference = IcallTable::build("corlib", entries.clone()).unwrap();

    for seed in [1u64, 7, 42, 1234, 99991] {
        let mut shuffled = entries.clone();
        shuffle(&mut shuffled, seed);
        let table = IcallTable::build("corlib", shuffled).unwrap();

        for &t in &tokens {
            let expected = reference.lookup(Token(t)).unwrap();
            let found = table.lookup(Token(t)).unwrap();
            assert_eq!(found, expected);
        }
        for probe in [0u32, 7, 160, 176, 9162, 9164, u32::MAX] {
            assert!(table.lookup(Token(probe)).is_err());
        }
    }
}

#[test]
fn test_parallel_arrays_stay_aligned_when_shuffled() {
    let mut rows: Vec<(u32, usize, u8)> = (0..40u32).map(|i| (100 + i * 3, 0x1000 + i as usize, if i % 5 == 0 { 4 } else { 0 })).collect();
    shuffle(&mut rows, 5);

    let tokens: Vec<u32> = rows.iter().map(|r| r.0).collect();
    let funcs: Vec<FunctionPtr> = rows.iter().map(|r| FunctionPtr::new(r.1 as *const u8)).collect();
    let flags: Vec<u8> = rows.iter().map(|r| r.2).collect();

    let table = IcallTable::from_parallel("corlib", &tokens, &funcs, &flags).unwrap();
    for (token, func, bits) in rows {
        let entry = table.lookup(Token(token)).unwrap();
        assert_eq!(entry.func(), FunctionPtr::new(func as *const u8));
        assert_eq!(entry.flags().bits(), bits);
    }
}

#[test]
fn test_named_import_scenario() {
    let p1 = FunctionPtr::new(0x1234 as *const u8);

    let mut tables = PinvokeTables::new();
    tables
        .insert(ImportModule::build("libFoo", vec![ImportEntry::new("bar", p1)]).unwrap())
        .unwrap();
    tables.insert(ImportModule::empty("libEmpty")).unwrap();

    assert_eq!(tables.lookup("libFoo", "bar").unwrap(), p1);
    assert!(tables.symbols("libEmpty").unwrap().is_empty());
    assert_eq!(
        tables.lookup("libEmpty", "anything").unwrap_err(),
        BindError::UnresolvedSymbol {
            module: "libEmpty".to_string(),
            symbol: "anything".to_string()
        }
    );

    // The same answers through the exported C layout
    let exported = tables.export().unwrap();
    assert_eq!(exported.module_count(), 2);
    let foo = CString::new("libFoo").unwrap();
    let empty = CString::new("libEmpty").unwrap();
    let bar = CString::new("bar").unwrap();
    let anything = CString::new("anything").unwrap();
    assert_eq!(exported.resolve(&foo, &bar), Some(p1.as_raw()));
    assert_eq!(exported.resolve(&empty, &anything), None);
    assert!(exported.table(1).unwrap()[0].is_sentinel());
}
