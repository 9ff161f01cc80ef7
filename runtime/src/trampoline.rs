//! Lazy native-to-managed trampolines
//!
//! Each slot of a [`TrampolineTable`] starts unbound. The first call asks the
//! [`ManagedHost`] for a managed entry point, stores it, and every later call
//! goes straight through the cached pointer.
//!
//! # Binding Protocol
//!
//! - Bound entries are published through a `OnceLock`, so readers see either
//!   nothing or the complete `(func, context)` pair.
//! - Resolution is claimed under a per-slot `parking_lot` mutex. Only the
//!   claiming thread calls the host; others wait on the slot's condvar.
//! - The mutex is released while the host runs. If the host re-enters the
//!   same slot on the resolving thread the call fails fast with
//!   `ReentrantResolution` instead of deadlocking.
//! - Waits across slots are tracked per table. A thread that would wait on a
//!   slot whose resolver is (transitively) waiting on a slot this thread is
//!   resolving gets `ReentrantResolution` too, so two hosts binding each
//!   other's slots cannot deadlock.
//! - A failed resolution returns the slot to `Unbound`; waiters wake up and
//!   one of them retries.
//!
//! # Invocation
//!
//! Managed entries take every argument by reference plus the slot context.
//! Non-void entries receive a pointer to the result first:
//!
//! ```text
//! void entry(R *result, A1 *a1, ..., An *an, void *context);
//! void entry(A1 *a1, ..., An *an, void *context);           // void return
//! ```

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};

use interop_abi::{FunctionPtr, NativeKind, NativeReturn, NativeType, Signature, MAX_ARITY};

use crate::error::{BindError, Result};

/// Identifies the managed method behind one trampoline slot
#[derive(Debug, Clone, PartialEq)]
pub struct TrampolineDesc {
    assembly: String,
    namespace: String,
    type_name: String,
    method: String,
    arg_count: usize,
    /// Native-facing shape, when known
    signature: Option<Signature>,
    /// The generated native trampoline for this slot
    native_entry: Option<FunctionPtr>,
    key: String,
}

impl TrampolineDesc {
    pub fn new(
        assembly: impl Into<String>,
        namespace: impl Into<String>,
        type_name: impl Into<String>,
        method: impl Into<String>,
        arg_count: usize,
    ) -> Self {
        let assembly = assembly.into();
        let type_name = type_name.into();
        let method = method.into();
        let key = Self::interp_key(&assembly, &type_name, &method);
        Self {
            assembly,
            namespace: namespace.into(),
            type_name,
            method,
            arg_count,
            signature: None,
            native_entry: None,
            key,
        }
    }

    /// `System.Private.CoreLib` + `ThreadPool` + `BackgroundJobHandler`
    /// → `System_Private_CoreLib_ThreadPool_BackgroundJobHandler`
    pub fn interp_key(assembly: &str, type_name: &str, method: &str) -> String {
        format!("{}_{}_{}", c_ident(assembly), c_ident(type_name), c_ident(method))
    }

    /// Attach the native shape; its arity must equal `arg_count`.
    pub fn with_signature(mut self, signature: Signature) -> Result<Self> {
        if signature.arity() != self.arg_count {
            return Err(BindError::SignatureMismatch {
                name: self.key,
                expected: format!("{} arguments", self.arg_count),
                found: signature.to_string(),
            });
        }
        self.signature = Some(signature);
        Ok(self)
    }

    pub fn with_native_entry(mut self, entry: FunctionPtr) -> Self {
        self.native_entry = Some(entry);
        self
    }

    pub fn assembly(&self) -> &str {
        &self.assembly
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn arg_count(&self) -> usize {
        self.arg_count
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn native_entry(&self) -> Option<FunctionPtr> {
        self.native_entry
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// C name of the generated trampoline function
    pub fn c_name(&self) -> String {
        format!(
            "wasm_native_to_interp_{}_{}",
            c_ident(&self.namespace),
            self.key
        )
    }

    /// Native return kind; `void` unless a signature says otherwise
    pub fn return_kind(&self) -> NativeKind {
        self.signature
            .as_ref()
            .map(|s| s.ret())
            .unwrap_or(NativeKind::Void)
    }
}

pub(crate) fn c_ident(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub(crate) fn is_c_ident(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Text that can go inside a C string literal or line comment as is
pub(crate) fn is_c_literal_safe(s: &str) -> bool {
    !s.chars().any(|c| c == '"' || c == '\\' || c.is_control())
}

/// A bound managed entry: the function to call and its opaque context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEntry {
    pub func: FunctionPtr,
    pub context: *mut c_void,
}

// SAFETY: the context is an opaque host token; this crate never dereferences
// it, only hands it back to the entry it was resolved with.
unsafe impl Send for ResolvedEntry {}
unsafe impl Sync for ResolvedEntry {}

/// The execution host's "resolve managed entry" operation
pub trait ManagedHost: Send + Sync {
    fn resolve_managed_entry(&self, desc: &TrampolineDesc) -> std::result::Result<ResolvedEntry, String>;
}

impl<F> ManagedHost for F
where
    F: Fn(&TrampolineDesc) -> std::result::Result<ResolvedEntry, String> + Send + Sync,
{
    fn resolve_managed_entry(&self, desc: &TrampolineDesc) -> std::result::Result<ResolvedEntry, String> {
        self(desc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Unbound,
    Resolving(ThreadId),
    Bound,
}

struct TrampolineSlot {
    desc: TrampolineDesc,
    bound: OnceLock<ResolvedEntry>,
    state: Mutex<SlotState>,
    resolved: Condvar,
}

/// Who resolves which slot, and which slot each blocked thread waits on.
///
/// Lock order: a slot's state lock may be held while taking this one, never
/// the reverse.
#[derive(Default)]
struct WaitGraph {
    resolvers: HashMap<usize, ThreadId>,
    waiting: HashMap<ThreadId, usize>,
}

impl WaitGraph {
    /// Would `me` waiting on a slot resolved by `owner` close a cycle?
    fn closes_cycle(&self, me: ThreadId, owner: ThreadId) -> bool {
        let mut current = owner;
        // Each thread waits on at most one slot, so a walk longer than the
        // number of waiters has already looped without reaching `me`.
        for _ in 0..=self.waiting.len() {
            if current == me {
                return true;
            }
            match self.waiting.get(&current).and_then(|slot| self.resolvers.get(slot)) {
                Some(next) => current = *next,
                None => return false,
            }
        }
        false
    }
}

/// Returns a claimed slot to `Unbound` if the host unwinds mid-resolution.
struct ResolutionClaim<'a> {
    table: &'a TrampolineTable,
    index: usize,
    settled: bool,
}

impl Drop for ResolutionClaim<'_> {
    fn drop(&mut self) {
        if !self.settled {
            let slot = &self.table.slots[self.index];
            let mut state = slot.state.lock();
            *state = SlotState::Unbound;
            self.table.waits.lock().resolvers.remove(&self.index);
            drop(state);
            slot.resolved.notify_all();
        }
    }
}

/// Fixed set of lazily bound native-to-managed trampolines
pub struct TrampolineTable {
    slots: Vec<TrampolineSlot>,
    by_key: HashMap<String, usize>,
    host: Box<dyn ManagedHost>,
    resolutions: AtomicUsize,
    waits: Mutex<WaitGraph>,
}

impl TrampolineTable {
    /// One unbound slot per descriptor; slot `i` is `descs[i]`.
    pub fn new(descs: Vec<TrampolineDesc>, host: impl ManagedHost + 'static) -> Result<Self> {
        let mut by_key = HashMap::with_capacity(descs.len());
        let mut slots = Vec::with_capacity(descs.len());

        for (index, desc) in descs.into_iter().enumerate() {
            if desc.arg_count > MAX_ARITY {
                return Err(BindError::Manifest(format!(
                    "trampoline '{}' takes {} arguments, at most {} supported",
                    desc.key, desc.arg_count, MAX_ARITY
                )));
            }
            if by_key.insert(desc.key.clone(), index).is_some() {
                return Err(BindError::DuplicateTrampoline(desc.key));
            }
            slots.push(TrampolineSlot {
                desc,
                bound: OnceLock::new(),
                state: Mutex::new(SlotState::Unbound),
                resolved: Condvar::new(),
            });
        }

        debug!("Created trampoline table with {} slots", slots.len());

        Ok(Self {
            slots,
            by_key,
            host: Box::new(host),
            resolutions: AtomicUsize::new(0),
            waits: Mutex::new(WaitGraph::default()),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, slot: usize) -> Result<&TrampolineSlot> {
        self.slots.get(slot).ok_or(BindError::SlotOutOfRange {
            slot,
            len: self.slots.len(),
        })
    }

    pub fn desc(&self, slot: usize) -> Result<&TrampolineDesc> {
        Ok(&self.slot(slot)?.desc)
    }

    pub fn descs(&self) -> impl Iterator<Item = &TrampolineDesc> {
        self.slots.iter().map(|s| &s.desc)
    }

    pub fn slot_by_key(&self, key: &str) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    /// Native trampoline registered for an interp key
    pub fn entry_point(&self, key: &str) -> Option<FunctionPtr> {
        let slot = self.slot_by_key(key)?;
        self.slots[slot].desc.native_entry
    }

    pub fn is_bound(&self, slot: usize) -> bool {
        self.slots
            .get(slot)
            .map(|s| s.bound.get().is_some())
            .unwrap_or(false)
    }

    /// Host resolution calls made so far, across all slots
    pub fn resolution_count(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    /// Return the slot's entry, resolving it through the host on first use.
    pub fn bind(&self, slot: usize) -> Result<ResolvedEntry> {
        let s = self.slot(slot)?;
        if let Some(entry) = s.bound.get() {
            return Ok(*entry);
        }

        let me = thread::current().id();
        let mut state = s.state.lock();
        loop {
            match *state {
                SlotState::Bound => return Self::published(s),
                SlotState::Resolving(owner) if owner == me => {
                    return Err(BindError::ReentrantResolution {
                        key: s.desc.key.clone(),
                    });
                }
                SlotState::Resolving(owner) => {
                    {
                        let mut waits = self.waits.lock();
                        if waits.closes_cycle(me, owner) {
                            warn!("Resolution of '{}' would wait on its own resolver", s.desc.key);
                            return Err(BindError::ReentrantResolution {
                                key: s.desc.key.clone(),
                            });
                        }
                        waits.waiting.insert(me, slot);
                    }
                    s.resolved.wait(&mut state);
                    self.waits.lock().waiting.remove(&me);
                }
                SlotState::Unbound => break,
            }
        }
        *state = SlotState::Resolving(me);
        self.waits.lock().resolvers.insert(slot, me);
        drop(state);

        let mut claim = ResolutionClaim {
            table: self,
            index: slot,
            settled: false,
        };

        debug!("Resolving managed entry '{}' for slot {}", s.desc.key, slot);
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .host
            .resolve_managed_entry(&s.desc)
            .and_then(|entry| {
                if entry.func.is_null() {
                    Err("host returned a null entry point".to_string())
                } else {
                    Ok(entry)
                }
            });

        let mut state = s.state.lock();
        claim.settled = true;
        self.waits.lock().resolvers.remove(&slot);
        let result = match outcome {
            Ok(entry) => {
                // Only the claiming thread ever sets the cell.
                let _ = s.bound.set(entry);
                *state = SlotState::Bound;
                trace!("Slot {} bound to {:?}", slot, entry.func);
                Ok(entry)
            }
            Err(reason) => {
                *state = SlotState::Unbound;
                warn!("Resolution of '{}' failed: {}", s.desc.key, reason);
                Err(BindError::ResolutionFailure {
                    key: s.desc.key.clone(),
                    reason,
                })
            }
        };
        s.resolved.notify_all();
        result
    }

    fn published(s: &TrampolineSlot) -> Result<ResolvedEntry> {
        s.bound.get().copied().ok_or_else(|| BindError::ResolutionFailure {
            key: s.desc.key.clone(),
            reason: "slot marked bound without an entry".to_string(),
        })
    }

    fn check_shape<A: InterpArgs>(&self, slot: usize, ret: NativeKind) -> Result<()> {
        let desc = self.desc(slot)?;
        if A::ARITY != desc.arg_count {
            return Err(BindError::SignatureMismatch {
                name: desc.key.clone(),
                expected: format!("{} arguments", desc.arg_count),
                found: format!("{} arguments", A::ARITY),
            });
        }
        if let Some(expected) = &desc.signature {
            let found = Signature::new(ret, A::kinds()).map_err(BindError::Manifest)?;
            if *expected != found {
                return Err(BindError::signature_mismatch(&desc.key, expected, &found));
            }
        }
        Ok(())
    }

    /// Call a slot whose managed entry produces a value.
    ///
    /// # Safety
    /// The host must resolve the slot to an entry with the non-void interp
    /// shape for `A` and `R`.
    pub unsafe fn invoke<A, R>(&self, slot: usize, args: A) -> Result<R>
    where
        A: InterpArgs,
        R: NativeType + NativeReturn,
    {
        self.check_shape::<A>(slot, <R as NativeReturn>::KIND)?;
        let entry = self.bind(slot)?;

        // Every native kind is valid when zeroed.
        let mut result = MaybeUninit::<R>::zeroed();
        args.call_with_result(entry.func, result.as_mut_ptr() as *mut c_void, entry.context);
        Ok(result.assume_init())
    }

    /// Call a slot whose managed entry returns nothing.
    ///
    /// # Safety
    /// The host must resolve the slot to an entry with the void interp shape
    /// for `A`.
    pub unsafe fn invoke_void<A: InterpArgs>(&self, slot: usize, args: A) -> Result<()> {
        self.check_shape::<A>(slot, NativeKind::Void)?;
        let entry = self.bind(slot)?;
        args.call_void(entry.func, entry.context);
        Ok(())
    }
}

/// Argument tuples that can be forwarded to a managed interp entry.
///
/// Implemented for tuples of up to [`MAX_ARITY`] native values; each arity
/// casts the entry to its own exact signature.
pub trait InterpArgs {
    const ARITY: usize;

    /// Native kind of each tuple element, in order
    fn kinds() -> Vec<NativeKind>;

    /// # Safety
    /// `func` must have the shape `fn(*mut R, *mut A1, .., *mut An, ctx)`.
    unsafe fn call_with_result(self, func: FunctionPtr, result: *mut c_void, context: *mut c_void);

    /// # Safety
    /// `func` must have the shape `fn(*mut A1, .., *mut An, ctx)`.
    unsafe fn call_void(self, func: FunctionPtr, context: *mut c_void);
}

macro_rules! erased {
    ($_t:ident) => {
        *mut c_void
    };
}

macro_rules! impl_interp_args {
    ($arity:expr; $($arg:ident $idx:tt),*) => {
        impl<$($arg: NativeType),*> InterpArgs for ($($arg,)*) {
            const ARITY: usize = $arity;

            fn kinds() -> Vec<NativeKind> {
                vec![$(<$arg as NativeType>::KIND),*]
            }

            #[allow(unused_mut, unused_variables)]
            unsafe fn call_with_result(self, func: FunctionPtr, result: *mut c_void, context: *mut c_void) {
                let entry = std::mem::transmute_copy::<
                    *const u8,
                    unsafe extern "C" fn(*mut c_void, $(erased!($arg),)* *mut c_void),
                >(&func.as_ptr());
                let mut args = self;
                entry(result, $(&mut args.$idx as *mut $arg as *mut c_void,)* context);
            }

            #[allow(unused_mut, unused_variables)]
            unsafe fn call_void(self, func: FunctionPtr, context: *mut c_void) {
                let entry = std::mem::transmute_copy::<
                    *const u8,
                    unsafe extern "C" fn($(erased!($arg),)* *mut c_void),
                >(&func.as_ptr());
                let mut args = self;
                entry($(&mut args.$idx as *mut $arg as *mut c_void,)* context);
            }
        }
    };
}

impl_interp_args!(0;);
impl_interp_args!(1; A1 0);
impl_interp_args!(2; A1 0, A2 1);
impl_interp_args!(3; A1 0, A2 1, A3 2);
impl_interp_args!(4; A1 0, A2 1, A3 2, A4 3);
impl_interp_args!(5; A1 0, A2 1, A3 2, A4 3, A5 4);
impl_interp_args!(6; A1 0, A2 1, A3 2, A4 3, A5 4, A6 5);
impl_interp_args!(7; A1 0, A2 1, A3 2, A4 3, A5 4, A6 5, A7 6);
impl_interp_args!(8; A1 0, A2 1, A3 2, A4 3, A5 4, A6 5, A7 6, A8 7);

/// Generate exported native trampolines bound to table slots.
///
/// `$table` is a function returning `&'static TrampolineTable`. Each
/// generated function forwards to its slot; a binding failure at this
/// boundary is fatal (see [`crate::fatal::binding_failure`]).
///
/// ```rust,ignore
/// native_to_interp! {
///     interp_table;
///     0 => fn background_job_handler();
///     1 => fn get_function_pointer(a0: *mut c_void, a1: *mut c_void) -> i32;
/// }
/// ```
#[macro_export]
macro_rules! native_to_interp {
    (@call $table:ident, $slot:literal, $site:expr, ($($arg:ident),*), $ret:ty) => {
        // SAFETY: the table's host resolves this slot to an entry of this shape.
        match unsafe { $table.invoke::<_, $ret>($slot, ($($arg,)*)) } {
            Ok(value) => value,
            Err(err) => $crate::fatal::binding_failure(&err, $site),
        }
    };
    (@call $table:ident, $slot:literal, $site:expr, ($($arg:ident),*)) => {
        // SAFETY: the table's host resolves this slot to an entry of this shape.
        if let Err(err) = unsafe { $table.invoke_void($slot, ($($arg,)*)) } {
            $crate::fatal::binding_failure(&err, $site);
        }
    };
    (
        $table:path;
        $($(#[$meta:meta])* $slot:literal => fn $name:ident($($arg:ident : $aty:ty),* $(,)?) $(-> $ret:ty)?;)*
    ) => {
        $(
            $(#[$meta])*
            pub extern "C" fn $name($($arg: $aty),*) $(-> $ret)? {
                let table: &$crate::trampoline::TrampolineTable = $table();
                $crate::native_to_interp!(@call table, $slot, stringify!($name), ($($arg),*) $(, $ret)?)
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::{Arc, Barrier};
    use std::time::Duration;

    static TICKS: AtomicI32 = AtomicI32::new(0);

    unsafe extern "C" fn managed_tick(context: *mut c_void) {
        TICKS.fetch_add(context as usize as i32, Ordering::SeqCst);
    }

    unsafe extern "C" fn managed_add(result: *mut c_void, a: *mut c_void, b: *mut c_void, _context: *mut c_void) {
        *(result as *mut i32) = *(a as *mut i32) + *(b as *mut i32);
    }

    fn entry(func: *const u8, context: usize) -> ResolvedEntry {
        ResolvedEntry {
            func: FunctionPtr::new(func),
            context: context as *mut c_void,
        }
    }

    fn tick_desc() -> TrampolineDesc {
        TrampolineDesc::new("System.Private.CoreLib", "System.Threading", "ThreadPool", "BackgroundJobHandler", 0)
    }

    fn add_desc() -> TrampolineDesc {
        TrampolineDesc::new("Engine", "Engine.Interop", "Exports", "Add", 2)
            .with_signature(Signature::parse("i32", &["i32", "i32"]).unwrap())
            .unwrap()
    }

    #[test]
    fn test_interp_key_and_c_name() {
        let desc = tick_desc();
        assert_eq!(desc.key(), "System_Private_CoreLib_ThreadPool_BackgroundJobHandler");
        assert_eq!(
            desc.c_name(),
            "wasm_native_to_interp_System_Threading_System_Private_CoreLib_ThreadPool_BackgroundJobHandler"
        );
    }

    #[test]
    fn test_binds_once_and_reuses_entry() {
        let table = TrampolineTable::new(vec![tick_desc()], |_: &TrampolineDesc| {
            Ok(entry(managed_tick as *const u8, 3))
        })
        .unwrap();

        assert!(!table.is_bound(0));
        let first = table.bind(0).unwrap();
        let second = table.bind(0).unwrap();
        assert_eq!(first, second);
        assert!(table.is_bound(0));
        assert_eq!(table.resolution_count(), 1);
    }

    #[test]
    fn test_invoke_void_passes_context() {
        let table = TrampolineTable::new(vec![tick_desc()], |_: &TrampolineDesc| {
            Ok(entry(managed_tick as *const u8, 5))
        })
        .unwrap();

        let before = TICKS.load(Ordering::SeqCst);
        unsafe { table.invoke_void(0, ()) }.unwrap();
        unsafe { table.invoke_void(0, ()) }.unwrap();
        assert!(TICKS.load(Ordering::SeqCst) - before >= 10);
        assert_eq!(table.resolution_count(), 1);
    }

    #[test]
    fn test_invoke_returns_through_out_parameter() {
        let table = TrampolineTable::new(vec![add_desc()], |_: &TrampolineDesc| {
            Ok(entry(managed_add as *const u8, 0))
        })
        .unwrap();

        let sum: i32 = unsafe { table.invoke(0, (40i32, 2i32)) }.unwrap();
        assert_eq!(sum, 42);
    }

    #[test]
    fn test_arity_and_return_mismatch() {
        let table = TrampolineTable::new(vec![add_desc()], |_: &TrampolineDesc| {
            Ok(entry(managed_add as *const u8, 0))
        })
        .unwrap();

        let err = unsafe { table.invoke::<_, i32>(0, (1i32,)) }.unwrap_err();
        assert!(matches!(err, BindError::SignatureMismatch { .. }));

        let err = unsafe { table.invoke::<_, i64>(0, (1i32, 2i32)) }.unwrap_err();
        assert!(matches!(err, BindError::SignatureMismatch { .. }));

        // No resolution is attempted for a call that cannot be made.
        assert_eq!(table.resolution_count(), 0);
    }

    #[test]
    fn test_parameter_kinds_must_match_signature() {
        let table = TrampolineTable::new(vec![add_desc()], |_: &TrampolineDesc| {
            Ok(entry(managed_add as *const u8, 0))
        })
        .unwrap();

        let err = unsafe { table.invoke::<_, i32>(0, (1.5f64, 2.5f64)) }.unwrap_err();
        assert_eq!(
            err,
            BindError::SignatureMismatch {
                name: "Engine_Exports_Add".to_string(),
                expected: Signature::parse("i32", &["i32", "i32"]).unwrap().to_string(),
                found: Signature::parse("i32", &["f64", "f64"]).unwrap().to_string(),
            }
        );

        let err = unsafe { table.invoke::<_, i32>(0, (1i32, 2i64)) }.unwrap_err();
        assert!(matches!(err, BindError::SignatureMismatch { .. }));
        assert_eq!(table.resolution_count(), 0);

        // Slots without a recorded signature only check arity
        let untyped = TrampolineTable::new(
            vec![TrampolineDesc::new("Engine", "Engine.Interop", "Exports", "Add", 2)],
            |_: &TrampolineDesc| Ok(entry(managed_add as *const u8, 0)),
        )
        .unwrap();
        let sum: i32 = unsafe { untyped.invoke(0, (20i32, 22i32)) }.unwrap();
        assert_eq!(sum, 42);
    }

    #[test]
    fn test_resolution_failure_surfaces_and_can_retry() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let host_attempts = Arc::clone(&attempts);
        let table = TrampolineTable::new(vec![tick_desc()], move |_: &TrampolineDesc| {
            if host_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("method not found".to_string())
            } else {
                Ok(entry(managed_tick as *const u8, 0))
            }
        })
        .unwrap();

        let err = table.bind(0).unwrap_err();
        assert_eq!(
            err,
            BindError::ResolutionFailure {
                key: "System_Private_CoreLib_ThreadPool_BackgroundJobHandler".to_string(),
                reason: "method not found".to_string()
            }
        );
        assert!(!table.is_bound(0));

        assert!(table.bind(0).is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_null_entry_is_a_resolution_failure() {
        let table = TrampolineTable::new(vec![tick_desc()], |_: &TrampolineDesc| {
            Ok(entry(std::ptr::null(), 0))
        })
        .unwrap();
        assert!(matches!(table.bind(0), Err(BindError::ResolutionFailure { .. })));
    }

    #[test]
    fn test_reentrant_resolution_fails_fast() {
        static TABLE: OnceLock<TrampolineTable> = OnceLock::new();
        static REENTRY: OnceLock<BindError> = OnceLock::new();

        let table = TABLE.get_or_init(|| {
            TrampolineTable::new(vec![tick_desc()], |_: &TrampolineDesc| {
                let inner = TABLE.get().map(|t| t.bind(0));
                if let Some(Err(err)) = inner {
                    let _ = REENTRY.set(err);
                }
                Ok(entry(managed_tick as *const u8, 0))
            })
            .unwrap()
        });

        assert!(table.bind(0).is_ok());
        assert!(matches!(REENTRY.get(), Some(BindError::ReentrantResolution { .. })));
    }

    #[test]
    fn test_cross_slot_resolution_cycle_fails_fast() {
        static TABLE: OnceLock<TrampolineTable> = OnceLock::new();
        static BOTH_RESOLVING: OnceLock<Barrier> = OnceLock::new();
        static INNER: std::sync::Mutex<Vec<std::result::Result<ResolvedEntry, BindError>>> =
            std::sync::Mutex::new(Vec::new());

        fn other_desc() -> TrampolineDesc {
            TrampolineDesc::new("System.Private.CoreLib", "System.Threading", "TimerQueue", "TimerHandler", 0)
        }

        let table = TABLE.get_or_init(|| {
            let host = |desc: &TrampolineDesc| -> std::result::Result<ResolvedEntry, String> {
                let table = TABLE.get().ok_or("table not published")?;
                BOTH_RESOLVING.get_or_init(|| Barrier::new(2)).wait();
                // Each resolver needs the slot the other thread is resolving
                let other = if desc.method() == "BackgroundJobHandler" { 1 } else { 0 };
                let result = table.bind(other);
                if let Ok(mut inner) = INNER.lock() {
                    inner.push(result);
                }
                Ok(entry(managed_tick as *const u8, 0))
            };
            TrampolineTable::new(vec![tick_desc(), other_desc()], host).unwrap()
        });

        let handles: Vec<_> = (0..2usize)
            .map(|slot| std::thread::spawn(move || TABLE.get().map(|t| t.bind(slot).is_ok())))
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), Some(true));
        }

        let inner = INNER.lock().unwrap();
        assert_eq!(inner.len(), 2);
        let cycles = inner
            .iter()
            .filter(|r| matches!(r, Err(BindError::ReentrantResolution { .. })))
            .count();
        assert_eq!(cycles, 1);
        assert!(table.is_bound(0) && table.is_bound(1));
        assert_eq!(table.resolution_count(), 2);
    }

    #[test]
    fn test_concurrent_first_calls_resolve_once() {
        const THREADS: usize = 8;
        let table = Arc::new(
            TrampolineTable::new(vec![tick_desc()], |_: &TrampolineDesc| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(entry(managed_tick as *const u8, 9))
            })
            .unwrap(),
        );
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    table.bind(0).unwrap()
                })
            })
            .collect();

        let entries: Vec<ResolvedEntry> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(entries.iter().all(|e| *e == entries[0]));
        assert_eq!(table.resolution_count(), 1);
    }

    #[test]
    fn test_lookup_by_key_and_entry_point() {
        extern "C" fn native_side() {}

        let desc = tick_desc().with_native_entry(FunctionPtr::new(native_side as *const u8));
        let table = TrampolineTable::new(vec![add_desc(), desc], |_: &TrampolineDesc| {
            Err("unused".to_string())
        })
        .unwrap();

        let key = "System_Private_CoreLib_ThreadPool_BackgroundJobHandler";
        assert_eq!(table.slot_by_key(key), Some(1));
        assert_eq!(table.entry_point(key), Some(FunctionPtr::new(native_side as *const u8)));
        assert_eq!(table.entry_point("Engine_Exports_Add"), None);
        assert_eq!(table.slot_by_key("missing"), None);
        assert_eq!(
            table.desc(5).unwrap_err(),
            BindError::SlotOutOfRange { slot: 5, len: 2 }
        );
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let result = TrampolineTable::new(vec![tick_desc(), tick_desc()], |_: &TrampolineDesc| {
            Err("unused".to_string())
        });
        assert!(matches!(result, Err(BindError::DuplicateTrampoline(_))));
    }
}
