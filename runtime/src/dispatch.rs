//! Token dispatch tables
//!
//! An [`IcallTable`] maps the sparse tokens of one managed assembly to native
//! function pointers and invocation flags. Entries are stored as one
//! composite record per token, sorted by token, and found by binary search.
//! Tokens are never used as array indices.
//!
//! Tables are immutable once built and can be read from any thread.

use indexmap::IndexMap;
use log::{debug, trace};

use interop_abi::{FunctionPtr, IcallDesc, InvokeFlags, NativeFn, Signature, Token};

use crate::error::{BindError, Result};

/// One registered internal call
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchEntry {
    token: Token,
    name: String,
    func: FunctionPtr,
    flags: InvokeFlags,
    signature: Option<Signature>,
}

impl DispatchEntry {
    pub fn new(token: Token, name: impl Into<String>, func: FunctionPtr, flags: InvokeFlags) -> Self {
        Self {
            token,
            name: name.into(),
            func,
            flags,
            signature: None,
        }
    }

    /// Record the native shape so typed access can be checked.
    pub fn with_signature(mut self, signature: Signature) -> Self {
        self.signature = Some(signature);
        self
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn func(&self) -> FunctionPtr {
        self.func
    }

    pub fn flags(&self) -> InvokeFlags {
        self.flags
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }
}

/// Host hook bracketing calls whose flags require a cooperative transition.
pub trait CoopTransition {
    /// Called before the native function runs
    fn enter(&self);

    /// Called after it returns or unwinds
    fn leave(&self);
}

/// Transition for hosts without a cooperative GC
pub struct NoTransition;

impl CoopTransition for NoTransition {
    fn enter(&self) {}
    fn leave(&self) {}
}

struct TransitionGuard<'a> {
    transition: &'a dyn CoopTransition,
}

impl<'a> TransitionGuard<'a> {
    fn enter(transition: &'a dyn CoopTransition) -> Self {
        transition.enter();
        Self { transition }
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        self.transition.leave();
    }
}

/// Dispatch table for one managed assembly
#[derive(Debug, Clone)]
pub struct IcallTable {
    assembly: String,
    /// Sorted by token, tokens unique
    entries: Vec<DispatchEntry>,
}

impl IcallTable {
    /// Build a table from composite entries in any order.
    ///
    /// # Errors
    ///
    /// - `DuplicateToken` if two entries share a token
    /// - `InvalidFlags` if an entry sets reserved flag bits
    pub fn build(assembly: impl Into<String>, entries: impl IntoIterator<Item = DispatchEntry>) -> Result<Self> {
        let assembly = assembly.into();
        let mut entries: Vec<DispatchEntry> = entries.into_iter().collect();

        if let Some(bad) = entries.iter().find(|e| e.flags.reserved_bits() != 0) {
            return Err(BindError::InvalidFlags {
                name: bad.name.clone(),
                bits: bad.flags.reserved_bits(),
            });
        }

        entries.sort_by_key(|e| e.token);

        if let Some(pair) = entries.windows(2).find(|w| w[0].token == w[1].token) {
            return Err(BindError::DuplicateToken {
                assembly,
                token: pair[0].token,
            });
        }

        debug!("Built icall table '{}' with {} entries", assembly, entries.len());

        Ok(Self { assembly, entries })
    }

    /// Build from the generated three-array form.
    ///
    /// The arrays are zipped into composite entries before anything is
    /// sorted, so position `i` of each array always describes the same call.
    pub fn from_parallel(
        assembly: impl Into<String>,
        tokens: &[u32],
        funcs: &[FunctionPtr],
        flags: &[u8],
    ) -> Result<Self> {
        if tokens.len() != funcs.len() || tokens.len() != flags.len() {
            return Err(BindError::LengthMismatch {
                tokens: tokens.len(),
                funcs: funcs.len(),
                flags: flags.len(),
            });
        }

        let assembly = assembly.into();
        let entries = tokens
            .iter()
            .zip(funcs)
            .zip(flags)
            .map(|((&token, &func), &bits)| {
                DispatchEntry::new(
                    Token(token),
                    format!("{}_icall_{}", assembly, token),
                    func,
                    InvokeFlags::from_bits(bits),
                )
            })
            .collect::<Vec<_>>();

        Self::build(assembly, entries)
    }

    /// Build from a static table produced by `declare_icalls!`.
    pub fn from_descs(assembly: impl Into<String>, descs: &[IcallDesc]) -> Result<Self> {
        let entries = descs
            .iter()
            .map(|d| {
                let signature = d.signature().map_err(BindError::Manifest)?;
                Ok(DispatchEntry::new(Token(d.token), d.name, d.func, d.flags).with_signature(signature))
            })
            .collect::<Result<Vec<_>>>()?;

        Self::build(assembly, entries)
    }

    pub fn assembly(&self) -> &str {
        &self.assembly
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending token order
    pub fn entries(&self) -> &[DispatchEntry] {
        &self.entries
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entries.binary_search_by_key(&token, |e| e.token).is_ok()
    }

    /// Find the entry registered for `token`.
    pub fn lookup(&self, token: Token) -> Result<&DispatchEntry> {
        match self.entries.binary_search_by_key(&token, |e| e.token) {
            Ok(index) => {
                let entry = &self.entries[index];
                trace!("{} in '{}' -> {} ({})", token, self.assembly, entry.name, entry.flags);
                Ok(entry)
            }
            Err(_) => Err(BindError::UnknownToken {
                assembly: self.assembly.clone(),
                token,
            }),
        }
    }

    /// Look up `token` and cast its pointer to `F`.
    ///
    /// When the entry recorded a signature it must equal `F::signature()`.
    ///
    /// # Safety
    /// Entries registered without a signature are cast unchecked; the caller
    /// guarantees `F` matches the native function.
    pub unsafe fn typed<F: NativeFn>(&self, token: Token) -> Result<F> {
        Self::cast(self.lookup(token)?)
    }

    unsafe fn cast<F: NativeFn>(entry: &DispatchEntry) -> Result<F> {
        if let Some(expected) = &entry.signature {
            let found = F::signature();
            if *expected != found {
                return Err(BindError::signature_mismatch(&entry.name, expected, &found));
            }
        }
        Ok(F::from_ptr(entry.func))
    }

    /// Look up, cast and call `token`.
    ///
    /// Entries flagged [`InvokeFlags::USES_HANDLES`] run between
    /// `transition.enter()` and `transition.leave()`; `leave` also runs if
    /// the call unwinds.
    ///
    /// # Safety
    /// Same contract as [`IcallTable::typed`].
    pub unsafe fn invoke<F, R>(
        &self,
        token: Token,
        transition: &dyn CoopTransition,
        call: impl FnOnce(F) -> R,
    ) -> Result<R>
    where
        F: NativeFn,
    {
        let entry = self.lookup(token)?;
        let func = Self::cast::<F>(entry)?;

        if entry.flags.needs_transition() {
            let _guard = TransitionGuard::enter(transition);
            Ok(call(func))
        } else {
            Ok(call(func))
        }
    }
}

/// Dispatch tables of every assembly, keyed by assembly name
#[derive(Debug, Clone, Default)]
pub struct IcallTables {
    tables: IndexMap<String, IcallTable>,
}

impl IcallTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: IcallTable) -> Result<()> {
        if self.tables.contains_key(table.assembly()) {
            return Err(BindError::Manifest(format!(
                "icall table for assembly '{}' declared twice",
                table.assembly()
            )));
        }
        self.tables.insert(table.assembly().to_string(), table);
        Ok(())
    }

    pub fn get(&self, assembly: &str) -> Result<&IcallTable> {
        self.tables
            .get(assembly)
            .ok_or_else(|| BindError::UnknownAssembly(assembly.to_string()))
    }

    pub fn lookup(&self, assembly: &str, token: Token) -> Result<&DispatchEntry> {
        self.get(assembly)?.lookup(token)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IcallTable> {
        self.tables.values()
    }
}
