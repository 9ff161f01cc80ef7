//! Binding errors
//!
//! Every variant is a linkage problem, not a transient condition: none of
//! them are retried by this crate.

use interop_abi::{Signature, Token};

/// Errors raised while building, resolving or invoking binding tables
#[derive(Debug, Clone, PartialEq)]
pub enum BindError {
    /// Token not present in the dispatch table
    UnknownToken { assembly: String, token: Token },

    /// No dispatch table registered for the assembly
    UnknownAssembly(String),

    /// (module, symbol) pair not present in the import tables
    UnresolvedSymbol { module: String, symbol: String },

    /// No import bucket registered under this module name
    UnknownModule(String),

    /// The host could not produce a managed entry for a trampoline
    ResolutionFailure { key: String, reason: String },

    /// A trampoline's resolution would wait on itself: the same slot on the
    /// same thread, or a cycle of resolvers waiting on each other's slots
    ReentrantResolution { key: String },

    /// Caller and registry disagree on a function's shape
    SignatureMismatch {
        name: String,
        expected: String,
        found: String,
    },

    /// Two entries of one dispatch table share a token
    DuplicateToken { assembly: String, token: Token },

    /// Two entries of one import bucket share a symbol name
    DuplicateSymbol { module: String, symbol: String },

    /// Two trampolines share a lookup key
    DuplicateTrampoline(String),

    /// Flags carry reserved bits
    InvalidFlags { name: String, bits: u8 },

    /// Parallel token/function/flag arrays differ in length
    LengthMismatch {
        tokens: usize,
        funcs: usize,
        flags: usize,
    },

    /// Trampoline slot index past the end of the table
    SlotOutOfRange { slot: usize, len: usize },

    /// Malformed or inconsistent binding manifest
    Manifest(String),

    /// I/O error while reading a manifest or library
    Io(String),
}

impl BindError {
    pub fn signature_mismatch(name: &str, expected: &Signature, found: &Signature) -> Self {
        BindError::SignatureMismatch {
            name: name.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindError::UnknownToken { assembly, token } => {
                write!(f, "unknown {} in icall table '{}'", token, assembly)
            }
            BindError::UnknownAssembly(name) => write!(f, "no icall table for assembly '{}'", name),
            BindError::UnresolvedSymbol { module, symbol } => {
                write!(f, "unable to resolve '{}' in module '{}'", symbol, module)
            }
            BindError::UnknownModule(name) => write!(f, "unknown native module '{}'", name),
            BindError::ResolutionFailure { key, reason } => {
                write!(f, "failed to resolve managed entry '{}': {}", key, reason)
            }
            BindError::ReentrantResolution { key } => {
                write!(f, "reentrant resolution of managed entry '{}'", key)
            }
            BindError::SignatureMismatch {
                name,
                expected,
                found,
            } => write!(
                f,
                "signature mismatch for '{}': registered {}, caller uses {}",
                name, expected, found
            ),
            BindError::DuplicateToken { assembly, token } => {
                write!(f, "duplicate {} in icall table '{}'", token, assembly)
            }
            BindError::DuplicateSymbol { module, symbol } => {
                write!(f, "duplicate symbol '{}' in module '{}'", symbol, module)
            }
            BindError::DuplicateTrampoline(key) => write!(f, "duplicate trampoline '{}'", key),
            BindError::InvalidFlags { name, bits } => {
                write!(f, "'{}' uses reserved invocation flag bits {:#04x}", name, bits)
            }
            BindError::LengthMismatch {
                tokens,
                funcs,
                flags,
            } => write!(
                f,
                "parallel icall arrays differ in length: {} tokens, {} functions, {} flags",
                tokens, funcs, flags
            ),
            BindError::SlotOutOfRange { slot, len } => {
                write!(f, "trampoline slot {} out of range (table has {})", slot, len)
            }
            BindError::Manifest(e) => write!(f, "manifest error: {}", e),
            BindError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for BindError {}

pub type Result<T> = std::result::Result<T, BindError>;
