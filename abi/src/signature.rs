//! Native signature descriptors
//!
//! A [`Signature`] is the ordered list of primitive parameter kinds plus a
//! return kind. Rust function pointer types describe themselves through
//! [`NativeFn`], which lets a caller's view of a function be checked against
//! the shape recorded in a table before the pointer is ever cast.

use std::fmt;
use std::str::FromStr;

use crate::FunctionPtr;

/// Widest native signature the tables support.
///
/// The widest observed interp entry is result + 6 arguments + context, and
/// the widest internal call takes 8 integers.
pub const MAX_ARITY: usize = 8;

/// Type tags for signature descriptors that cross repr(C) boundaries.
pub mod native_type {
    pub const VOID: u8 = 0;
    pub const I32: u8 = 1;
    pub const U32: u8 = 2;
    pub const I64: u8 = 3;
    pub const F32: u8 = 4;
    pub const F64: u8 = 5;
    pub const PTR: u8 = 6;
    pub const U64: u8 = 7;
}

/// Primitive parameter/return kind of a native function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeKind {
    /// Only valid as a return kind
    Void,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Ptr,
}

impl NativeKind {
    pub const fn tag(self) -> u8 {
        match self {
            NativeKind::Void => native_type::VOID,
            NativeKind::I32 => native_type::I32,
            NativeKind::U32 => native_type::U32,
            NativeKind::I64 => native_type::I64,
            NativeKind::U64 => native_type::U64,
            NativeKind::F32 => native_type::F32,
            NativeKind::F64 => native_type::F64,
            NativeKind::Ptr => native_type::PTR,
        }
    }

    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            native_type::VOID => Some(NativeKind::Void),
            native_type::I32 => Some(NativeKind::I32),
            native_type::U32 => Some(NativeKind::U32),
            native_type::I64 => Some(NativeKind::I64),
            native_type::U64 => Some(NativeKind::U64),
            native_type::F32 => Some(NativeKind::F32),
            native_type::F64 => Some(NativeKind::F64),
            native_type::PTR => Some(NativeKind::Ptr),
            _ => None,
        }
    }

    /// C spelling used in generated prototypes
    pub const fn c_name(self) -> &'static str {
        match self {
            NativeKind::Void => "void",
            NativeKind::I32 => "int32_t",
            NativeKind::U32 => "uint32_t",
            NativeKind::I64 => "int64_t",
            NativeKind::U64 => "uint64_t",
            NativeKind::F32 => "float",
            NativeKind::F64 => "double",
            NativeKind::Ptr => "void *",
        }
    }

    pub const fn is_void(self) -> bool {
        matches!(self, NativeKind::Void)
    }
}

impl fmt::Display for NativeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NativeKind::Void => "void",
            NativeKind::I32 => "i32",
            NativeKind::U32 => "u32",
            NativeKind::I64 => "i64",
            NativeKind::U64 => "u64",
            NativeKind::F32 => "f32",
            NativeKind::F64 => "f64",
            NativeKind::Ptr => "ptr",
        };
        f.write_str(name)
    }
}

impl FromStr for NativeKind {
    type Err = String;

    /// Accepts both the short manifest spellings and the C spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "void" => Ok(NativeKind::Void),
            "i32" | "int" | "int32_t" => Ok(NativeKind::I32),
            "u32" | "uint32_t" => Ok(NativeKind::U32),
            "i64" | "int64_t" => Ok(NativeKind::I64),
            "u64" | "uint64_t" => Ok(NativeKind::U64),
            "f32" | "float" => Ok(NativeKind::F32),
            "f64" | "double" => Ok(NativeKind::F64),
            "ptr" | "void*" | "void *" => Ok(NativeKind::Ptr),
            other => Err(format!("unknown native type '{}'", other)),
        }
    }
}

/// Ordered parameter kinds plus a return kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    ret: NativeKind,
    params: Vec<NativeKind>,
}

impl Signature {
    /// Build a signature, rejecting `void` parameters and arities above
    /// [`MAX_ARITY`].
    pub fn new(ret: NativeKind, params: impl Into<Vec<NativeKind>>) -> Result<Self, String> {
        let params = params.into();
        if params.len() > MAX_ARITY {
            return Err(format!(
                "{} parameters exceeds the maximum native arity of {}",
                params.len(),
                MAX_ARITY
            ));
        }
        if let Some(pos) = params.iter().position(|k| k.is_void()) {
            return Err(format!("parameter {} cannot be void", pos));
        }
        Ok(Self { ret, params })
    }

    /// Parse from manifest spellings, e.g. `("i32", ["ptr", "i64"])`.
    pub fn parse<S: AsRef<str>>(ret: &str, params: &[S]) -> Result<Self, String> {
        let ret = ret.parse()?;
        let params = params
            .iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<NativeKind>, String>>()?;
        Self::new(ret, params)
    }

    /// Rebuild from the tag form stored in static descriptors.
    pub fn from_tags(ret: u8, params: &[u8]) -> Result<Self, String> {
        let ret = NativeKind::from_tag(ret).ok_or_else(|| format!("invalid return tag {}", ret))?;
        let params = params
            .iter()
            .map(|&t| NativeKind::from_tag(t).ok_or_else(|| format!("invalid parameter tag {}", t)))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(ret, params)
    }

    // Callers guarantee the invariants `new` checks.
    fn from_kinds(ret: NativeKind, params: Vec<NativeKind>) -> Self {
        debug_assert!(params.len() <= MAX_ARITY);
        Self { ret, params }
    }

    pub fn ret(&self) -> NativeKind {
        self.ret
    }

    pub fn params(&self) -> &[NativeKind] {
        &self.params
    }

    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// `int32_t SystemNative_Close (void *);`
    pub fn c_declaration(&self, name: &str) -> String {
        let params: Vec<&str> = self.params.iter().map(|k| k.c_name()).collect();
        format!("{} {} ({});", self.ret.c_name(), name, params.join(", "))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", p)?;
        }
        write!(f, ") -> {}", self.ret)
    }
}

/// A Rust type that maps onto exactly one native parameter kind.
pub trait NativeType: Copy {
    const KIND: NativeKind;
}

/// A Rust type usable as a native return value (`()` is `void`).
pub trait NativeReturn {
    const KIND: NativeKind;
}

macro_rules! native_scalar {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl NativeType for $ty {
                const KIND: NativeKind = NativeKind::$kind;
            }
            impl NativeReturn for $ty {
                const KIND: NativeKind = NativeKind::$kind;
            }
        )*
    };
}

native_scalar! {
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

// Pointer-sized integers travel as pointers (`size_t`, `intptr_t`).
impl NativeType for usize {
    const KIND: NativeKind = NativeKind::Ptr;
}

impl NativeType for isize {
    const KIND: NativeKind = NativeKind::Ptr;
}

impl NativeReturn for usize {
    const KIND: NativeKind = NativeKind::Ptr;
}

impl NativeReturn for isize {
    const KIND: NativeKind = NativeKind::Ptr;
}

impl<T> NativeType for *mut T {
    const KIND: NativeKind = NativeKind::Ptr;
}

impl<T> NativeType for *const T {
    const KIND: NativeKind = NativeKind::Ptr;
}

impl<T> NativeReturn for *mut T {
    const KIND: NativeKind = NativeKind::Ptr;
}

impl<T> NativeReturn for *const T {
    const KIND: NativeKind = NativeKind::Ptr;
}

impl NativeReturn for () {
    const KIND: NativeKind = NativeKind::Void;
}

/// A C-ABI function pointer type whose shape is known statically.
pub trait NativeFn: Copy {
    const ARITY: usize;

    fn signature() -> Signature;

    /// Reinterpret an untyped pointer as this function type.
    ///
    /// # Safety
    /// `ptr` must point to a function with exactly this signature and the C
    /// calling convention.
    unsafe fn from_ptr(ptr: FunctionPtr) -> Self;

    fn to_ptr(self) -> FunctionPtr;
}

macro_rules! impl_native_fn {
    ($arity:expr; $($arg:ident),*) => {
        impl<R: NativeReturn, $($arg: NativeType),*> NativeFn for unsafe extern "C" fn($($arg),*) -> R {
            const ARITY: usize = $arity;

            fn signature() -> Signature {
                Signature::from_kinds(R::KIND, vec![$(<$arg as NativeType>::KIND),*])
            }

            unsafe fn from_ptr(ptr: FunctionPtr) -> Self {
                std::mem::transmute_copy::<*const u8, Self>(&ptr.as_ptr())
            }

            fn to_ptr(self) -> FunctionPtr {
                FunctionPtr::new(self as *const u8)
            }
        }

        impl<R: NativeReturn, $($arg: NativeType),*> NativeFn for extern "C" fn($($arg),*) -> R {
            const ARITY: usize = $arity;

            fn signature() -> Signature {
                Signature::from_kinds(R::KIND, vec![$(<$arg as NativeType>::KIND),*])
            }

            unsafe fn from_ptr(ptr: FunctionPtr) -> Self {
                std::mem::transmute_copy::<*const u8, Self>(&ptr.as_ptr())
            }

            fn to_ptr(self) -> FunctionPtr {
                FunctionPtr::new(self as *const u8)
            }
        }
    };
}

impl_native_fn!(0;);
impl_native_fn!(1; A1);
impl_native_fn!(2; A1, A2);
impl_native_fn!(3; A1, A2, A3);
impl_native_fn!(4; A1, A2, A3, A4);
impl_native_fn!(5; A1, A2, A3, A4, A5);
impl_native_fn!(6; A1, A2, A3, A4, A5, A6);
impl_native_fn!(7; A1, A2, A3, A4, A5, A6, A7);
impl_native_fn!(8; A1, A2, A3, A4, A5, A6, A7, A8);
