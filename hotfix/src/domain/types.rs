//! Domain types providing compile-time safety and self-documentation
//!
//! Every stage of a patch session passes these around: addresses resolved from
//! debug information, the functions they belong to, and the validated targets
//! that the patcher finally rewrites.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

/// Code address in the running process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
pub struct Address(pub u64);

impl Address {
    /// Raw pointer to the code at this address
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_mut_ptr(self) -> *mut u8 {
        self.0 as usize as *mut u8
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(addr: u64) -> Self {
        Address(addr)
    }
}

/// A function as described by one image
///
/// The qualified name is the identity; the addresses are only valid for the
/// image that produced them (main image and patch module disagree).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub name: String,
    pub entry: Address,
    pub end: Address,
}

impl FunctionRef {
    pub fn new(name: impl Into<String>, entry: u64, end: u64) -> Self {
        Self { name: name.into(), entry: Address(entry), end: Address(end) }
    }

    /// Length of the code region in bytes
    #[must_use]
    pub fn code_len(&self) -> u64 {
        self.end.0.saturating_sub(self.entry.0)
    }
}

/// How control reaches a callable's code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CallConvention {
    /// The entry address is the first instruction
    #[default]
    Direct,
    /// The entry address is a cell holding a code pointer
    Indirect,
}

/// A resolved function value that control can be transferred to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callable {
    pub name: String,
    pub entry: Address,
    pub convention: CallConvention,
}

impl Callable {
    pub fn direct(name: impl Into<String>, entry: u64) -> Self {
        Self { name: name.into(), entry: Address(entry), convention: CallConvention::Direct }
    }

    /// Same callable shape, materialized at another entry address
    #[must_use]
    pub fn at_address(&self, entry: Address) -> Self {
        Self { name: self.name.clone(), entry, convention: self.convention }
    }
}

/// A validated function to redirect
///
/// `old` shares `new`'s convention so both sides of the redirect agree on how
/// the target is reached. Built only by the planner, which guarantees
/// `old.entry != new.entry` and `region >= redirect length`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    pub name: String,
    pub old: Callable,
    pub new: Callable,
    /// Code bytes available at `old.entry`
    pub region: u64,
}

/// Deduplicated, lexicographically sorted, non-empty list of qualified names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSet(Vec<String>);

impl PatchSet {
    /// Returns `None` when no names remain
    pub fn new(names: impl IntoIterator<Item = String>) -> Option<Self> {
        let unique: BTreeSet<String> = names.into_iter().collect();
        if unique.is_empty() {
            None
        } else {
            Some(Self(unique.into_iter().collect()))
        }
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// A code image mapped into a process: the main executable or a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedImage {
    /// Path the loader actually mapped
    pub path: PathBuf,
    /// Lowest mapped address of the image
    pub base: Address,
}

/// Opaque handle to a module opened by a [`crate::loader::ModuleLoader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

/// Word width of the running process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchMode {
    Bits32,
    Bits64,
}

impl ArchMode {
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_pointer_width = "32") {
            ArchMode::Bits32
        } else {
            ArchMode::Bits64
        }
    }
}

impl fmt::Display for ArchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchMode::Bits32 => write!(f, "32-bit"),
            ArchMode::Bits64 => write!(f, "64-bit"),
        }
    }
}
