//! Structured error types for hotfix
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Every session failure ends up as a [`HotfixError`] inside
//! [`crate::SessionResult::err`]; the other enums describe collaborator
//! failures and are chained as sources.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HotfixError {
    #[error("another hotfix session is in progress")]
    SessionBusy,

    #[error("empty functions")]
    EmptyFunctions,

    #[error("closure unsupported: {name}")]
    UnsupportedTarget { name: String },

    #[error("{name} is not a struct or pointer to struct ({kind})")]
    InvalidTarget { name: String, kind: String },

    #[error("type not found: {name}")]
    TypeNotFound {
        name: String,
        #[source]
        source: SymbolError,
    },

    #[error("function not found: {name}")]
    FunctionNotFound {
        name: String,
        #[source]
        source: SymbolError,
    },

    #[error("jump code overflow: {name}, size: {have}, required: {need}")]
    RegionTooSmall { name: String, have: u64, need: u64 },

    #[error("main image load failed")]
    ImageLoad(#[source] SymbolError),

    #[error("failed to load module {}", path.display())]
    ModuleLoad {
        path: PathBuf,
        #[source]
        source: LoaderError,
    },

    #[error("module {} is not registered in the process image table", path.display())]
    ModuleNotRegistered { path: PathBuf },

    #[error("failed to load symbols of module {}", path.display())]
    ModuleSymbols {
        path: PathBuf,
        #[source]
        source: SymbolError,
    },

    #[error("validation failed: {name}: {reason}")]
    ValidationFailed { name: String, reason: String },

    #[error("failed to pause execution")]
    Pause(#[from] PauseError),

    #[error("patching failed: index: {index}, func: {name}")]
    PatchInstall {
        index: usize,
        name: String,
        #[source]
        source: WriteError,
    },

    #[error("session aborted: {message}")]
    Panicked { message: String, backtrace: String },
}

/// Debug information lookup failures
#[derive(Error, Debug)]
pub enum SymbolError {
    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("type not found: {0}")]
    TypeNotFound(String),

    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse object file {}: {source}", path.display())]
    Object {
        path: PathBuf,
        #[source]
        source: object::read::Error,
    },

    #[error("failed to parse DWARF: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("no memory mapping found for {}", .0.display())]
    NotMapped(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Module loading failures
#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to open module: {0}")]
    Open(#[source] libloading::Error),

    #[error("symbol {name} not found in module")]
    SymbolNotFound {
        name: String,
        #[source]
        source: libloading::Error,
    },

    #[error("unknown module handle {0}")]
    UnknownHandle(usize),

    #[error("failed to read process memory maps")]
    Maps(#[source] io::Error),
}

/// Code memory mutation failures
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("invalid code range {address:#x}+{len}")]
    InvalidRange { address: u64, len: usize },

    #[error("redirect of {need} bytes does not fit the {have} byte region at {address:#x}")]
    Overflow { address: u64, have: u64, need: usize },

    #[error("failed to change protection at {address:#x}: {source}")]
    Protect {
        address: u64,
        #[source]
        source: io::Error,
    },
}

/// Execution pause failures
#[derive(Error, Debug)]
pub enum PauseError {
    #[error("failed to install pause signal handler: {0}")]
    Handler(#[source] io::Error),

    #[error("failed to enumerate threads: {0}")]
    Threads(#[source] io::Error),

    #[error("pause timed out: {parked} of {expected} threads parked")]
    Timeout { parked: usize, expected: usize },

    #[error("a pause window is already open")]
    AlreadyPaused,

    #[error("too many threads to pause (max {max})")]
    TooManyThreads { max: usize },

    #[error("threads kept spawning after {rescans} rescans ({threads} threads)")]
    Spawning { rescans: usize, threads: usize },

    #[error("a thread stays stopped at {address:#x} inside a patch range after {attempts} attempts")]
    UnsafePoint { address: u64, attempts: usize },
}
