//! # hotfix - Live Function Replacement for Running Processes
//!
//! hotfix replaces the implementation of selected functions inside a running
//! process with code from a freshly loaded shared object, without restarting
//! the process. It targets long-running services where a restart is more
//! expensive than the fix.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Hotfixer::patch(module, selector)            │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ single-flight lock, panic trap, transcript
//!                         ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Symbolization│──▶│  Selection   │──▶│   Planning   │
//! │ (DWARF/ELF)  │   │ names/types/ │   │ size check,  │
//! │              │   │  namespaces  │   │ module load, │
//! └──────────────┘   └──────────────┘   │ cross-ref    │
//!                                       └──────┬───────┘
//!                                              ▼
//!                    ┌──────────────┐   ┌──────────────┐
//!                    │    Pause     │──▶│   Patching   │
//!                    │ (stop other  │   │ redirect over│
//!                    │   threads)   │   │  old entries │
//!                    └──────────────┘   └──────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`symbolization`]: function and type lookup from debug information
//!   - `dwarf_image`: ELF/DWARF index of the running executable
//!   - `memory_maps`: `/proc/<pid>/maps` parsing for PIE relocation
//! - [`selection`]: the four [`Selector`] primitives
//! - [`planning`]: entry resolution, module loading, validation
//! - [`loader`]: [`loader::ModuleLoader`] and the `dlopen` implementation
//! - [`pause`]: [`pause::PauseController`] and the signal-based stop-the-world
//! - [`patching`]: redirect encoding, code writes, [`patching::PatchApplier`]
//! - [`session`]: the [`Hotfixer`] orchestrator and [`SessionResult`]
//! - [`domain`]: shared types and errors
//!
//! ## Typical Usage
//!
//! ```no_run
//! use hotfix::Selector;
//!
//! let result = hotfix::patch(
//!     "/srv/app/patches/libfix_v2.so",
//!     &Selector::func(["app::router::Handler::serve"]),
//!     false,
//! );
//! if let Some(err) = &result.err {
//!     eprintln!("hotfix failed: {err}\n{}", result.message);
//! }
//! ```
//!
//! ## Key Concepts
//!
//! - **Redirect**: an absolute jump written over the first bytes of the old
//!   function; every later call lands in the module's replacement
//! - **Region**: the bytes a function owns; a redirect must fit in it
//! - **Pause window**: every other thread is parked while redirects are
//!   written, unless the caller asserts the targets are not in use
//! - **No rollback**: a failure part way through leaves earlier redirects
//!   installed; the result names the failing index
//!
//! ## Requirements
//!
//! - Linux on x86, x86_64 or aarch64
//! - The executable must carry debug info or a symbol table (`debug = true`)
//! - Patch modules must be built against the same sources and toolchain

pub mod cli;
pub mod domain;
pub mod loader;
pub mod patching;
pub mod pause;
pub mod planning;
pub mod preflight;
pub mod selection;
pub mod session;
pub mod symbolization;

use std::path::Path;

pub use domain::HotfixError;
pub use patching::PatchApplier;
pub use selection::Selector;
pub use session::{Hotfixer, HotfixerBuilder, SessionLock, SessionResult, SessionStage};

/// Patch the running process with the native engine and redirect applier
pub fn patch(module_path: impl AsRef<Path>, selector: &Selector, thread_safe: bool) -> SessionResult {
    Hotfixer::native().patch(module_path, selector, thread_safe)
}

/// Patch the running process with a custom applier
pub fn patch_with(
    module_path: impl AsRef<Path>,
    selector: &Selector,
    applier: &dyn PatchApplier,
    thread_safe: bool,
) -> SessionResult {
    Hotfixer::native().patch_with(module_path, selector, applier, thread_safe)
}

/// Whether a native session is running somewhere in the process
#[must_use]
pub fn in_progress() -> bool {
    SessionLock::global().is_held()
}
