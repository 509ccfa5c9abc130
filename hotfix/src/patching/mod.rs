//! Installing redirects into the running process
//!
//! - **`redirect`**: the per-architecture jump sequences and their length
//! - **`memory`**: writing into read+execute pages
//! - **`applier`**: the [`PatchApplier`] strategy and its default

pub mod applier;
pub mod memory;
pub mod redirect;

pub use applier::{InstallFailure, PatchApplier, PatchContext, RedirectApplier};
pub use memory::{CodeWriter, ProcessMemory};
pub use redirect::{AbsoluteJump, Arch, RedirectCode, RedirectEncoder, MAX_REDIRECT_LEN};
