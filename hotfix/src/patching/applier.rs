//! Patch application strategies
//!
//! The orchestrator hands a validated [`PatchContext`] to a [`PatchApplier`]
//! inside the pause window. [`RedirectApplier`] is the default: it writes a
//! redirect sequence over each old entry. Other strategies (trap based, for
//! instance) plug in through the same trait.
//!
//! A failure stops at the failing target. Targets before it stay patched.
//! Appliers run while every other thread is frozen, so a failure carries
//! only what was at hand; naming the target and formatting the cause happen
//! after the window closes.

use std::path::Path;

use crate::domain::{HotfixError, PatchTarget, WriteError};
use crate::session::SessionLog;

use super::memory::CodeWriter;
use super::redirect::RedirectEncoder;

/// Everything an applier may need about a validated session
pub struct PatchContext<'a> {
    /// Canonical path of the loaded module
    pub module_path: &'a Path,
    pub thread_safe: bool,
    /// Qualified names, in application order
    pub methods: &'a [String],
    /// One target per method, same order
    pub targets: &'a [PatchTarget],
    pub encoder: &'a dyn RedirectEncoder,
    pub writer: &'a dyn CodeWriter,
    /// Forwarding is held while paused; recording never blocks
    pub log: &'a mut SessionLog,
}

/// The first target an applier could not install
#[derive(Debug)]
pub struct InstallFailure {
    /// Position in [`PatchContext::targets`]
    pub index: usize,
    pub cause: WriteError,
}

impl InstallFailure {
    /// Attach the target name once the pause window is closed
    #[must_use]
    pub fn into_error(self, targets: &[PatchTarget]) -> HotfixError {
        HotfixError::PatchInstall {
            index: self.index,
            name: targets.get(self.index).map(|t| t.name.clone()).unwrap_or_default(),
            source: self.cause,
        }
    }
}

pub trait PatchApplier: Send + Sync {
    /// Install every target, in order
    ///
    /// Must not allocate: other threads may be frozen holding the allocator.
    ///
    /// # Errors
    /// The index of the first target that failed, with its cause
    fn apply(&self, ctx: &mut PatchContext<'_>) -> Result<(), InstallFailure>;
}

/// Overwrites old entries with absolute jumps to the new code
#[derive(Debug, Default, Clone, Copy)]
pub struct RedirectApplier;

impl RedirectApplier {
    #[allow(unsafe_code)]
    fn install(
        target: &PatchTarget,
        encoder: &dyn RedirectEncoder,
        writer: &dyn CodeWriter,
    ) -> Result<(), WriteError> {
        let code = encoder.encode(target.old.entry, target.new.entry, target.new.convention);
        if (code.len() as u64) > target.region {
            return Err(WriteError::Overflow {
                address: target.old.entry.0,
                have: target.region,
                need: code.len(),
            });
        }
        // SAFETY: the planner bounded the write by the function's own region,
        // and the orchestrator holds the pause window unless the caller
        // vouched for thread safety.
        unsafe { writer.write_code(target.old.entry, code.as_bytes()) }
    }
}

impl PatchApplier for RedirectApplier {
    fn apply(&self, ctx: &mut PatchContext<'_>) -> Result<(), InstallFailure> {
        crate::session_log!(ctx.log, "redirect patching {} functions ...", ctx.targets.len());
        for (index, target) in ctx.targets.iter().enumerate() {
            if let Err(cause) = Self::install(target, ctx.encoder, ctx.writer) {
                crate::session_log!(ctx.log, "patching {} failed", target.name);
                return Err(InstallFailure { index, cause });
            }
            crate::session_log!(
                ctx.log,
                "patched {}: {} -> {}",
                target.name,
                target.old.entry,
                target.new.entry
            );
        }
        crate::session_log!(ctx.log, "redirect patching finished");
        Ok(())
    }
}
