//! Patch planning: from sorted names to validated targets
//!
//! Planning runs in three steps, each of which can stop the session:
//!
//! 1. [`PatchPlanner::resolve_entries`] finds every name in the main image and
//!    checks that its code region can host a redirect. Nothing has been
//!    loaded yet, so a too-small function costs no module load.
//! 2. [`PatchPlanner::open_module`] maps the module and learns the path and
//!    base the loader really used.
//! 3. [`PatchPlanner::cross_reference`] merges the module's symbols and
//!    checks that each name resolves to a different address there. A module
//!    that does not redefine a target would otherwise "patch" a function
//!    onto itself.

use log::debug;
use serde::Serialize;
use std::path::Path;
use std::time::Instant;

use crate::domain::{
    Address, CallConvention, Callable, FunctionRef, HotfixError, LoadedImage, ModuleHandle,
    PatchSet, PatchTarget,
};
use crate::loader::ModuleLoader;
use crate::session::SessionLog;
use crate::session_log;
use crate::symbolization::SymbolSource;

/// A module mapped into the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub handle: ModuleHandle,
    /// Canonical path and base address from the process image table
    pub image: LoadedImage,
}

pub struct PatchPlanner<'a> {
    source: &'a mut dyn SymbolSource,
    loader: &'a dyn ModuleLoader,
    redirect_len: u64,
}

impl<'a> PatchPlanner<'a> {
    pub fn new(
        source: &'a mut dyn SymbolSource,
        loader: &'a dyn ModuleLoader,
        redirect_len: usize,
    ) -> Self {
        Self { source, loader, redirect_len: redirect_len as u64 }
    }

    /// Main-image entry of every name, in set order
    ///
    /// # Errors
    /// - [`HotfixError::FunctionNotFound`] if a name is unknown
    /// - [`HotfixError::RegionTooSmall`] if a function is shorter than a redirect
    pub fn resolve_entries(
        &self,
        set: &PatchSet,
        log: &mut SessionLog,
    ) -> Result<Vec<FunctionRef>, HotfixError> {
        let mut entries = Vec::with_capacity(set.len());
        for name in set.names() {
            let function = self.source.find_function(name).map_err(|source| {
                HotfixError::FunctionNotFound { name: name.clone(), source }
            })?;

            let size = function.code_len();
            session_log!(log, "find function: {name}, entry: {}, code space: {size}", function.entry);
            if let Some(location) = self.source.describe(function.entry) {
                debug!("{name} defined at {location}");
            }

            if size < self.redirect_len {
                return Err(HotfixError::RegionTooSmall {
                    name: name.clone(),
                    have: size,
                    need: self.redirect_len,
                });
            }
            entries.push(function);
        }
        Ok(entries)
    }

    /// Load the module and find it in the process image table
    ///
    /// # Errors
    /// - [`HotfixError::ModuleLoad`] if the loader rejects the module
    /// - [`HotfixError::ModuleNotRegistered`] if the image table lacks it
    pub fn open_module(
        &self,
        path: &Path,
        log: &mut SessionLog,
    ) -> Result<LoadedModule, HotfixError> {
        let handle = self
            .loader
            .load(path)
            .map_err(|source| HotfixError::ModuleLoad { path: path.to_path_buf(), source })?;

        let image = self
            .loader
            .locate(path)
            .map_err(|source| HotfixError::ModuleLoad { path: path.to_path_buf(), source })?
            .ok_or_else(|| HotfixError::ModuleNotRegistered { path: path.to_path_buf() })?;

        session_log!(log, "module {} mapped at {}", image.path.display(), image.base);
        Ok(LoadedModule { handle, image })
    }

    /// Pair every old entry with its replacement from the module
    ///
    /// # Errors
    /// - [`HotfixError::ModuleSymbols`] if the module's symbols cannot be read
    /// - [`HotfixError::ValidationFailed`] if a name is missing from the
    ///   module or resolves to its old address
    pub fn cross_reference(
        &mut self,
        module: &LoadedModule,
        entries: &[FunctionRef],
        log: &mut SessionLog,
    ) -> Result<Vec<PatchTarget>, HotfixError> {
        let start = Instant::now();
        self.source.load_module_symbols(&module.image).map_err(|source| {
            HotfixError::ModuleSymbols { path: module.image.path.clone(), source }
        })?;
        session_log!(log, "load module symbols finished, cost: {:?}", start.elapsed());

        let mut targets = Vec::with_capacity(entries.len());
        for entry in entries {
            let new = self.replacement(module, &entry.name)?;
            if new.entry == entry.entry {
                return Err(HotfixError::ValidationFailed {
                    name: entry.name.clone(),
                    reason: "module does not override the function".to_string(),
                });
            }

            session_log!(
                log,
                "validating hotfix function: {}, entry: {} -> {}",
                entry.name,
                entry.entry,
                new.entry
            );
            targets.push(PatchTarget {
                name: entry.name.clone(),
                old: new.at_address(entry.entry),
                new,
                region: entry.code_len(),
            });
        }
        Ok(targets)
    }

    /// Module definition of `name`, falling back to its exported symbol
    fn replacement(&self, module: &LoadedModule, name: &str) -> Result<Callable, HotfixError> {
        if let Ok(callable) = self.source.resolve_callable(name, true) {
            return Ok(callable);
        }
        match self.loader.resolve_symbol_address(module.handle, name) {
            Ok(entry) => Ok(Callable {
                name: name.to_string(),
                entry,
                convention: CallConvention::Direct,
            }),
            Err(err) => {
                debug!("{name} not exported by {}: {err}", module.image.path.display());
                Err(HotfixError::ValidationFailed {
                    name: name.to_string(),
                    reason: "function not found in module".to_string(),
                })
            }
        }
    }
}

/// Whether one function could host a redirect, for offline inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FitReport {
    pub name: String,
    pub entry: Option<Address>,
    pub size: Option<u64>,
    pub fits: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Size check of every name without stopping at the first failure
pub fn survey(source: &dyn SymbolSource, set: &PatchSet, redirect_len: usize) -> Vec<FitReport> {
    set.names()
        .iter()
        .map(|name| match source.find_function(name) {
            Ok(function) => {
                let size = function.code_len();
                FitReport {
                    name: name.clone(),
                    entry: Some(function.entry),
                    size: Some(size),
                    fits: size >= redirect_len as u64,
                    error: None,
                }
            }
            Err(err) => FitReport {
                name: name.clone(),
                entry: None,
                size: None,
                fits: false,
                error: Some(err.to_string()),
            },
        })
        .collect()
}
