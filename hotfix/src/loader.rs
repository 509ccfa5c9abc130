//! Mapping patch modules into the running process
//!
//! A module stays loaded for the rest of the process: once a redirect points
//! into it, unloading would leave patched functions jumping into unmapped
//! memory. [`DlopenLoader`] therefore parks every [`libloading::Library`] in a
//! process-wide table and hands out indices as [`ModuleHandle`]s.

use libloading::Library;
use log::{debug, info};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, OnceLock, PoisonError};

use crate::domain::{Address, LoadedImage, LoaderError, ModuleHandle};
use crate::symbolization::memory_maps::{executable_images, image_range, read_maps};

/// Host-specific module loading
pub trait ModuleLoader: Send + Sync {
    /// Map the module at `path` into the process
    ///
    /// # Errors
    /// [`LoaderError::Open`] if the dynamic loader rejects the module
    fn load(&self, path: &Path) -> Result<ModuleHandle, LoaderError>;

    /// Every executable image currently mapped, ordered by base address
    ///
    /// # Errors
    /// Returns an error if the process image table cannot be read
    fn loaded_images(&self) -> Result<Vec<LoadedImage>, LoaderError>;

    /// Canonical path and base address of an already loaded module
    ///
    /// `Ok(None)` means the loader accepted the module but the image table
    /// does not list it.
    ///
    /// # Errors
    /// Returns an error if the process image table cannot be read
    fn locate(&self, path: &Path) -> Result<Option<LoadedImage>, LoaderError>;

    /// Runtime address of an exported symbol
    ///
    /// # Errors
    /// [`LoaderError::SymbolNotFound`] if the module does not export `name`
    fn resolve_symbol_address(
        &self,
        handle: ModuleHandle,
        name: &str,
    ) -> Result<Address, LoaderError>;
}

/// Libraries loaded by [`DlopenLoader`]; never dropped
static LIBRARIES: OnceLock<Mutex<Vec<Library>>> = OnceLock::new();

fn libraries() -> &'static Mutex<Vec<Library>> {
    LIBRARIES.get_or_init(|| Mutex::new(Vec::new()))
}

/// `dlopen`-based loader for ELF shared objects
#[derive(Debug, Default, Clone, Copy)]
pub struct DlopenLoader;

impl ModuleLoader for DlopenLoader {
    #[allow(unsafe_code)]
    fn load(&self, path: &Path) -> Result<ModuleHandle, LoaderError> {
        // SAFETY: running a module's initializers is the point of loading it;
        // the caller vouches for the module it asked to patch with.
        let library = unsafe { Library::new(path) }.map_err(LoaderError::Open)?;

        let mut table = libraries().lock().unwrap_or_else(PoisonError::into_inner);
        table.push(library);
        let handle = ModuleHandle(table.len() - 1);
        info!("Loaded module {} as handle {}", path.display(), handle.0);
        Ok(handle)
    }

    fn loaded_images(&self) -> Result<Vec<LoadedImage>, LoaderError> {
        let maps = read_maps(None).map_err(LoaderError::Maps)?;
        Ok(executable_images(&maps))
    }

    fn locate(&self, path: &Path) -> Result<Option<LoadedImage>, LoaderError> {
        let maps = read_maps(None).map_err(LoaderError::Maps)?;

        // A path the loader found through its search list has no directory
        // component and may not exist relative to the working directory.
        if let Ok(canonical) = fs::canonicalize(path) {
            if let Some(range) = image_range(&maps, &canonical) {
                return Ok(Some(LoadedImage { path: canonical, base: Address(range.start) }));
            }
        }

        let Some(file_name) = path.file_name() else {
            return Ok(None);
        };
        let mut candidates = executable_images(&maps)
            .into_iter()
            .filter(|image| image.path.file_name() == Some(file_name));
        match (candidates.next(), candidates.next()) {
            (Some(image), None) => {
                debug!("Located {} by file name at {}", path.display(), image.path.display());
                Ok(Some(image))
            }
            _ => Ok(None),
        }
    }

    #[allow(unsafe_code)]
    fn resolve_symbol_address(
        &self,
        handle: ModuleHandle,
        name: &str,
    ) -> Result<Address, LoaderError> {
        let table = libraries().lock().unwrap_or_else(PoisonError::into_inner);
        let library = table.get(handle.0).ok_or(LoaderError::UnknownHandle(handle.0))?;

        // SAFETY: the symbol is only read as an address, never called here.
        let symbol = unsafe { library.get::<*const ()>(name.as_bytes()) }
            .map_err(|source| LoaderError::SymbolNotFound { name: name.to_string(), source })?;
        Ok(Address(*symbol as usize as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_module() {
        let err = DlopenLoader.load(Path::new("/nonexistent/libpatch.so")).unwrap_err();
        assert!(matches!(err, LoaderError::Open(_)));
    }

    #[test]
    fn test_unknown_handle() {
        let err = DlopenLoader.resolve_symbol_address(ModuleHandle(usize::MAX), "getpid");
        assert!(matches!(err, Err(LoaderError::UnknownHandle(_))));
    }

    #[test]
    fn test_load_locate_and_resolve_libc() {
        let loader = DlopenLoader;
        let handle = loader.load(Path::new("libc.so.6")).expect("libc should load");

        let image = loader
            .locate(Path::new("libc.so.6"))
            .expect("maps readable")
            .expect("libc mapped");
        assert!(image.path.is_absolute());
        assert!(image.base.0 > 0);

        let getpid = loader.resolve_symbol_address(handle, "getpid").expect("getpid exported");
        assert!(getpid.0 > image.base.0);

        let missing = loader.resolve_symbol_address(handle, "hotfix_no_such_symbol");
        assert!(matches!(missing, Err(LoaderError::SymbolNotFound { .. })));
    }

    #[test]
    fn test_loaded_images_include_self() {
        let images = DlopenLoader.loaded_images().unwrap();
        let exe = fs::canonicalize(std::env::current_exe().unwrap()).unwrap();
        assert!(images.iter().any(|image| image.path == exe));
    }
}
