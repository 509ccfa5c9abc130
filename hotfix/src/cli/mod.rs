//! The `hotfix` inspection CLI
//!
//! Selection and the size check run offline against a binary on disk: no
//! module is loaded and nothing is written. Addresses are link-time
//! addresses, since the image is not relocated.

pub mod args;

pub use args::Args;

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

use crate::domain::{HotfixError, LoadedImage, PatchSet};
use crate::patching::{AbsoluteJump, RedirectEncoder};
use crate::planning::{survey, FitReport};
use crate::selection::Selector;
use crate::symbolization::{executable_images, read_maps, DwarfImage};

/// What a session with this selector would try to patch
#[derive(Debug, Serialize)]
pub struct Inspection {
    pub binary: PathBuf,
    pub arch: String,
    pub redirect_len: usize,
    pub functions: Vec<FitReport>,
}

impl Inspection {
    #[must_use]
    pub fn all_fit(&self) -> bool {
        self.functions.iter().all(|f| f.fits)
    }
}

/// Run `selector` against `binary` and size-check every selected function
///
/// # Errors
/// Returns the same selection errors a live session would
pub fn inspect(binary: &Path, selector: &Selector) -> Result<Inspection, HotfixError> {
    let image = DwarfImage::open(binary, None).map_err(HotfixError::ImageLoad)?;
    let names = selector.select(&image)?;
    let set = PatchSet::new(names).ok_or(HotfixError::EmptyFunctions)?;

    let encoder = AbsoluteJump::native();
    Ok(Inspection {
        binary: binary.to_path_buf(),
        arch: encoder.arch().to_string(),
        redirect_len: encoder.len(),
        functions: survey(&image, &set, encoder.len()),
    })
}

/// Executable images mapped into process `pid`
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` cannot be read
pub fn process_images(pid: i32) -> io::Result<Vec<LoadedImage>> {
    Ok(executable_images(&read_maps(Some(pid))?))
}

/// Table rendering of an inspection
#[must_use]
pub fn format_inspection(inspection: &Inspection) -> String {
    let mut out = format!(
        "{} ({}, redirect {} bytes)\n",
        inspection.binary.display(),
        inspection.arch,
        inspection.redirect_len
    );
    for f in &inspection.functions {
        let line = match (f.entry, f.size) {
            (Some(entry), Some(size)) => format!(
                "  {:<4} {:>18} {size:>8}  {}\n",
                if f.fits { "ok" } else { "FAIL" },
                entry.to_string(),
                f.name
            ),
            _ => format!(
                "  {:<4} {:>18} {:>8}  {} ({})\n",
                "MISS",
                "-",
                "-",
                f.name,
                f.error.as_deref().unwrap_or("not found")
            ),
        };
        out.push_str(&line);
    }
    out
}
