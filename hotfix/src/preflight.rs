//! Pre-flight checks for the hotfix CLI
//!
//! Validates inputs before any debug information is parsed, with actionable
//! messages when they are not usable.

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::path::Path;

/// Run all checks for an offline inspection of `binary`
///
/// # Errors
/// Returns an error if the binary is missing or not a regular file
pub fn run_preflight_checks(binary: &Path, quiet: bool) -> Result<()> {
    check_binary_exists(binary)?;
    check_debug_symbols(binary, quiet)?;
    Ok(())
}

/// Check if the binary exists and is a regular file
fn check_binary_exists(binary: &Path) -> Result<()> {
    if !binary.exists() {
        bail!(
            "Binary not found: {}\n\n\
             Make sure the path is correct and the binary exists.",
            binary.display()
        );
    }
    if !binary.is_file() {
        bail!(
            "Not a file: {}\n\n\
             --binary must point to an executable file, not a directory.",
            binary.display()
        );
    }
    Ok(())
}

/// Warn when lookups will lack sizes or fail entirely
fn check_debug_symbols(binary: &Path, quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let file_data = std::fs::read(binary)
        .with_context(|| format!("Failed to read binary: {}", binary.display()))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        // Not an object file; the image loader reports it properly
        return Ok(());
    };

    let has_debug_info = obj.section_by_name(".debug_info").is_some_and(|s| s.size() > 0);
    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);

    if !has_debug_info && !has_symtab {
        eprintln!("warning: binary stripped, no function can be resolved");
    } else if !has_debug_info {
        eprintln!("warning: no DWARF debug info, type selection unavailable");
    }

    Ok(())
}

/// Check if we can read the process's memory maps
///
/// # Errors
/// Returns an error if `/proc/<pid>/maps` is unreadable
pub fn check_proc_access(pid: i32) -> Result<()> {
    let maps_path = format!("/proc/{pid}/maps");
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {pid})\n\
             - Permission denied (run as the process owner or with sudo)\n\
             - /proc is not mounted"
        )
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_binary_not_found() {
        let err = check_binary_exists(Path::new("/nonexistent/path/to/binary")).unwrap_err();
        assert!(err.to_string().contains("Binary not found"));
    }

    #[test]
    fn test_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = check_binary_exists(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Not a file"));
    }

    #[test]
    fn test_non_object_passes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"#!/bin/sh\necho hi\n").unwrap();
        assert!(run_preflight_checks(file.path(), false).is_ok());
    }

    #[test]
    fn test_own_process_readable() {
        assert!(check_proc_access(std::process::id() as i32).is_ok());
    }

    #[test]
    fn test_missing_process() {
        let err = check_proc_access(999_999_999).unwrap_err();
        assert!(err.to_string().contains("Cannot read"));
    }
}
