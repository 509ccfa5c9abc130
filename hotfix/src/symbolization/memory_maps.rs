//! Memory mapping utilities for process address space analysis
//!
//! This module parses `/proc/<pid>/maps` to find where images are loaded.
//! The main executable (PIE) and every patch module are relocated by the base
//! address found here, and the module loader uses it to learn which path the
//! dynamic loader really mapped.

use log::debug;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::domain::{Address, LoadedImage};

/// Memory range of a loaded image in a process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One line of a maps file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub range: MemoryRange,
    pub perms: String,
    pub offset: u64,
    pub path: Option<PathBuf>,
}

impl Mapping {
    #[must_use]
    pub fn is_executable(&self) -> bool {
        self.perms.contains('x')
    }
}

/// Read the maps of `pid`, or of the calling process when `pid` is `None`
///
/// # Errors
/// Returns an error if the maps file cannot be read
pub fn read_maps(pid: Option<i32>) -> io::Result<Vec<Mapping>> {
    let maps_path = match pid {
        Some(pid) => format!("/proc/{pid}/maps"),
        None => "/proc/self/maps".to_string(),
    };
    let contents = fs::read_to_string(&maps_path)?;
    Ok(parse_maps(&contents))
}

/// Parse maps lines of the form "start-end perms offset dev inode pathname"
///
/// Malformed lines are skipped.
#[must_use]
pub fn parse_maps(contents: &str) -> Vec<Mapping> {
    contents.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<Mapping> {
    let mut parts = line.split_whitespace();
    let (start, end) = parts.next()?.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    let perms = parts.next()?.to_string();
    let offset = u64::from_str_radix(parts.next()?, 16).ok()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;

    // The pathname may contain spaces; take the rest of the line verbatim
    let rest: Vec<&str> = parts.collect();
    let path = if rest.is_empty() {
        None
    } else {
        let joined = rest.join(" ");
        let trimmed = joined.strip_suffix(" (deleted)").unwrap_or(&joined);
        // Pseudo mappings like [heap] and [vdso] are not images
        if trimmed.starts_with('/') {
            Some(PathBuf::from(trimmed))
        } else {
            None
        }
    };

    Some(Mapping { range: MemoryRange { start, end }, perms, offset, path })
}

/// Full address range of every mapping of `path`
///
/// Returns the range from the minimum start to the maximum end address.
#[must_use]
pub fn image_range(maps: &[Mapping], path: &Path) -> Option<MemoryRange> {
    let range = maps
        .iter()
        .filter(|m| m.path.as_deref() == Some(path))
        .map(|m| m.range)
        .reduce(|acc, r| MemoryRange { start: acc.start.min(r.start), end: acc.end.max(r.end) })?;

    debug!(
        "{} mapped at 0x{:x} - 0x{:x} (size: {} KB)",
        path.display(),
        range.start,
        range.end,
        (range.end - range.start) / 1024
    );
    Some(range)
}

/// Every image with at least one executable mapping, ordered by base address
#[must_use]
pub fn executable_images(maps: &[Mapping]) -> Vec<LoadedImage> {
    let mut bases: BTreeMap<&Path, u64> = BTreeMap::new();
    let mut executable: Vec<&Path> = Vec::new();

    for mapping in maps {
        let Some(path) = mapping.path.as_deref() else {
            continue;
        };
        let base = bases.entry(path).or_insert(mapping.range.start);
        *base = (*base).min(mapping.range.start);
        if mapping.is_executable() && !executable.contains(&path) {
            executable.push(path);
        }
    }

    let mut images: Vec<LoadedImage> = executable
        .into_iter()
        .map(|path| LoadedImage { path: path.to_path_buf(), base: Address(bases[path]) })
        .collect();
    images.sort_by_key(|image| image.base);
    images
}
