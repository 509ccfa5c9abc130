//! Writing into the process's own code pages

#![allow(unsafe_code)] // mprotect, raw copies into code

use std::io;
use std::ptr;

use crate::domain::{Address, WriteError};

/// Installs bytes over existing machine code
pub trait CodeWriter: Send + Sync {
    /// Overwrite `bytes.len()` bytes of code at `address`
    ///
    /// Must not allocate: it runs inside the pause window.
    ///
    /// # Safety
    /// The range must be mapped code owned by a single function, and no
    /// other thread may execute it during the write.
    ///
    /// # Errors
    /// Returns an error if the range is invalid or its protection cannot change
    unsafe fn write_code(&self, address: Address, bytes: &[u8]) -> Result<(), WriteError>;
}

/// `mprotect`-based writer for the calling process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

#[allow(clippy::cast_sign_loss)]
fn page_size() -> u64 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        4096
    }
}

#[allow(clippy::cast_possible_truncation)]
fn protect(start: u64, len: u64, prot: libc::c_int) -> Result<(), WriteError> {
    // SAFETY: start is page aligned; mprotect validates the range itself
    let rc = unsafe { libc::mprotect(start as usize as *mut libc::c_void, len as usize, prot) };
    if rc == 0 {
        Ok(())
    } else {
        Err(WriteError::Protect { address: start, source: io::Error::last_os_error() })
    }
}

impl CodeWriter for ProcessMemory {
    unsafe fn write_code(&self, address: Address, bytes: &[u8]) -> Result<(), WriteError> {
        let invalid = || WriteError::InvalidRange { address: address.0, len: bytes.len() };
        if address.0 == 0 || bytes.is_empty() {
            return Err(invalid());
        }
        let end = address.0.checked_add(bytes.len() as u64).ok_or_else(invalid)?;

        let page = page_size();
        let first = address.0 & !(page - 1);
        let span = end - first;

        // Writable and executable: the writer's own code may share the page
        protect(first, span, libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)?;
        // SAFETY: the caller guarantees the range is mapped and unused
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), address.as_mut_ptr(), bytes.len()) };
        protect(first, span, libc::PROT_READ | libc::PROT_EXEC)?;

        // SAFETY: the range was just written and is mapped
        unsafe { flush_icache(address.0, end) };
        Ok(())
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn flush_icache(start: u64, end: u64) {
    use std::arch::asm;

    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from EL0 on Linux
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
    let dline = 4u64 << ((ctr >> 16) & 0xF);
    let iline = 4u64 << (ctr & 0xF);

    let mut line = start & !(dline - 1);
    while line < end {
        // SAFETY: cleaning a mapped line to the point of unification
        unsafe { asm!("dc cvau, {}", in(reg) line, options(nostack)) };
        line += dline;
    }
    unsafe { asm!("dsb ish", options(nostack)) };

    let mut line = start & !(iline - 1);
    while line < end {
        // SAFETY: invalidating instruction cache lines of a mapped range
        unsafe { asm!("ic ivau, {}", in(reg) line, options(nostack)) };
        line += iline;
    }
    unsafe { asm!("dsb ish", "isb", options(nostack)) };
}

/// Instruction fetch is coherent with stores on x86
#[cfg(not(target_arch = "aarch64"))]
unsafe fn flush_icache(_start: u64, _end: u64) {}
