//! # Function Lookup from Debug Information
//!
//! Patching starts from qualified names (`app::router::Handler::serve`), but
//! the patcher needs raw addresses: where the old function starts, how many
//! bytes of code it owns, and where the replacement lives inside a freshly
//! loaded module. This module provides that translation.
//!
//! ## Key Concepts
//!
//! ### DWARF Debug Information
//!
//! **DWARF** is the debug format embedded in ELF binaries built with debug
//! symbols. Every `DW_TAG_subprogram` carries a linkage name and the address
//! range of the function's code, which is exactly what the region-size check
//! needs. Aggregates and pointer types are indexed as well so that a whole
//! type's methods can be selected.
//!
//! **How to enable DWARF**:
//! ```toml
//! # Cargo.toml
//! [profile.release]
//! debug = true  # Include DWARF debug info in release builds
//! ```
//!
//! **Libraries used**:
//! - `gimli`: Low-level DWARF parser
//! - `addr2line`: Source locations for diagnostics
//! - `object`: ELF parsing and symbol tables
//! - `rustc-demangle`: Linkage names to qualified names
//!
//! ### PIE and Shared Objects
//!
//! Position-independent images are linked at address zero and slid by the
//! loader. Debug information holds link-time addresses, so every address is
//! shifted by the runtime base taken from `/proc/self/maps`:
//!
//! ```text
//! Runtime Address = Base Address + Link-Time Address
//! ```
//!
//! The same rule relocates the symbols of a patch module once the dynamic
//! loader has mapped it.
//!
//! ## Module Structure
//!
//! - **`symbol_source`**: the [`SymbolSource`] gateway trait the engine consumes
//! - **`dwarf_image`**: [`DwarfImage`], the ELF/DWARF implementation
//! - **`memory_maps`**: `/proc/<pid>/maps` parsing
//! - **`naming`**: detection of compiler-synthesized names
//!
//! ## Limitations
//!
//! - **Requires debug symbols** for size information of local functions
//! - **ELF only**
//! - Generic instances sharing one demangled name collapse to the first seen

pub mod dwarf_image;
pub mod memory_maps;
pub mod naming;
pub mod symbol_source;

pub use dwarf_image::{CurrentExe, DwarfImage};
pub use memory_maps::{executable_images, image_range, parse_maps, read_maps, MemoryRange};
pub use symbol_source::{ImageLoader, Receiver, SymbolSource, TypeDescriptor, TypeKind};
