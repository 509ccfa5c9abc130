// String formatting intentionally uses format! for clarity
#![allow(clippy::format_push_string)]

use addr2line::Context;
use gimli::{AttributeValue, EndianRcSlice, Reader as _, RunTimeEndian, UnitOffset};
use log::{debug, info};
use object::{Object, ObjectKind, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::domain::{Address, CallConvention, Callable, FunctionRef, LoadedImage, SymbolError};

use super::memory_maps::{image_range, read_maps};
use super::symbol_source::{ImageLoader, Receiver, SymbolSource, TypeDescriptor, TypeKind};

type Slice = EndianRcSlice<RunTimeEndian>;
type Dwarf = gimli::Dwarf<Slice>;
type Unit = gimli::Unit<Slice>;
type Entry<'abbrev, 'unit> = gimli::DebuggingInformationEntry<'abbrev, 'unit, Slice>;

/// Linker tombstones for code removed by `--gc-sections`
const TOMBSTONES: [u64; 2] = [u64::MAX, u64::MAX - 1];

/// Function and type tables of an ELF image, built from DWARF
///
/// Functions come from `DW_TAG_subprogram` entries, with the ELF symbol table
/// filling in whatever the debug information does not describe. Addresses
/// are relocated by the runtime bias so they can be compared with addresses
/// of loaded modules.
pub struct DwarfImage {
    path: PathBuf,
    bias: u64,
    functions: BTreeMap<String, FunctionRef>,
    types: HashMap<String, TypeDescriptor>,
    module_functions: HashMap<String, Callable>,
    locations: Context<Slice>,
}

impl DwarfImage {
    /// Open `path`, relocating a position-independent image to `base`
    ///
    /// Pass `None` to inspect the file offline with link-time addresses.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, or if its DWARF
    /// is malformed
    pub fn open(path: impl AsRef<Path>, base: Option<u64>) -> Result<Self, SymbolError> {
        let path = path.as_ref();
        let data = read_file(path)?;
        let obj = parse_object(path, &data)?;
        let bias = runtime_bias(&obj, base);

        let endian =
            if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section = |id: gimli::SectionId| -> Result<Slice, gimli::Error> {
            let data = obj
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };

        let dwarf = gimli::Dwarf::load(&load_section)?;

        let mut index = Index::new(bias);
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            index.add_unit(&dwarf, &unit)?;
        }
        let from_dwarf = index.functions.len();

        // Symbol table fallback for code without debug information
        for symbol in obj.symbols() {
            if symbol.kind() != SymbolKind::Text || symbol.size() == 0 || !symbol.is_definition()
            {
                continue;
            }
            let Ok(raw) = symbol.name() else {
                continue;
            };
            let name = Self::demangle_symbol(raw);
            let entry = symbol.address() + bias;
            index
                .functions
                .entry(name.clone())
                .or_insert_with(|| FunctionRef::new(name, entry, entry + symbol.size()));
        }

        info!(
            "{}: {} functions ({} from DWARF), {} types, bias 0x{:x}",
            path.display(),
            index.functions.len(),
            from_dwarf,
            index.types.len(),
            bias
        );

        let locations = Context::from_dwarf(dwarf)?;

        Ok(Self {
            path: path.to_path_buf(),
            bias,
            functions: index.functions,
            types: index.types,
            module_functions: HashMap::new(),
            locations,
        })
    }

    /// Path the image was read from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of known functions of the main image
    #[must_use]
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Demangle a Rust symbol name, dropping the hash suffix
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

impl SymbolSource for DwarfImage {
    fn find_function(&self, name: &str) -> Result<FunctionRef, SymbolError> {
        self.functions.get(name).cloned().ok_or_else(|| SymbolError::FunctionNotFound(name.to_string()))
    }

    fn find_type(&self, name: &str) -> Result<TypeDescriptor, SymbolError> {
        self.types.get(name).cloned().ok_or_else(|| SymbolError::TypeNotFound(name.to_string()))
    }

    fn for_each_function(&self, visitor: &mut dyn FnMut(&str, Address) -> ControlFlow<()>) {
        for (name, func) in &self.functions {
            if visitor(name, func.entry).is_break() {
                break;
            }
        }
    }

    /// Inherent methods live under `Type::`, methods implemented for
    /// references under `<&Type as Trait>::`
    fn method_prefix(&self, receiver: Receiver<'_>) -> String {
        match receiver {
            Receiver::Value(ty) => format!("{}::", ty.name),
            Receiver::Pointer(ty) => format!("<&{} as ", ty.name),
        }
    }

    fn load_module_symbols(&mut self, module: &LoadedImage) -> Result<(), SymbolError> {
        let data = read_file(&module.path)?;
        let obj = parse_object(&module.path, &data)?;
        let bias = runtime_bias(&obj, Some(module.base.0));

        let mut merged = 0usize;
        for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
            if !symbol.is_definition() {
                continue;
            }
            let convention = match symbol.kind() {
                SymbolKind::Text => CallConvention::Direct,
                SymbolKind::Data => CallConvention::Indirect,
                _ => continue,
            };
            let Ok(raw) = symbol.name() else {
                continue;
            };
            let name = Self::demangle_symbol(raw);
            let entry = Address(symbol.address() + bias);
            self.module_functions.entry(name.clone()).or_insert_with(|| {
                merged += 1;
                Callable { name, entry, convention }
            });
        }

        info!("merged {merged} symbols from {}", module.path.display());
        Ok(())
    }

    fn resolve_callable(&self, name: &str, from_module: bool) -> Result<Callable, SymbolError> {
        if from_module {
            return self
                .module_functions
                .get(name)
                .cloned()
                .ok_or_else(|| SymbolError::FunctionNotFound(name.to_string()));
        }
        self.find_function(name).map(|func| Callable::direct(func.name, func.entry.0))
    }

    fn describe(&self, address: Address) -> Option<String> {
        let relative = address.0.checked_sub(self.bias)?;
        let location = self.locations.find_location(relative).ok()??;
        let mut out = location.file?.to_string();
        if let Some(line) = location.line {
            out.push_str(&format!(":{line}"));
        }
        Some(out)
    }
}

/// Loads the DWARF image of the running executable
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentExe;

impl ImageLoader for CurrentExe {
    fn load_main_image(&self) -> Result<Box<dyn SymbolSource>, SymbolError> {
        let exe = fs::read_link("/proc/self/exe")?;
        let maps = read_maps(None)?;
        let range = image_range(&maps, &exe).ok_or_else(|| SymbolError::NotMapped(exe.clone()))?;
        Ok(Box::new(DwarfImage::open(&exe, Some(range.start))?))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>, SymbolError> {
    fs::read(path).map_err(|source| SymbolError::Read { path: path.to_path_buf(), source })
}

fn parse_object<'data>(path: &Path, data: &'data [u8]) -> Result<object::File<'data>, SymbolError> {
    object::File::parse(data).map_err(|source| SymbolError::Object { path: path.to_path_buf(), source })
}

/// Difference between runtime and link-time addresses
///
/// Fixed-address executables are never relocated; position-independent
/// images are shifted so their first segment lands on `base`.
fn runtime_bias(obj: &object::File<'_>, base: Option<u64>) -> u64 {
    match (obj.kind(), base) {
        (ObjectKind::Dynamic, Some(base)) => {
            let first = obj.segments().map(|segment| segment.address()).min().unwrap_or(0);
            base.saturating_sub(first & !0xfff)
        }
        _ => 0,
    }
}

/// Tables accumulated while walking compilation units
struct Index {
    bias: u64,
    functions: BTreeMap<String, FunctionRef>,
    types: HashMap<String, TypeDescriptor>,
}

impl Index {
    fn new(bias: u64) -> Self {
        Self { bias, functions: BTreeMap::new(), types: HashMap::new() }
    }

    fn add_unit(&mut self, dwarf: &Dwarf, unit: &Unit) -> Result<(), gimli::Error> {
        // (depth, name) of the enclosing namespaces and aggregates
        let mut scopes: Vec<(isize, String)> = Vec::new();
        let mut aggregates: HashMap<UnitOffset, String> = HashMap::new();
        let mut pointers: Vec<(String, UnitOffset)> = Vec::new();
        let mut depth = 0isize;

        let mut cursor = unit.entries();
        while let Some((delta, entry)) = cursor.next_dfs()? {
            depth += delta;
            while scopes.last().is_some_and(|(d, _)| *d >= depth) {
                scopes.pop();
            }

            match entry.tag() {
                gimli::DW_TAG_namespace => {
                    let name = attr_str(dwarf, unit, entry, gimli::DW_AT_name)
                        .unwrap_or_else(|| "{anon}".to_string());
                    scopes.push((depth, name));
                }
                gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type => {
                    let Some(name) = attr_str(dwarf, unit, entry, gimli::DW_AT_name) else {
                        continue;
                    };
                    let qualified = qualify(&scopes, &name);
                    aggregates.insert(entry.offset(), qualified.clone());
                    self.types
                        .entry(qualified.clone())
                        .or_insert_with(|| TypeDescriptor::structure(qualified));
                    scopes.push((depth, name));
                }
                gimli::DW_TAG_base_type | gimli::DW_TAG_enumeration_type => {
                    let Some(name) = attr_str(dwarf, unit, entry, gimli::DW_AT_name) else {
                        continue;
                    };
                    let kind = if entry.tag() == gimli::DW_TAG_base_type { "base" } else { "enum" };
                    let qualified = qualify(&scopes, &name);
                    self.types.entry(qualified.clone()).or_insert_with(|| {
                        TypeDescriptor::new(qualified, TypeKind::Other(kind.to_string()))
                    });
                }
                gimli::DW_TAG_pointer_type | gimli::DW_TAG_reference_type => {
                    // Pointer names are already fully qualified ("&a::b::Widget")
                    let Some(name) = attr_str(dwarf, unit, entry, gimli::DW_AT_name) else {
                        continue;
                    };
                    if let Some(AttributeValue::UnitRef(pointee)) =
                        entry.attr_value(gimli::DW_AT_type)?
                    {
                        pointers.push((name, pointee));
                    }
                }
                gimli::DW_TAG_subprogram => self.add_subprogram(dwarf, unit, entry, &scopes)?,
                _ => {}
            }
        }

        // Pointees may be declared after the pointer
        for (name, pointee) in pointers {
            let target = match aggregates.get(&pointee) {
                Some(aggregate) => TypeDescriptor::structure(aggregate.clone()),
                None => TypeDescriptor::new("<opaque>", TypeKind::Other("unknown".to_string())),
            };
            self.types.entry(name.clone()).or_insert_with(|| TypeDescriptor::pointer_to(name, target));
        }

        Ok(())
    }

    fn add_subprogram(
        &mut self,
        dwarf: &Dwarf,
        unit: &Unit,
        entry: &Entry<'_, '_>,
        scopes: &[(isize, String)],
    ) -> Result<(), gimli::Error> {
        let Some(low) = entry.attr_value(gimli::DW_AT_low_pc)? else {
            return Ok(());
        };
        let Some(low) = dwarf.attr_address(unit, low)? else {
            return Ok(());
        };
        if low == 0 || TOMBSTONES.contains(&low) {
            return Ok(());
        }

        let high = match entry.attr_value(gimli::DW_AT_high_pc)? {
            Some(AttributeValue::Udata(len)) => Some(low + len),
            Some(other) => dwarf.attr_address(unit, other)?,
            None => None,
        };
        let Some(high) = high.filter(|high| *high > low) else {
            return Ok(());
        };

        let Some(name) = subprogram_name(dwarf, unit, entry, scopes)? else {
            return Ok(());
        };

        if let Some(existing) = self.functions.get(&name) {
            debug!("duplicate function {name} at 0x{low:x}, keeping 0x{:x}", existing.entry.0);
            return Ok(());
        }
        let func = FunctionRef::new(name.clone(), low + self.bias, high + self.bias);
        self.functions.insert(name, func);
        Ok(())
    }
}

/// Qualified name of a subprogram
///
/// The demangled linkage name wins because it carries the full impl path;
/// otherwise the enclosing namespaces are joined with `DW_AT_name`.
fn subprogram_name(
    dwarf: &Dwarf,
    unit: &Unit,
    entry: &Entry<'_, '_>,
    scopes: &[(isize, String)],
) -> Result<Option<String>, gimli::Error> {
    if let Some(linkage) = linkage_name(dwarf, unit, entry) {
        return Ok(Some(DwarfImage::demangle_symbol(&linkage)));
    }

    let mut plain = attr_str(dwarf, unit, entry, gimli::DW_AT_name);
    for attr in [gimli::DW_AT_specification, gimli::DW_AT_abstract_origin] {
        if let Some(AttributeValue::UnitRef(offset)) = entry.attr_value(attr)? {
            let origin = unit.entry(offset)?;
            if let Some(linkage) = linkage_name(dwarf, unit, &origin) {
                return Ok(Some(DwarfImage::demangle_symbol(&linkage)));
            }
            if plain.is_none() {
                plain = attr_str(dwarf, unit, &origin, gimli::DW_AT_name);
            }
        }
    }

    Ok(plain.map(|name| qualify(scopes, &name)))
}

fn linkage_name(dwarf: &Dwarf, unit: &Unit, entry: &Entry<'_, '_>) -> Option<String> {
    attr_str(dwarf, unit, entry, gimli::DW_AT_linkage_name)
        .or_else(|| attr_str(dwarf, unit, entry, gimli::DW_AT_MIPS_linkage_name))
}

fn attr_str(dwarf: &Dwarf, unit: &Unit, entry: &Entry<'_, '_>, attr: gimli::DwAt) -> Option<String> {
    let value = entry.attr_value(attr).ok()??;
    let raw = dwarf.attr_string(unit, value).ok()?;
    raw.to_string_lossy().ok().map(Cow::into_owned)
}

fn qualify(scopes: &[(isize, String)], name: &str) -> String {
    let mut qualified = String::new();
    for (_, scope) in scopes {
        qualified.push_str(scope);
        qualified.push_str("::");
    }
    qualified.push_str(name);
    qualified
}
