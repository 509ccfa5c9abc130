//! The debug-information gateway consumed by the engine
//!
//! The engine never parses debug information itself. It asks a
//! [`SymbolSource`] for functions and types by qualified name, walks every
//! known function, and merges a freshly loaded module into the source's
//! lookup tables before cross-referencing. [`super::DwarfImage`] is the ELF
//! implementation; tests substitute in-memory tables.

use std::ops::ControlFlow;

use crate::domain::{Address, Callable, FunctionRef, LoadedImage, SymbolError};

use super::naming;

/// Shape of a type as far as target selection cares
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    /// Plain aggregate
    Struct,
    /// Pointer to the given type
    Pointer(Box<TypeDescriptor>),
    /// Anything else, with a short description of what it is
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
}

/// The aggregate behind a type, and how its methods receive it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver<'a> {
    Value(&'a TypeDescriptor),
    Pointer(&'a TypeDescriptor),
}

impl TypeDescriptor {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> Self {
        Self { name: name.into(), kind }
    }

    pub fn structure(name: impl Into<String>) -> Self {
        Self::new(name, TypeKind::Struct)
    }

    pub fn pointer_to(name: impl Into<String>, pointee: TypeDescriptor) -> Self {
        Self::new(name, TypeKind::Pointer(Box::new(pointee)))
    }

    /// `None` unless this is an aggregate or a pointer to one
    #[must_use]
    pub fn receiver(&self) -> Option<Receiver<'_>> {
        match &self.kind {
            TypeKind::Struct => Some(Receiver::Value(self)),
            TypeKind::Pointer(pointee) if pointee.kind == TypeKind::Struct => {
                Some(Receiver::Pointer(pointee))
            }
            _ => None,
        }
    }

    /// Short human-readable kind, used in error messages
    #[must_use]
    pub fn kind_name(&self) -> String {
        match &self.kind {
            TypeKind::Struct => "struct".to_string(),
            TypeKind::Pointer(pointee) => format!("pointer to {}", pointee.kind_name()),
            TypeKind::Other(kind) => kind.clone(),
        }
    }
}

/// Function and type lookup over a code image (plus any merged modules)
pub trait SymbolSource {
    /// Resolve a function of the main image by qualified name
    ///
    /// # Errors
    /// [`SymbolError::FunctionNotFound`] if the image does not describe it
    fn find_function(&self, name: &str) -> Result<FunctionRef, SymbolError>;

    /// Resolve a type by qualified name
    ///
    /// # Errors
    /// [`SymbolError::TypeNotFound`] if the image does not describe it
    fn find_type(&self, name: &str) -> Result<TypeDescriptor, SymbolError>;

    /// Visit every known function of the main image until the visitor breaks
    ///
    /// The traversal is finite and restartable: calling it again starts over.
    fn for_each_function(&self, visitor: &mut dyn FnMut(&str, Address) -> ControlFlow<()>);

    /// Name prefix shared by all methods of the receiver
    ///
    /// Value and pointer receivers must map to distinct prefixes.
    fn method_prefix(&self, receiver: Receiver<'_>) -> String;

    /// Whether `name` may be patched at all
    fn is_patchable(&self, name: &str) -> bool {
        !naming::is_synthesized(name)
    }

    /// Merge the symbols of a loaded module into the lookup tables
    ///
    /// # Errors
    /// Returns an error if the module image cannot be read
    fn load_module_symbols(&mut self, module: &LoadedImage) -> Result<(), SymbolError>;

    /// Resolve a callable from the main image or from the merged modules
    ///
    /// # Errors
    /// [`SymbolError::FunctionNotFound`] if the requested side lacks `name`
    fn resolve_callable(&self, name: &str, from_module: bool) -> Result<Callable, SymbolError>;

    /// Optional source location of an address, for diagnostics
    fn describe(&self, _address: Address) -> Option<String> {
        None
    }
}

/// Produces the symbol source of the running executable
pub trait ImageLoader: Send + Sync {
    /// # Errors
    /// Returns an error if the executable or its debug information is unreadable
    fn load_main_image(&self) -> Result<Box<dyn SymbolSource>, SymbolError>;
}
