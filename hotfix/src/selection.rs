//! Target selection: turning user intent into qualified function names
//!
//! Four primitives exist: literal names, every method of a type, every
//! function under a namespace prefix, and the union of other selectors.
//! Selection is pure with respect to the image; ordering is normalized later
//! by [`crate::domain::PatchSet`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::ControlFlow;

use crate::domain::HotfixError;
use crate::symbolization::SymbolSource;

/// Which functions a session should patch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    /// Fully qualified function names
    ///
    /// ```text
    /// app::data::test_add
    /// app::data::DataType::test_hotfix
    /// ```
    Functions(Vec<String>),
    /// Every method of the named types (aggregate or pointer to aggregate)
    Types(Vec<String>),
    /// Every function whose qualified name starts with one of the prefixes
    Namespaces(Vec<String>),
    /// Concatenation of several selectors
    Any(Vec<Selector>),
}

impl Selector {
    pub fn func<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selector::Functions(names.into_iter().map(Into::into).collect())
    }

    pub fn types<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selector::Types(names.into_iter().map(Into::into).collect())
    }

    pub fn namespace<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selector::Namespaces(prefixes.into_iter().map(Into::into).collect())
    }

    pub fn any(selectors: impl IntoIterator<Item = Selector>) -> Self {
        Selector::Any(selectors.into_iter().collect())
    }

    /// Resolve to qualified names, in order of first appearance
    ///
    /// # Errors
    /// - [`HotfixError::UnsupportedTarget`] for a literal closure name
    /// - [`HotfixError::TypeNotFound`] / [`HotfixError::InvalidTarget`] for bad types
    pub fn select(&self, source: &dyn SymbolSource) -> Result<Vec<String>, HotfixError> {
        match self {
            Selector::Functions(names) => {
                if let Some(name) = names.iter().find(|name| !source.is_patchable(name)) {
                    return Err(HotfixError::UnsupportedTarget { name: name.clone() });
                }
                Ok(names.clone())
            }
            Selector::Types(names) => {
                let mut methods = Vec::new();
                for name in names {
                    let ty = source.find_type(name).map_err(|source| {
                        HotfixError::TypeNotFound { name: name.clone(), source }
                    })?;
                    let receiver = ty.receiver().ok_or_else(|| HotfixError::InvalidTarget {
                        name: name.clone(),
                        kind: ty.kind_name(),
                    })?;
                    let prefix = source.method_prefix(receiver);
                    methods.extend(with_prefix(source, &prefix));
                }
                Ok(methods)
            }
            Selector::Namespaces(prefixes) => {
                Ok(prefixes.iter().flat_map(|prefix| with_prefix(source, prefix)).collect())
            }
            Selector::Any(selectors) => {
                let mut seen = HashSet::new();
                let mut methods = Vec::new();
                for selector in selectors {
                    for name in selector.select(source)? {
                        if seen.insert(name.clone()) {
                            methods.push(name);
                        }
                    }
                }
                Ok(methods)
            }
        }
    }
}

/// Patchable functions whose name starts with `prefix`
fn with_prefix(source: &dyn SymbolSource, prefix: &str) -> Vec<String> {
    let mut names = Vec::new();
    source.for_each_function(&mut |name, _| {
        if name.starts_with(prefix) && source.is_patchable(name) {
            names.push(name.to_string());
        }
        ControlFlow::Continue(())
    });
    names
}
