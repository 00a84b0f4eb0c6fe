//! Variable resolution for `${NAME}` expressions.
//!
//! The engine treats variables as an opaque key → string lookup. Copy counts,
//! channel sizes and sampler intervals may all be written as expressions and
//! are resolved through a [`VariableResolver`] right before they are needed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lookup capability used by the engine to resolve expressions.
pub trait VariableResolver: Send + Sync {
    /// Value of a single variable, if defined.
    fn get_variable(&self, name: &str) -> Option<String>;

    /// Substitute every `${NAME}` in `expr`. Unknown names are left verbatim.
    fn resolve(&self, expr: &str) -> String {
        let mut out = String::with_capacity(expr.len());
        let mut rest = expr;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.get_variable(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Simple in-memory variable space.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    /// Builder-style `set`.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

impl VariableResolver for Variables {
    fn get_variable(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}
