use std::collections::BTreeMap;

use crate::error::{IslError, IslResult};

/// One scope in the property stack: a string-keyed table.
pub type PropertyTable = BTreeMap<String, String>;

/// A stack of lexically scoped property tables.
///
/// The base table (index 0) is the global scope and is never popped.
/// Lookup walks from the top of the stack down; `effective()` merges the
/// whole stack with more-nested entries overriding outer ones.
#[derive(Debug)]
pub struct PropertyStack {
    stack: Vec<PropertyTable>,
}

impl Default for PropertyStack {
    fn default() -> Self {
        Self::new()
    }
}

impl PropertyStack {
    /// A fresh stack holding only the global table.
    pub fn new() -> Self {
        Self {
            stack: vec![PropertyTable::new()],
        }
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Push a new empty scope.
    pub fn push(&mut self) {
        self.stack.push(PropertyTable::new());
    }

    /// Pop the innermost scope. Popping the global table is an
    /// interpreter bug and fails with `StackUnderflow`.
    pub fn pop(&mut self) -> IslResult<()> {
        if self.stack.len() <= 1 {
            return Err(IslError::StackUnderflow);
        }
        self.stack.pop();
        Ok(())
    }

    /// Write into the innermost scope, or the global scope when `global`.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>, global: bool) {
        let table = if global {
            &mut self.stack[0]
        } else {
            self.stack.last_mut().expect("stack holds the base table")
        };
        table.insert(key.into(), value.into());
    }

    /// Innermost binding for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.stack
            .iter()
            .rev()
            .find_map(|table| table.get(key).map(String::as_str))
    }

    /// Merged view of all scopes, innermost bindings winning.
    pub fn effective(&self) -> PropertyTable {
        let mut merged = PropertyTable::new();
        for table in &self.stack {
            for (k, v) in table {
                merged.insert(k.clone(), v.clone());
            }
        }
        merged
    }

    /// The topmost table that already defines `key`, else the innermost
    /// table. Mutation tags (`increment`, `replace`, `append`) use this
    /// so they update the nearest enclosing definition instead of
    /// shadowing it.
    pub fn find_owning_mut(&mut self, key: &str) -> &mut PropertyTable {
        let idx = self
            .stack
            .iter()
            .rposition(|table| table.contains_key(key))
            .unwrap_or(self.stack.len() - 1);
        &mut self.stack[idx]
    }

    /// Remove a binding from the global table.
    pub fn clear_global(&mut self, key: &str) {
        self.stack[0].remove(key);
    }
}
