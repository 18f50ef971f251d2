//! The record database: every named record, keyed by its root type and name.
//!
//! Records live in the database's own [`Heap`]; links between records are
//! `Value::Record` ids into this heap, so the whole database is one object
//! graph.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::error::{DecladError, Result};
use crate::types::{TypeId, TypeRegistry};
use crate::value::{Heap, OtherHasher, RecordId, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub id: RecordId,
    pub ty: TypeId,
    /// Parentless record type that scopes the name.
    pub root: TypeId,
    pub name: String,
}

/// Name lookup over the registered records, in registration order.
#[derive(Debug, Default)]
pub struct RecordIndex {
    by_key: HashMap<(TypeId, String), RecordId, OtherHasher>,
    entries: IndexMap<RecordId, RecordEntry, OtherHasher>,
}

impl RecordIndex {
    pub fn lookup(&self, root: TypeId, name: &str) -> Option<&RecordEntry> {
        let id = self.by_key.get(&(root, name.to_string()))?;
        self.entries.get(id)
    }

    pub fn entry(&self, id: RecordId) -> Option<&RecordEntry> {
        self.entries.get(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &RecordEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct Database {
    pub(crate) heap: Heap,
    pub(crate) index: RecordIndex,
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn index(&self) -> &RecordIndex {
        &self.index
    }

    /// Instantiates and indexes a new record. Fails on a duplicate
    /// `(root, name)` or a type that cannot be instantiated.
    pub(crate) fn register(&mut self, types: &TypeRegistry, ty: TypeId, name: &str) -> Result<RecordId> {
        let root = types
            .root_record_type(ty)
            .ok_or_else(|| DecladError::State(format!("`{}` is not a record type", types.name(ty))))?;
        if self.index.by_key.contains_key(&(root, name.to_string())) {
            return Err(DecladError::State(format!("record `{}:{name}` is already registered", types.name(root))));
        }
        let object = self
            .heap
            .instantiate(types, ty)
            .ok_or_else(|| DecladError::State(format!("`{}` cannot be instantiated", types.name(ty))))?;
        let id = RecordId(object);
        self.index.by_key.insert((root, name.to_string()), id);
        self.index.entries.insert(id, RecordEntry { id, ty, root, name: name.to_string() });
        Ok(id)
    }

    /// The record named `name` in `ty`'s root scope, if it is a `ty`.
    pub fn get(&self, types: &TypeRegistry, ty: TypeId, name: &str) -> Option<RecordId> {
        let root = types.root_record_type(ty)?;
        self.index.lookup(root, name).filter(|e| types.is_assignable(ty, e.ty)).map(|e| e.id)
    }

    /// Every record assignable to `ty`, in registration order.
    pub fn list(&self, types: &TypeRegistry, ty: TypeId) -> Vec<RecordId> {
        self.index.entries().filter(|e| types.is_assignable(ty, e.ty)).map(|e| e.id).collect()
    }

    pub fn count(&self) -> usize {
        self.index.len()
    }

    pub fn entry(&self, id: RecordId) -> Option<&RecordEntry> {
        self.index.entry(id)
    }

    pub fn name(&self, id: RecordId) -> Option<&str> {
        self.index.entry(id).map(|e| e.name.as_str())
    }

    pub fn field(&self, types: &TypeRegistry, id: RecordId, name: &str) -> Option<&Value> {
        self.heap.field(types, id.object(), name)
    }

    pub fn set_field(&mut self, types: &TypeRegistry, id: RecordId, name: &str, value: Value) -> bool {
        self.heap.set_field(types, id.object(), name, value)
    }

    /// `[Type:name]`, the form used in diagnostics.
    pub fn display(&self, types: &TypeRegistry, id: RecordId) -> String {
        match self.index.entry(id) {
            Some(entry) => format!("[{}:{}]", types.name(entry.ty), entry.name),
            None => "[unregistered]".to_string(),
        }
    }

    pub fn clear(&mut self) {
        self.heap = Heap::new();
        self.index = RecordIndex::default();
    }
}
