//! The engine: type registry, converters, settings, diagnostics and the
//! record database, plus the document entry points that tie them together.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::compose::{WriteStyle, Writer};
use crate::config::Settings;
use crate::convert::{Converter, ConverterRegistry};
use crate::database::{Database, RecordIndex};
use crate::diag::{DiagnosticSink, Diagnostics};
use crate::error::TypeError;
use crate::loader::{LoadState, Loader};
use crate::parse::Reader;
use crate::recorder::{self, Context, Shared};
use crate::types::{TypeId, TypeRegistry};
use crate::value::{Heap, OtherHasher, RecordId, Value};

/// Borrowed view of everything a read or write pass consults.
#[derive(Clone, Copy)]
pub(crate) struct Env<'s> {
    pub(crate) types: &'s TypeRegistry,
    pub(crate) converters: &'s ConverterRegistry,
    /// Record names, when record links may be resolved.
    pub(crate) records: Option<&'s RecordIndex>,
    pub(crate) diag: &'s Diagnostics,
    pub(crate) settings: &'s Settings,
}

impl Env<'_> {
    /// Resolves a written type name, reporting failures at `at`. An ambiguous
    /// name is reported and resolves to its first candidate.
    pub(crate) fn resolve_type(&self, name: &str, at: &str) -> Option<TypeId> {
        match self.types.resolve(name, &self.settings.using_namespaces) {
            Ok(id) => Some(id),
            Err(e @ TypeError::Ambiguous { first, .. }) => {
                self.diag.error(format!("{at}: {e}; using `{}`", self.types.name(first)));
                Some(first)
            }
            Err(e) => {
                self.diag.error(format!("{at}: {e}"));
                None
            }
        }
    }
}

pub struct Engine {
    pub(crate) types: TypeRegistry,
    pub(crate) converters: ConverterRegistry,
    pub(crate) database: Database,
    /// Filled static reference slots, by `(class, slot)`.
    pub(crate) statics: HashMap<(String, String), RecordId, OtherHasher>,
    pub(crate) settings: Settings,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) state: LoadState,
}

impl Engine {
    pub fn new(types: TypeRegistry) -> Self {
        Self::with_settings(types, Settings::default())
    }

    pub fn with_settings(types: TypeRegistry, settings: Settings) -> Self {
        Self {
            types,
            converters: ConverterRegistry::new(),
            database: Database::new(),
            statics: HashMap::default(),
            settings,
            diagnostics: Diagnostics::default(),
            state: LoadState::Uninitialized,
        }
    }

    /// Routes diagnostics to `sink` instead of `tracing`.
    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Diagnostics::new(sink);
        self
    }

    pub(crate) fn env(&self) -> Env<'_> {
        Env {
            types: &self.types,
            converters: &self.converters,
            records: Some(&self.database.index),
            diag: &self.diagnostics,
            settings: &self.settings,
        }
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut self.database
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Resolves a written type name against the configured namespaces.
    pub fn resolve(&self, name: &str) -> Option<TypeId> {
        self.env().resolve_type(name, "resolve")
    }

    // ------------- Converters -------------

    /// Registers `converter` for `types`. Types that already have a
    /// converter keep it; that conflict is reported.
    pub fn register_converter(&mut self, types: &[TypeId], converter: Converter) {
        if types.is_empty() {
            self.diagnostics.error(format!("{converter:?} registered for no types"));
            return;
        }
        let outcome = self.converters.register(types, converter);
        for ty in outcome.rejected {
            self.diagnostics.error(format!("Type `{}` already has a converter; keeping the first one", self.types.name(ty)));
        }
    }

    // ------------- Loading -------------

    /// Starts a load session.
    pub fn loader(&mut self) -> Loader<'_> {
        Loader::new(self)
    }

    /// Drops every record and returns to [`LoadState::Uninitialized`].
    pub fn clear_database(&mut self) {
        if !matches!(self.state, LoadState::Finished | LoadState::Uninitialized) {
            self.diagnostics.error(format!("Clearing the database while the load is {:?}", self.state));
        }
        let dropped = self.database.count();
        self.database.clear();
        self.statics.clear();
        self.state = LoadState::Uninitialized;
        debug!(target: "declad", dropped, "database cleared");
    }

    // ------------- Lookup -------------

    pub fn get(&self, ty: TypeId, name: &str) -> Option<RecordId> {
        self.database.get(&self.types, ty, name)
    }

    /// Like [`Engine::get`], naming the type as written in documents.
    pub fn get_named(&self, type_name: &str, name: &str) -> Option<RecordId> {
        let ty = self.types.resolve(type_name, &self.settings.using_namespaces).ok()?;
        self.get(ty, name)
    }

    pub fn list(&self, ty: TypeId) -> Vec<RecordId> {
        self.database.list(&self.types, ty)
    }

    pub fn field(&self, record: RecordId, name: &str) -> Option<&Value> {
        self.database.field(&self.types, record, name)
    }

    pub fn display(&self, record: RecordId) -> String {
        self.database.display(&self.types, record)
    }

    /// The record bound to a static slot by the last load.
    pub fn static_ref(&self, class: &str, slot: &str) -> Option<RecordId> {
        self.statics.get(&(class.to_string(), slot.to_string())).copied()
    }

    // ------------- Documents -------------

    /// Serializes `value` as a recorder document. Objects shared within the
    /// graph are written once, under `refs`.
    pub fn write(&self, heap: &mut Heap, value: &Value, ty: TypeId) -> String {
        let writer = Writer::new(self.env(), heap, WriteStyle::Recorder);
        writer.write_recorder_document(value, ty)
    }

    /// Reads a recorder document into `heap`.
    pub fn read(&self, heap: &mut Heap, text: &str, ty: TypeId) -> Value {
        self.read_named(heap, text, ty, "input")
    }

    /// Like [`Engine::read`], naming the input in diagnostics.
    pub fn read_named(&self, heap: &mut Heap, text: &str, ty: TypeId, source: &str) -> Value {
        recorder::read_document(self.env(), heap, text, ty, source)
    }

    /// Deep copy of the graph under `value` into `target`. Objects shared in
    /// the source stay shared in the copy, cycles included. Accepts exactly
    /// what a [`Engine::write`] then [`Engine::read`] pair would, without
    /// going through text.
    pub fn clone_value(&self, source: &mut Heap, target: &mut Heap, value: &Value, ty: TypeId) -> Value {
        let before = target.len();
        let tree = Writer::new(self.env(), source, WriteStyle::Recorder).recorder_tree(value, ty);
        let copy = recorder::read_tree(self.env(), target, &tree, ty, "clone");
        debug!(target: "declad", objects = target.len() - before, "value cloned");
        copy
    }

    /// Writes `value` as a plain tree, without reference sharing, under an
    /// element called `root_name`.
    pub fn write_simple(&self, heap: &mut Heap, value: &Value, ty: TypeId, root_name: &str) -> String {
        let writer = Writer::new(self.env(), heap, WriteStyle::Simple);
        writer.write_simple_document(value, ty, root_name)
    }

    /// Reads a plain tree written by [`Engine::write_simple`].
    pub fn read_simple(&self, heap: &mut Heap, text: &str, ty: TypeId, source: &str) -> Value {
        let root = match crate::xml::parse_document(text) {
            Ok(root) => root,
            Err(e) => {
                self.diagnostics.error(format!("{source}: {e}"));
                return Value::Null;
            }
        };
        let mut reader = Reader::new(self.env(), heap, source);
        reader.parse_element(&root, ty, Value::Null, &Context::with_shared(Shared::Flexible), None)
    }

    /// Writes every record in the database as one `<Decs>` document that the
    /// loader can read back.
    pub fn compose_records(&mut self) -> String {
        let Engine { types, converters, database, diagnostics, settings, .. } = self;
        let Database { heap, index } = database;
        let env = Env { types, converters, records: Some(&*index), diag: diagnostics, settings };
        let text = Writer::new(env, heap, WriteStyle::Records).write_records_document(index);
        info!(target: "declad", records = index.len(), bytes = text.len(), "records composed");
        text
    }
}
