//! Multi-module record loading.
//!
//! A load runs through fixed phases: modules accumulate record fragments
//! from strings, files and directories; [`Loader::finish`] then resolves
//! every record identity across modules, instantiates the concrete ones,
//! applies parent chains and fragments in patch mode, fills static
//! reference slots and finally runs the per-type hooks in dependency order.
//!
//! Problems with the data are reported through the engine's diagnostics and
//! the load carries on with whatever is usable.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Read;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info};

use crate::dag::{self, DagIssue};
use crate::database::Database;
use crate::diag::{Diagnostics, panic_message};
use crate::engine::{Engine, Env};
use crate::error::{DecladError, Result};
use crate::parse::{Reader, parse_bool_attribute};
use crate::tree::{Element, TreeNode, location};
use crate::types::{TypeId, TypeRegistry};
use crate::value::{OtherHasher, RecordId, Value};

lazy_static! {
    static ref RECORD_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("record name pattern");
}

/// Record names are identifiers: a letter or underscore, then letters,
/// digits and underscores.
pub fn is_valid_record_name(name: &str) -> bool {
    RECORD_NAME.is_match(name)
}

/// Module whose identifiers are not prefixed with the module name.
pub const CORE_MODULE: &str = "core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadState {
    #[default]
    Uninitialized,
    Accumulating,
    Processing,
    Distributing,
    Finalizing,
    Finished,
}

// ------------- Hooks -------------

pub type HookError = Box<dyn std::error::Error + Send + Sync>;
pub type HookResult = std::result::Result<(), HookError>;
pub type RecordHook = Arc<dyn Fn(&mut HookContext<'_>) -> HookResult + Send + Sync>;

/// Wraps a closure as a [`RecordHook`].
pub fn hook<F>(f: F) -> RecordHook
where
    F: Fn(&mut HookContext<'_>) -> HookResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// What a hook sees: the record it runs for and the whole database.
pub struct HookContext<'a> {
    types: &'a TypeRegistry,
    database: &'a mut Database,
    record: RecordId,
    errors: Vec<String>,
}

impl HookContext<'_> {
    pub fn record(&self) -> RecordId {
        self.record
    }

    pub fn name(&self) -> &str {
        self.database.name(self.record).unwrap_or_default()
    }

    pub fn types(&self) -> &TypeRegistry {
        self.types
    }

    pub fn database(&self) -> &Database {
        &*self.database
    }

    pub fn database_mut(&mut self) -> &mut Database {
        &mut *self.database
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.database.field(self.types, self.record, name)
    }

    pub fn set_field(&mut self, name: &str, value: Value) -> bool {
        self.database.set_field(self.types, self.record, name, value)
    }

    /// Reports a configuration problem with this record.
    pub fn report(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

fn run_hook(hook: &RecordHook, types: &TypeRegistry, database: &mut Database, record: RecordId, diag: &Diagnostics, phase: &str) {
    let display = database.display(types, record);
    let mut ctx = HookContext { types, database, record, errors: Vec::new() };
    let outcome = catch_unwind(AssertUnwindSafe(|| hook(&mut ctx)));
    for error in ctx.errors {
        diag.error(format!("{display}: {error}"));
    }
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => diag.exception(format!("{display}: {phase} failed: {e}")),
        Err(payload) => diag.exception(format!("{display}: {phase} panicked: {}", panic_message(&*payload))),
    }
}

// ------------- Fragments -------------

#[derive(Debug)]
struct Fragment {
    source: String,
    module: usize,
    ty: TypeId,
    name: String,
    /// Explicit `abstract` attribute, if any.
    is_abstract: Option<bool>,
    parent: Option<String>,
    node: Element,
}

impl Fragment {
    fn at(&self) -> String {
        location(&self.source, &self.node)
    }
}

type Identity = (TypeId, String);

#[derive(Debug)]
struct Module {
    name: String,
}

// ------------- Loader -------------

/// One load session over an [`Engine`].
pub struct Loader<'e> {
    engine: &'e mut Engine,
    modules: Vec<Module>,
    fragments: Vec<Fragment>,
}

/// A module being filled. Identifiers passed here are reported as
/// `module:identifier`, except in the core module.
pub struct ModuleMut<'l, 'e> {
    loader: &'l mut Loader<'e>,
    index: usize,
}

impl ModuleMut<'_, '_> {
    pub fn name(&self) -> &str {
        &self.loader.modules[self.index].name
    }

    /// Adds record definitions from a string.
    pub fn add_string(&mut self, text: &str, identifier: &str) -> Result<()> {
        self.loader.add_text(self.index, text, identifier)
    }

    pub fn add_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.loader.add_file(self.index, path.as_ref())
    }

    /// Adds every `*.xml` file below `path`, skipping dot-prefixed entries.
    /// Files that fail to read or parse are reported and skipped.
    pub fn add_directory(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.loader.add_directory(self.index, path.as_ref())
    }

    pub fn add_reader(&mut self, mut reader: impl Read, identifier: &str) -> Result<()> {
        let mut text = String::new();
        if let Err(e) = reader.read_to_string(&mut text) {
            let qualified = self.loader.qualify(self.index, identifier);
            self.loader.engine.diagnostics.error(format!("{qualified}: {e}"));
            return Err(e.into());
        }
        self.loader.add_text(self.index, &text, identifier)
    }
}

impl<'e> Loader<'e> {
    pub(crate) fn new(engine: &'e mut Engine) -> Self {
        if engine.state != LoadState::Uninitialized {
            engine
                .diagnostics
                .error(format!("Starting a load while the previous one is {:?}; clear the database first", engine.state));
        }
        Self { engine, modules: Vec::new(), fragments: Vec::new() }
    }

    pub fn state(&self) -> LoadState {
        self.engine.state
    }

    fn accumulate(&mut self, operation: &str) {
        match self.engine.state {
            LoadState::Uninitialized | LoadState::Accumulating => {}
            other => self.engine.diagnostics.error(format!("`{operation}` called while the load is {other:?}; continuing")),
        }
        self.engine.state = LoadState::Accumulating;
    }

    fn qualify(&self, module: usize, identifier: &str) -> String {
        let name = &self.modules[module].name;
        if name == CORE_MODULE { identifier.to_string() } else { format!("{name}:{identifier}") }
    }

    /// Creates a module, or returns the existing one with an error if the
    /// name is taken.
    pub fn create_module(&mut self, name: &str) -> ModuleMut<'_, 'e> {
        self.accumulate("create_module");
        let index = match self.modules.iter().position(|m| m.name == name) {
            Some(existing) => {
                self.engine.diagnostics.error(format!("Module `{name}` already exists; using the existing module"));
                existing
            }
            None => {
                self.modules.push(Module { name: name.to_string() });
                self.modules.len() - 1
            }
        };
        ModuleMut { loader: self, index }
    }

    pub fn module(&mut self, name: &str) -> Option<ModuleMut<'_, 'e>> {
        let index = self.modules.iter().position(|m| m.name == name)?;
        Some(ModuleMut { loader: self, index })
    }

    fn add_text(&mut self, module: usize, text: &str, identifier: &str) -> Result<()> {
        self.accumulate("add_string");
        let identifier = self.qualify(module, identifier);
        let diag = &self.engine.diagnostics;
        if text.is_empty() {
            diag.error(format!("{identifier}: Empty string provided"));
            return Err(DecladError::Config(format!("{identifier}: empty input")));
        }
        if text.trim_end().ends_with(".xml") {
            diag.error(format!("{identifier}: Input ends in `.xml`; it looks like a file name was passed instead of file contents"));
            return Err(DecladError::Config(format!("{identifier}: file name passed as contents")));
        }
        let root = match crate::xml::parse_document(text) {
            Ok(root) => root,
            Err(e) => {
                diag.error(format!("{identifier}: {e}"));
                return Err(e);
            }
        };
        self.ingest(module, root, &identifier);
        Ok(())
    }

    fn add_file(&mut self, module: usize, path: &Path) -> Result<()> {
        let identifier = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| path.display().to_string());
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                self.engine.diagnostics.error(format!("{}: {e}", path.display()));
                return Err(e.into());
            }
        };
        self.add_text(module, &text, &identifier)
    }

    fn add_directory(&mut self, module: usize, root: &Path) -> Result<()> {
        let mut files: Vec<PathBuf> = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) => {
                    self.engine.diagnostics.error(format!("{}: {e}", dir.display()));
                    if dir == root {
                        return Err(e.into());
                    }
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|e| e == "xml") {
                    files.push(path);
                }
            }
        }
        files.sort();
        debug!(target: "declad", files = files.len(), dir = %root.display(), "ingesting directory");
        for file in files {
            // failures are already reported; siblings still load
            let _ = self.add_file(module, &file);
        }
        Ok(())
    }

    /// Turns the children of a `<Decs>` document into fragments.
    fn ingest(&mut self, module: usize, mut root: Element, identifier: &str) {
        let env = self.engine.env();
        if root.name != "Decs" {
            env.diag.warning(format!("{identifier}: Found root element <{}>, expected <Decs>", root.name));
        }
        for node in std::mem::take(&mut root.children) {
            let at = location(identifier, &node);
            let Some(mut ty) = env.resolve_type(&node.name, &at) else { continue };
            if !env.types.is_record(ty) {
                env.diag.error(format!("{at}: `{}` is not a record type", node.name));
                continue;
            }
            let Some(name) = node.attribute("decName").map(str::to_string) else {
                env.diag.error(format!("{at}: No `decName` attribute found for <{}>", node.name));
                continue;
            };
            if !is_valid_record_name(&name) {
                env.diag.error(format!("{at}: Record name `{name}` is not a valid identifier"));
                continue;
            }
            if let Some(class) = node.attribute("class") {
                if let Some(explicit) = env.resolve_type(class, &at) {
                    if env.types.is_assignable(ty, explicit) {
                        ty = explicit;
                    } else {
                        env.diag.error(format!("{at}: Class `{class}` is not a subtype of `{}`; ignoring it", node.name));
                    }
                }
            }
            let is_abstract = match node.attribute("abstract") {
                None => None,
                Some(text) => match parse_bool_attribute(text) {
                    Some(b) => Some(b),
                    None => {
                        env.diag.error(format!("{at}: Invalid `abstract` attribute `{text}`; treating the record as concrete"));
                        None
                    }
                },
            };
            let parent = node.attribute("parent").map(str::to_string);
            self.fragments.push(Fragment { source: identifier.to_string(), module, ty, name, is_abstract, parent, node });
        }
    }

    // ------------- Processing -------------

    /// Runs every remaining phase and leaves the engine `Finished`.
    pub fn finish(self) {
        let Loader { engine, modules, fragments } = self;
        if engine.state != LoadState::Accumulating && engine.state != LoadState::Uninitialized {
            engine.diagnostics.error(format!("`finish` called while the load is {:?}; continuing", engine.state));
        }
        let started = Instant::now();
        engine.state = LoadState::Processing;

        let Engine { types, converters, database, statics, settings, diagnostics, state } = engine;
        let types: &TypeRegistry = types;
        let diag: &Diagnostics = diagnostics;

        let chains = collate(types, diag, &modules, &fragments);

        // resolve identities and create the concrete ones up front, so
        // records can link to each other in any order
        let mut instantiated: Vec<(RecordId, &Identity)> = Vec::new();
        for (identity, indices) in &chains {
            let first = &fragments[indices[0]];
            let mut ty = first.ty;
            let mut is_abstract = first.is_abstract.unwrap_or(false);
            for index in &indices[1..] {
                let fragment = &fragments[*index];
                if types.is_assignable(ty, fragment.ty) {
                    ty = fragment.ty;
                } else if !types.is_assignable(fragment.ty, ty) {
                    diag.error(format!(
                        "{}: Record `{}` is declared as both `{}` and `{}`; using `{}`",
                        fragment.at(),
                        identity.1,
                        types.name(ty),
                        types.name(fragment.ty),
                        types.name(fragment.ty)
                    ));
                    ty = fragment.ty;
                }
                if let Some(flag) = fragment.is_abstract {
                    is_abstract = flag;
                }
            }
            if is_abstract {
                continue;
            }
            match database.register(types, ty, &identity.1) {
                Ok(id) => instantiated.push((id, identity)),
                Err(e) => diag.error(format!("{}: {e}", first.at())),
            }
        }

        {
            let Database { heap, index } = &mut *database;
            let env = Env { types, converters, records: Some(&*index), diag, settings };
            let mut reader = Reader::new(env, heap, "");
            for (id, identity) in &instantiated {
                for fragment in resolve_chain(identity, &chains, &fragments, diag) {
                    let fragment = &fragments[fragment];
                    reader.source.clone_from(&fragment.source);
                    reader.populate_record(&fragment.node, id.object());
                }
            }
        }

        *state = LoadState::Distributing;
        statics.clear();
        for class in types.static_classes() {
            for (slot, ty) in &class.slots {
                let Some(root) = types.root_record_type(*ty) else {
                    diag.error(format!("Static slot `{}.{slot}` has non-record type `{}`", class.name, types.name(*ty)));
                    continue;
                };
                match database.index.lookup(root, slot) {
                    Some(entry) if types.is_assignable(*ty, entry.ty) => {
                        statics.insert((class.name.clone(), slot.clone()), entry.id);
                    }
                    Some(entry) => diag.error(format!(
                        "Static slot `{}.{slot}` expects `{}` but `{slot}` is a `{}`",
                        class.name,
                        types.name(*ty),
                        types.name(entry.ty)
                    )),
                    None => diag.error(format!("Static slot `{}.{slot}` has no `{}` named `{slot}`", class.name, types.name(*ty))),
                }
            }
        }

        *state = LoadState::Finalizing;
        let mut groups: IndexMap<TypeId, Vec<RecordId>, OtherHasher> = IndexMap::default();
        for entry in database.index.entries() {
            groups.entry(entry.ty).or_default().push(entry.id);
        }
        let group_types: Vec<TypeId> = groups.keys().copied().collect();
        let mut dependencies: Vec<(TypeId, TypeId)> = Vec::new();
        for ty in &group_types {
            for dep in depends_on(types, *ty) {
                if !types.is_record(dep) {
                    diag.error(format!("`{}` depends on `{}`, which is not a record type", types.name(*ty), types.name(dep)));
                } else {
                    // a dependency on a base type covers every loaded subtype
                    let covered: Vec<TypeId> = group_types.iter().copied().filter(|g| g != ty && types.is_assignable(dep, *g)).collect();
                    if covered.is_empty() {
                        diag.error(format!(
                            "`{}` depends on `{}`, but no records of that type were loaded; ignoring the dependency",
                            types.name(*ty),
                            types.name(dep)
                        ));
                    }
                    dependencies.extend(covered.into_iter().map(|before| (before, *ty)));
                }
            }
        }
        let ordered = dag::calculate_order(&group_types, &dependencies, |t| types.name(*t).to_string());
        for issue in &ordered.issues {
            match issue {
                DagIssue::UnknownItem(t) => diag.error(format!("Post-load ordering references unknown type `{}`", types.name(*t))),
                DagIssue::Cycle { before, after } => diag.error(format!(
                    "Post-load dependency loop between `{}` and `{}`; ignoring that edge",
                    types.name(*before),
                    types.name(*after)
                )),
            }
        }
        for ty in &ordered.items {
            let config_errors = types.inherited_hook(*ty, |h| h.config_errors.as_ref());
            let post_load = types.inherited_hook(*ty, |h| h.post_load.as_ref());
            for record in groups.get(ty).map(Vec::as_slice).unwrap_or_default() {
                if let Some(hook) = config_errors {
                    run_hook(hook, types, database, *record, diag, "config check");
                }
                if let Some(hook) = post_load {
                    run_hook(hook, types, database, *record, diag, "post-load");
                }
            }
        }

        *state = LoadState::Finished;
        info!(
            target: "declad",
            modules = modules.len(),
            fragments = fragments.len(),
            records = database.count(),
            ms = started.elapsed().as_secs_f64() * 1000.0,
            "load finished"
        );
    }
}

/// Groups fragments by identity, resolving same-module duplicates.
fn collate(types: &TypeRegistry, diag: &Diagnostics, modules: &[Module], fragments: &[Fragment]) -> IndexMap<Identity, Vec<usize>, OtherHasher> {
    let mut chains: IndexMap<Identity, Vec<usize>, OtherHasher> = IndexMap::default();
    let mut seen: HashMap<(usize, Identity), usize, OtherHasher> = HashMap::default();
    for (index, fragment) in fragments.iter().enumerate() {
        let root = types.root_record_type(fragment.ty).unwrap_or(fragment.ty);
        let identity: Identity = (root, fragment.name.clone());
        if let Some(earlier) = seen.get(&(fragment.module, identity.clone())).copied() {
            diag.error(format!(
                "{}: Record `{}` is defined twice in module `{}`, also at {}",
                fragment.at(),
                fragment.name,
                modules[fragment.module].name,
                fragments[earlier].at()
            ));
            // an abstract duplicate never displaces the earlier definition
            if fragment.is_abstract == Some(true) {
                continue;
            }
            if let Some(chain) = chains.get_mut(&identity) {
                chain.retain(|i| *i != earlier);
            }
        }
        seen.insert((fragment.module, identity.clone()), index);
        chains.entry(identity).or_default().push(index);
    }
    chains.retain(|_, chain| !chain.is_empty());
    chains
}

/// Fragments to apply for one identity: the parent's full chain first, then
/// the identity's own fragments.
fn resolve_chain(identity: &Identity, chains: &IndexMap<Identity, Vec<usize>, OtherHasher>, fragments: &[Fragment], diag: &Diagnostics) -> Vec<usize> {
    let Some(own) = chains.get(identity) else { return Vec::new() };
    let mut chain: Vec<usize> = own.clone();
    let mut visited: HashSet<&Identity> = HashSet::new();
    visited.insert(identity);
    let mut segment: &[usize] = own;
    while let Some(with_parent) = segment.iter().rev().find(|i| fragments[**i].parent.is_some()) {
        let fragment = &fragments[*with_parent];
        let parent_name = fragment.parent.as_deref().unwrap_or_default();
        let parent: Identity = (identity.0, parent_name.to_string());
        let Some((key, parent_chain)) = chains.get_key_value(&parent) else {
            diag.error(format!("{}: Parent `{parent_name}` of `{}` not found", fragment.at(), identity.1));
            break;
        };
        if !visited.insert(key) {
            diag.error(format!("{}: Parent chain of `{}` loops back to `{parent_name}`", fragment.at(), identity.1));
            break;
        }
        let mut combined = parent_chain.clone();
        combined.extend(chain);
        chain = combined;
        segment = parent_chain.as_slice();
    }
    chain
}

/// Types whose post-load hooks must run before `ty`'s, including those
/// declared on ancestors.
fn depends_on(types: &TypeRegistry, ty: TypeId) -> Vec<TypeId> {
    let mut out = Vec::new();
    let mut current = Some(ty);
    while let Some(id) = current {
        let descriptor = types.get(id);
        for dep in &descriptor.hooks.setup_depends_on {
            if !out.contains(dep) {
                out.push(*dep);
            }
        }
        current = descriptor.parent;
    }
    out
}
