//! Symmetric read/write of whole object graphs.
//!
//! A [`Recordable`] type describes itself once, in `record`, and the same
//! code runs for both directions: on write every call emits a child node, on
//! read every call looks the child up by label and merges it into the value.
//! Recorder documents have the layout
//!
//! ```text
//! <Record>
//!   <recordFormatVersion>1</recordFormatVersion>
//!   <refs> <Ref id="ref00000" class="T">..</Ref> .. </refs>
//!   <data>..</data>
//! </Record>
//! ```
//!
//! where `refs` holds every object that is shared, cyclic, or was hoisted out
//! of a deep nesting chain.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::debug;

use crate::compose::{NodeId, Writer};
use crate::convert::Converter;
use crate::diag::panic_message;
use crate::engine::Env;
use crate::parse::{ParseMode, Reader};
use crate::tree::{Element, TreeNode, location};
use crate::types::{TypeId, TypeRegistry};
use crate::value::{Heap, ObjectData, ObjectId, OtherHasher, RecordScalar, Value};

/// Current recorder document format.
pub const FORMAT_VERSION: &str = "1";

/// A type that reads and writes itself through a [`Recorder`].
pub trait Recordable: Any + Send + Sync + fmt::Debug {
    fn record(&mut self, recorder: &mut Recorder<'_, '_>);
}

/// Builds the default instance of a recordable type.
pub type RecordableFactory = Arc<dyn Fn() -> Box<dyn Recordable> + Send + Sync>;

/// Context-scoped constructor override; `None` falls back to the type's own
/// default instance.
pub type Factory = Arc<dyn Fn(TypeId) -> Option<Box<dyn Recordable>> + Send + Sync>;
pub type FactoryTable = HashMap<TypeId, Factory, OtherHasher>;

// ------------- Contexts -------------

/// Whether a value may be written as, or read from, a shared reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shared {
    #[default]
    Deny,
    /// Inherited by the children of an `Allow` context.
    Flexible,
    Allow,
}

#[derive(Clone, Default)]
pub struct Context {
    pub(crate) shared: Shared,
    pub(crate) factories: Option<Arc<FactoryTable>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("shared", &self.shared)
            .field("factories", &self.factories.as_ref().map(|t| t.len()))
            .finish()
    }
}

impl Context {
    pub(crate) fn with_shared(shared: Shared) -> Self {
        Self { shared, factories: None }
    }

    /// Context for the contents of a value recorded in this context.
    pub(crate) fn child(&self) -> Self {
        let shared = match self.shared {
            Shared::Allow => Shared::Flexible,
            other => other,
        };
        Self { shared, factories: self.factories.clone() }
    }

    /// The factory registered for `ty` or its nearest ancestor.
    pub(crate) fn factory_for(&self, types: &TypeRegistry, ty: TypeId) -> Option<Factory> {
        let table = self.factories.as_ref()?;
        let mut current = Some(ty);
        while let Some(id) = current {
            if let Some(factory) = table.get(&id) {
                return Some(factory.clone());
            }
            current = types.get(id).parent;
        }
        None
    }
}

/// Per-call options for [`Recorder::record_with`].
#[derive(Clone, Default)]
pub struct Parameters {
    shared: bool,
    factories: Option<Arc<FactoryTable>>,
    as_this: bool,
    conflict: Option<&'static str>,
}

impl fmt::Debug for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameters")
            .field("shared", &self.shared)
            .field("factories", &self.factories.is_some())
            .field("as_this", &self.as_this)
            .finish()
    }
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allows the value to be written as a reference and read back from one.
    /// Clears any factory table.
    pub fn shared(mut self) -> Self {
        if self.factories.take().is_some() {
            self.conflict = Some("`shared` and `with_factory` cannot be combined; dropping the factories");
        }
        self.shared = true;
        self
    }

    /// Overrides construction for the value and everything below it.
    /// Clears `shared`.
    pub fn with_factory(mut self, table: FactoryTable) -> Self {
        if self.shared {
            self.conflict = Some("`shared` and `with_factory` cannot be combined; dropping `shared`");
            self.shared = false;
        }
        self.factories = Some(Arc::new(table));
        self
    }

    /// Records the value into the current node instead of a labelled child.
    pub fn as_this(mut self) -> Self {
        self.as_this = true;
        self
    }

    fn context(&self, inherited: &Context) -> Context {
        Context {
            shared: if self.shared { Shared::Allow } else { Shared::Deny },
            factories: self.factories.clone().or_else(|| inherited.factories.clone()),
        }
    }
}

// ------------- Recorder -------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

enum Inner<'r, 's> {
    Read { reader: &'r mut Reader<'s>, node: &'s dyn TreeNode },
    Write { writer: &'r mut Writer<'s>, node: NodeId },
}

/// Handle passed to `record` functions.
pub struct Recorder<'r, 's> {
    inner: Inner<'r, 's>,
    ctx: Context,
    /// Labels written so far, or consumed so far when reading.
    labels: HashSet<String>,
    ignored: HashSet<String>,
    disallow_shared: bool,
    as_this_used: bool,
}

impl<'r, 's> Recorder<'r, 's> {
    pub(crate) fn reading(reader: &'r mut Reader<'s>, node: &'s dyn TreeNode, ctx: Context, disallow_shared: bool) -> Self {
        Self {
            inner: Inner::Read { reader, node },
            ctx,
            labels: HashSet::new(),
            ignored: HashSet::new(),
            disallow_shared,
            as_this_used: false,
        }
    }

    pub(crate) fn writing(writer: &'r mut Writer<'s>, node: NodeId, ctx: Context) -> Self {
        Self {
            inner: Inner::Write { writer, node },
            ctx,
            labels: HashSet::new(),
            ignored: HashSet::new(),
            disallow_shared: false,
            as_this_used: false,
        }
    }

    fn env(&self) -> Env<'s> {
        match &self.inner {
            Inner::Read { reader, .. } => reader.env,
            Inner::Write { writer, .. } => writer.env,
        }
    }

    fn at(&self) -> String {
        match &self.inner {
            Inner::Read { reader, node } => location(&reader.source, *node),
            Inner::Write { writer, node } => format!("<{}>", writer.tree.name(*node)),
        }
    }

    pub fn direction(&self) -> Direction {
        match self.inner {
            Inner::Read { .. } => Direction::Read,
            Inner::Write { .. } => Direction::Write,
        }
    }

    pub fn is_reading(&self) -> bool {
        self.direction() == Direction::Read
    }

    pub fn types(&self) -> &TypeRegistry {
        self.env().types
    }

    pub fn heap(&self) -> &Heap {
        match &self.inner {
            Inner::Read { reader, .. } => &*reader.heap,
            Inner::Write { writer, .. } => &*writer.heap,
        }
    }

    /// Mutable heap access, for recordables that allocate their own objects.
    pub fn heap_mut(&mut self) -> &mut Heap {
        match &mut self.inner {
            Inner::Read { reader, .. } => &mut *reader.heap,
            Inner::Write { writer, .. } => &mut *writer.heap,
        }
    }

    /// Reports a data problem found by the `record` function itself.
    pub fn error(&self, message: impl fmt::Display) {
        self.env().diag.error(format!("{}: {message}", self.at()));
    }

    pub fn record(&mut self, value: &mut Value, label: &str, ty: TypeId) {
        self.record_with(value, label, ty, Parameters::default());
    }

    pub fn record_as_this(&mut self, value: &mut Value, ty: TypeId) {
        self.record_with(value, "", ty, Parameters::new().as_this());
    }

    /// Records a Rust scalar. Unparseable or absent input leaves it unchanged.
    pub fn field<T: RecordScalar>(&mut self, value: &mut T, label: &str) {
        let mut boxed = value.to_value();
        self.record(&mut boxed, label, T::TYPE);
        if let Some(read) = T::from_value(&boxed) {
            *value = read;
        }
    }

    /// Marks a label as intentionally unread.
    pub fn ignore(&mut self, label: &str) {
        self.ignored.insert(label.to_string());
    }

    pub fn record_with(&mut self, value: &mut Value, label: &str, ty: TypeId, mut params: Parameters) {
        let env = self.env();
        let at = self.at();
        if let Some(conflict) = params.conflict {
            env.diag.error(format!("{at}: {conflict}"));
        }
        if self.disallow_shared && params.shared {
            env.diag.error(format!("{at}: Shared references cannot be used while a factory converter is constructing its value; recording `{label}` unshared"));
            params.shared = false;
        }
        let ctx = params.context(&self.ctx);

        if params.as_this {
            if self.as_this_used || !self.labels.is_empty() {
                env.diag.error(format!("{at}: Recording as `this` must be the only record call of a record function"));
                return;
            }
            self.as_this_used = true;
        } else if self.as_this_used {
            env.diag.error(format!("{at}: Field `{label}` recorded after recording as `this`; ignoring it"));
            return;
        }

        match &mut self.inner {
            Inner::Write { writer, node } => {
                if params.as_this {
                    writer.compose_as_this(*node, value, ty, &ctx);
                    return;
                }
                if !self.labels.insert(label.to_string()) {
                    env.diag.error(format!("{at}: Field `{label}` written multiple times"));
                    return;
                }
                let child = writer.tree.child(*node, label);
                writer.compose_element(child, value, ty, &ctx, None);
            }
            Inner::Read { reader, node } => {
                let node: &'s dyn TreeNode = *node;
                if params.as_this {
                    let current = mem::take(value);
                    *value = reader.parse_shape(node, ty, current, ParseMode::Default, &ctx, None, &at);
                    return;
                }
                self.labels.insert(label.to_string());
                let matches: Vec<&dyn TreeNode> = node.children().into_iter().filter(|c| c.name() == label).collect();
                if matches.len() > 1 {
                    env.diag.error(format!("{at}: Field `{label}` appears {} times; using the first", matches.len()));
                }
                if let Some(child) = matches.first() {
                    let current = mem::take(value);
                    *value = reader.parse_element(*child, ty, current, &ctx, None);
                }
            }
        }
    }

    /// Warns about children that no `record` call asked for.
    pub(crate) fn report_unused(&self) {
        let Inner::Read { node, .. } = &self.inner else { return };
        if self.as_this_used {
            return;
        }
        let mut unused: Vec<&str> = Vec::new();
        for child in node.children() {
            let name = child.name();
            if !self.labels.contains(name) && !self.ignored.contains(name) && !unused.contains(&name) {
                unused.push(name);
            }
        }
        if !unused.is_empty() {
            self.env().diag.warning(format!("{}: Unused fields {}", self.at(), unused.join(", ")));
        }
    }
}

// ------------- Documents -------------

enum Pending<'a> {
    Fill(&'a Element, ObjectId, TypeId),
    Factory(&'a Element, ObjectId, TypeId, Arc<dyn crate::convert::FactoryConverter>),
}

/// Reads a recorder document into `heap`.
pub(crate) fn read_document(env: Env<'_>, heap: &mut Heap, text: &str, ty: TypeId, source: &str) -> Value {
    match crate::xml::parse_document(text) {
        Ok(root) => read_tree(env, heap, &root, ty, source),
        Err(e) => {
            env.diag.error(format!("{source}: {e}"));
            Value::Null
        }
    }
}

/// Reads an already parsed recorder document into `heap`.
pub(crate) fn read_tree(env: Env<'_>, heap: &mut Heap, root: &Element, ty: TypeId, source: &str) -> Value {
    if root.name != "Record" {
        env.diag.warning(format!("{source}: Found root element <{}>, expected <Record>", root.name));
    }
    match root.child("recordFormatVersion").map(|v| v.text.as_deref().unwrap_or("").trim()) {
        None => env.diag.error(format!("{source}: Missing recordFormatVersion; assuming the data is current")),
        Some(FORMAT_VERSION) => {}
        Some(other) => {
            env.diag.error(format!("{source}: Unknown recordFormatVersion `{other}`, expected {FORMAT_VERSION}"));
            return Value::Null;
        }
    }

    let mut reader = Reader::for_recorder(env, heap, source);
    let mut pending: Vec<Pending<'_>> = Vec::new();

    // every reference needs an identity before any body is read
    if let Some(refs) = root.child("refs") {
        for element in &refs.children {
            let at = location(source, element);
            if element.name != "Ref" {
                env.diag.error(format!("{at}: Reference element should be <Ref>, is <{}>", element.name));
            }
            let Some(id) = element.attribute("id") else {
                env.diag.error(format!("{at}: Reference is missing its `id`"));
                continue;
            };
            let Some(class) = element.attribute("class") else {
                env.diag.error(format!("{at}: Reference `{id}` is missing its `class`"));
                continue;
            };
            let Some(ref_ty) = env.resolve_type(class, &at) else { continue };
            if !env.types.get(ref_ty).is_reference() {
                env.diag.error(format!("{at}: Reference `{id}` is a `{class}`, which is a value type and cannot be shared"));
                continue;
            }
            if reader.refs.as_ref().is_some_and(|r| r.contains_left(id)) {
                env.diag.error(format!("{at}: Reference id `{id}` is defined more than once"));
                continue;
            }

            let object = match env.converters.get(ref_ty) {
                Some(Converter::String(_)) => {
                    let value = reader.parse_element_with(element, ref_ty, Value::Null, &Context::with_shared(Shared::Allow), None, &["id"]);
                    match value.as_object() {
                        Some(object) => object,
                        None => continue,
                    }
                }
                Some(Converter::Record(converter)) => match catch_unwind(AssertUnwindSafe(|| converter.create(ref_ty))) {
                    Ok(native) => {
                        let object = reader.heap.alloc(ref_ty, ObjectData::Native(native));
                        pending.push(Pending::Fill(element, object, ref_ty));
                        object
                    }
                    Err(payload) => {
                        env.diag.exception(format!("{at}: converter for `{class}` panicked: {}", panic_message(&*payload)));
                        continue;
                    }
                },
                Some(Converter::Factory(converter)) => {
                    let created = {
                        let mut recorder = Recorder::reading(&mut reader, element, Context::with_shared(Shared::Allow), true);
                        catch_unwind(AssertUnwindSafe(|| converter.create(ref_ty, &mut recorder)))
                    };
                    match created {
                        Ok(Ok(native)) => {
                            let object = reader.heap.alloc(ref_ty, ObjectData::Native(native));
                            pending.push(Pending::Factory(element, object, ref_ty, converter.clone()));
                            object
                        }
                        Ok(Err(e)) => {
                            env.diag.exception(format!("{at}: converter for `{class}` failed: {e}"));
                            continue;
                        }
                        Err(payload) => {
                            env.diag.exception(format!("{at}: converter for `{class}` panicked: {}", panic_message(&*payload)));
                            continue;
                        }
                    }
                }
                None => {
                    let ctx = Context::with_shared(Shared::Allow);
                    let created = if env.types.get(ref_ty).kind == crate::types::TypeKind::Recordable {
                        reader.create_recordable(ref_ty, &ctx, &at)
                    } else {
                        reader.heap.instantiate(env.types, ref_ty)
                    };
                    let Some(object) = created else {
                        env.diag.error(format!("{at}: Cannot create an instance of `{class}` for reference `{id}`"));
                        continue;
                    };
                    pending.push(Pending::Fill(element, object, ref_ty));
                    object
                }
            };
            if let Some(refs) = reader.refs.as_mut() {
                refs.insert(id.to_string(), object);
            }
        }
    }

    debug!(target: "declad", references = pending.len(), source, "populating references");
    for item in pending {
        match item {
            Pending::Fill(element, object, ref_ty) => {
                reader.parse_element_with(element, ref_ty, Value::Object(object), &Context::with_shared(Shared::Allow), None, &["id"]);
            }
            Pending::Factory(element, object, ref_ty, converter) => {
                let at = location(source, element);
                reader.read_factory(element, object, ref_ty, &converter, &Context::with_shared(Shared::Allow), &at);
            }
        }
    }

    let Some(data) = root.child("data") else {
        env.diag.error(format!("{source}: No <data> element provided; nothing to read"));
        return Value::Null;
    };
    reader.parse_element(data, ty, Value::Null, &Context::with_shared(Shared::Flexible), None)
}
