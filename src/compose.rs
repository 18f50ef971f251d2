//! Value to tree.
//!
//! [`Writer`] builds an in-memory output tree first and serializes it at the
//! end, because reference handling rewrites nodes after they are created: the
//! first occurrence of a shared object is only known to be shared once a
//! second occurrence turns up, and depth promotion needs the finished tree.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};

use bimap::BiMap;
use tracing::debug;

use crate::convert::Converter;
use crate::database::RecordIndex;
use crate::diag::panic_message;
use crate::engine::Env;
use crate::recorder::{Context, FORMAT_VERSION, Recorder, Shared};
use crate::tree::{Element, LIST_ITEM};
use crate::types::{TypeId, TypeKind};
use crate::value::{Heap, ObjectData, ObjectId, OtherHasher, RecordId, Value};
use crate::xml::XmlWriter;

pub(crate) type NodeId = usize;

// ------------- Output tree -------------

#[derive(Debug, Default)]
struct OutNode {
    name: String,
    attributes: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<NodeId>,
    /// Write depth, reset when a write is deferred.
    depth: usize,
}

#[derive(Debug, Default)]
pub(crate) struct OutTree {
    nodes: Vec<OutNode>,
}

impl OutTree {
    fn root(&mut self, name: &str) -> NodeId {
        self.nodes.push(OutNode { name: name.to_string(), ..OutNode::default() });
        self.nodes.len() - 1
    }

    pub(crate) fn child(&mut self, parent: NodeId, name: &str) -> NodeId {
        let depth = self.nodes[parent].depth + 1;
        self.nodes.push(OutNode { name: name.to_string(), depth, ..OutNode::default() });
        let id = self.nodes.len() - 1;
        self.nodes[parent].children.push(id);
        id
    }

    pub(crate) fn name(&self, node: NodeId) -> &str {
        &self.nodes[node].name
    }

    fn set_attribute(&mut self, node: NodeId, key: &str, value: String) {
        let attributes = &mut self.nodes[node].attributes;
        match attributes.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => attributes.push((key.to_string(), value)),
        }
    }

    fn set_text(&mut self, node: NodeId, text: String) {
        self.nodes[node].text = Some(text);
    }

    fn write(&self, root: NodeId, pretty: bool) -> String {
        enum Step {
            Enter(NodeId),
            Exit(NodeId),
        }
        let mut writer = XmlWriter::new(pretty);
        let mut stack = vec![Step::Enter(root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(id) => {
                    let node = &self.nodes[id];
                    if node.children.is_empty() {
                        writer.leaf(&node.name, &node.attributes, node.text.as_deref());
                    } else {
                        writer.open(&node.name, &node.attributes, node.text.as_deref());
                        stack.push(Step::Exit(id));
                        stack.extend(node.children.iter().rev().map(|c| Step::Enter(*c)));
                    }
                }
                Step::Exit(id) => writer.close(&self.nodes[id].name),
            }
        }
        writer.finish()
    }

    /// Owned copy of the subtree at `root`, built without recursion.
    fn to_element(&self, root: NodeId) -> Element {
        enum Step {
            Enter(NodeId),
            Exit,
        }
        let mut open: Vec<Element> = Vec::new();
        let mut finished = Element::new(self.nodes[root].name.clone());
        let mut stack = vec![Step::Enter(root)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Enter(id) => {
                    let node = &self.nodes[id];
                    let mut element = Element::new(node.name.clone());
                    element.attributes = node.attributes.clone();
                    // matches what an XML round trip would hand back
                    element.text = node.text.clone().filter(|t| !t.is_empty());
                    open.push(element);
                    stack.push(Step::Exit);
                    stack.extend(node.children.iter().rev().map(|c| Step::Enter(*c)));
                }
                Step::Exit => {
                    let Some(element) = open.pop() else { continue };
                    match open.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => finished = element,
                    }
                }
            }
        }
        finished
    }
}

// ------------- References -------------

#[derive(Debug, Default)]
struct ReferenceTracker {
    /// First node each object was written to; `None` when that write denied sharing.
    ref_to_node: HashMap<ObjectId, Option<NodeId>, OtherHasher>,
    /// Inverse of the shareable entries, for depth promotion.
    node_to_ref: HashMap<NodeId, ObjectId, OtherHasher>,
    ids: BiMap<String, ObjectId>,
    /// Objects with an id whose first node has not been hoisted yet.
    unstripped: Vec<ObjectId>,
    next: usize,
}

impl ReferenceTracker {
    fn assign(&mut self, object: ObjectId) -> String {
        if let Some(id) = self.ids.get_by_right(&object) {
            return id.clone();
        }
        let id = format!("ref{:05}", self.next);
        self.next += 1;
        self.ids.insert(id.clone(), object);
        self.unstripped.push(object);
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteStyle {
    /// Recorder documents: shared references, depth promotion.
    Recorder,
    /// Plain trees: every object must appear once.
    Simple,
    /// Record documents: links by name, no reference tracking.
    Records,
}

enum Deferred {
    Recordable { node: NodeId, object: ObjectId, ctx: Context },
    Converted { node: NodeId, object: ObjectId, ty: TypeId, converter: Converter, ctx: Context },
}

// ------------- Writer -------------

pub(crate) struct Writer<'s> {
    pub(crate) env: Env<'s>,
    pub(crate) heap: &'s mut Heap,
    pub(crate) tree: OutTree,
    style: WriteStyle,
    tracker: ReferenceTracker,
    seen: HashSet<ObjectId, OtherHasher>,
    deferred: VecDeque<Deferred>,
    overrun_reported: bool,
}

impl<'s> Writer<'s> {
    pub(crate) fn new(env: Env<'s>, heap: &'s mut Heap, style: WriteStyle) -> Self {
        Self {
            env,
            heap,
            tree: OutTree::default(),
            style,
            tracker: ReferenceTracker::default(),
            seen: HashSet::default(),
            deferred: VecDeque::new(),
            overrun_reported: false,
        }
    }

    fn type_name(&self, ty: TypeId) -> String {
        self.env.types.compose_name(ty, &self.env.settings.using_namespaces)
    }

    fn error(&self, message: impl AsRef<str>) {
        self.env.diag.error(message);
    }

    /// Writes `value`, declared as `field_ty`, into `node`.
    pub(crate) fn compose_element(&mut self, node: NodeId, value: &Value, field_ty: TypeId, ctx: &Context, tuple_names: Option<&[String]>) {
        let types = self.env.types;
        if let Value::Record(rid) = value {
            self.compose_record_link(node, *rid, field_ty);
            return;
        }
        if value.is_null() {
            if types.is_record(field_ty) {
                self.tree.set_text(node, String::new());
            } else {
                self.tree.set_attribute(node, "null", "true".into());
            }
            return;
        }
        let Some(runtime) = value.runtime_type(self.heap) else {
            self.error(format!("Value in <{}> points outside the heap; writing null", self.tree.name(node)));
            self.tree.set_attribute(node, "null", "true".into());
            return;
        };

        if let Value::Object(object) = value {
            if self.register_reference(*object, node, ctx, runtime) {
                return;
            }
        }

        if runtime != field_ty {
            if !types.is_assignable(field_ty, runtime) {
                self.error(format!(
                    "A `{}` is stored in <{}>, which is declared as `{}`",
                    self.type_name(runtime),
                    self.tree.name(node),
                    self.type_name(field_ty)
                ));
            }
            let class = self.type_name(runtime);
            self.tree.set_attribute(node, "class", class);
        }
        if ctx.shared == Shared::Allow && !types.get(runtime).is_reference() {
            self.env.diag.warning(format!("`{}` is a value type and cannot be shared; writing it inline", self.type_name(runtime)));
        }
        self.compose_shape(node, value, runtime, ctx, tuple_names);
    }

    /// Writes a value into the node of the recordable that holds it. No class
    /// tag and no reference tracking apply.
    pub(crate) fn compose_as_this(&mut self, node: NodeId, value: &Value, ty: TypeId, ctx: &Context) {
        if value.is_null() {
            self.tree.set_attribute(node, "null", "true".into());
            return;
        }
        let runtime = value.runtime_type(self.heap).unwrap_or(ty);
        self.compose_shape(node, value, runtime, ctx, None);
    }

    fn compose_record_link(&mut self, node: NodeId, rid: RecordId, field_ty: TypeId) {
        let types = self.env.types;
        let Some(entry) = self.env.records.and_then(|r| r.entry(rid)) else {
            self.error(format!("<{}> links to a record that is not in the database; writing null", self.tree.name(node)));
            self.tree.set_attribute(node, "null", "true".into());
            return;
        };
        if !types.is_record(field_ty) || !types.is_assignable(field_ty, entry.ty) {
            let class = self.type_name(entry.root);
            self.tree.set_attribute(node, "class", class);
        }
        self.tree.set_text(node, entry.name.clone());
    }

    fn compose_shape(&mut self, node: NodeId, value: &Value, ty: TypeId, ctx: &Context, tuple_names: Option<&[String]>) {
        match value {
            Value::Object(object) => self.compose_object(node, *object, ty, ctx),
            Value::Tuple(tuple_ty, items) => self.compose_tuple(node, *tuple_ty, items, ctx, tuple_names),
            Value::Type(named) => {
                let text = self.type_name(*named);
                self.tree.set_text(node, text);
            }
            other => match format_scalar(other) {
                Some(text) => self.tree.set_text(node, text),
                None => self.error(format!("Cannot write {other:?} as text")),
            },
        }
    }

    fn compose_tuple(&mut self, node: NodeId, ty: TypeId, items: &[Value], ctx: &Context, tuple_names: Option<&[String]>) {
        let TypeKind::Tuple(elements) = self.env.types.kind(ty).clone() else {
            self.error(format!("`{}` is not a tuple type", self.type_name(ty)));
            return;
        };
        let child_ctx = ctx.child();
        for (index, (item, element)) in items.iter().zip(elements).enumerate() {
            let label = match tuple_names.and_then(|names| names.get(index)) {
                Some(name) => name.as_str(),
                None => LIST_ITEM,
            };
            let child = self.tree.child(node, label);
            self.compose_element(child, item, element, &child_ctx, None);
        }
    }

    fn compose_object(&mut self, node: NodeId, object: ObjectId, ty: TypeId, ctx: &Context) {
        let types = self.env.types;
        let converters = self.env.converters;
        if let Some(converter) = converters.get(ty) {
            self.write_converted(node, object, ty, converter.clone(), ctx);
            return;
        }
        let child_ctx = ctx.child();
        match types.kind(ty).clone() {
            TypeKind::List(element) | TypeKind::Set(element) => {
                let items: Vec<Value> = match self.heap.data(object) {
                    Some(ObjectData::List(items)) => items.clone(),
                    Some(ObjectData::Set(items)) => items.iter().cloned().collect(),
                    _ => Vec::new(),
                };
                for item in &items {
                    let li = self.tree.child(node, LIST_ITEM);
                    self.compose_element(li, item, element, &child_ctx, None);
                }
            }
            TypeKind::Array { element, .. } => {
                let (lengths, items) = match self.heap.array(object) {
                    Some((lengths, items)) => (lengths.to_vec(), items.to_vec()),
                    None => (vec![0], Vec::new()),
                };
                self.compose_array_level(node, element, &lengths, 0, &items, &child_ctx);
            }
            TypeKind::Map { key, value } => {
                let entries: Vec<(Value, Value)> = self.heap.map(object).map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()).unwrap_or_default();
                for (k, v) in &entries {
                    let li = self.tree.child(node, LIST_ITEM);
                    let key_node = self.tree.child(li, crate::tree::MAP_KEY);
                    self.compose_element(key_node, k, key, &child_ctx, None);
                    let value_node = self.tree.child(li, crate::tree::MAP_VALUE);
                    self.compose_element(value_node, v, value, &child_ctx, None);
                }
            }
            TypeKind::Recordable => self.write_recordable(node, object, ctx),
            TypeKind::Composite | TypeKind::Record => {
                if self.style == WriteStyle::Recorder {
                    self.error(format!(
                        "`{}` has neither a record function nor a converter; field reflection is not available in recorder documents",
                        self.type_name(ty)
                    ));
                    return;
                }
                self.compose_fields(node, object, ty, ctx);
            }
            _ => self.error(format!("No way to write `{}`; register a converter for it", self.type_name(ty))),
        }
    }

    fn compose_array_level(&mut self, node: NodeId, element: TypeId, lengths: &[usize], level: usize, items: &[Value], ctx: &Context) {
        let stride: usize = lengths[level + 1..].iter().product();
        for index in 0..lengths[level] {
            let li = self.tree.child(node, LIST_ITEM);
            if level + 1 == lengths.len() {
                let item = items.get(index).cloned().unwrap_or_default();
                self.compose_element(li, &item, element, ctx, None);
            } else {
                let start = (index * stride).min(items.len());
                let end = (start + stride).min(items.len());
                self.compose_array_level(li, element, lengths, level + 1, &items[start..end], ctx);
            }
        }
    }

    fn compose_fields(&mut self, node: NodeId, object: ObjectId, ty: TypeId, ctx: &Context) {
        let types = self.env.types;
        let values: Vec<Value> = self.heap.fields(object).map(|f| f.to_vec()).unwrap_or_default();
        let child_ctx = ctx.child();
        for (slot, field) in types.get(ty).fields.iter().enumerate() {
            if !field.serializable || field.index {
                continue;
            }
            let child = self.tree.child(node, &field.name);
            let value = values.get(slot).cloned().unwrap_or_default();
            self.compose_element(child, &value, field.ty, &child_ctx, field.tuple_names.as_deref());
        }
    }

    // ------------- Recordables and converters -------------

    fn defer_if_deep(&mut self, node: NodeId) -> bool {
        if self.tree.nodes[node].depth < self.env.settings.max_write_depth {
            return false;
        }
        self.tree.nodes[node].depth = 0;
        true
    }

    fn write_recordable(&mut self, node: NodeId, object: ObjectId, ctx: &Context) {
        if self.defer_if_deep(node) {
            self.deferred.push_back(Deferred::Recordable { node, object, ctx: ctx.clone() });
            return;
        }
        self.run_recordable(node, object, ctx.child());
    }

    fn run_recordable(&mut self, node: NodeId, object: ObjectId, ctx: Context) {
        let Some(mut target) = self.heap.take_recordable(object) else {
            self.error(format!("<{}>: object is not a recordable instance, or is already being written", self.tree.name(node)));
            return;
        };
        let outcome = {
            let mut recorder = Recorder::writing(self, node, ctx);
            catch_unwind(AssertUnwindSafe(|| target.record(&mut recorder)))
        };
        self.heap.restore(object, ObjectData::Recordable(target));
        if let Err(payload) = outcome {
            self.env.diag.exception(format!("<{}>: record function panicked: {}", self.tree.name(node), panic_message(&*payload)));
        }
    }

    fn write_converted(&mut self, node: NodeId, object: ObjectId, ty: TypeId, converter: Converter, ctx: &Context) {
        if let Converter::String(string) = &converter {
            let written = match self.heap.data(object) {
                Some(ObjectData::Native(native)) => {
                    let native: &dyn std::any::Any = &**native;
                    catch_unwind(AssertUnwindSafe(|| string.write(native, ty)))
                }
                _ => {
                    self.error(format!("Instance of `{}` is not converter data", self.type_name(ty)));
                    return;
                }
            };
            match written {
                Ok(Ok(text)) => self.tree.set_text(node, text),
                Ok(Err(e)) => self.env.diag.exception(format!("converter for `{}` failed: {e}", self.type_name(ty))),
                Err(payload) => {
                    self.env.diag.exception(format!("converter for `{}` panicked: {}", self.type_name(ty), panic_message(&*payload)))
                }
            }
            return;
        }
        if self.defer_if_deep(node) {
            self.deferred.push_back(Deferred::Converted { node, object, ty, converter, ctx: ctx.clone() });
            return;
        }
        self.run_converter(node, object, ty, &converter, ctx.child());
    }

    fn run_converter(&mut self, node: NodeId, object: ObjectId, ty: TypeId, converter: &Converter, ctx: Context) {
        let Some(mut native) = self.heap.take_native(object) else {
            self.error(format!("Instance of `{}` is not converter data, or is already being written", self.type_name(ty)));
            return;
        };
        let outcome = {
            let mut recorder = Recorder::writing(self, node, ctx);
            match converter {
                Converter::Record(c) => catch_unwind(AssertUnwindSafe(|| c.record(&mut *native, ty, &mut recorder))),
                Converter::Factory(c) => catch_unwind(AssertUnwindSafe(|| c.write(&*native, ty, &mut recorder))),
                Converter::String(_) => Ok(Ok(())),
            }
        };
        self.heap.restore(object, ObjectData::Native(native));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.env.diag.exception(format!("converter for `{}` failed: {e}", self.type_name(ty))),
            Err(payload) => self.env.diag.exception(format!("converter for `{}` panicked: {}", self.type_name(ty), panic_message(&*payload))),
        }
    }

    fn drain_deferred(&mut self) {
        let mut drained = 0usize;
        while let Some(next) = self.deferred.pop_front() {
            drained += 1;
            match next {
                Deferred::Recordable { node, object, ctx } => self.run_recordable(node, object, ctx.child()),
                Deferred::Converted { node, object, ty, converter, ctx } => self.run_converter(node, object, ty, &converter, ctx.child()),
            }
        }
        if drained > 0 {
            debug!(target: "declad", drained, "ran deferred writes");
        }
    }

    // ------------- Reference tracking -------------

    /// Returns true when the node has been fully handled as a reference (or
    /// skipped) and must not receive the object's contents.
    fn register_reference(&mut self, object: ObjectId, node: NodeId, ctx: &Context, runtime: TypeId) -> bool {
        if !self.env.types.get(runtime).is_reference() {
            return false;
        }
        match self.style {
            WriteStyle::Records => false,
            WriteStyle::Simple => {
                if self.seen.insert(object) {
                    return false;
                }
                self.error(format!(
                    "<{}>: `{}` instance appears more than once; shared objects are not supported in this mode, skipping it",
                    self.tree.name(node),
                    self.type_name(runtime)
                ));
                true
            }
            WriteStyle::Recorder => match self.tracker.ref_to_node.get(&object).copied() {
                None => {
                    if ctx.shared == Shared::Deny {
                        self.tracker.ref_to_node.insert(object, None);
                    } else {
                        self.tracker.ref_to_node.insert(object, Some(node));
                        self.tracker.node_to_ref.insert(node, object);
                    }
                    false
                }
                Some(None) => {
                    self.error(format!(
                        "<{}>: Attempted to create a new reference to an unshared `{}`; mark its first use as shared",
                        self.tree.name(node),
                        self.type_name(runtime)
                    ));
                    true
                }
                Some(Some(_)) if ctx.shared == Shared::Deny => {
                    self.error(format!(
                        "<{}>: Attempted to create an unshared reference to a `{}` that is already written; mark this use as shared",
                        self.tree.name(node),
                        self.type_name(runtime)
                    ));
                    true
                }
                Some(Some(_)) => {
                    let id = self.tracker.assign(object);
                    self.tree.set_attribute(node, "ref", id);
                    true
                }
            },
        }
    }

    /// Moves the first occurrence of `object` into a new `<Ref>` under `refs`
    /// and leaves a `ref` attribute behind.
    fn strip(&mut self, object: ObjectId, refs: NodeId) -> Option<NodeId> {
        let id = self.tracker.ids.get_by_right(&object)?.clone();
        let source = self.tracker.ref_to_node.get(&object).copied().flatten()?;
        let class = self.heap.ty(object).map(|t| self.type_name(t)).unwrap_or_default();
        let target = self.tree.child(refs, "Ref");

        let moved = &mut self.tree.nodes[source];
        let attributes = std::mem::replace(&mut moved.attributes, vec![("ref".to_string(), id.clone())]);
        let children = std::mem::take(&mut moved.children);
        let text = moved.text.take();

        let reference = &mut self.tree.nodes[target];
        reference.attributes.push(("id".to_string(), id));
        reference.attributes.push(("class".to_string(), class));
        reference.attributes.extend(attributes.into_iter().filter(|(k, _)| k != "class" && k != "ref"));
        reference.children = children;
        reference.text = text;

        self.tracker.node_to_ref.remove(&source);
        Some(target)
    }

    /// Assigns ids to shareable objects nested `reference_depth` or more
    /// levels below `start`. Returns whether anything was promoted.
    fn promote_deep(&mut self, start: NodeId) -> bool {
        let budget = self.env.settings.reference_depth as isize;
        let overrun = self.env.settings.reference_depth_overrun as isize;
        let mut found = false;
        let mut stack = vec![(start, budget)];
        while let Some((node, remaining)) = stack.pop() {
            if remaining <= 0 {
                if let Some(object) = self.tracker.node_to_ref.get(&node).copied() {
                    if !self.tracker.ids.contains_right(&object) {
                        self.tracker.assign(object);
                        found = true;
                        continue;
                    }
                }
                if remaining <= -overrun {
                    if !self.overrun_reported {
                        self.overrun_reported = true;
                        self.error(format!(
                            "<{}>: Nesting is too deep to write; no shareable object found within {} levels, mark more of the graph as shared",
                            self.tree.name(node),
                            budget + overrun
                        ));
                    }
                    continue;
                }
            }
            stack.extend(self.tree.nodes[node].children.iter().rev().map(|c| (*c, remaining - 1)));
        }
        found
    }

    // ------------- Documents -------------

    /// Recorder document around `value`.
    pub(crate) fn write_recorder_document(mut self, value: &Value, ty: TypeId) -> String {
        let root = self.compose_recorder_document(value, ty);
        self.tree.write(root, self.env.settings.pretty)
    }

    /// The recorder document around `value` as an owned tree, for reading
    /// straight back without going through text.
    pub(crate) fn recorder_tree(mut self, value: &Value, ty: TypeId) -> Element {
        let root = self.compose_recorder_document(value, ty);
        self.tree.to_element(root)
    }

    fn compose_recorder_document(&mut self, value: &Value, ty: TypeId) -> NodeId {
        let root = self.tree.root("Record");
        let version = self.tree.child(root, "recordFormatVersion");
        self.tree.set_text(version, FORMAT_VERSION.to_string());
        let refs = self.tree.child(root, "refs");
        let data = self.tree.child(root, "data");

        self.compose_element(data, value, ty, &Context::with_shared(Shared::Flexible), None);
        self.drain_deferred();

        let mut scan = vec![data];
        let mut passes = 0usize;
        loop {
            passes += 1;
            let mut fresh = std::mem::take(&mut self.tracker.unstripped);
            fresh.sort_by(|a, b| self.tracker.ids.get_by_right(a).cmp(&self.tracker.ids.get_by_right(b)));
            for object in fresh {
                if let Some(hoisted) = self.strip(object, refs) {
                    scan.push(hoisted);
                }
            }
            let mut found = false;
            for start in std::mem::take(&mut scan) {
                found |= self.promote_deep(start);
            }
            if !found {
                break;
            }
        }
        debug!(target: "declad", references = self.tracker.ids.len(), passes, "recorder document composed");

        if self.tree.nodes[refs].children.is_empty() {
            self.tree.nodes[root].children.retain(|c| *c != refs);
        }
        root
    }

    /// Plain tree rooted at `root_name`.
    pub(crate) fn write_simple_document(mut self, value: &Value, ty: TypeId, root_name: &str) -> String {
        let root = self.tree.root(root_name);
        self.compose_element(root, value, ty, &Context::with_shared(Shared::Flexible), None);
        self.drain_deferred();
        self.tree.write(root, self.env.settings.pretty)
    }

    /// Every registered record, flattened, in registration order.
    pub(crate) fn write_records_document(mut self, index: &RecordIndex) -> String {
        let root = self.tree.root("Decs");
        for entry in index.entries() {
            let type_name = self.type_name(entry.ty);
            let node = self.tree.child(root, &type_name);
            self.tree.set_attribute(node, "decName", entry.name.clone());
            self.compose_fields(node, entry.id.object(), entry.ty, &Context::default());
        }
        self.drain_deferred();
        self.tree.write(root, self.env.settings.pretty)
    }
}

// ------------- Text forms -------------

fn format_f64(v: f64) -> String {
    if v.is_nan() {
        if v.to_bits() == f64::NAN.to_bits() { "NaN".to_string() } else { format!("NaNbox{:016X}", v.to_bits()) }
    } else if v == f64::INFINITY {
        "Infinity".to_string()
    } else if v == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}

fn format_f32(v: f32) -> String {
    if v.is_nan() {
        if v.to_bits() == f32::NAN.to_bits() { "NaN".to_string() } else { format!("NaNbox{:08X}", v.to_bits()) }
    } else if v == f32::INFINITY {
        "Infinity".to_string()
    } else if v == f32::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        v.to_string()
    }
}

/// Text form of a leaf value, or `None` for values that are not leaves.
/// Floats round-trip exactly, including NaN payloads.
pub fn format_scalar(value: &Value) -> Option<String> {
    Some(match value {
        Value::Bool(v) => v.to_string(),
        Value::I8(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::U8(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::F32(v) => format_f32(*v),
        Value::F64(v) => format_f64(*v),
        Value::Char(v) => v.to_string(),
        Value::Str(v) => v.clone(),
        Value::Enum(_, v) => v.clone(),
        _ => return None,
    })
}
