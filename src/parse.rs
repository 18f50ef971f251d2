//! Tree to value.
//!
//! [`Reader`] walks a [`TreeNode`] against a declared type and produces a
//! [`Value`], merging into an existing value when one is supplied. Data
//! problems are reported through the diagnostics and answered with a
//! fallback (the original value, a default, or skipping the entry); nothing
//! here returns an error.

use std::collections::{HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bimap::BiMap;
use tracing::debug;

use crate::convert::{Converter, FactoryConverter, RecordConverter};
use crate::diag::panic_message;
use crate::engine::Env;
use crate::recorder::{Context, Recorder, Shared};
use crate::tree::{ListItem, MapEntry, SetEntry, TreeNode, LIST_ITEM, location};
use crate::types::{Primitive, TypeId, TypeKind};
use crate::value::{Heap, ObjectData, ObjectId, Value};

/// Attributes the engine itself understands on any node.
pub const RECOGNIZED_ATTRIBUTES: [&str; 4] = ["null", "ref", "class", "mode"];

/// Default slot names for tuples without declared names.
pub const TUPLE_NAMES: [&str; 8] = ["Item1", "Item2", "Item3", "Item4", "Item5", "Item6", "Item7", "Rest"];

/// How new data merges with a value that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Default,
    Replace,
    Patch,
    Append,
}

impl ParseMode {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "replace" => Some(ParseMode::Replace),
            "patch" => Some(ParseMode::Patch),
            "append" => Some(ParseMode::Append),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            ParseMode::Default => "default",
            ParseMode::Replace => "replace",
            ParseMode::Patch => "patch",
            ParseMode::Append => "append",
        }
    }
}

/// Object contents whose reading was postponed because the read had nested
/// past `max_read_depth`. The object already has its identity.
enum Deferred<'s> {
    Recordable { node: &'s dyn TreeNode, object: ObjectId, ctx: Context },
    Shape { node: &'s dyn TreeNode, object: ObjectId, ty: TypeId, mode: ParseMode, ctx: Context },
    Converted { node: &'s dyn TreeNode, object: ObjectId, ty: TypeId, converter: Arc<dyn RecordConverter>, ctx: Context },
    Factory { node: &'s dyn TreeNode, object: ObjectId, ty: TypeId, converter: Arc<dyn FactoryConverter>, ctx: Context },
}

pub(crate) struct Reader<'s> {
    pub(crate) env: Env<'s>,
    pub(crate) heap: &'s mut Heap,
    /// Identifier prefixed to every diagnostic.
    pub(crate) source: String,
    /// Present only while reading a recorder document.
    pub(crate) refs: Option<BiMap<String, ObjectId>>,
    pub(crate) allow_reflection: bool,
    /// Elements entered and not yet left.
    depth: usize,
    deferred: VecDeque<Deferred<'s>>,
    draining: bool,
}

impl<'s> Reader<'s> {
    pub(crate) fn new(env: Env<'s>, heap: &'s mut Heap, source: impl Into<String>) -> Self {
        Self::with_refs(env, heap, source.into(), None)
    }

    pub(crate) fn for_recorder(env: Env<'s>, heap: &'s mut Heap, source: impl Into<String>) -> Self {
        Self::with_refs(env, heap, source.into(), Some(BiMap::new()))
    }

    fn with_refs(env: Env<'s>, heap: &'s mut Heap, source: String, refs: Option<BiMap<String, ObjectId>>) -> Self {
        let allow_reflection = refs.is_none();
        Self { env, heap, source, refs, allow_reflection, depth: 0, deferred: VecDeque::new(), draining: false }
    }

    fn at(&self, node: &dyn TreeNode) -> String {
        location(&self.source, node)
    }

    fn error(&self, message: impl AsRef<str>) {
        self.env.diag.error(message);
    }

    fn type_name(&self, ty: TypeId) -> String {
        self.env.types.compose_name(ty, &self.env.settings.using_namespaces)
    }

    /// Resolves a written type name, reporting failures. Ambiguity falls back
    /// to the first candidate.
    pub(crate) fn resolve_type(&self, name: &str, at: &str) -> Option<TypeId> {
        self.env.resolve_type(name, at)
    }

    fn value_type(&self, value: &Value) -> Option<TypeId> {
        match value {
            Value::Record(rid) => self.env.records.and_then(|r| r.entry(*rid)).map(|e| e.ty),
            other => other.runtime_type(self.heap),
        }
    }

    // ------------- Entry points -------------

    pub(crate) fn parse_element(
        &mut self,
        node: &'s dyn TreeNode,
        ty: TypeId,
        original: Value,
        ctx: &Context,
        tuple_names: Option<&[String]>,
    ) -> Value {
        self.parse_element_with(node, ty, original, ctx, tuple_names, &[])
    }

    /// Like [`Reader::parse_element`], accepting extra attribute names that the
    /// caller has already consumed.
    pub(crate) fn parse_element_with(
        &mut self,
        node: &'s dyn TreeNode,
        ty: TypeId,
        original: Value,
        ctx: &Context,
        tuple_names: Option<&[String]>,
        extra_attributes: &[&str],
    ) -> Value {
        self.depth += 1;
        let value = self.parse_node(node, ty, original, ctx, tuple_names, extra_attributes);
        self.depth -= 1;
        if self.depth == 0 {
            self.drain_deferred();
        }
        value
    }

    fn parse_node(
        &mut self,
        node: &'s dyn TreeNode,
        ty: TypeId,
        original: Value,
        ctx: &Context,
        tuple_names: Option<&[String]>,
        extra_attributes: &[&str],
    ) -> Value {
        let at = self.at(node);

        let unknown: Vec<&str> = node
            .unrecognized_attribute_names(&RECOGNIZED_ATTRIBUTES)
            .into_iter()
            .filter(|a| !extra_attributes.contains(a))
            .collect();
        if !unknown.is_empty() {
            self.error(format!("{at}: Has unknown attributes {}", unknown.join(", ")));
        }

        let null_attribute = node.attribute("null");
        let class_attribute = node.attribute("class");
        let mode_attribute = node.attribute("mode");
        let mut ref_attribute = node.attribute("ref");

        let mut is_null = false;
        if let Some(text) = null_attribute {
            match parse_bool(text) {
                Some(b) => is_null = b,
                None => self.error(format!("{at}: Invalid `null` attribute `{text}`")),
            }
        }

        if ref_attribute.is_some() && self.refs.is_none() {
            self.error(format!("{at}: Found a reference tag outside of a recorder document; ignoring it"));
            ref_attribute = None;
        }

        let mode = match mode_attribute {
            None => ParseMode::Default,
            Some(text) => ParseMode::parse(text).unwrap_or_else(|| {
                self.error(format!("{at}: Invalid mode `{text}`, expected replace, patch or append; using default"));
                ParseMode::Default
            }),
        };

        if null_attribute.is_some() && (ref_attribute.is_some() || class_attribute.is_some() || mode_attribute.is_some()) {
            self.error(format!("{at}: A `null` attribute cannot be combined with `ref`, `class` or `mode`"));
        }
        if ref_attribute.is_some() && (class_attribute.is_some() || mode_attribute.is_some()) {
            self.error(format!("{at}: A `ref` attribute cannot be combined with `class` or `mode`"));
        }

        if let Some(key) = ref_attribute {
            return self.resolve_reference(key, ty, original, ctx, &at);
        }

        if is_null {
            return Value::Null;
        }

        let mut ty = ty;
        if let Some(class) = class_attribute {
            if let Some(explicit) = self.resolve_type(class, &at) {
                if self.env.types.is_assignable(ty, explicit) {
                    ty = explicit;
                } else {
                    self.error(format!(
                        "{at}: Explicit class `{class}` is not compatible with `{}`; keeping `{}`",
                        self.type_name(ty),
                        self.type_name(ty)
                    ));
                }
            }
            if let Some(existing) = self.value_type(&original) {
                if existing != ty {
                    self.error(format!(
                        "{at}: Explicit class `{class}` does not match the existing `{}` instance; keeping the existing instance",
                        self.type_name(existing)
                    ));
                    ty = existing;
                }
            }
        } else if let Some(existing) = self.value_type(&original) {
            if existing != ty && self.env.types.is_assignable(ty, existing) {
                ty = existing;
            }
        }

        self.parse_shape(node, ty, original, mode, ctx, tuple_names, &at)
    }

    fn resolve_reference(&mut self, key: &str, ty: TypeId, original: Value, ctx: &Context, at: &str) -> Value {
        if ctx.shared == Shared::Deny {
            self.error(format!("{at}: Found a reference in a context that does not allow sharing; using it anyway"));
        }
        let target = self.refs.as_ref().and_then(|refs| refs.get_by_left(key).copied());
        let Some(target) = target else {
            self.error(format!("{at}: Couldn't find reference with id `{key}`"));
            return original;
        };
        let target_ty = self.heap.ty(target).unwrap_or(TypeId::OBJECT);
        if !self.env.types.is_assignable(ty, target_ty) {
            self.error(format!(
                "{at}: Reference `{key}` is a `{}`, which cannot be stored in a `{}`",
                self.type_name(target_ty),
                self.type_name(ty)
            ));
            return original;
        }
        Value::Object(target)
    }

    /// Shape dispatch once attributes are settled. Also the entry point for
    /// record-as-this reads, which share the node with their parent.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn parse_shape(
        &mut self,
        node: &'s dyn TreeNode,
        ty: TypeId,
        original: Value,
        mode: ParseMode,
        ctx: &Context,
        tuple_names: Option<&[String]>,
        at: &str,
    ) -> Value {
        let types = self.env.types;
        let converters = self.env.converters;

        if let Some(converter) = converters.get(ty) {
            self.check_mode(mode, &[ParseMode::Default, ParseMode::Patch], "converted types", at);
            return self.parse_converted(node, ty, original, converter.clone(), ctx, at);
        }

        let has_text = node.has_text();
        let has_children = node.has_children();
        if has_text && has_children {
            self.error(format!("{at}: Cannot have both text and child nodes; this is probably a typo, maybe a close tag is misplaced"));
        }

        let descriptor = types.get(ty);
        if descriptor.kind == TypeKind::Record && has_children {
            self.error(format!(
                "{at}: Found child nodes under a reference to `{}`; records can only be defined at the top level",
                self.type_name(ty)
            ));
            return Value::Null;
        }

        if descriptor.kind == TypeKind::Recordable {
            self.check_mode(mode, &[ParseMode::Default, ParseMode::Patch], "recordable types", at);
            if has_text {
                self.error(format!("{at}: Text provided for recordable `{}`; ignoring it", self.type_name(ty)));
            }
            return self.parse_recordable(node, ty, original, ctx, at);
        }

        if descriptor.is_leaf() || descriptor.kind == TypeKind::Record {
            self.check_mode(mode, &[ParseMode::Default, ParseMode::Replace], "text types", at);
            if has_children {
                self.error(format!("{at}: Child nodes are not valid for text type `{}`", self.type_name(ty)));
            }
            return self.parse_string(node.text().unwrap_or(""), ty, original, at);
        }

        if has_text {
            self.error(format!("{at}: Text provided for `{}`, which cannot be read from text", self.type_name(ty)));
            return original;
        }

        let deferrable = matches!(descriptor.kind, TypeKind::List(_) | TypeKind::Array { .. } | TypeKind::Map { .. } | TypeKind::Set(_))
            || (descriptor.kind == TypeKind::Composite && self.allow_reflection);
        if deferrable && self.too_deep() {
            let Some(object) = self.collection_target(ty, &original, at) else { return original };
            self.deferred.push_back(Deferred::Shape { node, object, ty, mode, ctx: ctx.clone() });
            return Value::Object(object);
        }

        self.parse_structure(node, ty, original, mode, ctx, tuple_names, at)
    }

    /// Dispatch for values read from child nodes: collections, tuples and
    /// reflected composites.
    #[allow(clippy::too_many_arguments)]
    fn parse_structure(
        &mut self,
        node: &'s dyn TreeNode,
        ty: TypeId,
        original: Value,
        mode: ParseMode,
        ctx: &Context,
        tuple_names: Option<&[String]>,
        at: &str,
    ) -> Value {
        let types = self.env.types;
        match types.get(ty).kind.clone() {
            TypeKind::List(element) => self.parse_list(node, ty, element, original, mode, ctx, at),
            TypeKind::Array { element, rank } => self.parse_array(node, ty, element, rank, original, mode, ctx, at),
            TypeKind::Map { key, value } => self.parse_map(node, ty, key, value, original, mode, ctx, at),
            TypeKind::Set(element) => self.parse_set(node, ty, element, original, mode, ctx, at),
            TypeKind::Tuple(elements) => self.parse_tuple(node, ty, &elements, mode, ctx, tuple_names, at),
            TypeKind::Composite => {
                if !self.allow_reflection {
                    self.error(format!(
                        "{at}: `{}` has neither a record function nor a converter; field reflection is not available in recorder documents",
                        self.type_name(ty)
                    ));
                    return original;
                }
                self.check_mode(mode, &[ParseMode::Default, ParseMode::Patch], "composite types", at);
                let id = match original.as_object() {
                    Some(id) => id,
                    None => match self.heap.instantiate(types, ty) {
                        Some(id) => id,
                        None => {
                            self.error(format!("{at}: Cannot create an instance of abstract `{}`", self.type_name(ty)));
                            return original;
                        }
                    },
                };
                self.populate_fields(node, id, ctx);
                Value::Object(id)
            }
            TypeKind::Object => {
                self.error(format!("{at}: Cannot read a bare `object` without a `class` attribute"));
                original
            }
            TypeKind::Native => {
                self.error(format!("{at}: No converter registered for `{}`", self.type_name(ty)));
                original
            }
            // leaf and recordable kinds were dispatched above
            _ => original,
        }
    }

    fn check_mode(&self, mode: ParseMode, allowed: &[ParseMode], what: &str, at: &str) -> ParseMode {
        if allowed.contains(&mode) {
            mode
        } else {
            self.error(format!("{at}: Mode `{}` is not supported on {what}; using default", mode.label()));
            ParseMode::Default
        }
    }

    fn too_deep(&self) -> bool {
        self.depth > self.env.settings.max_read_depth
    }

    /// Reads every postponed object, oldest first. Objects nested deeply
    /// inside those are postponed again and picked up by the same loop.
    fn drain_deferred(&mut self) {
        if self.draining {
            return;
        }
        self.draining = true;
        let mut drained = 0usize;
        while let Some(next) = self.deferred.pop_front() {
            drained += 1;
            match next {
                Deferred::Recordable { node, object, ctx } => {
                    let at = self.at(node);
                    self.record_into(node, object, ctx, &at);
                }
                Deferred::Shape { node, object, ty, mode, ctx } => {
                    let at = self.at(node);
                    self.parse_structure(node, ty, Value::Object(object), mode, &ctx, None, &at);
                }
                Deferred::Converted { node, object, ty, converter, ctx } => {
                    let at = self.at(node);
                    self.fill_converted(node, object, ty, &converter, ctx, &at);
                }
                Deferred::Factory { node, object, ty, converter, ctx } => {
                    let at = self.at(node);
                    self.read_factory(node, object, ty, &converter, &ctx, &at);
                }
            }
        }
        self.draining = false;
        if drained > 0 {
            debug!(target: "declad", drained, source = %self.source, "ran deferred reads");
        }
    }

    // ------------- Leaves -------------

    /// Reads a leaf value from text.
    pub(crate) fn parse_string(&mut self, text: &str, ty: TypeId, original: Value, at: &str) -> Value {
        let types = self.env.types;
        let converters = self.env.converters;
        match converters.get(ty) {
            Some(Converter::String(converter)) => {
                let converter = converter.clone();
                return match catch_unwind(AssertUnwindSafe(|| converter.read(text, ty))) {
                    Ok(Ok(native)) => self.store_native(ty, native, &original),
                    Ok(Err(e)) => {
                        self.error(format!("{at}: {e}"));
                        original
                    }
                    Err(payload) => {
                        self.env.diag.exception(format!("{at}: converter for `{}` panicked: {}", self.type_name(ty), panic_message(&*payload)));
                        original
                    }
                };
            }
            Some(_) => {
                self.error(format!("{at}: `{}` has a converter that cannot read from text", self.type_name(ty)));
                return original;
            }
            None => {}
        }

        match &types.get(ty).kind {
            TypeKind::Record => {
                if text.is_empty() {
                    return Value::Null;
                }
                self.lookup_record(text, ty, original, at)
            }
            TypeKind::Type => {
                if text.is_empty() {
                    return Value::Null;
                }
                match self.resolve_type(text, at) {
                    Some(named) => Value::Type(named),
                    None => original,
                }
            }
            TypeKind::String => Value::Str(text.to_string()),
            TypeKind::Primitive(primitive) => {
                if text.is_empty() {
                    self.error(format!("{at}: Empty field provided for type `{}`", self.type_name(ty)));
                    return original;
                }
                match parse_primitive(*primitive, text.trim()) {
                    Ok(value) => value,
                    Err(e) => {
                        self.error(format!("{at}: {e}"));
                        original
                    }
                }
            }
            TypeKind::Enum(variants) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    self.error(format!("{at}: Empty field provided for type `{}`", self.type_name(ty)));
                    return original;
                }
                if variants.iter().any(|v| v == trimmed) {
                    Value::Enum(ty, trimmed.to_string())
                } else {
                    self.error(format!("{at}: `{trimmed}` is not a member of enum `{}`", self.type_name(ty)));
                    original
                }
            }
            _ => {
                self.error(format!("{at}: `{}` cannot be read from text", self.type_name(ty)));
                original
            }
        }
    }

    fn lookup_record(&self, name: &str, ty: TypeId, original: Value, at: &str) -> Value {
        let types = self.env.types;
        let Some(records) = self.env.records else {
            self.error(format!("{at}: Record reference `{name}` read without a database"));
            return original;
        };
        let root = types.root_record_type(ty).unwrap_or(ty);
        match records.lookup(root, name) {
            Some(entry) if types.is_assignable(ty, entry.ty) => Value::Record(entry.id),
            Some(entry) => {
                self.error(format!(
                    "{at}: Record `{name}` is a `{}`, which is not a `{}`",
                    self.type_name(entry.ty),
                    self.type_name(ty)
                ));
                original
            }
            None => {
                let type_name = self.type_name(ty);
                if name.contains(' ') {
                    self.error(format!("{at}: Record name `{name}` is not a valid identifier; consider removing spaces"));
                } else if name.contains('"') || name.contains('\'') {
                    self.error(format!("{at}: Record name `{name}` is not a valid identifier; consider removing quotes"));
                } else if !crate::loader::is_valid_record_name(name) {
                    self.error(format!("{at}: Record name `{name}` is not a valid identifier"));
                } else {
                    self.error(format!("{at}: Couldn't find {type_name} named `{name}`"));
                }
                original
            }
        }
    }

    fn store_native(&mut self, ty: TypeId, native: crate::value::NativeBox, original: &Value) -> Value {
        match original.as_object() {
            Some(id) if self.heap.ty(id) == Some(ty) => {
                self.heap.restore(id, ObjectData::Native(native));
                Value::Object(id)
            }
            _ => Value::Object(self.heap.alloc(ty, ObjectData::Native(native))),
        }
    }

    // ------------- Converters and recordables -------------

    fn parse_converted(&mut self, node: &'s dyn TreeNode, ty: TypeId, original: Value, converter: Converter, ctx: &Context, at: &str) -> Value {
        match converter {
            Converter::String(_) => {
                if node.has_children() {
                    self.error(format!("{at}: Child nodes are not valid for text-converted `{}`", self.type_name(ty)));
                }
                self.parse_string(node.text().unwrap_or(""), ty, original, at)
            }
            Converter::Record(converter) => {
                if node.has_text() {
                    self.error(format!("{at}: Text provided for record-converted `{}`; ignoring it", self.type_name(ty)));
                }
                let id = match original.as_object() {
                    Some(id) if self.heap.ty(id) == Some(ty) => id,
                    _ => match catch_unwind(AssertUnwindSafe(|| converter.create(ty))) {
                        Ok(native) => self.heap.alloc(ty, ObjectData::Native(native)),
                        Err(payload) => {
                            self.report_converter_result(Err(payload), ty, at);
                            return original;
                        }
                    },
                };
                if self.too_deep() {
                    self.deferred.push_back(Deferred::Converted { node, object: id, ty, converter, ctx: ctx.child() });
                } else {
                    self.fill_converted(node, id, ty, &converter, ctx.child(), at);
                }
                Value::Object(id)
            }
            Converter::Factory(converter) => {
                let id = match original.as_object() {
                    Some(id) if self.heap.ty(id) == Some(ty) => id,
                    _ => {
                        let created = {
                            let mut recorder = Recorder::reading(self, node, ctx.child(), true);
                            catch_unwind(AssertUnwindSafe(|| converter.create(ty, &mut recorder)))
                        };
                        match created {
                            Ok(Ok(native)) => self.heap.alloc(ty, ObjectData::Native(native)),
                            other => {
                                self.report_converter_result(other.map(|r| r.map(|_| ())), ty, at);
                                return original;
                            }
                        }
                    }
                };
                if self.too_deep() {
                    self.deferred.push_back(Deferred::Factory { node, object: id, ty, converter, ctx: ctx.clone() });
                } else {
                    self.read_factory(node, id, ty, &converter, ctx, at);
                }
                Value::Object(id)
            }
        }
    }

    fn fill_converted(&mut self, node: &'s dyn TreeNode, id: ObjectId, ty: TypeId, converter: &Arc<dyn RecordConverter>, ctx: Context, at: &str) {
        let Some(mut native) = self.heap.take_native(id) else {
            self.error(format!("{at}: Instance of `{}` is not converter data", self.type_name(ty)));
            return;
        };
        let result = {
            let mut recorder = Recorder::reading(self, node, ctx, false);
            let result = catch_unwind(AssertUnwindSafe(|| converter.record(&mut *native, ty, &mut recorder)));
            recorder.report_unused();
            result
        };
        self.heap.restore(id, ObjectData::Native(native));
        self.report_converter_result(result, ty, at);
    }

    pub(crate) fn read_factory(
        &mut self,
        node: &'s dyn TreeNode,
        id: ObjectId,
        ty: TypeId,
        converter: &Arc<dyn FactoryConverter>,
        ctx: &Context,
        at: &str,
    ) {
        let Some(mut native) = self.heap.take_native(id) else {
            self.error(format!("{at}: Instance of `{}` is not converter data", self.type_name(ty)));
            return;
        };
        let result = {
            let mut recorder = Recorder::reading(self, node, ctx.child(), false);
            let result = catch_unwind(AssertUnwindSafe(|| converter.read(&mut *native, ty, &mut recorder)));
            recorder.report_unused();
            result
        };
        self.heap.restore(id, ObjectData::Native(native));
        self.report_converter_result(result, ty, at);
    }

    fn report_converter_result(&self, result: std::thread::Result<crate::convert::ConvertResult<()>>, ty: TypeId, at: &str) {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.env.diag.exception(format!("{at}: converter for `{}` failed: {e}", self.type_name(ty))),
            Err(payload) => {
                self.env.diag.exception(format!("{at}: converter for `{}` panicked: {}", self.type_name(ty), panic_message(&*payload)))
            }
        }
    }

    fn parse_recordable(&mut self, node: &'s dyn TreeNode, ty: TypeId, original: Value, ctx: &Context, at: &str) -> Value {
        let id = match original.as_object() {
            Some(id) => id,
            None => match self.create_recordable(ty, ctx, at) {
                Some(id) => id,
                None => return original,
            },
        };
        if self.too_deep() {
            self.deferred.push_back(Deferred::Recordable { node, object: id, ctx: ctx.child() });
        } else {
            self.record_into(node, id, ctx.child(), at);
        }
        Value::Object(id)
    }

    /// Builds a fresh recordable, through a context factory when one covers
    /// the type or one of its ancestors.
    pub(crate) fn create_recordable(&mut self, ty: TypeId, ctx: &Context, at: &str) -> Option<ObjectId> {
        let types = self.env.types;
        if let Some(factory) = ctx.factory_for(types, ty) {
            match catch_unwind(AssertUnwindSafe(|| factory(ty))) {
                Ok(Some(instance)) => return Some(self.heap.alloc(ty, ObjectData::Recordable(instance))),
                Ok(None) => self.error(format!("{at}: Factory for `{}` returned nothing; using the default instance", self.type_name(ty))),
                Err(payload) => self.env.diag.exception(format!("{at}: factory for `{}` panicked: {}", self.type_name(ty), panic_message(&*payload))),
            }
        }
        let created = self.heap.instantiate(types, ty);
        if created.is_none() {
            self.error(format!("{at}: Cannot create an instance of `{}`", self.type_name(ty)));
        }
        created
    }

    pub(crate) fn record_into(&mut self, node: &'s dyn TreeNode, id: ObjectId, ctx: Context, at: &str) {
        let Some(mut target) = self.heap.take_recordable(id) else {
            self.error(format!("{at}: Object is not a recordable instance"));
            return;
        };
        let outcome = {
            let mut recorder = Recorder::reading(self, node, ctx, false);
            let outcome = catch_unwind(AssertUnwindSafe(|| target.record(&mut recorder)));
            recorder.report_unused();
            outcome
        };
        self.heap.restore(id, ObjectData::Recordable(target));
        if let Err(payload) = outcome {
            self.env.diag.exception(format!("{at}: record function panicked: {}", panic_message(&*payload)));
        }
    }

    // ------------- Collections -------------

    /// Reuses the original collection object when there is one, so every
    /// holder of the reference sees the merged contents.
    fn collection_target(&mut self, ty: TypeId, original: &Value, at: &str) -> Option<ObjectId> {
        if let Some(id) = original.as_object() {
            return Some(id);
        }
        let created = self.heap.instantiate(self.env.types, ty);
        if created.is_none() {
            self.error(format!("{at}: Cannot create an instance of `{}`", self.type_name(ty)));
        }
        created
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_list(&mut self, node: &'s dyn TreeNode, ty: TypeId, element: TypeId, original: Value, mode: ParseMode, ctx: &Context, at: &str) -> Value {
        let mode = self.check_mode(mode, &[ParseMode::Default, ParseMode::Replace, ParseMode::Append], "lists", at);
        let Some(id) = self.collection_target(ty, &original, at) else { return original };
        if mode != ParseMode::Append {
            if let Some(list) = self.heap.list_mut(id) {
                list.clear();
            }
        }
        let child_ctx = ctx.child();
        for item in node.list_items() {
            let child = match item {
                ListItem::Item(child) => child,
                ListItem::Misnamed(child) => {
                    self.error(format!("{}: Tag should be <{LIST_ITEM}>, is <{}>", self.at(child), child.name()));
                    child
                }
            };
            let value = self.parse_element(child, element, Value::Null, &child_ctx, None);
            if let Some(list) = self.heap.list_mut(id) {
                list.push(value);
            }
        }
        Value::Object(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_array(
        &mut self,
        node: &'s dyn TreeNode,
        ty: TypeId,
        element: TypeId,
        rank: usize,
        original: Value,
        mode: ParseMode,
        ctx: &Context,
        at: &str,
    ) -> Value {
        let mut mode = self.check_mode(mode, &[ParseMode::Default, ParseMode::Replace, ParseMode::Append], "arrays", at);
        if mode == ParseMode::Append && rank > 1 {
            self.error(format!("{at}: Append is only supported on one-dimensional arrays; replacing instead"));
            mode = ParseMode::Replace;
        }
        let Some(id) = self.collection_target(ty, &original, at) else { return original };

        // extents come from the first entry at each nesting level
        let mut lengths = Vec::with_capacity(rank);
        let mut cursor: Option<&dyn TreeNode> = Some(node);
        for _ in 0..rank {
            let children = cursor.map(|p| p.children()).unwrap_or_default();
            lengths.push(children.len());
            cursor = children.into_iter().next();
        }

        let child_ctx = ctx.child();
        let mut items = Vec::with_capacity(lengths.iter().product());
        self.parse_array_level(node, element, &lengths, 0, &mut items, &child_ctx, at);

        if mode == ParseMode::Append {
            if let Some((_, existing)) = self.heap.array(id) {
                let mut combined = existing.to_vec();
                combined.extend(items);
                lengths = vec![combined.len()];
                items = combined;
            }
        }
        self.heap.restore(id, ObjectData::Array { lengths, items });
        Value::Object(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_array_level(
        &mut self,
        node: &'s dyn TreeNode,
        element: TypeId,
        lengths: &[usize],
        level: usize,
        items: &mut Vec<Value>,
        ctx: &Context,
        at: &str,
    ) {
        let expected = lengths[level];
        let children = node.children();
        if children.len() != expected {
            self.error(format!(
                "{at}: Array dimension {level} has {} entries, expected {expected}; padding or truncating",
                children.len()
            ));
        }
        let stride: usize = lengths[level + 1..].iter().product();
        for index in 0..expected {
            match children.get(index) {
                Some(child) => {
                    if child.name() != LIST_ITEM {
                        self.error(format!("{}: Tag should be <{LIST_ITEM}>, is <{}>", self.at(*child), child.name()));
                    }
                    if level + 1 == lengths.len() {
                        items.push(self.parse_element(*child, element, Value::Null, ctx, None));
                    } else {
                        self.parse_array_level(*child, element, lengths, level + 1, items, ctx, at);
                    }
                }
                None => {
                    let fill = self.env.types.default_value(element);
                    items.extend(std::iter::repeat_n(fill, stride));
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_map(
        &mut self,
        node: &'s dyn TreeNode,
        ty: TypeId,
        key_ty: TypeId,
        value_ty: TypeId,
        original: Value,
        mode: ParseMode,
        ctx: &Context,
        at: &str,
    ) -> Value {
        let Some(id) = self.collection_target(ty, &original, at) else { return original };
        let mut replaceable: HashSet<Value> = HashSet::new();
        match mode {
            ParseMode::Default | ParseMode::Replace => {
                if let Some(map) = self.heap.map_mut(id) {
                    map.clear();
                }
            }
            ParseMode::Patch => {
                if let Some(map) = self.heap.map(id) {
                    replaceable.extend(map.keys().cloned());
                }
            }
            ParseMode::Append => {}
        }

        let child_ctx = ctx.child();
        for entry in node.map_entries() {
            let (key, value_node, entry_at) = match entry {
                MapEntry::Explicit { entry, key, value } => {
                    let entry_at = self.at(entry);
                    let Some(key_node) = key else {
                        self.error(format!("{entry_at}: Map entry is missing its <key>"));
                        continue;
                    };
                    let Some(value_node) = value else {
                        self.error(format!("{entry_at}: Map entry is missing its <value>"));
                        continue;
                    };
                    (self.parse_element(key_node, key_ty, Value::Null, &child_ctx, None), value_node, entry_at)
                }
                MapEntry::Inline { key, value } => {
                    let entry_at = self.at(value);
                    (self.parse_string(key, key_ty, Value::Null, &entry_at), value, entry_at)
                }
            };
            if key.is_null() {
                self.error(format!("{entry_at}: Map key is null; skipping the entry"));
                continue;
            }

            let existing = self.heap.map(id).and_then(|m| m.get(&key).cloned());
            if !replaceable.remove(&key) && existing.is_some() {
                self.error(format!("{entry_at}: Map includes duplicate key `{}`", describe(&key)));
            }
            let merge_into = if mode == ParseMode::Patch { existing.unwrap_or_default() } else { Value::Null };
            let value = self.parse_element(value_node, value_ty, merge_into, &child_ctx, None);
            if let Some(map) = self.heap.map_mut(id) {
                map.insert(key, value);
            }
        }
        Value::Object(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_set(&mut self, node: &'s dyn TreeNode, ty: TypeId, element: TypeId, original: Value, mode: ParseMode, ctx: &Context, at: &str) -> Value {
        let Some(id) = self.collection_target(ty, &original, at) else { return original };
        let mut replaceable: HashSet<Value> = HashSet::new();
        match mode {
            ParseMode::Default | ParseMode::Replace => {
                if let Some(set) = self.heap.set_mut(id) {
                    set.clear();
                }
            }
            ParseMode::Patch => {
                if let Some(set) = self.heap.set(id) {
                    replaceable.extend(set.iter().cloned());
                }
            }
            ParseMode::Append => {}
        }

        let child_ctx = ctx.child();
        for entry in node.set_entries() {
            let (item, entry_at) = match entry {
                SetEntry::Item(child) => (self.parse_element(child, element, Value::Null, &child_ctx, None), self.at(child)),
                SetEntry::Inline { key, node: child } => {
                    let entry_at = self.at(child);
                    if child.has_children() || child.has_text() {
                        self.error(format!("{entry_at}: Set entry `{key}` has contents; only the tag name is used"));
                    }
                    (self.parse_string(key, element, Value::Null, &entry_at), entry_at)
                }
            };
            if item.is_null() {
                self.error(format!("{entry_at}: Set element is null; skipping it"));
                continue;
            }
            let present = self.heap.set(id).is_some_and(|s| s.contains(&item));
            if !replaceable.remove(&item) && present {
                self.error(format!("{entry_at}: Set includes duplicate element `{}`", describe(&item)));
            }
            if let Some(set) = self.heap.set_mut(id) {
                set.insert(item);
            }
        }
        Value::Object(id)
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_tuple(
        &mut self,
        node: &'s dyn TreeNode,
        ty: TypeId,
        elements: &[TypeId],
        mode: ParseMode,
        ctx: &Context,
        tuple_names: Option<&[String]>,
        at: &str,
    ) -> Value {
        self.check_mode(mode, &[ParseMode::Default, ParseMode::Replace], "tuples", at);
        let children = node.children();
        let child_ctx = ctx.child();
        let types = self.env.types;

        if children.iter().all(|c| c.name() == LIST_ITEM) {
            if !children.is_empty() && children.len() != elements.len() {
                self.error(format!("{at}: Tuple has {} entries, expected {}", children.len(), elements.len()));
            }
            let mut values = Vec::with_capacity(elements.len());
            for (index, element) in elements.iter().enumerate() {
                values.push(match children.get(index) {
                    Some(child) => self.parse_element(*child, *element, Value::Null, &child_ctx, None),
                    None => types.default_value(*element),
                });
            }
            return Value::Tuple(ty, values);
        }

        let names: Vec<&str> = match tuple_names {
            Some(names) => names.iter().map(String::as_str).collect(),
            None => TUPLE_NAMES.iter().take(elements.len()).copied().collect(),
        };
        let mut slots: Vec<Option<Value>> = vec![None; elements.len()];
        for child in children {
            let Some(index) = names.iter().position(|n| *n == child.name()).filter(|i| *i < elements.len()) else {
                self.error(format!(
                    "{}: Tuple has no slot named `{}`; expected one of {}",
                    self.at(child),
                    child.name(),
                    names.join(", ")
                ));
                continue;
            };
            if slots[index].is_some() {
                self.error(format!("{}: Duplicate tuple slot `{}`", self.at(child), child.name()));
                continue;
            }
            slots[index] = Some(self.parse_element(child, elements[index], Value::Null, &child_ctx, None));
        }
        let values = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    self.error(format!("{at}: Missing tuple slot `{}`", names.get(index).copied().unwrap_or("?")));
                    types.default_value(elements[index])
                })
            })
            .collect();
        Value::Tuple(ty, values)
    }

    // ------------- Composites -------------

    /// Applies every child of `node` to the matching field of `id`.
    pub(crate) fn populate_fields(&mut self, node: &'s dyn TreeNode, id: ObjectId, ctx: &Context) {
        let types = self.env.types;
        let Some(ty) = self.heap.ty(id) else { return };
        let mut seen: HashSet<&str> = HashSet::new();
        let child_ctx = ctx.child();
        for child in node.children() {
            let name = child.name();
            let at = self.at(child);
            if !seen.insert(name) {
                self.error(format!("{at}: Duplicate field `{name}`"));
            }
            let Some((slot, field)) = types.field(ty, name) else {
                let wanted = loose_canonical(name);
                match types.get(ty).fields.iter().find(|f| loose_canonical(&f.name) == wanted) {
                    Some(close) => self.error(format!(
                        "{at}: Field `{name}` does not exist in type `{}`; did you mean `{}`?",
                        self.type_name(ty),
                        close.name
                    )),
                    None => self.error(format!("{at}: Field `{name}` does not exist in type `{}`", self.type_name(ty))),
                }
                continue;
            };
            if field.index {
                self.error(format!("{at}: Field `{name}` is an index generated by the engine and cannot be set"));
                continue;
            }
            if !field.serializable {
                self.error(format!("{at}: Field `{name}` is not serializable and cannot be set"));
                continue;
            }
            let current = self.heap.fields(id).and_then(|f| f.get(slot).cloned()).unwrap_or_default();
            let value = self.parse_element(child, field.ty, current, &child_ctx, field.tuple_names.as_deref());
            if let Some(target) = self.heap.fields_mut(id).and_then(|f| f.get_mut(slot)) {
                *target = value;
            }
        }
    }

    /// Applies one fragment of a named record.
    pub(crate) fn populate_record(&mut self, node: &'s dyn TreeNode, id: ObjectId) {
        let at = self.at(node);
        let unknown: Vec<&str> = node
            .unrecognized_attribute_names(&["decName", "abstract", "parent", "class", "mode"])
            .into_iter()
            .collect();
        if !unknown.is_empty() {
            self.error(format!("{at}: Has unknown attributes {}", unknown.join(", ")));
        }
        if let Some(mode) = node.attribute("mode") {
            if mode != "patch" {
                self.error(format!("{at}: Record fragments only support `patch` mode, found `{mode}`; patching"));
            }
        }
        if node.has_text() {
            self.error(format!("{at}: Records cannot have text content"));
        }
        self.populate_fields(node, id, &Context::default());
    }
}

// ------------- Text helpers -------------

fn parse_bool(text: &str) -> Option<bool> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

pub(crate) fn parse_bool_attribute(text: &str) -> Option<bool> {
    parse_bool(text)
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => text.parse::<f64>().ok(),
    }
}

/// Locale-invariant primitive parsing.
pub fn parse_primitive(primitive: Primitive, text: &str) -> Result<Value, String> {
    let fail = |what: &str| format!("`{text}` is not a valid {what}");
    Ok(match primitive {
        Primitive::Bool => Value::Bool(parse_bool(text).ok_or_else(|| fail("bool"))?),
        Primitive::I8 => Value::I8(text.parse().map_err(|_| fail("sbyte"))?),
        Primitive::I16 => Value::I16(text.parse().map_err(|_| fail("short"))?),
        Primitive::I32 => Value::I32(text.parse().map_err(|_| fail("int"))?),
        Primitive::I64 => Value::I64(text.parse().map_err(|_| fail("long"))?),
        Primitive::U8 => Value::U8(text.parse().map_err(|_| fail("byte"))?),
        Primitive::U16 => Value::U16(text.parse().map_err(|_| fail("ushort"))?),
        Primitive::U32 => Value::U32(text.parse().map_err(|_| fail("uint"))?),
        Primitive::U64 => Value::U64(text.parse().map_err(|_| fail("ulong"))?),
        Primitive::F32 => match text.strip_prefix("NaNbox") {
            Some(hex) => Value::F32(f32::from_bits(u32::from_str_radix(hex, 16).map_err(|_| fail("float"))?)),
            None => Value::F32(parse_float(text).ok_or_else(|| fail("float"))? as f32),
        },
        Primitive::F64 => match text.strip_prefix("NaNbox") {
            Some(hex) => Value::F64(f64::from_bits(u64::from_str_radix(hex, 16).map_err(|_| fail("double"))?)),
            None => Value::F64(parse_float(text).ok_or_else(|| fail("double"))?),
        },
        Primitive::Char => {
            let mut chars = text.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Value::Char(c),
                _ => return Err(fail("char")),
            }
        }
    })
}

/// Lowercased with underscores removed, for "did you mean" suggestions.
fn loose_canonical(name: &str) -> String {
    name.chars().filter(|c| *c != '_').flat_map(char::to_lowercase).collect()
}

/// Short rendering of a value for diagnostics.
pub(crate) fn describe(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Enum(_, v) => v.clone(),
        other => crate::compose::format_scalar(other).unwrap_or_else(|| format!("{other:?}")),
    }
}
