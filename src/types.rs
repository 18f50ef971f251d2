//! Type registry.
//!
//! Every type the engine can read or write is described here: built-in
//! primitives, enums, structural collections interned by shape, and named
//! classes (plain composites, named records, recordables and converter-only
//! native types) whose field tables are given at registration time.
//! Written type names are resolved against this registry, never against the
//! running program.

use std::collections::HashMap;
use std::fmt;

use lazy_static::lazy_static;

use crate::value::OtherHasher;
use crate::error::{DecladError, Result, TypeError};
use crate::loader::RecordHook;
use crate::recorder::RecordableFactory;
use crate::value::Value;

// ------------- TypeId -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    pub const OBJECT: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const I8: TypeId = TypeId(2);
    pub const I16: TypeId = TypeId(3);
    pub const I32: TypeId = TypeId(4);
    pub const I64: TypeId = TypeId(5);
    pub const U8: TypeId = TypeId(6);
    pub const U16: TypeId = TypeId(7);
    pub const U32: TypeId = TypeId(8);
    pub const U64: TypeId = TypeId(9);
    pub const F32: TypeId = TypeId(10);
    pub const F64: TypeId = TypeId(11);
    pub const CHAR: TypeId = TypeId(12);
    pub const STRING: TypeId = TypeId(13);
    pub const TYPE: TypeId = TypeId(14);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    Char,
}

const BUILTINS: [(&str, TypeKind0); 15] = [
    ("object", TypeKind0::Object),
    ("bool", TypeKind0::Primitive(Primitive::Bool)),
    ("sbyte", TypeKind0::Primitive(Primitive::I8)),
    ("short", TypeKind0::Primitive(Primitive::I16)),
    ("int", TypeKind0::Primitive(Primitive::I32)),
    ("long", TypeKind0::Primitive(Primitive::I64)),
    ("byte", TypeKind0::Primitive(Primitive::U8)),
    ("ushort", TypeKind0::Primitive(Primitive::U16)),
    ("uint", TypeKind0::Primitive(Primitive::U32)),
    ("ulong", TypeKind0::Primitive(Primitive::U64)),
    ("float", TypeKind0::Primitive(Primitive::F32)),
    ("double", TypeKind0::Primitive(Primitive::F64)),
    ("char", TypeKind0::Primitive(Primitive::Char)),
    ("string", TypeKind0::String),
    ("Type", TypeKind0::Type),
];

// const-friendly mirror of the built-in kinds
#[derive(Clone, Copy)]
enum TypeKind0 {
    Object,
    Primitive(Primitive),
    String,
    Type,
}

lazy_static! {
    /// Alternate spellings accepted for built-in types once namespace
    /// resolution has found nothing.
    static ref PRIMITIVE_ALIASES: HashMap<&'static str, TypeId> = {
        let mut m = HashMap::with_capacity(40);
        m.insert("Object", TypeId::OBJECT);
        m.insert("System.Object", TypeId::OBJECT);
        m.insert("Boolean", TypeId::BOOL);
        m.insert("System.Boolean", TypeId::BOOL);
        m.insert("SByte", TypeId::I8);
        m.insert("System.SByte", TypeId::I8);
        m.insert("Int16", TypeId::I16);
        m.insert("System.Int16", TypeId::I16);
        m.insert("Int32", TypeId::I32);
        m.insert("System.Int32", TypeId::I32);
        m.insert("Int64", TypeId::I64);
        m.insert("System.Int64", TypeId::I64);
        m.insert("Byte", TypeId::U8);
        m.insert("System.Byte", TypeId::U8);
        m.insert("UInt16", TypeId::U16);
        m.insert("System.UInt16", TypeId::U16);
        m.insert("UInt32", TypeId::U32);
        m.insert("System.UInt32", TypeId::U32);
        m.insert("UInt64", TypeId::U64);
        m.insert("System.UInt64", TypeId::U64);
        m.insert("Single", TypeId::F32);
        m.insert("System.Single", TypeId::F32);
        m.insert("Double", TypeId::F64);
        m.insert("System.Double", TypeId::F64);
        m.insert("Char", TypeId::CHAR);
        m.insert("System.Char", TypeId::CHAR);
        m.insert("String", TypeId::STRING);
        m.insert("System.String", TypeId::STRING);
        m.insert("System.Type", TypeId::TYPE);
        m
    };
}

// ------------- Descriptors -------------

/// Shape of a type, which decides how the engine reads and writes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeKind {
    /// Accepts any value; only useful as a declared field type.
    Object,
    Primitive(Primitive),
    String,
    /// A type-valued field, written as a type name.
    Type,
    Enum(Vec<String>),
    List(TypeId),
    Array { element: TypeId, rank: usize },
    Map { key: TypeId, value: TypeId },
    Set(TypeId),
    Tuple(Vec<TypeId>),
    /// Plain structured object, populated field by field through its descriptors.
    Composite,
    /// Named record owned by the database.
    Record,
    /// Object driven only by its own `record` call.
    Recordable,
    /// Opaque data that only a converter knows how to read and write.
    Native,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldDefault {
    /// The declared type's zero value (null for reference types).
    Zero,
    Value(Value),
    /// A fresh empty instance of the declared type.
    New,
}

#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: TypeId,
    /// Cleared for runtime-only fields that must never appear in input.
    pub serializable: bool,
    /// Engine-owned index fields; never read from input.
    pub index: bool,
    /// Slot names for tuple-typed fields.
    pub tuple_names: Option<Vec<String>>,
    pub default: FieldDefault,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, ty: TypeId) -> Self {
        Self { name: name.into(), ty, serializable: true, index: false, tuple_names: None, default: FieldDefault::Zero }
    }
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = FieldDefault::Value(value);
        self
    }
    pub fn with_new_instance(mut self) -> Self {
        self.default = FieldDefault::New;
        self
    }
    pub fn not_serialized(mut self) -> Self {
        self.serializable = false;
        self
    }
    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }
    pub fn tuple_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tuple_names = Some(names.into_iter().map(Into::into).collect());
        self
    }
}

/// Per-record-type hooks. Each one is inherited by subtypes that do not
/// define their own.
#[derive(Clone, Default)]
pub struct RecordHooks {
    pub config_errors: Option<RecordHook>,
    pub post_load: Option<RecordHook>,
    pub setup_depends_on: Vec<TypeId>,
}

impl fmt::Debug for RecordHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordHooks")
            .field("config_errors", &self.config_errors.is_some())
            .field("post_load", &self.post_load.is_some())
            .field("setup_depends_on", &self.setup_depends_on)
            .finish()
    }
}

pub struct TypeDescriptor {
    pub name: String,
    pub kind: TypeKind,
    pub parent: Option<TypeId>,
    pub is_abstract: bool,
    /// Flattened field table: inherited fields first, then this type's own.
    pub fields: Vec<FieldDescriptor>,
    pub hooks: RecordHooks,
    pub(crate) factory: Option<RecordableFactory>,
}

impl TypeDescriptor {
    fn builtin(name: &str, kind: TypeKind) -> Self {
        Self { name: name.to_string(), kind, parent: None, is_abstract: false, fields: Vec::new(), hooks: RecordHooks::default(), factory: None }
    }
    pub fn is_class(&self) -> bool {
        matches!(self.kind, TypeKind::Composite | TypeKind::Record | TypeKind::Recordable | TypeKind::Native)
    }
    /// Types whose values have identity and may therefore be shared.
    pub fn is_reference(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Object
                | TypeKind::List(_)
                | TypeKind::Array { .. }
                | TypeKind::Map { .. }
                | TypeKind::Set(_)
                | TypeKind::Composite
                | TypeKind::Recordable
                | TypeKind::Native
        )
    }
    /// Types written as plain text.
    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, TypeKind::Primitive(_) | TypeKind::String | TypeKind::Type | TypeKind::Enum(_))
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("parent", &self.parent)
            .field("is_abstract", &self.is_abstract)
            .field("fields", &self.fields.iter().map(|d| d.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

/// Registration form for composite and record classes.
#[derive(Debug, Clone)]
pub struct ClassDef {
    name: String,
    parent: Option<TypeId>,
    is_abstract: bool,
    fields: Vec<FieldDescriptor>,
    hooks: RecordHooks,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), parent: None, is_abstract: false, fields: Vec::new(), hooks: RecordHooks::default() }
    }
    pub fn parent(mut self, parent: TypeId) -> Self {
        self.parent = Some(parent);
        self
    }
    /// Abstract classes are never instantiated.
    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }
    pub fn field(mut self, name: impl Into<String>, ty: TypeId) -> Self {
        self.fields.push(FieldDescriptor::new(name, ty));
        self
    }
    pub fn field_with(mut self, descriptor: FieldDescriptor) -> Self {
        self.fields.push(descriptor);
        self
    }
    pub fn config_errors(mut self, hook: RecordHook) -> Self {
        self.hooks.config_errors = Some(hook);
        self
    }
    pub fn post_load(mut self, hook: RecordHook) -> Self {
        self.hooks.post_load = Some(hook);
        self
    }
    /// Post-load hooks of `other` run before this type's.
    pub fn depends_on(mut self, other: TypeId) -> Self {
        self.hooks.setup_depends_on.push(other);
        self
    }
}

/// A class whose slots are filled with the record of the same name once
/// every record is registered.
#[derive(Debug, Clone)]
pub struct StaticClass {
    pub name: String,
    pub slots: Vec<(String, TypeId)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Shape {
    List(TypeId),
    Array(TypeId, usize),
    Map(TypeId, TypeId),
    Set(TypeId),
    Tuple(Vec<TypeId>),
}

// ------------- TypeRegistry -------------
#[derive(Debug)]
pub struct TypeRegistry {
    types: Vec<TypeDescriptor>,
    by_name: HashMap<String, TypeId, OtherHasher>,
    shapes: HashMap<Shape, TypeId, OtherHasher>,
    statics: Vec<StaticClass>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            types: Vec::new(),
            by_name: HashMap::default(),
            shapes: HashMap::default(),
            statics: Vec::new(),
        };
        for (name, kind) in BUILTINS {
            let kind = match kind {
                TypeKind0::Object => TypeKind::Object,
                TypeKind0::Primitive(p) => TypeKind::Primitive(p),
                TypeKind0::String => TypeKind::String,
                TypeKind0::Type => TypeKind::Type,
            };
            registry.push(TypeDescriptor::builtin(name, kind));
        }
        registry
    }

    fn push(&mut self, descriptor: TypeDescriptor) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.by_name.insert(descriptor.name.clone(), id);
        self.types.push(descriptor);
        id
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains(['<', '>', '[', ']', '(', ')', ',', ' ']) {
            return Err(DecladError::Config(format!("`{name}` is not a valid type name")));
        }
        if self.by_name.contains_key(name) {
            return Err(DecladError::Config(format!("type `{name}` is already registered")));
        }
        Ok(())
    }

    fn check_parent(&self, name: &str, parent: Option<TypeId>, kind: &TypeKind) -> Result<()> {
        if let Some(parent) = parent {
            let parent_kind = &self.get(parent).kind;
            if parent_kind != kind {
                return Err(DecladError::Config(format!(
                    "`{name}` cannot derive from `{}`: parent is a {:?}, child is a {:?}",
                    self.name(parent),
                    parent_kind,
                    kind
                )));
            }
        }
        Ok(())
    }

    pub fn register_enum<I, S>(&mut self, name: &str, variants: I) -> Result<TypeId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.check_name(name)?;
        let variants: Vec<String> = variants.into_iter().map(Into::into).collect();
        Ok(self.push(TypeDescriptor::builtin(name, TypeKind::Enum(variants))))
    }

    fn register_class(&mut self, def: ClassDef, kind: TypeKind) -> Result<TypeId> {
        self.check_name(&def.name)?;
        self.check_parent(&def.name, def.parent, &kind)?;
        let mut fields: Vec<FieldDescriptor> = match def.parent {
            Some(parent) => self.get(parent).fields.clone(),
            None => Vec::new(),
        };
        for field in def.fields {
            match fields.iter_mut().find(|f| f.name == field.name) {
                Some(existing) => *existing = field,
                None => fields.push(field),
            }
        }
        Ok(self.push(TypeDescriptor {
            name: def.name,
            kind,
            parent: def.parent,
            is_abstract: def.is_abstract,
            fields,
            hooks: def.hooks,
            factory: None,
        }))
    }

    /// Registers a plain structured class.
    pub fn register_composite(&mut self, def: ClassDef) -> Result<TypeId> {
        self.register_class(def, TypeKind::Composite)
    }

    /// Registers a named-record class. A record class without a parent is
    /// the root type that scopes record names.
    pub fn register_record(&mut self, def: ClassDef) -> Result<TypeId> {
        self.register_class(def, TypeKind::Record)
    }

    /// Registers a class driven by its own `record` call. The factory builds
    /// the default instance.
    pub fn register_recordable(&mut self, name: &str, parent: Option<TypeId>, factory: RecordableFactory) -> Result<TypeId> {
        let mut def = ClassDef::new(name);
        def.parent = parent;
        let id = self.register_class(def, TypeKind::Recordable)?;
        self.types[id.index()].factory = Some(factory);
        Ok(id)
    }

    /// Registers a type only a converter can handle.
    pub fn register_native(&mut self, name: &str) -> Result<TypeId> {
        self.check_name(name)?;
        Ok(self.push(TypeDescriptor::builtin(name, TypeKind::Native)))
    }

    pub fn register_static_class(&mut self, name: &str, slots: &[(&str, TypeId)]) {
        self.statics.push(StaticClass {
            name: name.to_string(),
            slots: slots.iter().map(|(n, t)| (n.to_string(), *t)).collect(),
        });
    }

    pub fn static_classes(&self) -> &[StaticClass] {
        &self.statics
    }

    fn intern(&mut self, shape: Shape, kind: TypeKind) -> TypeId {
        if let Some(id) = self.shapes.get(&shape) {
            return *id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDescriptor::builtin("", kind));
        let name = self.compose_name(id, &[]);
        self.types[id.index()].name = name.clone();
        self.by_name.insert(name, id);
        self.shapes.insert(shape, id);
        id
    }

    pub fn list_of(&mut self, element: TypeId) -> TypeId {
        self.intern(Shape::List(element), TypeKind::List(element))
    }

    pub fn array_of(&mut self, element: TypeId, rank: usize) -> TypeId {
        let rank = rank.max(1);
        self.intern(Shape::Array(element, rank), TypeKind::Array { element, rank })
    }

    pub fn map_of(&mut self, key: TypeId, value: TypeId) -> TypeId {
        self.intern(Shape::Map(key, value), TypeKind::Map { key, value })
    }

    pub fn set_of(&mut self, element: TypeId) -> TypeId {
        self.intern(Shape::Set(element), TypeKind::Set(element))
    }

    pub fn tuple_of(&mut self, elements: &[TypeId]) -> TypeId {
        self.intern(Shape::Tuple(elements.to_vec()), TypeKind::Tuple(elements.to_vec()))
    }

    // ------------- Queries -------------

    pub fn get(&self, id: TypeId) -> &TypeDescriptor {
        // ids are only minted by this registry
        &self.types[id.index()]
    }

    pub fn try_get(&self, id: TypeId) -> Option<&TypeDescriptor> {
        self.types.get(id.index())
    }

    pub fn name(&self, id: TypeId) -> &str {
        self.try_get(id).map(|d| d.name.as_str()).unwrap_or("<unregistered>")
    }

    pub fn kind(&self, id: TypeId) -> &TypeKind {
        &self.get(id).kind
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &TypeDescriptor)> {
        self.types.iter().enumerate().map(|(i, d)| (TypeId(i as u32), d))
    }

    /// Looks up a field by name, returning its slot index.
    pub fn field(&self, ty: TypeId, name: &str) -> Option<(usize, &FieldDescriptor)> {
        self.get(ty).fields.iter().enumerate().find(|(_, f)| f.name == name)
    }

    /// `candidate` values may be stored where `target` is declared.
    pub fn is_assignable(&self, target: TypeId, candidate: TypeId) -> bool {
        if target == candidate || target == TypeId::OBJECT {
            return true;
        }
        let mut current = self.get(candidate).parent;
        while let Some(parent) = current {
            if parent == target {
                return true;
            }
            current = self.get(parent).parent;
        }
        false
    }

    /// The parentless record class that scopes names for `ty`.
    pub fn root_record_type(&self, ty: TypeId) -> Option<TypeId> {
        if self.get(ty).kind != TypeKind::Record {
            return None;
        }
        let mut current = ty;
        while let Some(parent) = self.get(current).parent {
            current = parent;
        }
        Some(current)
    }

    pub fn is_record(&self, ty: TypeId) -> bool {
        self.get(ty).kind == TypeKind::Record
    }

    /// Nearest hook of the given kind, walking up the parent chain.
    pub fn inherited_hook(&self, ty: TypeId, pick: impl Fn(&RecordHooks) -> Option<&RecordHook>) -> Option<&RecordHook> {
        let mut current = Some(ty);
        while let Some(id) = current {
            let descriptor = self.get(id);
            if let Some(hook) = pick(&descriptor.hooks) {
                return Some(hook);
            }
            current = descriptor.parent;
        }
        None
    }

    /// Zero value of a type. Reference types zero to `Null`.
    pub fn default_value(&self, ty: TypeId) -> Value {
        match &self.get(ty).kind {
            TypeKind::Primitive(p) => match p {
                Primitive::Bool => Value::Bool(false),
                Primitive::I8 => Value::I8(0),
                Primitive::I16 => Value::I16(0),
                Primitive::I32 => Value::I32(0),
                Primitive::I64 => Value::I64(0),
                Primitive::U8 => Value::U8(0),
                Primitive::U16 => Value::U16(0),
                Primitive::U32 => Value::U32(0),
                Primitive::U64 => Value::U64(0),
                Primitive::F32 => Value::F32(0.0),
                Primitive::F64 => Value::F64(0.0),
                Primitive::Char => Value::Char('\0'),
            },
            TypeKind::Enum(variants) => match variants.first() {
                Some(first) => Value::Enum(ty, first.clone()),
                None => Value::Null,
            },
            TypeKind::Tuple(elements) => Value::Tuple(ty, elements.iter().map(|e| self.default_value(*e)).collect()),
            _ => Value::Null,
        }
    }

    // ------------- Name resolution -------------

    /// Resolves a written type name. The bare name and every namespace
    /// prefix are tried; more than one hit is ambiguous. Built-in aliases are
    /// consulted only when nothing else matched.
    pub fn resolve(&self, name: &str, namespaces: &[String]) -> std::result::Result<TypeId, TypeError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TypeError::Malformed(name.to_string()));
        }
        if name.contains(['<', '[', '(']) {
            let mut parser = TypeNameParser { registry: self, namespaces, text: name, pos: 0 };
            let id = parser.parse_type()?;
            parser.skip_ws();
            if parser.pos != name.len() {
                return Err(TypeError::Malformed(name.to_string()));
            }
            return Ok(id);
        }
        self.resolve_simple(name, namespaces)
    }

    fn resolve_simple(&self, name: &str, namespaces: &[String]) -> std::result::Result<TypeId, TypeError> {
        let mut candidates: Vec<TypeId> = Vec::new();
        if let Some(id) = self.by_name.get(name) {
            candidates.push(*id);
        }
        for namespace in namespaces {
            if let Some(id) = self.by_name.get(&format!("{namespace}.{name}")) {
                if !candidates.contains(id) {
                    candidates.push(*id);
                }
            }
        }
        match candidates.len() {
            0 => PRIMITIVE_ALIASES.get(name).copied().ok_or_else(|| TypeError::Unknown(name.to_string())),
            1 => Ok(candidates[0]),
            _ => Err(TypeError::Ambiguous {
                name: name.to_string(),
                candidates: candidates.iter().map(|c| self.name(*c)).collect::<Vec<_>>().join(", "),
                first: candidates[0],
            }),
        }
    }

    /// The shortest written form of a type given the namespace search path.
    pub fn compose_name(&self, id: TypeId, namespaces: &[String]) -> String {
        let descriptor = self.get(id);
        match &descriptor.kind {
            TypeKind::List(e) => format!("List<{}>", self.compose_name(*e, namespaces)),
            TypeKind::Set(e) => format!("HashSet<{}>", self.compose_name(*e, namespaces)),
            TypeKind::Map { key, value } => {
                format!("Dictionary<{}, {}>", self.compose_name(*key, namespaces), self.compose_name(*value, namespaces))
            }
            TypeKind::Array { element, rank } => {
                format!("{}[{}]", self.compose_name(*element, namespaces), ",".repeat(rank - 1))
            }
            TypeKind::Tuple(elements) => {
                let parts: Vec<String> = elements.iter().map(|e| self.compose_name(*e, namespaces)).collect();
                format!("({})", parts.join(", "))
            }
            _ => {
                let best = namespaces
                    .iter()
                    .filter_map(|ns| descriptor.name.strip_prefix(ns.as_str()).and_then(|rest| rest.strip_prefix('.')))
                    .min_by_key(|rest| rest.len());
                best.unwrap_or(&descriptor.name).to_string()
            }
        }
    }
}

// Small recursive-descent reader for generic, array and tuple type syntax.
struct TypeNameParser<'a> {
    registry: &'a TypeRegistry,
    namespaces: &'a [String],
    text: &'a str,
    pos: usize,
}

impl TypeNameParser<'_> {
    fn malformed(&self) -> TypeError {
        TypeError::Malformed(self.text.to_string())
    }

    fn skip_ws(&mut self) {
        while self.text[self.pos..].starts_with(' ') {
            self.pos += 1;
        }
    }

    fn eat(&mut self, c: char) -> bool {
        self.skip_ws();
        if self.text[self.pos..].starts_with(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn identifier(&mut self) -> &str {
        self.skip_ws();
        let start = self.pos;
        let rest = &self.text[start..];
        let len = rest.find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.')).unwrap_or(rest.len());
        self.pos += len;
        &self.text[start..start + len]
    }

    fn arguments(&mut self, close: char) -> std::result::Result<Vec<TypeId>, TypeError> {
        let mut arguments = vec![self.parse_type()?];
        while self.eat(',') {
            arguments.push(self.parse_type()?);
        }
        if !self.eat(close) {
            return Err(self.malformed());
        }
        Ok(arguments)
    }

    fn shape(&self, shape: Shape) -> std::result::Result<TypeId, TypeError> {
        self.registry.shapes.get(&shape).copied().ok_or_else(|| TypeError::Unknown(self.text.to_string()))
    }

    fn parse_type(&mut self) -> std::result::Result<TypeId, TypeError> {
        let mut id = if self.eat('(') {
            let elements = self.arguments(')')?;
            self.shape(Shape::Tuple(elements))?
        } else {
            let head = self.identifier().to_string();
            if head.is_empty() {
                return Err(self.malformed());
            }
            if self.eat('<') {
                let arguments = self.arguments('>')?;
                let short = head.rsplit('.').next().unwrap_or(&head);
                match (short, arguments.as_slice()) {
                    ("List", [e]) => self.shape(Shape::List(*e))?,
                    ("HashSet", [e]) => self.shape(Shape::Set(*e))?,
                    ("Dictionary", [k, v]) => self.shape(Shape::Map(*k, *v))?,
                    ("Tuple" | "ValueTuple", _) => self.shape(Shape::Tuple(arguments.clone()))?,
                    _ => return Err(TypeError::Unknown(self.text.to_string())),
                }
            } else {
                self.registry.resolve_simple(&head, self.namespaces)?
            }
        };
        while self.eat('[') {
            let mut rank = 1;
            while self.eat(',') {
                rank += 1;
            }
            if !self.eat(']') {
                return Err(self.malformed());
            }
            id = self.shape(Shape::Array(id, rank))?;
        }
        Ok(id)
    }
}
