//! Dynamic values and the object arena.
//!
//! Values that have identity (collections, composites, recordables, native
//! data) live in a [`Heap`] and are referred to by [`ObjectId`]. Sharing and
//! cycles are therefore plain index equality; the engine never needs pointers
//! into the graph.

use core::hash::BuildHasherDefault;
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use indexmap::{IndexMap, IndexSet};
use seahash::SeaHasher;

use crate::recorder::Recordable;
use crate::types::{TypeId, TypeKind, TypeRegistry, FieldDefault};

// we will use a fast hashing algo for all internal maps and sets
pub type OtherHasher = BuildHasherDefault<SeaHasher>;

pub type ValueMap = IndexMap<Value, Value, OtherHasher>;
pub type ValueSet = IndexSet<Value, OtherHasher>;

// ------------- Identities -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index as u32)
    }
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

/// Identity of a record inside the database's own heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(pub(crate) ObjectId);

impl RecordId {
    pub fn object(self) -> ObjectId {
        self.0
    }
}

// ------------- Value -------------
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Char(char),
    Str(String),
    Enum(TypeId, String),
    Type(TypeId),
    /// Link to a named record in the database.
    Record(RecordId),
    Tuple(TypeId, Vec<Value>),
    Object(ObjectId),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<RecordId> {
        match self {
            Value::Record(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I8(v) => Some(v as i64),
            Value::I16(v) => Some(v as i64),
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::U8(v) => Some(v as i64),
            Value::U16(v) => Some(v as i64),
            Value::U32(v) => Some(v as i64),
            Value::U64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => self.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Type of the value itself. Records are resolved by the database and
    /// `Null` has none.
    pub fn runtime_type(&self, heap: &Heap) -> Option<TypeId> {
        Some(match self {
            Value::Null | Value::Record(_) => return None,
            Value::Bool(_) => TypeId::BOOL,
            Value::I8(_) => TypeId::I8,
            Value::I16(_) => TypeId::I16,
            Value::I32(_) => TypeId::I32,
            Value::I64(_) => TypeId::I64,
            Value::U8(_) => TypeId::U8,
            Value::U16(_) => TypeId::U16,
            Value::U32(_) => TypeId::U32,
            Value::U64(_) => TypeId::U64,
            Value::F32(_) => TypeId::F32,
            Value::F64(_) => TypeId::F64,
            Value::Char(_) => TypeId::CHAR,
            Value::Str(_) => TypeId::STRING,
            // a type value is a plain type, whichever type it names
            Value::Type(_) => TypeId::TYPE,
            Value::Enum(ty, _) | Value::Tuple(ty, _) => *ty,
            Value::Object(id) => return heap.ty(*id),
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (I8(a), I8(b)) => a == b,
            (I16(a), I16(b)) => a == b,
            (I32(a), I32(b)) => a == b,
            (I64(a), I64(b)) => a == b,
            (U8(a), U8(b)) => a == b,
            (U16(a), U16(b)) => a == b,
            (U32(a), U32(b)) => a == b,
            (U64(a), U64(b)) => a == b,
            // bitwise, so NaN keys behave and -0.0 stays distinct
            (F32(a), F32(b)) => a.to_bits() == b.to_bits(),
            (F64(a), F64(b)) => a.to_bits() == b.to_bits(),
            (Char(a), Char(b)) => a == b,
            (Str(a), Str(b)) => a == b,
            (Enum(ta, a), Enum(tb, b)) => ta == tb && a == b,
            (Type(a), Type(b)) => a == b,
            (Record(a), Record(b)) => a == b,
            (Tuple(ta, a), Tuple(tb, b)) => ta == tb && a == b,
            (Object(a), Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::I8(v) => v.hash(state),
            Value::I16(v) => v.hash(state),
            Value::I32(v) => v.hash(state),
            Value::I64(v) => v.hash(state),
            Value::U8(v) => v.hash(state),
            Value::U16(v) => v.hash(state),
            Value::U32(v) => v.hash(state),
            Value::U64(v) => v.hash(state),
            Value::F32(v) => v.to_bits().hash(state),
            Value::F64(v) => v.to_bits().hash(state),
            Value::Char(v) => v.hash(state),
            Value::Str(v) => v.hash(state),
            Value::Enum(t, v) => {
                t.hash(state);
                v.hash(state)
            }
            Value::Type(t) => t.hash(state),
            Value::Record(r) => r.hash(state),
            Value::Tuple(t, v) => {
                t.hash(state);
                v.hash(state)
            }
            Value::Object(o) => o.hash(state),
        }
    }
}

// ------------- Heap -------------

pub type NativeBox = Box<dyn Any + Send + Sync>;

pub enum ObjectData {
    /// Composite or record fields, aligned with the type's field table.
    Fields(Vec<Value>),
    List(Vec<Value>),
    /// Row-major storage with one length per dimension.
    Array { lengths: Vec<usize>, items: Vec<Value> },
    Map(ValueMap),
    Set(ValueSet),
    Recordable(Box<dyn Recordable>),
    Native(NativeBox),
    /// Placeholder while the data is checked out for a `record` call.
    Taken,
}

impl fmt::Debug for ObjectData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectData::Fields(v) => f.debug_tuple("Fields").field(v).finish(),
            ObjectData::List(v) => f.debug_tuple("List").field(v).finish(),
            ObjectData::Array { lengths, items } => f.debug_struct("Array").field("lengths", lengths).field("items", items).finish(),
            ObjectData::Map(m) => f.debug_tuple("Map").field(m).finish(),
            ObjectData::Set(s) => f.debug_tuple("Set").field(s).finish(),
            ObjectData::Recordable(r) => f.debug_tuple("Recordable").field(r).finish(),
            ObjectData::Native(_) => f.write_str("Native(..)"),
            ObjectData::Taken => f.write_str("Taken"),
        }
    }
}

#[derive(Debug)]
pub struct Object {
    pub ty: TypeId,
    pub data: ObjectData,
}

/// Arena owning every identity-bearing value of one object graph.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn alloc(&mut self, ty: TypeId, data: ObjectData) -> ObjectId {
        let id = ObjectId::new(self.objects.len());
        self.objects.push(Object { ty, data });
        id
    }

    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.index())
    }

    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.index())
    }

    pub fn ty(&self, id: ObjectId) -> Option<TypeId> {
        self.get(id).map(|o| o.ty)
    }

    pub fn data(&self, id: ObjectId) -> Option<&ObjectData> {
        self.get(id).map(|o| &o.data)
    }

    pub fn data_mut(&mut self, id: ObjectId) -> Option<&mut ObjectData> {
        self.get_mut(id).map(|o| &mut o.data)
    }

    /// Checks out a recordable payload. Other payloads stay where they are.
    pub(crate) fn take_recordable(&mut self, id: ObjectId) -> Option<Box<dyn Recordable>> {
        let slot = self.data_mut(id)?;
        if !matches!(slot, ObjectData::Recordable(_)) {
            return None;
        }
        match std::mem::replace(slot, ObjectData::Taken) {
            ObjectData::Recordable(r) => Some(r),
            _ => None,
        }
    }

    /// Checks out a converter payload. Other payloads stay where they are.
    pub(crate) fn take_native(&mut self, id: ObjectId) -> Option<NativeBox> {
        let slot = self.data_mut(id)?;
        if !matches!(slot, ObjectData::Native(_)) {
            return None;
        }
        match std::mem::replace(slot, ObjectData::Taken) {
            ObjectData::Native(n) => Some(n),
            _ => None,
        }
    }

    pub(crate) fn restore(&mut self, id: ObjectId, data: ObjectData) {
        if let Some(slot) = self.data_mut(id) {
            *slot = data;
        }
    }

    // ------------- Typed views -------------

    pub fn fields(&self, id: ObjectId) -> Option<&[Value]> {
        match self.data(id)? {
            ObjectData::Fields(v) => Some(v),
            _ => None,
        }
    }

    pub fn fields_mut(&mut self, id: ObjectId) -> Option<&mut Vec<Value>> {
        match self.data_mut(id)? {
            ObjectData::Fields(v) => Some(v),
            _ => None,
        }
    }

    /// Field by name, through the object's field table.
    pub fn field(&self, types: &TypeRegistry, id: ObjectId, name: &str) -> Option<&Value> {
        let (slot, _) = types.field(self.ty(id)?, name)?;
        self.fields(id)?.get(slot)
    }

    pub fn set_field(&mut self, types: &TypeRegistry, id: ObjectId, name: &str, value: Value) -> bool {
        let Some(ty) = self.ty(id) else { return false };
        let Some((slot, _)) = types.field(ty, name) else { return false };
        match self.fields_mut(id).and_then(|f| f.get_mut(slot)) {
            Some(target) => {
                *target = value;
                true
            }
            None => false,
        }
    }

    pub fn list(&self, id: ObjectId) -> Option<&[Value]> {
        match self.data(id)? {
            ObjectData::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn list_mut(&mut self, id: ObjectId) -> Option<&mut Vec<Value>> {
        match self.data_mut(id)? {
            ObjectData::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn array(&self, id: ObjectId) -> Option<(&[usize], &[Value])> {
        match self.data(id)? {
            ObjectData::Array { lengths, items } => Some((lengths, items)),
            _ => None,
        }
    }

    pub fn map(&self, id: ObjectId) -> Option<&ValueMap> {
        match self.data(id)? {
            ObjectData::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn map_mut(&mut self, id: ObjectId) -> Option<&mut ValueMap> {
        match self.data_mut(id)? {
            ObjectData::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn set(&self, id: ObjectId) -> Option<&ValueSet> {
        match self.data(id)? {
            ObjectData::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn set_mut(&mut self, id: ObjectId) -> Option<&mut ValueSet> {
        match self.data_mut(id)? {
            ObjectData::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn native<T: Any>(&self, id: ObjectId) -> Option<&T> {
        match self.data(id)? {
            ObjectData::Native(b) => b.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn recordable<T: Recordable>(&self, id: ObjectId) -> Option<&T> {
        match self.data(id)? {
            ObjectData::Recordable(r) => {
                let any: &dyn Any = &**r;
                any.downcast_ref::<T>()
            }
            _ => None,
        }
    }

    pub fn recordable_mut<T: Recordable>(&mut self, id: ObjectId) -> Option<&mut T> {
        match self.data_mut(id)? {
            ObjectData::Recordable(r) => {
                let any: &mut dyn Any = &mut **r;
                any.downcast_mut::<T>()
            }
            _ => None,
        }
    }

    // ------------- Construction -------------

    /// Default-constructs an instance of `ty`. Returns `None` for abstract
    /// classes, value types and converter-only types.
    pub fn instantiate(&mut self, types: &TypeRegistry, ty: TypeId) -> Option<ObjectId> {
        let descriptor = types.get(ty);
        if descriptor.is_abstract {
            return None;
        }
        let data = match &descriptor.kind {
            TypeKind::List(_) => ObjectData::List(Vec::new()),
            TypeKind::Array { rank, .. } => ObjectData::Array { lengths: vec![0; *rank], items: Vec::new() },
            TypeKind::Map { .. } => ObjectData::Map(ValueMap::default()),
            TypeKind::Set(_) => ObjectData::Set(ValueSet::default()),
            TypeKind::Recordable => ObjectData::Recordable((descriptor.factory.as_ref()?)()),
            TypeKind::Composite | TypeKind::Record => {
                let id = self.alloc(ty, ObjectData::Fields(Vec::new()));
                let mut fields = Vec::with_capacity(descriptor.fields.len());
                for field in &descriptor.fields {
                    fields.push(match &field.default {
                        FieldDefault::Zero => types.default_value(field.ty),
                        FieldDefault::Value(v) => v.clone(),
                        FieldDefault::New => match self.instantiate(types, field.ty) {
                            Some(child) => Value::Object(child),
                            None => types.default_value(field.ty),
                        },
                    });
                }
                self.restore(id, ObjectData::Fields(fields));
                return Some(id);
            }
            _ => return None,
        };
        Some(self.alloc(ty, data))
    }

    /// Allocates a list holding `items`.
    pub fn new_list(&mut self, types: &mut TypeRegistry, element: TypeId, items: Vec<Value>) -> ObjectId {
        let ty = types.list_of(element);
        self.alloc(ty, ObjectData::List(items))
    }

    /// Structural comparison of two graphs, following object links and
    /// ignoring identity. Recordable and native payloads are opaque and only
    /// compare equal to themselves.
    pub fn graph_eq(&self, a: &Value, other: &Heap, b: &Value) -> bool {
        let mut visited = HashSet::new();
        self.graph_eq_inner(a, other, b, &mut visited)
    }

    fn graph_eq_inner(&self, a: &Value, other: &Heap, b: &Value, visited: &mut HashSet<(ObjectId, ObjectId)>) -> bool {
        match (a, b) {
            (Value::Object(x), Value::Object(y)) => {
                if !visited.insert((*x, *y)) {
                    return true;
                }
                let (Some(ox), Some(oy)) = (self.get(*x), other.get(*y)) else { return false };
                if ox.ty != oy.ty {
                    return false;
                }
                let pairs_eq = |l: &[Value], r: &[Value], visited: &mut HashSet<(ObjectId, ObjectId)>| {
                    l.len() == r.len() && l.iter().zip(r).all(|(p, q)| self.graph_eq_inner(p, other, q, visited))
                };
                match (&ox.data, &oy.data) {
                    (ObjectData::Fields(l), ObjectData::Fields(r)) | (ObjectData::List(l), ObjectData::List(r)) => pairs_eq(l, r, visited),
                    (ObjectData::Array { lengths: la, items: l }, ObjectData::Array { lengths: lb, items: r }) => {
                        la == lb && pairs_eq(l, r, visited)
                    }
                    (ObjectData::Map(l), ObjectData::Map(r)) => {
                        l.len() == r.len()
                            && l.iter().zip(r.iter()).all(|((lk, lv), (rk, rv))| {
                                self.graph_eq_inner(lk, other, rk, visited) && self.graph_eq_inner(lv, other, rv, visited)
                            })
                    }
                    (ObjectData::Set(l), ObjectData::Set(r)) => {
                        l.len() == r.len() && l.iter().zip(r.iter()).all(|(p, q)| self.graph_eq_inner(p, other, q, visited))
                    }
                    _ => std::ptr::eq(self, other) && x == y,
                }
            }
            (Value::Tuple(ta, l), Value::Tuple(tb, r)) => {
                ta == tb && l.len() == r.len() && l.iter().zip(r).all(|(p, q)| self.graph_eq_inner(p, other, q, visited))
            }
            _ => a == b,
        }
    }
}

// ------------- Scalars -------------

/// Rust scalars that map one-to-one onto a built-in type.
pub trait RecordScalar: Sized {
    const TYPE: TypeId;
    fn to_value(&self) -> Value;
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! record_scalar {
    ($t:ty, $id:expr, $variant:ident) => {
        impl RecordScalar for $t {
            const TYPE: TypeId = $id;
            fn to_value(&self) -> Value {
                Value::$variant(self.clone())
            }
            fn from_value(value: &Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v.clone()),
                    _ => None,
                }
            }
        }
    };
}

record_scalar!(bool, TypeId::BOOL, Bool);
record_scalar!(i8, TypeId::I8, I8);
record_scalar!(i16, TypeId::I16, I16);
record_scalar!(i32, TypeId::I32, I32);
record_scalar!(i64, TypeId::I64, I64);
record_scalar!(u8, TypeId::U8, U8);
record_scalar!(u16, TypeId::U16, U16);
record_scalar!(u32, TypeId::U32, U32);
record_scalar!(u64, TypeId::U64, U64);
record_scalar!(f32, TypeId::F32, F32);
record_scalar!(f64, TypeId::F64, F64);
record_scalar!(char, TypeId::CHAR, Char);
record_scalar!(String, TypeId::STRING, Str);
