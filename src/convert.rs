//! Converters: per-type transcoders that replace field-by-field handling.
//!
//! A converter owns the in-memory representation of the types it claims,
//! which live in the heap as native payloads. Three shapes exist and the
//! engine picks the path from the shape alone:
//!
//! * [`StringConverter`] turns a leaf's text into a value and back.
//! * [`RecordConverter`] drives one symmetric `record` call over a value the
//!   engine default-constructs through [`RecordConverter::create`].
//! * [`FactoryConverter`] needs data to construct the value at all, so its
//!   `create` step reads through a recorder that refuses shared references.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::recorder::Recorder;
use crate::types::TypeId;
use crate::value::{NativeBox, OtherHasher};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ConvertError(pub String);

impl ConvertError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type ConvertResult<T> = std::result::Result<T, ConvertError>;

pub trait StringConverter: Send + Sync {
    fn read(&self, text: &str, ty: TypeId) -> ConvertResult<NativeBox>;
    fn write(&self, value: &dyn Any, ty: TypeId) -> ConvertResult<String>;
}

pub trait RecordConverter: Send + Sync {
    /// Default instance the engine hands to `record` when reading.
    fn create(&self, ty: TypeId) -> NativeBox;
    fn record(&self, value: &mut dyn Any, ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<()>;
}

pub trait FactoryConverter: Send + Sync {
    fn create(&self, ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<NativeBox>;
    fn read(&self, value: &mut dyn Any, ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<()>;
    fn write(&self, value: &dyn Any, ty: TypeId, recorder: &mut Recorder<'_, '_>) -> ConvertResult<()>;
}

#[derive(Clone)]
pub enum Converter {
    String(Arc<dyn StringConverter>),
    Record(Arc<dyn RecordConverter>),
    Factory(Arc<dyn FactoryConverter>),
}

impl Converter {
    pub fn string(converter: impl StringConverter + 'static) -> Self {
        Converter::String(Arc::new(converter))
    }
    pub fn record(converter: impl RecordConverter + 'static) -> Self {
        Converter::Record(Arc::new(converter))
    }
    pub fn factory(converter: impl FactoryConverter + 'static) -> Self {
        Converter::Factory(Arc::new(converter))
    }
    fn shape(&self) -> &'static str {
        match self {
            Converter::String(_) => "string",
            Converter::Record(_) => "record",
            Converter::Factory(_) => "factory",
        }
    }
}

impl std::fmt::Debug for Converter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Converter({})", self.shape())
    }
}

/// Outcome of a registration: which of the requested types were already
/// claimed and therefore kept their earlier converter.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Registration {
    pub claimed: Vec<TypeId>,
    pub rejected: Vec<TypeId>,
}

#[derive(Debug, Default)]
pub struct ConverterRegistry {
    by_type: HashMap<TypeId, Converter, OtherHasher>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `types` for `converter`. The first registrant for a type wins.
    pub fn register(&mut self, types: &[TypeId], converter: Converter) -> Registration {
        let mut outcome = Registration::default();
        for ty in types {
            if self.by_type.contains_key(ty) {
                outcome.rejected.push(*ty);
            } else {
                self.by_type.insert(*ty, converter.clone());
                outcome.claimed.push(*ty);
            }
        }
        outcome
    }

    /// Converter for exactly this type; subtypes are not covered.
    pub fn get(&self, ty: TypeId) -> Option<&Converter> {
        self.by_type.get(&ty)
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_type.clear();
    }
}
