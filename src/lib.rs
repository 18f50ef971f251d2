//! Declad – layered declarative records and shared object graphs over
//! tree-structured text.
//!
//! Two related services live here:
//!
//! * **Record loading.** Named, typed records ("decs") are declared across
//!   several modules. Later modules patch earlier definitions, records can
//!   inherit from a parent record, and abstract records exist only to be
//!   inherited from. The [`loader::Loader`] collects fragments, resolves every
//!   record identity, fills the [`database::Database`], binds static
//!   reference slots and runs per-type hooks in dependency order.
//! * **Object recording.** Arbitrary object graphs are written to and read
//!   back from a self-describing document. Objects reachable more than once
//!   are emitted once under `refs` and referenced by id; very deep chains are
//!   hoisted so neither direction recurses without bound. Types opt in through
//!   the [`recorder::Recordable`] trait or a [`convert::Converter`].
//!
//! ## Modules
//! * [`types`] – type descriptors, the registry and written type names.
//! * [`value`] – the dynamic [`value::Value`] model and its object [`value::Heap`].
//! * [`tree`] – the tree-node contract the engine reads; [`xml`] binds it to XML.
//! * [`parse`] / [`compose`] – the read and write halves of the shape engine.
//! * [`recorder`] – the bidirectional recording API and recorder documents.
//! * [`loader`] – the multi-module load state machine and hooks.
//! * [`dag`] – stable topological ordering used for hook order.
//! * [`engine`] – the entry point that owns all of the above.
//!
//! ## Diagnostics
//! Data problems never abort an operation. They are reported through
//! [`diag::Diagnostics`], which forwards to `tracing` unless another
//! [`diag::DiagnosticSink`] is installed, and counts what it saw. Only
//! failures that abandon a whole input surface as [`error::DecladError`].
//!
//! ## Quick Start
//! ```
//! use declad::{Engine, types::{ClassDef, TypeId, TypeRegistry}};
//!
//! let mut types = TypeRegistry::new();
//! let weapon = types.register_record(ClassDef::new("Weapon").field("damage", TypeId::I32)).unwrap();
//!
//! let mut engine = Engine::new(types);
//! let mut loader = engine.loader();
//! loader
//!     .create_module("core")
//!     .add_string(r#"<Decs><Weapon decName="Sword"><damage>7</damage></Weapon></Decs>"#, "weapons.xml")
//!     .unwrap();
//! loader.finish();
//!
//! let sword = engine.get(weapon, "Sword").unwrap();
//! assert_eq!(engine.field(sword, "damage").and_then(|v| v.as_i64()), Some(7));
//! ```

pub mod compose;
pub mod config;
pub mod convert;
pub mod dag;
pub mod database;
pub mod diag;
pub mod engine;
pub mod error;
pub mod loader;
pub mod parse;
pub mod recorder;
pub mod tree;
pub mod types;
pub mod value;
pub mod xml;

pub use crate::config::Settings;
pub use diag::{CollectingSink, Diagnostics, Severity};
pub use engine::Engine;
pub use error::{DecladError, Result};
pub use loader::{HookContext, LoadState, Loader};
pub use recorder::{Parameters, Recordable, Recorder};
pub use value::{Heap, ObjectId, RecordId, Value};
