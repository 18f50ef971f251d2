use std::path::Path;

use ::config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::Result;

/// Engine-wide tunables. Anything missing from the sources falls back to
/// [`Settings::default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Namespace prefixes tried, in order, when resolving a written type name.
    pub using_namespaces: Vec<String>,
    /// Nesting depth after which unshared objects are hoisted into the refs block.
    pub reference_depth: usize,
    /// How far below `reference_depth` a scan may descend without finding a
    /// hoistable object before the graph is declared not shareable enough.
    pub reference_depth_overrun: usize,
    /// Direct write recursion allowed before a write is deferred to the worklist.
    pub max_write_depth: usize,
    /// Nested elements read directly before an object's contents are
    /// postponed to the read worklist.
    pub max_read_depth: usize,
    /// Indent generated documents.
    pub pretty: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            using_namespaces: Vec::new(),
            reference_depth: 20,
            reference_depth_overrun: 100,
            max_write_depth: 100,
            max_read_depth: 50,
            pretty: true,
        }
    }
}

impl Settings {
    /// Layers an optional settings file and `DECLAD_*` environment variables
    /// over the defaults. A missing file is not an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let built = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Self::environment())
            .build()?;
        Ok(built.try_deserialize()?)
    }

    /// Reads settings from an in-memory TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        let built = Config::builder().add_source(File::from_str(text, FileFormat::Toml)).build()?;
        Ok(built.try_deserialize()?)
    }

    fn environment() -> Environment {
        Environment::with_prefix("DECLAD")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("using_namespaces")
    }

    pub fn with_namespaces<I, S>(mut self, namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.using_namespaces = namespaces.into_iter().map(Into::into).collect();
        self
    }
}
