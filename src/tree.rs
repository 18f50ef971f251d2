//! The tree-node contract the engine reads from, plus an owned tree that
//! implements it.
//!
//! The engine never looks at raw text. Anything hierarchical that can expose a
//! name, optional text, string attributes and ordered children can feed it;
//! the XML binding in [`crate::xml`] is one such source.

use std::fmt;

/// Tag used for anonymous entries of ordered collections, sets and map entries.
pub const LIST_ITEM: &str = "li";
pub const MAP_KEY: &str = "key";
pub const MAP_VALUE: &str = "value";

/// Read access to one node of a hierarchical document.
pub trait TreeNode {
    fn name(&self) -> &str;
    /// Text content, if any. Whitespace-only runs between children do not count.
    fn text(&self) -> Option<&str>;
    fn attribute(&self, key: &str) -> Option<&str>;
    fn attribute_names(&self) -> Vec<&str>;
    fn children(&self) -> Vec<&dyn TreeNode>;
    /// Source line, when the format knows it.
    fn line(&self) -> Option<usize>;

    fn has_text(&self) -> bool {
        self.text().is_some()
    }

    fn has_children(&self) -> bool {
        !self.children().is_empty()
    }

    fn child_named(&self, name: &str) -> Option<&dyn TreeNode> {
        self.children().into_iter().find(|c| c.name() == name)
    }

    /// Attribute names outside `recognized`, in document order.
    fn unrecognized_attribute_names(&self, recognized: &[&str]) -> Vec<&str> {
        self.attribute_names().into_iter().filter(|a| !recognized.contains(a)).collect()
    }

    /// Children of an ordered collection. Every child should be an `li`.
    fn list_items(&self) -> Vec<ListItem<'_>> {
        self.children()
            .into_iter()
            .map(|c| if c.name() == LIST_ITEM { ListItem::Item(c) } else { ListItem::Misnamed(c) })
            .collect()
    }

    /// Entries of an associative map: either `li` with `key`/`value` children,
    /// or a child whose tag name is the key.
    fn map_entries(&self) -> Vec<MapEntry<'_>> {
        self.children()
            .into_iter()
            .map(|c| {
                if c.name() == LIST_ITEM {
                    MapEntry::Explicit { entry: c, key: c.child_named(MAP_KEY), value: c.child_named(MAP_VALUE) }
                } else {
                    MapEntry::Inline { key: c.name(), value: c }
                }
            })
            .collect()
    }

    /// Entries of a set: `li` nodes holding the element, or a bare tag whose
    /// name is the element.
    fn set_entries(&self) -> Vec<SetEntry<'_>> {
        self.children()
            .into_iter()
            .map(|c| if c.name() == LIST_ITEM { SetEntry::Item(c) } else { SetEntry::Inline { key: c.name(), node: c } })
            .collect()
    }
}

pub enum ListItem<'a> {
    Item(&'a dyn TreeNode),
    Misnamed(&'a dyn TreeNode),
}

pub enum MapEntry<'a> {
    Explicit { entry: &'a dyn TreeNode, key: Option<&'a dyn TreeNode>, value: Option<&'a dyn TreeNode> },
    Inline { key: &'a str, value: &'a dyn TreeNode },
}

pub enum SetEntry<'a> {
    Item(&'a dyn TreeNode),
    Inline { key: &'a str, node: &'a dyn TreeNode },
}

/// `source:line` label used as the prefix of diagnostics about a node.
pub fn location(source: &str, node: &dyn TreeNode) -> String {
    match node.line() {
        Some(line) => format!("{source}:{line}"),
        None => source.to_string(),
    }
}

// ------------- Element -------------

/// Owned, immutable-by-convention tree element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: Option<String>,
    pub children: Vec<Element>,
    pub line: Option<usize>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), attributes: Vec::new(), text: None, children: Vec::new(), line: None }
    }
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }
    pub fn to_xml(&self, pretty: bool) -> String {
        crate::xml::write_element(self, pretty)
    }
}

// Deep documents would otherwise overflow the stack in the derived drop glue.
impl Drop for Element {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut element) = pending.pop() {
            pending.append(&mut element.children);
        }
    }
}

impl TreeNode for Element {
    fn name(&self) -> &str {
        &self.name
    }
    fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }
    fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
    fn attribute_names(&self) -> Vec<&str> {
        self.attributes.iter().map(|(k, _)| k.as_str()).collect()
    }
    fn children(&self) -> Vec<&dyn TreeNode> {
        self.children.iter().map(|c| c as &dyn TreeNode).collect()
    }
    fn line(&self) -> Option<usize> {
        self.line
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml(false))
    }
}
