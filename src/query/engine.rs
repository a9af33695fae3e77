use std::fmt;
use std::sync::Arc;
use crate::core::error::Result;
use crate::query::context::QueryContext;
use crate::query::source::QuerySource;

/// One item of a query result.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// An element or document node, kept in serialized form.
    Node { xml: String },
    Atomic { type_name: String, value: String },
}

impl Item {
    pub fn node(xml: impl Into<String>) -> Self {
        Item::Node { xml: xml.into() }
    }

    pub fn atomic(type_name: impl Into<String>, value: impl Into<String>) -> Self {
        Item::Atomic { type_name: type_name.into(), value: value.into() }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Item::atomic("xs:string", value)
    }

    pub fn integer(value: i64) -> Self {
        Item::atomic("xs:integer", value.to_string())
    }

    pub fn is_node(&self) -> bool {
        matches!(self, Item::Node { .. })
    }

    pub fn type_name(&self) -> &str {
        match self {
            Item::Node { .. } => "element()",
            Item::Atomic { type_name, .. } => type_name,
        }
    }
}

/// Materialized, cheaply clonable result sequence.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Sequence {
    items: Arc<[Item]>,
}

impl Sequence {
    pub fn empty() -> Self {
        Sequence::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Item> {
        self.items.iter()
    }
}

impl From<Vec<Item>> for Sequence {
    fn from(items: Vec<Item>) -> Self {
        Sequence { items: Arc::from(items) }
    }
}

impl FromIterator<Item> for Sequence {
    fn from_iter<I: IntoIterator<Item = Item>>(iter: I) -> Self {
        Sequence::from(iter.into_iter().collect::<Vec<_>>())
    }
}

/// The query language implementation.
///
/// `compile` sees the context the program will run with, so static
/// declarations (namespaces, documents, module path) are available at compile time.
pub trait QueryEngine: Send + Sync {
    fn compile(&self, source: &QuerySource, context: &QueryContext) -> Result<Box<dyn CompiledProgram>>;
}

/// A compiled program. Immutable; all per-run state lives in the context.
pub trait CompiledProgram: Send {
    fn execute(&self, context: &mut QueryContext) -> Result<Sequence>;
}

impl fmt::Debug for dyn CompiledProgram {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("CompiledProgram")
    }
}
