//! Node type descriptors.
//!
//! A [`NodeSchema`] is built once when a type is registered and is immutable
//! afterwards. The only late-bound piece is the foreign-key catalog, which is
//! read from the live database by the migrator and set exactly once.

use super::naming;
use super::stream::Stream;
use crate::error::{NodeError, NodeResult};
use crate::node::Node;
use crate::store::Value;
use once_cell::unsync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Computed property over a node; cached until the next invalidation.
pub type DerivedFn = Rc<dyn Fn(&Node) -> NodeResult<Value>>;

/// Invalidation handler, called with the invalidated stream name.
pub type HandlerFn = Rc<dyn Fn(&Node, &str)>;

/// Name of the index that matches every row.
pub const BY_ALL: &str = "by_all";

/// Name of the primary-key index.
pub const BY_ID: &str = "by_id";

/// A declared index over one or more streams
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDef {
    pub name: String,
    pub streams: Vec<String>,
    pub unique: bool,
    /// Partial-index predicate, raw SQL over column names
    pub predicate: Option<String>,
}

impl IndexDef {
    pub fn new(name: &str, streams: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            streams: streams.iter().map(|s| s.to_string()).collect(),
            unique: false,
            predicate: None,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn partial(mut self, predicate: &str) -> Self {
        self.predicate = Some(predicate.to_string());
        self
    }
}

/// One row of the live foreign-key catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Referencing table
    pub table: String,
    /// Referencing column
    pub column: String,
    /// Referenced table
    pub referenced_table: String,
    pub referenced_column: String,
}

/// Foreign keys touching one table, in both directions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForeignKeyCatalog {
    /// Keys declared on this table
    pub forward: Vec<ForeignKey>,
    /// Keys on other tables pointing at this table
    pub reverse: Vec<ForeignKey>,
}

/// Immutable description of a node type
pub struct NodeSchema {
    name: String,
    table: String,
    primary_key: String,
    streams: Vec<Stream>,
    indices: Vec<IndexDef>,
    identity: Vec<String>,
    derived: HashMap<String, DerivedFn>,
    handlers: HashMap<String, HandlerFn>,
    statements: Vec<(String, String)>,
    foreign_keys: OnceCell<ForeignKeyCatalog>,
}

impl fmt::Debug for NodeSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSchema")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("streams", &self.streams)
            .field("indices", &self.indices)
            .field("identity", &self.identity)
            .finish()
    }
}

impl NodeSchema {
    pub fn builder(name: &str) -> NodeSchemaBuilder {
        NodeSchemaBuilder {
            name: name.to_string(),
            streams: Vec::new(),
            indices: Vec::new(),
            identity: Vec::new(),
            derived: HashMap::new(),
            handlers: HashMap::new(),
            statements: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    pub fn stream(&self, name: &str) -> Option<&Stream> {
        self.streams.iter().find(|s| s.name == name)
    }

    pub fn has_stream(&self, name: &str) -> bool {
        self.stream(name).is_some()
    }

    pub fn indices(&self) -> &[IndexDef] {
        &self.indices
    }

    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indices.iter().find(|i| i.name == name)
    }

    /// Streams hashed into `infname`, in declaration order
    pub fn identity(&self) -> &[String] {
        &self.identity
    }

    pub fn derived(&self, name: &str) -> Option<&DerivedFn> {
        self.derived.get(name)
    }

    pub fn handler(&self, name: &str) -> Option<&HandlerFn> {
        self.handlers.get(name)
    }

    pub fn statements(&self) -> &[(String, String)] {
        &self.statements
    }

    /// Backing column of a stream; reference streams need the referenced table.
    pub fn column_for(&self, stream: &Stream, referenced_table: Option<&str>) -> String {
        match referenced_table {
            Some(table) if stream.is_reference() => naming::reference_column(table, &stream.name),
            _ => stream.name.clone(),
        }
    }

    pub fn foreign_keys(&self) -> Option<&ForeignKeyCatalog> {
        self.foreign_keys.get()
    }

    /// Store the catalog read by the migrator; later calls are no-ops.
    pub(crate) fn set_foreign_keys(&self, catalog: ForeignKeyCatalog) {
        let _ = self.foreign_keys.set(catalog);
    }

    /// Whether an index yields at most one row
    pub fn is_unique_index(&self, index: &str) -> bool {
        index == BY_ID || self.index(index).map_or(false, |i| i.unique)
    }
}

/// Builder for [`NodeSchema`]
pub struct NodeSchemaBuilder {
    name: String,
    streams: Vec<Stream>,
    indices: Vec<IndexDef>,
    identity: Vec<String>,
    derived: HashMap<String, DerivedFn>,
    handlers: HashMap<String, HandlerFn>,
    statements: Vec<(String, String)>,
}

impl NodeSchemaBuilder {
    pub fn stream(mut self, stream: Stream) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indices.push(index);
        self
    }

    /// Restrict `infname` to these streams; defaults to every stream
    pub fn identity(mut self, streams: &[&str]) -> Self {
        self.identity = streams.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn derived<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Node) -> NodeResult<Value> + 'static,
    {
        self.derived.insert(name.to_string(), Rc::new(f));
        self
    }

    pub fn handler<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(&Node, &str) + 'static,
    {
        self.handlers.insert(name.to_string(), Rc::new(f));
        self
    }

    /// Extra read statement; `{schema}` and `{table}` are substituted.
    pub fn statement(mut self, name: &str, sql: &str) -> Self {
        self.statements.push((name.to_string(), sql.to_string()));
        self
    }

    pub fn build(self) -> NodeResult<NodeSchema> {
        let table = naming::table_name(&self.name)?;
        let primary_key = naming::primary_key_column(&table);

        let mut seen = Vec::new();
        for stream in &self.streams {
            naming::check_identifier(&stream.name)?;
            if seen.contains(&stream.name.as_str()) {
                return Err(NodeError::Integrity(format!(
                    "stream '{}' declared twice on {}",
                    stream.name, self.name
                )));
            }
            if stream.name.starts_with('_') {
                return Err(NodeError::Integrity(format!(
                    "stream '{}' on {} uses the reserved leading underscore",
                    stream.name, self.name
                )));
            }
            if let Some(handler) = &stream.handler {
                if !self.handlers.contains_key(handler) {
                    return Err(NodeError::Integrity(format!(
                        "stream '{}' names unknown handler '{}'",
                        stream.name, handler
                    )));
                }
            }
            seen.push(stream.name.as_str());
        }

        for index in &self.indices {
            naming::check_identifier(&index.name)?;
            if index.name == BY_ALL || index.name == BY_ID || index.streams.is_empty() {
                return Err(NodeError::Integrity(format!(
                    "index '{}' on {} is reserved or empty",
                    index.name, self.name
                )));
            }
            if let Some(missing) = index.streams.iter().find(|s| !seen.contains(&s.as_str())) {
                return Err(NodeError::Integrity(format!(
                    "index '{}' names unknown stream '{}'",
                    index.name, missing
                )));
            }
        }

        let identity = if self.identity.is_empty() {
            self.streams.iter().map(|s| s.name.clone()).collect()
        } else {
            if let Some(missing) = self.identity.iter().find(|s| !seen.contains(&s.as_str())) {
                return Err(NodeError::Integrity(format!(
                    "identity names unknown stream '{}'",
                    missing
                )));
            }
            self.identity
        };

        for (name, _) in &self.statements {
            naming::check_identifier(name)?;
        }
        if let Some(clash) = self.derived.keys().find(|d| seen.contains(&d.as_str())) {
            return Err(NodeError::Integrity(format!(
                "derived property '{}' shadows a stream",
                clash
            )));
        }

        Ok(NodeSchema {
            name: self.name,
            table,
            primary_key,
            streams: self.streams,
            indices: self.indices,
            identity,
            derived: self.derived,
            handlers: self.handlers,
            statements: self.statements,
            foreign_keys: OnceCell::new(),
        })
    }
}

/// Static declaration of a node type.
///
/// ```ignore
/// struct Owner;
///
/// impl NodeDefinition for Owner {
///     const NAME: &'static str = "Owner";
///     fn describe(builder: NodeSchemaBuilder) -> NodeSchemaBuilder {
///         builder.stream(Stream::text("name").with_default(""))
///     }
/// }
/// ```
pub trait NodeDefinition {
    const NAME: &'static str;

    fn describe(builder: NodeSchemaBuilder) -> NodeSchemaBuilder;

    fn schema() -> NodeResult<NodeSchema> {
        Self::describe(NodeSchema::builder(Self::NAME)).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget() -> NodeSchemaBuilder {
        NodeSchema::builder("Widget")
            .stream(Stream::text("name").with_default(""))
            .stream(Stream::reference("owner", "Owner").required())
    }

    #[test]
    fn builds_with_derived_names() {
        let schema = widget().index(IndexDef::new("by_name", &["name"]).unique()).build().unwrap();
        assert_eq!(schema.table(), "widgets");
        assert_eq!(schema.primary_key(), "_widgets_id");
        assert_eq!(schema.identity(), &["name".to_string(), "owner".to_string()]);
        assert!(schema.is_unique_index("by_name"));
        assert!(schema.is_unique_index(BY_ID));
        assert!(!schema.is_unique_index(BY_ALL));
    }

    #[test]
    fn rejects_index_on_unknown_stream() {
        let result = widget().index(IndexDef::new("by_colour", &["colour"])).build();
        assert!(matches!(result, Err(NodeError::Integrity(_))));
    }

    #[test]
    fn rejects_unknown_handler() {
        let result = NodeSchema::builder("Widget")
            .stream(Stream::text("name").on_invalidate("missing"))
            .build();
        assert!(matches!(result, Err(NodeError::Integrity(_))));
    }

    #[test]
    fn foreign_key_catalog_is_set_once() {
        let schema = widget().build().unwrap();
        assert!(schema.foreign_keys().is_none());
        schema.set_foreign_keys(ForeignKeyCatalog::default());
        schema.set_foreign_keys(ForeignKeyCatalog {
            forward: vec![ForeignKey {
                table: "x".into(),
                column: "y".into(),
                referenced_table: "z".into(),
                referenced_column: "w".into(),
            }],
            reverse: Vec::new(),
        });
        assert!(schema.foreign_keys().unwrap().forward.is_empty());
    }
}
