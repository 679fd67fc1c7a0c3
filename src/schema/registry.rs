use super::descriptor::NodeSchema;
use crate::error::{NodeError, NodeResult};
use crate::store::StatementTable;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Registered node types plus their generated statements.
///
/// Statement tables are rendered on first use and then shared, so every node
/// instance of a type works from the same query templates.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    context: String,
    schemas: HashMap<String, Rc<NodeSchema>>,
    order: Vec<String>,
    statements: RefCell<HashMap<String, Rc<StatementTable>>>,
}

impl SchemaRegistry {
    pub fn new(context: &str) -> Self {
        Self {
            context: context.to_string(),
            ..Default::default()
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn register(&mut self, schema: NodeSchema) -> NodeResult<Rc<NodeSchema>> {
        if self.schemas.contains_key(schema.name()) {
            return Err(NodeError::Usage(format!(
                "node type '{}' is already registered",
                schema.name()
            )));
        }
        if let Some(clash) = self.schemas.values().find(|s| s.table() == schema.table()) {
            return Err(NodeError::Integrity(format!(
                "'{}' and '{}' map to the same table",
                clash.name(),
                schema.name()
            )));
        }
        let name = schema.name().to_string();
        let schema = Rc::new(schema);
        self.schemas.insert(name.clone(), Rc::clone(&schema));
        self.order.push(name);
        Ok(schema)
    }

    pub fn get(&self, name: &str) -> NodeResult<Rc<NodeSchema>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| NodeError::Usage(format!("unknown node type '{}'", name)))
    }

    pub fn by_table(&self, table: &str) -> Option<Rc<NodeSchema>> {
        self.schemas.values().find(|s| s.table() == table).cloned()
    }

    pub fn table_of(&self, name: &str) -> NodeResult<String> {
        self.get(name).map(|s| s.table().to_string())
    }

    /// Registered types in registration order
    pub fn all(&self) -> Vec<Rc<NodeSchema>> {
        self.order
            .iter()
            .filter_map(|n| self.schemas.get(n).cloned())
            .collect()
    }

    /// Statement table of a type, generated on first request
    pub fn statements(&self, name: &str) -> NodeResult<Rc<StatementTable>> {
        if let Some(table) = self.statements.borrow().get(name) {
            return Ok(Rc::clone(table));
        }
        let schema = self.get(name)?;
        let table = Rc::new(StatementTable::generate(&schema, &self.context, |t| {
            self.table_of(t)
        })?);
        self.statements
            .borrow_mut()
            .insert(name.to_string(), Rc::clone(&table));
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::stream::Stream;

    #[test]
    fn statements_are_shared() {
        let mut registry = SchemaRegistry::new("app");
        registry
            .register(NodeSchema::builder("Owner").stream(Stream::text("name")).build().unwrap())
            .unwrap();
        let a = registry.statements("Owner").unwrap();
        let b = registry.statements("Owner").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = SchemaRegistry::new("app");
        let owner = || NodeSchema::builder("Owner").build().unwrap();
        registry.register(owner()).unwrap();
        assert!(registry.register(owner()).is_err());
    }

    #[test]
    fn unknown_reference_target_fails_generation() {
        let mut registry = SchemaRegistry::new("app");
        registry
            .register(
                NodeSchema::builder("Widget")
                    .stream(Stream::reference("owner", "Owner"))
                    .build()
                    .unwrap(),
            )
            .unwrap();
        assert!(registry.statements("Widget").is_err());
    }
}
