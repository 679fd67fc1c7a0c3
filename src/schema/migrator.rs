//! Brings backing tables into structural agreement with node definitions.
//!
//! Migration never drops anything: a column present in a table but absent
//! from the definition is an integrity error. Missing columns and indices are
//! added; running a migration twice is a no-op.

use super::descriptor::{ForeignKeyCatalog, NodeSchema};
use super::naming::{self, quote};
use super::registry::SchemaRegistry;
use super::stream::{Stream, StreamKind};
use crate::error::{NodeError, NodeResult};
use crate::store::Database;
use log::{info, warn};
use std::collections::HashSet;
use std::rc::Rc;

/// Table of discoverable registrations
pub const DISCOVERABLE_TABLE: &str = "rpc_discoverable";

/// Table of routing registrations
pub const REGISTRATION_TABLE: &str = "rpc_registration";

/// What a migration changed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub created_tables: Vec<String>,
    /// (table, column)
    pub added_columns: Vec<(String, String)>,
    pub created_indices: Vec<String>,
}

impl MigrationReport {
    pub fn is_empty(&self) -> bool {
        self.created_tables.is_empty()
            && self.added_columns.is_empty()
            && self.created_indices.is_empty()
    }
}

/// One migration run over a registry
pub struct Migrator<'a> {
    db: &'a Database,
    registry: &'a SchemaRegistry,
    /// Types whose tables are being materialized right now
    materializing: Vec<String>,
    migrated: HashSet<String>,
    report: MigrationReport,
}

impl<'a> Migrator<'a> {
    pub fn new(db: &'a Database, registry: &'a SchemaRegistry) -> Self {
        Self {
            db,
            registry,
            materializing: Vec::new(),
            migrated: HashSet::new(),
            report: MigrationReport::default(),
        }
    }

    /// Migrate every registered type and the registry tables, then load the
    /// foreign-key catalogs.
    pub fn migrate_all(mut self) -> NodeResult<MigrationReport> {
        self.db.ensure_schema()?;
        let db = self.db;
        db.transaction(|_| {
            self.ensure_registry()?;
            for schema in self.registry.all() {
                self.init(&schema)?;
            }
            Ok(())
        })?;
        let mut visited = HashSet::new();
        for schema in self.registry.all() {
            self.init_fkeys(&schema, &mut visited)?;
        }
        Ok(self.report)
    }

    /// Ensure one type's table, columns and indices.
    pub fn init(&mut self, schema: &Rc<NodeSchema>) -> NodeResult<()> {
        if self.migrated.contains(schema.name()) || self.materializing.iter().any(|n| n == schema.name()) {
            return Ok(());
        }
        naming::table_name(schema.name())?;
        self.materializing.push(schema.name().to_string());
        let result = self.materialize(schema);
        self.materializing.pop();
        result?;
        self.migrated.insert(schema.name().to_string());
        Ok(())
    }

    fn materialize(&mut self, schema: &Rc<NodeSchema>) -> NodeResult<()> {
        for stream in schema.streams() {
            if let Some(target) = stream.target() {
                let target = self.registry.get(target)?;
                self.init(&target)?;
            }
        }

        let qualified = self.db.qualified(schema.table());
        let probe = format!("SELECT * FROM {} LIMIT 0", qualified);
        if let Err(e) = self.db.probe(&probe) {
            if !e.is_missing_table() {
                return Err(e);
            }
            self.create_table(schema)?;
            self.db.probe(&probe)?;
        }

        let existing: Vec<String> = self
            .db
            .columns(schema.table())?
            .into_iter()
            .map(|c| c.name)
            .filter(|name| !name.starts_with('_'))
            .collect();
        let wanted = self.wanted_columns(schema)?;

        if let Some(dropped) = existing.iter().find(|c| !wanted.iter().any(|(_, w)| w == *c)) {
            return Err(NodeError::Integrity(format!(
                "column '{}' of table '{}' is not declared by {}; refusing to drop data",
                dropped,
                schema.table(),
                schema.name()
            )));
        }

        for (stream, column) in &wanted {
            if existing.contains(column) {
                continue;
            }
            let definition = self.column_definition(stream, column, false)?;
            self.db.execute_ddl(&format!(
                "ALTER TABLE {} ADD COLUMN {}",
                qualified, definition
            ))?;
            info!("added column {}.{}", schema.table(), column);
            self.report
                .added_columns
                .push((schema.table().to_string(), column.clone()));
        }

        self.build_indices(schema)
    }

    /// (stream, column) pairs the definition needs
    fn wanted_columns<'s>(&self, schema: &'s NodeSchema) -> NodeResult<Vec<(&'s Stream, String)>> {
        schema
            .streams()
            .iter()
            .map(|stream| {
                let referenced = match stream.target() {
                    Some(target) => Some(self.registry.table_of(target)?),
                    None => None,
                };
                Ok((stream, schema.column_for(stream, referenced.as_deref())))
            })
            .collect()
    }

    /// Column DDL. SQLite refuses `ALTER TABLE ADD COLUMN ... NOT NULL`
    /// without a default, so such columns are only `NOT NULL` at creation.
    fn column_definition(&self, stream: &Stream, column: &str, creating: bool) -> NodeResult<String> {
        let mut definition = match &stream.kind {
            StreamKind::Scalar(sql_type) => format!("{} {}", quote(column), sql_type.declaration()),
            StreamKind::Reference(target) => {
                let target = self.registry.get(target)?;
                format!(
                    "{} INTEGER REFERENCES {}({})",
                    quote(column),
                    quote(target.table()),
                    quote(target.primary_key())
                )
            }
        };
        let default = stream.default_value();
        if stream.is_required() {
            if creating || default.is_some() {
                definition.push_str(" NOT NULL");
            } else {
                warn!(
                    "column {} added nullable; required-ness is enforced on create",
                    column
                );
            }
        }
        if let Some(value) = default {
            definition.push_str(&format!(" DEFAULT {}", value.sql_literal()));
        }
        Ok(definition)
    }

    fn create_table(&mut self, schema: &NodeSchema) -> NodeResult<()> {
        let mut columns = vec![format!(
            "{} INTEGER PRIMARY KEY AUTOINCREMENT",
            quote(schema.primary_key())
        )];
        for (stream, column) in self.wanted_columns(schema)? {
            columns.push(self.column_definition(stream, &column, true)?);
        }
        self.db.execute_ddl(&format!(
            "CREATE TABLE {} ({})",
            self.db.qualified(schema.table()),
            columns.join(", ")
        ))?;
        info!("created table {}", schema.table());
        self.report.created_tables.push(schema.table().to_string());
        Ok(())
    }

    fn build_indices(&mut self, schema: &NodeSchema) -> NodeResult<()> {
        let present = self.db.indices(schema.table())?;
        let wanted = self.wanted_columns(schema)?;
        for index in schema.indices() {
            let name = format!("{}_{}", schema.table(), index.name);
            if present.contains(&name) {
                continue;
            }
            let columns: Vec<String> = index
                .streams
                .iter()
                .filter_map(|s| wanted.iter().find(|(st, _)| &st.name == s))
                .map(|(_, c)| quote(c))
                .collect();
            let predicate = index
                .predicate
                .as_ref()
                .map(|p| format!(" WHERE {}", p))
                .unwrap_or_default();
            self.db.execute_ddl(&format!(
                "CREATE {}INDEX IF NOT EXISTS {}.{} ON {} ({}){}",
                if index.unique { "UNIQUE " } else { "" },
                quote(self.db.schema()),
                quote(&name),
                quote(schema.table()),
                columns.join(", "),
                predicate
            ))?;
            info!("built index {}", name);
            self.report.created_indices.push(name);
        }
        Ok(())
    }

    /// Ensure the discovery and routing registration tables.
    pub fn ensure_registry(&mut self) -> NodeResult<()> {
        let discoverable = self.db.qualified(DISCOVERABLE_TABLE);
        let registration = self.db.qualified(REGISTRATION_TABLE);
        let schema = quote(self.db.schema());
        let before = self.db.tables()?;
        self.db.execute_ddl(&format!(
            "CREATE TABLE IF NOT EXISTS {discoverable} (
                \"_rpc_discoverable_id\" INTEGER PRIMARY KEY AUTOINCREMENT,
                \"infname_semantic\" TEXT NOT NULL,
                \"stripe\" INTEGER NOT NULL DEFAULT 0,
                \"url\" TEXT NOT NULL,
                \"type\" TEXT NOT NULL,
                \"envid\" TEXT NOT NULL,
                \"heartbeat\" REAL NOT NULL,
                \"listen\" BOOLEAN NOT NULL DEFAULT 0
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {schema}.\"rpc_discoverable_semantic\"
                ON \"{DISCOVERABLE_TABLE}\" (\"infname_semantic\", \"stripe\") WHERE \"listen\" = 0;
            CREATE TABLE IF NOT EXISTS {registration} (
                \"_rpc_registration_id\" INTEGER PRIMARY KEY AUTOINCREMENT,
                \"service\" TEXT NOT NULL,
                \"owner_class\" TEXT NOT NULL,
                \"owner_id\" TEXT NOT NULL,
                \"role\" TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {schema}.\"rpc_registration_key\"
                ON \"{REGISTRATION_TABLE}\" (\"service\", \"owner_class\", \"owner_id\", \"role\");"
        ))?;
        for table in [DISCOVERABLE_TABLE, REGISTRATION_TABLE] {
            if !before.iter().any(|t| t == table) {
                self.report.created_tables.push(table.to_string());
            }
        }
        Ok(())
    }

    /// Read the live foreign-key catalog for a type, referenced types first.
    pub fn init_fkeys(&self, schema: &Rc<NodeSchema>, visited: &mut HashSet<String>) -> NodeResult<()> {
        if !visited.insert(schema.name().to_string()) {
            return Ok(());
        }
        for stream in schema.streams() {
            if let Some(target) = stream.target() {
                let target = self.registry.get(target)?;
                self.init_fkeys(&target, visited)?;
            }
        }
        let forward = self.db.foreign_keys(schema.table())?;
        let mut reverse = Vec::new();
        for table in self.db.tables()? {
            reverse.extend(
                self.db
                    .foreign_keys(&table)?
                    .into_iter()
                    .filter(|fk| fk.referenced_table == schema.table()),
            );
        }
        schema.set_foreign_keys(ForeignKeyCatalog { forward, reverse });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::schema::descriptor::IndexDef;

    fn registry(widget: NodeSchema) -> SchemaRegistry {
        let mut registry = SchemaRegistry::new("app");
        registry
            .register(NodeSchema::builder("Owner").stream(Stream::text("name")).build().unwrap())
            .unwrap();
        registry.register(widget).unwrap();
        registry
    }

    fn widget() -> crate::schema::descriptor::NodeSchemaBuilder {
        NodeSchema::builder("Widget")
            .stream(Stream::text("name").with_default(""))
            .stream(Stream::reference("owner", "Owner").required())
            .index(IndexDef::new("by_name", &["name"]).unique())
    }

    fn database() -> Database {
        Database::open(&RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn migration_is_idempotent() {
        let db = database();
        let reg = registry(widget().build().unwrap());
        let first = Migrator::new(&db, &reg).migrate_all().unwrap();
        assert!(first.created_tables.contains(&"widgets".to_string()));
        assert_eq!(first.created_indices, vec!["widgets_by_name".to_string()]);

        let second = Migrator::new(&db, &reg).migrate_all().unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn new_stream_adds_exactly_one_column() {
        let db = database();
        Migrator::new(&db, &registry(widget().build().unwrap())).migrate_all().unwrap();
        let grown = registry(widget().stream(Stream::integer("size").with_default(0)).build().unwrap());
        let report = Migrator::new(&db, &grown).migrate_all().unwrap();
        assert_eq!(report.added_columns, vec![("widgets".to_string(), "size".to_string())]);
        assert!(report.created_tables.is_empty());
    }

    #[test]
    fn removed_stream_is_an_integrity_error() {
        let db = database();
        Migrator::new(&db, &registry(widget().build().unwrap())).migrate_all().unwrap();
        let shrunk = registry(
            NodeSchema::builder("Widget")
                .stream(Stream::reference("owner", "Owner").required())
                .build()
                .unwrap(),
        );
        let result = Migrator::new(&db, &shrunk).migrate_all();
        assert!(matches!(result, Err(NodeError::Integrity(_))));
    }

    #[test]
    fn foreign_key_catalog_sees_both_directions() {
        let db = database();
        let reg = registry(widget().build().unwrap());
        Migrator::new(&db, &reg).migrate_all().unwrap();
        let owner = reg.get("Owner").unwrap();
        let catalog = owner.foreign_keys().unwrap();
        assert!(catalog.forward.is_empty());
        assert_eq!(catalog.reverse.len(), 1);
        assert_eq!(catalog.reverse[0].table, "widgets");
        assert_eq!(catalog.reverse[0].column, "owners_id_owner");
    }

    #[test]
    fn mutually_referencing_types_terminate() {
        let db = database();
        let mut reg = SchemaRegistry::new("app");
        reg.register(
            NodeSchema::builder("Author")
                .stream(Stream::reference("favourite", "Book"))
                .build()
                .unwrap(),
        )
        .unwrap();
        reg.register(
            NodeSchema::builder("Book")
                .stream(Stream::reference("author", "Author"))
                .build()
                .unwrap(),
        )
        .unwrap();
        let report = Migrator::new(&db, &reg).migrate_all().unwrap();
        assert!(report.created_tables.contains(&"authors".to_string()));
        assert!(report.created_tables.contains(&"books".to_string()));
    }
}
