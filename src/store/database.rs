//! The process-wide SQL executor.
//!
//! One [`rusqlite::Connection`] per process. The application context is an
//! attached SQLite database named after the context, so every node table is
//! addressed as `"<context>"."<table>"`.

use crate::config::RuntimeConfig;
use crate::error::{NodeError, NodeResult};
use crate::schema::descriptor::ForeignKey;
use crate::schema::naming::{check_identifier, quote};
use crate::store::Value;
use log::{debug, warn};
use rusqlite::{params_from_iter, Connection};
use std::cell::Cell;
use std::collections::HashMap;
use std::path::PathBuf;

/// A result row keyed by column name
pub type SqlRow = HashMap<String, Value>;

/// Column as reported by the live catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

/// Shared connection with a reentrant, depth-counted transaction slot
pub struct Database {
    conn: Connection,
    schema: String,
    schema_file: Option<PathBuf>,
    depth: Cell<usize>,
    rollback_only: Cell<bool>,
    savepoints: Cell<u64>,
}

impl Database {
    /// Open the main database described by `config`. The context schema is
    /// attached later by [`Database::ensure_schema`].
    pub fn open(config: &RuntimeConfig) -> NodeResult<Self> {
        let conn = match config.main_file() {
            Some(path) => Connection::open(path)?,
            None => Connection::open_in_memory()?,
        };
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn,
            schema: check_identifier(&config.context)?.to_string(),
            schema_file: config.schema_file(),
            depth: Cell::new(0),
            rollback_only: Cell::new(false),
            savepoints: Cell::new(0),
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Name of the context schema
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// `"<schema>"."<table>"`
    pub fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote(&self.schema), quote(table))
    }

    /// Attach the context schema if it is not attached yet.
    ///
    /// Must run outside any transaction.
    pub fn ensure_schema(&self) -> NodeResult<bool> {
        let attached = self.attached_schemas()?;
        if attached.iter().any(|s| s == &self.schema) {
            return Ok(false);
        }
        let location = match &self.schema_file {
            Some(path) => path.to_string_lossy().into_owned(),
            None => ":memory:".to_string(),
        };
        self.conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote(&self.schema)),
            [location],
        )?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        debug!("attached schema {}", self.schema);
        Ok(true)
    }

    fn attached_schemas(&self) -> NodeResult<Vec<String>> {
        let mut stmt = self.conn.prepare("PRAGMA database_list")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// Current nesting depth of [`Database::transaction`]
    pub fn depth(&self) -> usize {
        self.depth.get()
    }

    /// Run `f` inside the global transaction. Only the outermost scope
    /// commits; an error at any depth makes the whole transaction roll back,
    /// and the outermost scope then reports an error even if `f` recovered.
    pub fn transaction<T>(&self, f: impl FnOnce(&Database) -> NodeResult<T>) -> NodeResult<T> {
        let outermost = self.depth.get() == 0;
        if outermost {
            self.conn.execute_batch("BEGIN")?;
            self.rollback_only.set(false);
        }
        self.depth.set(self.depth.get() + 1);
        let result = f(self);
        self.depth.set(self.depth.get() - 1);

        if result.is_err() {
            self.rollback_only.set(true);
        }
        if outermost {
            if self.rollback_only.replace(false) {
                if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                    warn!("rollback failed: {}", e);
                }
                if result.is_ok() {
                    return Err(NodeError::Integrity(
                        "transaction rolled back after a nested failure".into(),
                    ));
                }
            } else {
                self.conn.execute_batch("COMMIT")?;
            }
        }
        result
    }

    /// Run a speculative statement inside a savepoint so a failure only
    /// rolls back the probe itself.
    pub fn probe(&self, sql: &str) -> NodeResult<()> {
        let n = self.savepoints.get() + 1;
        self.savepoints.set(n);
        let savepoint = format!("probe_{}", n);
        self.conn.execute_batch(&format!("SAVEPOINT {}", savepoint))?;
        let outcome = self.conn.prepare(sql).and_then(|mut stmt| {
            let mut rows = stmt.query([])?;
            rows.next().map(|_| ())
        });
        match outcome {
            Ok(()) => {
                self.conn.execute_batch(&format!("RELEASE {}", savepoint))?;
                Ok(())
            }
            Err(e) => {
                self.conn
                    .execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", savepoint))?;
                Err(e.into())
            }
        }
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> NodeResult<Vec<SqlRow>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = SqlRow::with_capacity(columns.len());
            for (i, name) in columns.iter().enumerate() {
                map.insert(name.clone(), row.get::<_, Value>(i)?);
            }
            out.push(map);
        }
        Ok(out)
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> NodeResult<usize> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        Ok(stmt.execute(params_from_iter(params.iter()))?)
    }

    /// Run an `INSERT ... RETURNING <pk>` and hand back the key.
    pub fn insert_returning(&self, sql: &str, params: &[Value]) -> NodeResult<i64> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let id = stmt.query_row(params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?;
        Ok(id)
    }

    pub fn execute_ddl(&self, sql: &str) -> NodeResult<()> {
        debug!("ddl: {}", sql);
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Tables of the context schema
    pub fn tables(&self) -> NodeResult<Vec<String>> {
        let sql = format!(
            "SELECT name FROM {}.sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            quote(&self.schema)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    pub fn columns(&self, table: &str) -> NodeResult<Vec<ColumnInfo>> {
        let sql = format!("PRAGMA {}.table_info({})", quote(&self.schema), quote(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let columns = stmt
            .query_map([], |row| {
                Ok(ColumnInfo {
                    name: row.get(1)?,
                    declared_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    not_null: row.get::<_, i64>(3)? != 0,
                    primary_key: row.get::<_, i64>(5)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    /// Index names on a table, excluding SQLite's automatic ones
    pub fn indices(&self, table: &str) -> NodeResult<Vec<String>> {
        let sql = format!("PRAGMA {}.index_list({})", quote(&self.schema), quote(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names
            .into_iter()
            .filter(|n| !n.starts_with("sqlite_autoindex"))
            .collect())
    }

    /// Foreign keys declared on `table`
    pub fn foreign_keys(&self, table: &str) -> NodeResult<Vec<ForeignKey>> {
        let sql = format!("PRAGMA {}.foreign_key_list({})", quote(&self.schema), quote(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let keys = stmt
            .query_map([], |row| {
                Ok(ForeignKey {
                    table: table.to_string(),
                    referenced_table: row.get(2)?,
                    column: row.get(3)?,
                    referenced_column: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}

/// Turn a "no such table" failure into a retrieval error.
pub(crate) fn retrieval_on_missing_table(err: NodeError) -> NodeError {
    if err.is_missing_table() {
        NodeError::Retrieval(err.to_string().replacen("Database error: ", "", 1))
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Database {
        let db = Database::open(&RuntimeConfig::default()).unwrap();
        db.ensure_schema().unwrap();
        db
    }

    #[test]
    fn attaches_schema_once() {
        let db = open();
        assert!(!db.ensure_schema().unwrap());
        assert!(db.tables().unwrap().is_empty());
    }

    #[test]
    fn failed_probe_keeps_outer_transaction() {
        let db = open();
        db.execute_ddl(&format!("CREATE TABLE {} (a INTEGER)", db.qualified("t"))).unwrap();
        db.transaction(|db| {
            db.execute(&format!("INSERT INTO {} (a) VALUES (?1)", db.qualified("t")), &[Value::Integer(1)])?;
            let missing = db.probe(&format!("SELECT * FROM {}", db.qualified("nope")));
            assert!(missing.unwrap_err().is_missing_table());
            db.execute(&format!("INSERT INTO {} (a) VALUES (?1)", db.qualified("t")), &[Value::Integer(2)])?;
            Ok(())
        })
        .unwrap();
        let rows = db.query(&format!("SELECT a FROM {}", db.qualified("t")), &[]).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn nested_failure_rolls_back_outermost() {
        let db = open();
        db.execute_ddl(&format!("CREATE TABLE {} (a INTEGER)", db.qualified("t"))).unwrap();
        let result: NodeResult<()> = db.transaction(|db| {
            db.execute(&format!("INSERT INTO {} (a) VALUES (1)", db.qualified("t")), &[])?;
            let inner: NodeResult<()> =
                db.transaction(|_| Err(NodeError::Usage("inner failure".into())));
            assert!(inner.is_err());
            assert_eq!(db.depth(), 1);
            Ok(())
        });
        assert!(matches!(result, Err(NodeError::Integrity(_))));
        let rows = db.query(&format!("SELECT a FROM {}", db.qualified("t")), &[]).unwrap();
        assert!(rows.is_empty());
        assert_eq!(db.depth(), 0);
    }
}
