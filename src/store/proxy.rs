//! Relational projection of one node instance.
//!
//! A [`StoreProxy`] remembers what a node searched for (index, parameters,
//! window, offset, direction) and turns create/read/update/delete requests
//! into the statements of its type's [`StatementTable`].

use super::database::{retrieval_on_missing_table, Database, SqlRow};
use super::frame::Frame;
use super::statements::{SortDirection, StatementTable};
use super::Value;
use crate::error::{NodeError, NodeResult};
use crate::schema::descriptor::{NodeSchema, BY_ID};
use crate::schema::stream::StreamKind;
use log::debug;
use std::collections::HashMap;
use std::rc::Rc;

/// Search parameters as handed in by callers, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum SearchKey {
    /// Positional values in index order
    Values(Vec<Value>),
    /// Values keyed by stream name
    Named(HashMap<String, Value>),
}

impl SearchKey {
    pub fn none() -> Self {
        SearchKey::Values(Vec::new())
    }
}

impl From<Value> for SearchKey {
    fn from(value: Value) -> Self {
        SearchKey::Values(vec![value])
    }
}

impl From<i64> for SearchKey {
    fn from(value: i64) -> Self {
        SearchKey::Values(vec![Value::Integer(value)])
    }
}

impl From<&str> for SearchKey {
    fn from(value: &str) -> Self {
        SearchKey::Values(vec![Value::from(value)])
    }
}

impl From<Vec<Value>> for SearchKey {
    fn from(values: Vec<Value>) -> Self {
        SearchKey::Values(values)
    }
}

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for SearchKey {
    fn from((a, b): (A, B)) -> Self {
        SearchKey::Values(vec![a.into(), b.into()])
    }
}

impl<A: Into<Value>, B: Into<Value>, C: Into<Value>> From<(A, B, C)> for SearchKey {
    fn from((a, b, c): (A, B, C)) -> Self {
        SearchKey::Values(vec![a.into(), b.into(), c.into()])
    }
}

impl From<HashMap<String, Value>> for SearchKey {
    fn from(map: HashMap<String, Value>) -> Self {
        SearchKey::Named(map)
    }
}

/// Read behaviour switches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOptions {
    /// Return an empty window instead of a retrieval error
    pub allow_empty: bool,
    /// Notify remote listeners of this search after reading
    pub broadcast: bool,
}

/// Storage side of a node instance
#[derive(Debug, Clone)]
pub struct StoreProxy {
    schema: Rc<NodeSchema>,
    statements: Rc<StatementTable>,
    pub index: String,
    pub params: Vec<Value>,
    pub limit: Option<u64>,
    pub offset: u64,
    pub direction: SortDirection,
}

impl StoreProxy {
    pub fn new(
        schema: Rc<NodeSchema>,
        statements: Rc<StatementTable>,
        index: &str,
        key: SearchKey,
    ) -> NodeResult<Self> {
        let mut proxy = Self {
            schema,
            statements,
            index: index.to_string(),
            params: Vec::new(),
            limit: None,
            offset: 0,
            direction: SortDirection::Ascending,
        };
        proxy.params = proxy.normalize(key)?;
        Ok(proxy)
    }

    pub fn schema(&self) -> &Rc<NodeSchema> {
        &self.schema
    }

    pub fn statements(&self) -> &Rc<StatementTable> {
        &self.statements
    }

    /// Order the supplied key by the index's streams and check its arity.
    fn normalize(&self, key: SearchKey) -> NodeResult<Vec<Value>> {
        let expected = self.statements.param_count(&self.index)?;
        let values = match key {
            SearchKey::Values(values) => values,
            SearchKey::Named(mut map) => {
                let streams = self.index_streams()?;
                streams
                    .iter()
                    .map(|s| {
                        map.remove(s).ok_or_else(|| {
                            NodeError::Usage(format!("search on '{}' is missing '{}'", self.index, s))
                        })
                    })
                    .collect::<NodeResult<Vec<_>>>()?
            }
        };
        if let Some(expected) = expected {
            if values.len() != expected {
                return Err(NodeError::Usage(format!(
                    "'{}' on {} takes {} parameter(s), got {}",
                    self.index,
                    self.schema.name(),
                    expected,
                    values.len()
                )));
            }
        }
        Ok(values)
    }

    /// Streams an index compares, by stream name
    pub fn index_streams(&self) -> NodeResult<Vec<String>> {
        if self.index == BY_ID {
            return Ok(Vec::new());
        }
        if let Some(def) = self.schema.index(&self.index) {
            return Ok(def.streams.clone());
        }
        if let Some(stream) = self.index.strip_prefix("by_") {
            if self.schema.stream(stream).map_or(false, |s| s.is_reference()) {
                return Ok(vec![stream.to_string()]);
            }
        }
        Ok(Vec::new())
    }

    /// Re-derive search parameters from a frame, so a refresh finds the rows
    /// again after their indexed streams changed.
    pub fn resync_from(&mut self, frame: &Frame) -> NodeResult<()> {
        if self.index == BY_ID {
            if let Some(id) = frame.id {
                self.params = vec![Value::Integer(id)];
            }
            return Ok(());
        }
        if self.statements.param_count(&self.index)?.is_none() {
            return Ok(());
        }
        let streams = self.index_streams()?;
        if !streams.is_empty() {
            self.params = streams.iter().map(|s| frame.get(s)).collect();
        }
        Ok(())
    }

    /// Point the proxy at one row by primary key.
    pub fn pin_to(&mut self, id: i64) {
        self.index = BY_ID.to_string();
        self.params = vec![Value::Integer(id)];
    }

    fn frame_from_row(&self, mut row: SqlRow) -> Frame {
        let id = row.remove(self.statements.primary_key()).and_then(|v| v.as_i64());
        let mut frame = Frame {
            id,
            values: HashMap::with_capacity(self.schema.streams().len()),
        };
        for stream in self.schema.streams() {
            let column = self.statements.column(&stream.name).unwrap_or(&stream.name);
            let value = row.remove(column).unwrap_or(Value::Null);
            let value = match &stream.kind {
                StreamKind::Scalar(sql_type) => sql_type.coerce(value),
                StreamKind::Reference(_) => value,
            };
            frame.values.insert(stream.name.clone(), value);
        }
        frame
    }

    /// Run the search.
    pub fn read(&self, db: &Database, options: ReadOptions) -> NodeResult<Vec<Frame>> {
        let sql = self.statements.read(&self.index, self.direction)?;
        let mut params = self.params.clone();
        if self.statements.param_count(&self.index)?.is_some() {
            let limit = match self.limit {
                Some(limit) => sql_count("limit", limit)?,
                None => -1,
            };
            params.push(Value::Integer(limit));
            params.push(Value::Integer(sql_count("offset", self.offset)?));
        }
        let rows = db.query(&sql, &params).map_err(retrieval_on_missing_table)?;
        debug!("{} {} -> {} row(s)", self.schema.name(), self.index, rows.len());
        if rows.is_empty() && !options.allow_empty {
            return Err(NodeError::Retrieval(format!(
                "{} {} {:?} returned no rows",
                self.schema.name(),
                self.index,
                self.params
            )));
        }
        Ok(rows.into_iter().map(|row| self.frame_from_row(row)).collect())
    }

    /// Streams that must be present before a frame can be persisted
    pub fn missing_required(&self, frame: &Frame) -> Vec<String> {
        self.schema
            .streams()
            .iter()
            .filter(|s| s.is_required() && !frame.has(&s.name))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Persist an in-memory frame and return its new primary key.
    pub fn insert(&self, db: &Database, frame: &Frame, fullhouse: bool) -> NodeResult<i64> {
        if fullhouse {
            let missing = self.missing_required(frame);
            if !missing.is_empty() {
                return Err(NodeError::Integrity(format!(
                    "cannot create {}: required stream(s) {} missing",
                    self.schema.name(),
                    missing.join(", ")
                )));
            }
        }
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (stream, column) in self.statements.columns() {
            if frame.has(stream) {
                columns.push(column.clone());
                values.push(frame.get(stream));
            }
        }
        let sql = self.statements.insert(&columns);
        let id = db.insert_returning(&sql, &values).map_err(|e| match e {
            NodeError::Database(inner) if inner.to_string().contains("constraint failed") => {
                NodeError::Integrity(format!("insert into {} rejected: {}", self.schema.name(), inner))
            }
            other => other,
        })?;
        debug!("created {} #{}", self.schema.name(), id);
        Ok(id)
    }

    /// Write `changes` to every row matched by the current search.
    pub fn update(&self, db: &Database, changes: &[(String, Value)]) -> NodeResult<usize> {
        let mut columns = Vec::with_capacity(changes.len());
        let mut values = Vec::with_capacity(changes.len() + self.params.len());
        for (stream, value) in changes {
            let column = self.statements.column(stream).ok_or_else(|| {
                NodeError::Usage(format!("{} has no stream '{}'", self.schema.name(), stream))
            })?;
            columns.push(column.to_string());
            values.push(value.clone());
        }
        let sql = self.statements.update(&self.index, &columns)?;
        values.extend(self.params.iter().cloned());
        let count = db.execute(&sql, &values).map_err(|e| match e {
            NodeError::Database(inner) if inner.to_string().contains("constraint failed") => {
                NodeError::Integrity(format!("update of {} rejected: {}", self.schema.name(), inner))
            }
            other => other,
        })?;
        debug!("updated {} row(s) of {}", count, self.schema.name());
        Ok(count)
    }

    /// Delete rows by primary key.
    pub fn delete(&self, db: &Database, ids: &[i64]) -> NodeResult<usize> {
        let sql = self.statements.delete();
        let mut count = 0;
        for id in ids {
            count += db.execute(&sql, &[Value::Integer(*id)]).map_err(|e| match e {
                NodeError::Database(inner) if inner.to_string().contains("constraint failed") => {
                    NodeError::Integrity(format!(
                        "delete of {} #{} rejected: {}",
                        self.schema.name(),
                        id,
                        inner
                    ))
                }
                other => other,
            })?;
        }
        debug!("deleted {} row(s) of {}", count, self.schema.name());
        Ok(count)
    }
}

/// A row count as SQLite takes it; larger values are refused.
fn sql_count(what: &str, count: u64) -> NodeResult<i64> {
    i64::try_from(count).map_err(|_| NodeError::Usage(format!("{} {} is out of range", what, count)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::schema::stream::Stream;

    fn widget_proxy() -> StoreProxy {
        let schema = NodeSchema::builder("Widget")
            .stream(Stream::text("name"))
            .build()
            .unwrap();
        let statements = StatementTable::generate(&schema, "app", |t| {
            Err(NodeError::Integrity(t.to_string()))
        })
        .unwrap();
        StoreProxy::new(Rc::new(schema), Rc::new(statements), "by_all", SearchKey::none()).unwrap()
    }

    #[test]
    fn oversized_window_is_refused() {
        let db = Database::open(&RuntimeConfig::default()).unwrap();
        let mut proxy = widget_proxy();
        proxy.limit = Some(u64::MAX);
        assert!(matches!(proxy.read(&db, ReadOptions::default()), Err(NodeError::Usage(_))));

        proxy.limit = Some(5);
        proxy.offset = u64::MAX;
        assert!(matches!(proxy.read(&db, ReadOptions::default()), Err(NodeError::Usage(_))));
    }

    #[test]
    fn positional_keys_must_match_the_index() {
        let proxy = widget_proxy();
        assert!(proxy.params.is_empty());
        let schema = Rc::clone(proxy.schema());
        let statements = Rc::clone(proxy.statements());
        let wrong = StoreProxy::new(schema, statements, "by_id", SearchKey::none());
        assert!(matches!(wrong, Err(NodeError::Usage(_))));
    }
}
