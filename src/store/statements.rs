//! Parameterized statements generated from a node type.
//!
//! Every type gets a fixed table of reads (by primary key, by each declared
//! index, `by_all`, one `by_<stream>` per reference stream, plus the type's own
//! statements), an insert returning the primary key and a delete by primary
//! key. Rendered SQL is memoized per statement shape.

use crate::error::{NodeError, NodeResult};
use crate::schema::descriptor::{NodeSchema, BY_ALL, BY_ID};
use crate::schema::naming::quote;
use std::cell::RefCell;
use std::collections::HashMap;

/// Order of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

impl SortDirection {
    fn keyword(&self) -> &'static str {
        match self {
            SortDirection::Ascending => "ASC",
            SortDirection::Descending => "DESC",
        }
    }
}

/// Shape of one read statement
#[derive(Debug, Clone, PartialEq)]
pub enum ReadShape {
    /// `WHERE c1 = ? AND c2 = ?` over these columns, in declaration order
    Columns(Vec<String>),
    /// Caller supplied SQL, executed as written
    Custom(String),
}

/// Generated statements for one node type
#[derive(Debug)]
pub struct StatementTable {
    table: String,
    primary_key: String,
    /// stream name -> column name
    columns: Vec<(String, String)>,
    reads: HashMap<String, ReadShape>,
    rendered: RefCell<HashMap<String, String>>,
}

impl StatementTable {
    /// Build the table for `schema`; `table_of` maps a referenced type name to its table.
    pub fn generate(
        schema: &NodeSchema,
        context: &str,
        table_of: impl Fn(&str) -> NodeResult<String>,
    ) -> NodeResult<Self> {
        let mut columns = Vec::with_capacity(schema.streams().len());
        let mut reads = HashMap::new();
        for stream in schema.streams() {
            let referenced = match stream.target() {
                Some(target) => Some(table_of(target)?),
                None => None,
            };
            let column = schema.column_for(stream, referenced.as_deref());
            if stream.is_reference() {
                reads.insert(
                    format!("by_{}", stream.name),
                    ReadShape::Columns(vec![column.clone()]),
                );
            }
            columns.push((stream.name.clone(), column));
        }

        let column_of = |stream: &str| {
            columns
                .iter()
                .find(|(s, _)| s == stream)
                .map(|(_, c)| c.clone())
                .ok_or_else(|| NodeError::Integrity(format!("unknown stream '{}'", stream)))
        };

        reads.insert(
            BY_ID.to_string(),
            ReadShape::Columns(vec![schema.primary_key().to_string()]),
        );
        reads.insert(BY_ALL.to_string(), ReadShape::Columns(Vec::new()));
        for index in schema.indices() {
            let cols = index
                .streams
                .iter()
                .map(|s| column_of(s))
                .collect::<NodeResult<Vec<_>>>()?;
            reads.insert(index.name.clone(), ReadShape::Columns(cols));
        }

        let table = format!("{}.{}", quote(context), quote(schema.table()));
        for (name, sql) in schema.statements() {
            let sql = sql
                .replace("{schema}", &quote(context))
                .replace("{table}", &table);
            reads.insert(name.clone(), ReadShape::Custom(sql));
        }

        Ok(Self {
            table,
            primary_key: schema.primary_key().to_string(),
            columns,
            reads,
            rendered: RefCell::new(HashMap::new()),
        })
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Qualified table name
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn column(&self, stream: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(s, _)| s == stream)
            .map(|(_, c)| c.as_str())
    }

    /// (stream, column) pairs in declaration order
    pub fn columns(&self) -> &[(String, String)] {
        &self.columns
    }

    pub fn has_read(&self, index: &str) -> bool {
        self.reads.contains_key(index)
    }

    pub fn read_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.reads.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn shape(&self, index: &str) -> NodeResult<&ReadShape> {
        self.reads
            .get(index)
            .ok_or_else(|| NodeError::Usage(format!("no statement named '{}' on {}", index, self.table)))
    }

    /// Number of search parameters a read expects; `None` for custom statements
    pub fn param_count(&self, index: &str) -> NodeResult<Option<usize>> {
        Ok(match self.shape(index)? {
            ReadShape::Columns(cols) => Some(cols.len()),
            ReadShape::Custom(_) => None,
        })
    }

    /// Columns an index predicate compares, in order
    pub fn predicate_columns(&self, index: &str) -> NodeResult<&[String]> {
        match self.shape(index)? {
            ReadShape::Columns(cols) => Ok(cols),
            ReadShape::Custom(_) => Err(NodeError::Usage(format!(
                "statement '{}' has no index predicate",
                index
            ))),
        }
    }

    fn where_clause(columns: &[String], first_param: usize) -> String {
        if columns.is_empty() {
            return String::new();
        }
        let terms: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = ?{}", quote(c), first_param + i))
            .collect();
        format!(" WHERE {}", terms.join(" AND "))
    }

    fn memo(&self, key: String, render: impl FnOnce() -> String) -> String {
        if let Some(sql) = self.rendered.borrow().get(&key) {
            return sql.clone();
        }
        let sql = render();
        self.rendered.borrow_mut().insert(key, sql.clone());
        sql
    }

    /// `SELECT` for a read; index reads take their parameters first, then
    /// limit and offset.
    pub fn read(&self, index: &str, direction: SortDirection) -> NodeResult<String> {
        let shape = self.shape(index)?;
        let key = format!("read:{}:{:?}", index, direction);
        Ok(match shape {
            ReadShape::Custom(sql) => sql.clone(),
            ReadShape::Columns(cols) => self.memo(key, || {
                format!(
                    "SELECT * FROM {}{} ORDER BY {} {} LIMIT ?{} OFFSET ?{}",
                    self.table,
                    Self::where_clause(cols, 1),
                    quote(&self.primary_key),
                    direction.keyword(),
                    cols.len() + 1,
                    cols.len() + 2
                )
            }),
        })
    }

    /// `UPDATE` writing `columns` for every row matched by `index`; the
    /// written values come first, then the index parameters.
    pub fn update(&self, index: &str, columns: &[String]) -> NodeResult<String> {
        let predicate = self.predicate_columns(index)?.to_vec();
        if columns.is_empty() {
            return Err(NodeError::Usage("update writes no columns".into()));
        }
        let key = format!("update:{}:{}", index, columns.join(","));
        Ok(self.memo(key, || {
            let sets: Vec<String> = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{} = ?{}", quote(c), i + 1))
                .collect();
            format!(
                "UPDATE {} SET {}{}",
                self.table,
                sets.join(", "),
                Self::where_clause(&predicate, columns.len() + 1)
            )
        }))
    }

    pub fn insert(&self, columns: &[String]) -> String {
        let key = format!("insert:{}", columns.join(","));
        self.memo(key, || {
            if columns.is_empty() {
                format!(
                    "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                    self.table,
                    quote(&self.primary_key)
                )
            } else {
                let names: Vec<String> = columns.iter().map(|c| quote(c)).collect();
                let marks: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
                format!(
                    "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                    self.table,
                    names.join(", "),
                    marks.join(", "),
                    quote(&self.primary_key)
                )
            }
        })
    }

    pub fn delete(&self) -> String {
        self.memo("delete".to_string(), || {
            format!(
                "DELETE FROM {} WHERE {} = ?1",
                self.table,
                quote(&self.primary_key)
            )
        })
    }
}
