use super::{Mode, Node, NodeState, Origin};
use crate::context::Context;
use crate::error::{NodeError, NodeResult};
use crate::schema::BY_ID;
use crate::store::{ReadOptions, SearchKey, SortDirection, StoreProxy, Value};
use std::collections::HashMap;

/// Builder for a search-backed node.
///
/// Defaults to a primary-key search. The resulting node is unique when the
/// index is the primary key or a unique index, multi otherwise, unless
/// [`Search::multi`] or [`Search::unique`] says so explicitly.
pub struct Search {
    ctx: Context,
    type_name: String,
    index: String,
    key: SearchKey,
    limit: Option<u64>,
    offset: u64,
    direction: SortDirection,
    options: ReadOptions,
    mode: Option<Mode>,
}

impl Search {
    pub(crate) fn new(ctx: &Context, type_name: &str) -> Self {
        Self {
            ctx: ctx.clone(),
            type_name: type_name.to_string(),
            index: BY_ID.to_string(),
            key: SearchKey::none(),
            limit: None,
            offset: 0,
            direction: SortDirection::Ascending,
            options: ReadOptions::default(),
            mode: None,
        }
    }

    /// Declared index, `by_all`, `by_<reference>` or a user statement
    pub fn index(mut self, name: &str) -> Self {
        self.index = name.to_string();
        self
    }

    /// Run a statement supplied by the node type
    pub fn statement(self, name: &str) -> Self {
        self.index(name)
    }

    pub fn key(mut self, key: impl Into<SearchKey>) -> Self {
        self.key = key.into();
        self
    }

    /// Take the search values from another node's active row.
    pub fn like(mut self, node: &Node) -> NodeResult<Self> {
        let frame = node.frame().ok_or_else(|| {
            NodeError::Retrieval(format!("{} has no active row to search by", node.type_name()))
        })?;
        if self.index == BY_ID {
            let id = frame.id.ok_or_else(|| {
                NodeError::Usage("an unpersisted node cannot be searched by primary key".into())
            })?;
            self.key = SearchKey::from(id);
            return Ok(self);
        }
        let schema = self.ctx.registry().get(&self.type_name)?;
        let streams = match schema.index(&self.index) {
            Some(def) => def.streams.clone(),
            None => self
                .index
                .strip_prefix("by_")
                .filter(|s| schema.has_stream(s))
                .map(|s| vec![s.to_string()])
                .ok_or_else(|| {
                    NodeError::Usage(format!("'{}' does not name its streams", self.index))
                })?,
        };
        let values: HashMap<String, Value> =
            streams.into_iter().map(|s| (s.clone(), frame.get(&s))).collect();
        self.key = SearchKey::Named(values);
        Ok(self)
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn direction(mut self, direction: SortDirection) -> Self {
        self.direction = direction;
        self
    }

    /// An empty result yields an empty node instead of a retrieval error
    pub fn allow_empty(mut self) -> Self {
        self.options.allow_empty = true;
        self
    }

    pub fn multi(mut self) -> Self {
        self.mode = Some(Mode::Multi);
        self
    }

    pub fn unique(mut self) -> Self {
        self.mode = Some(Mode::Unique);
        self
    }

    /// Read the rows and adopt the node into the context.
    pub fn run(self) -> NodeResult<Node> {
        let registry = self.ctx.registry();
        let schema = registry.get(&self.type_name)?;
        let statements = registry.statements(&self.type_name)?;
        let mut proxy = StoreProxy::new(schema.clone(), statements, &self.index, self.key)?;
        proxy.limit = self.limit;
        proxy.offset = self.offset;
        proxy.direction = self.direction;

        let mode = self.mode.unwrap_or(if schema.is_unique_index(&self.index) {
            Mode::Unique
        } else {
            Mode::Multi
        });
        let frames = proxy.read(self.ctx.db(), self.options)?;
        if mode == Mode::Unique && frames.len() > 1 {
            return Err(NodeError::Usage(format!(
                "{} {} matched {} rows for a unique node",
                schema.name(),
                self.index,
                frames.len()
            )));
        }
        Ok(self
            .ctx
            .adopt(NodeState::new(schema, mode, Origin::Store(proxy), frames)))
    }
}
