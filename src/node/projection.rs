//! Attribute access.
//!
//! Declared streams read and write the active frame. Reference streams
//! resolve lazily to child nodes, reverse accessors to multi nodes of the
//! referencing type; both are memoized in the node's cache and the node
//! registers its interest with whatever it resolved to.

use super::cache::Cached;
use super::{coerce_for, Node};
use crate::error::{NodeError, NodeResult};
use crate::rpc::message::WireValue;
use crate::schema::ForeignKey;
use crate::store::Value;

/// Result of a read that may cross into another node
#[derive(Debug, Clone)]
pub enum Attribute {
    Value(Value),
    Node(Node),
    /// Unset nullable reference
    Missing,
}

impl Attribute {
    pub fn value(&self) -> Option<&Value> {
        match self {
            Attribute::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_node(self) -> Option<Node> {
        match self {
            Attribute::Node(n) => Some(n),
            _ => None,
        }
    }
}

/// One reverse accessor: referencing type, its stream, accessor name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseAccessor {
    pub name: String,
    pub node_type: String,
    pub stream: String,
}

impl Node {
    /// Value of a declared stream on the active row, or a derived property.
    /// Reference streams read as the raw primary key.
    pub fn get(&self, name: &str) -> NodeResult<Value> {
        self.require_local("get")?;
        let is_derived = {
            let state = self.state.borrow();
            if state.schema.has_stream(name) {
                let frame = state.window.active().ok_or_else(|| {
                    NodeError::Retrieval(format!("{} has no active row", state.schema.name()))
                })?;
                return Ok(frame.get(name));
            }
            state.schema.derived(name).is_some()
        };
        if is_derived {
            return self.derived(name);
        }
        Err(NodeError::Usage(format!(
            "{} has no attribute '{}'",
            self.type_name(),
            name
        )))
    }

    /// Write a declared stream on the active row. Nothing is persisted
    /// until [`Node::update`].
    pub fn set(&self, name: &str, value: impl Into<Value>) -> NodeResult<()> {
        let evicted = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            if state.is_remote() {
                return Err(NodeError::Integrity(format!(
                    "stream '{}' is not writable on a proxy",
                    name
                )));
            }
            let value = coerce_for(&state.schema, name, value.into())?;
            let frame = state.window.active_mut().ok_or_else(|| {
                NodeError::Retrieval(format!("{} has no active row", state.schema.name()))
            })?;
            frame.set(name, value);
            state.cache.invalidate(name, &state.schema)
        };
        drop(evicted);
        Ok(())
    }

    /// Point a reference stream at `child`, which must be persisted.
    pub fn set_node(&self, name: &str, child: &Node) -> NodeResult<()> {
        let target = {
            let state = self.state.borrow();
            let stream = state.schema.stream(name).ok_or_else(|| {
                NodeError::Usage(format!("{} has no stream '{}'", state.schema.name(), name))
            })?;
            stream.target().map(str::to_string).ok_or_else(|| {
                NodeError::Usage(format!("stream '{}' is not a reference", name))
            })?
        };
        if child.type_name() != target {
            return Err(NodeError::Integrity(format!(
                "'{}' references {}, not {}",
                name,
                target,
                child.type_name()
            )));
        }
        let id = child.id().ok_or_else(|| {
            NodeError::Integrity(format!("{} must be created before it is referenced", target))
        })?;
        self.set(name, Value::Integer(id))?;
        // A node holding a handle to itself would never be released.
        if child.same_instance(self) {
            return Ok(());
        }
        self.depend_on(child, name)?;
        let replaced = self
            .state
            .borrow_mut()
            .cache
            .insert(name, Cached::Node(child.clone()));
        drop(replaced);
        Ok(())
    }

    /// Lazily resolve a reference stream; `None` when a nullable reference
    /// is unset. Returns the same instance until the entry is invalidated.
    pub fn resolve(&self, name: &str) -> NodeResult<Option<Node>> {
        self.require_local("resolve")?;
        let (target, raw, required) = {
            let state = self.state.borrow();
            match state.cache.get(name) {
                Some(Cached::Node(node)) => return Ok(Some(node.clone())),
                Some(Cached::Absent) => return Ok(None),
                _ => {}
            }
            let stream = state.schema.stream(name).ok_or_else(|| {
                NodeError::Usage(format!("{} has no stream '{}'", state.schema.name(), name))
            })?;
            let target = stream.target().ok_or_else(|| {
                NodeError::Usage(format!("stream '{}' is not a reference", name))
            })?;
            let raw = state.window.active().map(|f| f.get(name)).ok_or_else(|| {
                NodeError::Retrieval(format!("{} has no active row", state.schema.name()))
            })?;
            (target.to_string(), raw, stream.is_required())
        };

        if raw.is_null() {
            if required {
                return Err(NodeError::Retrieval(format!(
                    "required reference '{}' is unset",
                    name
                )));
            }
            self.state.borrow_mut().cache.insert(name, Cached::Absent);
            return Ok(None);
        }
        let id = raw.as_i64().ok_or_else(|| {
            NodeError::Integrity(format!("reference '{}' holds {}", name, raw))
        })?;
        let child = Node::by_id(&self.ctx, &target, id)?;
        self.depend_on(&child, name)?;
        let replaced = self
            .state
            .borrow_mut()
            .cache
            .insert(name, Cached::Node(child.clone()));
        drop(replaced);
        Ok(Some(child))
    }

    /// Reverse accessors from the live foreign-key catalog. The first key
    /// from a referencing table is named after the table, later ones from
    /// the same table `<table>_<stream>`.
    pub fn reverse_accessors(&self) -> NodeResult<Vec<ReverseAccessor>> {
        let schema = self.schema();
        let catalog = schema.foreign_keys().ok_or_else(|| {
            NodeError::Usage(format!("foreign keys of {} are not loaded", schema.name()))
        })?;
        let mut accessors: Vec<ReverseAccessor> = Vec::new();
        for key in &catalog.reverse {
            let Some(referencing) = self.ctx.registry().by_table(&key.table) else {
                continue;
            };
            let Some(stream) = stream_for_key(&referencing, key) else {
                continue;
            };
            let name = if accessors.iter().any(|a| a.node_type == referencing.name()) {
                format!("{}_{}", key.table, stream)
            } else {
                key.table.clone()
            };
            accessors.push(ReverseAccessor {
                name,
                node_type: referencing.name().to_string(),
                stream,
            });
        }
        Ok(accessors)
    }

    /// Rows of another type referencing the active row, as a multi node.
    pub fn reverse(&self, name: &str) -> NodeResult<Node> {
        self.require_local("reverse")?;
        if let Some(Cached::Node(node)) = self.state.borrow().cache.get(name) {
            return Ok(node.clone());
        }
        let accessor = self
            .reverse_accessors()?
            .into_iter()
            .find(|a| a.name == name)
            .ok_or_else(|| {
                NodeError::Usage(format!("{} has no reverse accessor '{}'", self.type_name(), name))
            })?;
        let id = self.id().ok_or_else(|| {
            NodeError::Retrieval(format!("{} is not persisted", self.type_name()))
        })?;
        let children = Node::search(&self.ctx, &accessor.node_type)
            .index(&format!("by_{}", accessor.stream))
            .key(id)
            .allow_empty()
            .multi()
            .run()?;
        self.depend_on(&children, name)?;
        let replaced = self
            .state
            .borrow_mut()
            .cache
            .insert(name, Cached::Node(children.clone()));
        drop(replaced);
        Ok(children)
    }

    /// Value of a derived property, computed once per invalidation.
    pub fn derived(&self, name: &str) -> NodeResult<Value> {
        self.require_local("derived")?;
        let compute = {
            let state = self.state.borrow();
            if let Some(Cached::Value(v)) = state.cache.get(name) {
                return Ok(v.clone());
            }
            state.schema.derived(name).cloned().ok_or_else(|| {
                NodeError::Usage(format!("{} has no derived property '{}'", state.schema.name(), name))
            })?
        };
        let value = compute(self)?;
        self.state
            .borrow_mut()
            .cache
            .insert(name, Cached::Value(value.clone()));
        Ok(value)
    }

    /// Read any attribute: declared stream, reference, derived property or
    /// reverse accessor. Proxies forward the read to their remote node.
    pub async fn fetch(&self, name: &str) -> NodeResult<Attribute> {
        if self.is_proxy() {
            return self.fetch_remote(name).await;
        }
        self.local_attribute(name)
    }

    fn local_attribute(&self, name: &str) -> NodeResult<Attribute> {
        let (is_stream, is_reference, is_derived) = {
            let state = self.state.borrow();
            let stream = state.schema.stream(name);
            (
                stream.is_some(),
                stream.map_or(false, |s| s.is_reference()),
                state.schema.derived(name).is_some(),
            )
        };
        if is_reference {
            return Ok(self.resolve(name)?.map_or(Attribute::Missing, Attribute::Node));
        }
        if is_stream {
            return self.get(name).map(Attribute::Value);
        }
        if is_derived {
            return self.derived(name).map(Attribute::Value);
        }
        self.reverse(name).map(Attribute::Node)
    }

    /// Answer a `getstream` request.
    pub(crate) fn serve_attribute(&self, name: &str) -> NodeResult<WireValue> {
        self.require_local("getstream")?;
        Ok(match self.local_attribute(name)? {
            Attribute::Value(v) => WireValue::Scalar(v),
            Attribute::Node(n) => WireValue::Node(n.url().to_string()),
            Attribute::Missing => WireValue::Missing,
        })
    }
}

fn stream_for_key(referencing: &crate::schema::NodeSchema, key: &ForeignKey) -> Option<String> {
    referencing
        .streams()
        .iter()
        .find(|s| s.is_reference() && referencing.column_for(s, Some(key.referenced_table.as_str())) == key.column)
        .map(|s| s.name.clone())
}
