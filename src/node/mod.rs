//! Node instances.
//!
//! A [`Node`] projects zero, one or many backing rows of a registered type.
//! It is a handle into the context's node arena: clones share one instance,
//! and the instance is torn down when the last handle goes away.
//!
//! Reads of local attributes are synchronous. Anything that may talk to
//! other nodes over RPC (`update`, `delete`, `refresh`, `fetch`, proxies) is
//! async and must run on the context's `LocalSet`.

pub mod cache;
pub mod identity;
mod lifecycle;
pub mod projection;
mod remote;
pub mod search;
pub mod window;

pub use cache::{Cached, NodeCache};
pub use projection::Attribute;
pub use search::Search;
pub use window::ResultWindow;

use crate::context::{Context, Outbound};
use crate::error::{NodeError, NodeResult};
use crate::rpc::address::{NodeId, NodeUrl};
use crate::rpc::discovery::{self, Discoverable};
use crate::rpc::message::{Action, Args};
use crate::rpc::registrants::{self, Registrants};
use crate::schema::{NodeSchema, StreamKind, BY_ALL};
use crate::store::{Frame, StoreProxy, Value};
use log::{debug, warn};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Row cardinality of a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Exactly one row, or none
    Unique,
    /// An iterable window of rows
    Multi,
}

/// Filter predicate kept on a node and re-applied after every read
pub type Predicate = Rc<dyn Fn(&Node) -> bool>;

/// Where a node's rows come from
#[derive(Debug)]
pub(crate) enum Origin {
    /// Built in memory, never persisted
    Memory,
    /// Backed by a search against the store
    Store(StoreProxy),
    /// Proxy of a node hosted elsewhere
    Remote(NodeUrl),
}

#[derive(Default)]
pub(crate) struct RpcState {
    pub(crate) registrants: Registrants,
    /// URLs of nodes holding a registration made by this node
    pub(crate) upstream: Vec<String>,
    pub(crate) discoverable: Option<Discoverable>,
    /// Row id of this node's listener registration
    pub(crate) listening: Option<i64>,
}

pub(crate) struct NodeState {
    pub(crate) schema: Rc<NodeSchema>,
    pub(crate) mode: Mode,
    pub(crate) origin: Origin,
    pub(crate) window: ResultWindow,
    pub(crate) filters: Vec<Predicate>,
    pub(crate) cache: NodeCache,
    pub(crate) rpc: RpcState,
}

impl NodeState {
    pub(crate) fn new(schema: Rc<NodeSchema>, mode: Mode, origin: Origin, frames: Vec<Frame>) -> Self {
        Self {
            schema,
            mode,
            origin,
            window: ResultWindow::new(frames),
            filters: Vec::new(),
            cache: NodeCache::default(),
            rpc: RpcState::default(),
        }
    }

    pub(crate) fn is_unique(&self) -> bool {
        self.mode == Mode::Unique
    }

    pub(crate) fn is_remote(&self) -> bool {
        matches!(self.origin, Origin::Remote(_))
    }
}

/// Handle to a node instance
pub struct Node {
    pub(crate) ctx: Context,
    pub(crate) id: NodeId,
    pub(crate) state: Rc<RefCell<NodeState>>,
}

impl Node {
    pub(crate) fn from_parts(ctx: Context, id: NodeId, state: Rc<RefCell<NodeState>>) -> Self {
        Self { ctx, id, state }
    }

    /// An unpersisted node; stream defaults are filled in first.
    pub fn new<'a, I>(ctx: &Context, type_name: &str, values: I) -> NodeResult<Node>
    where
        I: IntoIterator<Item = (&'a str, Value)>,
    {
        let schema = ctx.registry().get(type_name)?;
        let mut frame = Frame::new();
        for stream in schema.streams() {
            if let Some(default) = stream.default_value() {
                frame.set(&stream.name, default.clone());
            }
        }
        for (name, value) in values {
            let value = coerce_for(&schema, name, value)?;
            frame.set(name, value);
        }
        Ok(ctx.adopt(NodeState::new(schema, Mode::Unique, Origin::Memory, vec![frame])))
    }

    /// Start a search over the rows of `type_name`
    pub fn search(ctx: &Context, type_name: &str) -> Search {
        Search::new(ctx, type_name)
    }

    pub fn by_id(ctx: &Context, type_name: &str, id: i64) -> NodeResult<Node> {
        Search::new(ctx, type_name).key(id).run()
    }

    /// Every row of a type; empty tables give an empty window
    pub fn all(ctx: &Context, type_name: &str) -> NodeResult<Node> {
        Search::new(ctx, type_name).index(BY_ALL).allow_empty().run()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Process-unique id of this instance
    pub fn node_id(&self) -> NodeId {
        self.id
    }

    pub fn url(&self) -> NodeUrl {
        self.ctx.url_of(self.id)
    }

    pub fn type_name(&self) -> String {
        self.state.borrow().schema.name().to_string()
    }

    pub fn schema(&self) -> Rc<NodeSchema> {
        Rc::clone(&self.state.borrow().schema)
    }

    pub fn mode(&self) -> Mode {
        self.state.borrow().mode
    }

    pub fn is_unique(&self) -> bool {
        self.state.borrow().is_unique()
    }

    pub fn is_proxy(&self) -> bool {
        self.state.borrow().is_remote()
    }

    /// Whether the node is backed by a store search
    pub fn is_persisted(&self) -> bool {
        matches!(self.state.borrow().origin, Origin::Store(_))
    }

    /// Primary key of the active row
    pub fn id(&self) -> Option<i64> {
        self.state.borrow().window.active().and_then(|f| f.id)
    }

    /// Copy of the active row
    pub fn frame(&self) -> Option<Frame> {
        self.state.borrow().window.active().cloned()
    }

    /// Copies of the rows in the window
    pub fn frames(&self) -> Vec<Frame> {
        self.state.borrow().window.frames().cloned().collect()
    }

    /// Rows in the window
    pub fn len(&self) -> usize {
        self.state.borrow().window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the attributes currently memoized
    pub fn cached(&self) -> Vec<String> {
        self.state.borrow().cache.keys()
    }

    /// Whether both handles point at the same instance
    pub fn same_instance(&self, other: &Node) -> bool {
        self.id == other.id && self.ctx.ptr_eq(&other.ctx)
    }

    fn require_local(&self, operation: &str) -> NodeResult<()> {
        match &self.state.borrow().origin {
            Origin::Remote(url) => Err(NodeError::Usage(format!(
                "{} is a proxy of {}; use fetch() instead of {}",
                self.id, url, operation
            ))),
            _ => Ok(()),
        }
    }

    fn require_multi(&self, operation: &str) -> NodeResult<()> {
        let state = self.state.borrow();
        if state.is_unique() {
            return Err(NodeError::Usage(format!(
                "cannot {} unique {} node",
                operation,
                state.schema.name()
            )));
        }
        Ok(())
    }
}

/// Check `value` against the declared stream `name` and coerce it.
pub(crate) fn coerce_for(schema: &NodeSchema, name: &str, value: Value) -> NodeResult<Value> {
    let stream = schema
        .stream(name)
        .ok_or_else(|| NodeError::Usage(format!("{} has no stream '{}'", schema.name(), name)))?;
    match &stream.kind {
        StreamKind::Scalar(sql_type) => Ok(sql_type.coerce(value)),
        StreamKind::Reference(target) => match value {
            Value::Null | Value::Integer(_) => Ok(value),
            other => Err(NodeError::Integrity(format!(
                "reference '{}' to {} takes a primary key, got {}",
                name, target, other
            ))),
        },
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        self.ctx.retain(self.id);
        Self {
            ctx: self.ctx.clone(),
            id: self.id,
            state: Rc::clone(&self.state),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Some(state) = self.ctx.release(self.id) {
            teardown(&self.ctx, self.id, &state);
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_borrow() {
            Ok(state) => write!(
                f,
                "Node({} {:?} #{} rows={})",
                state.schema.name(),
                state.mode,
                self.id,
                state.window.len()
            ),
            Err(_) => write!(f, "Node(#{})", self.id),
        }
    }
}

/// Deregister a node whose last handle is gone.
fn teardown(ctx: &Context, id: NodeId, state: &Rc<RefCell<NodeState>>) {
    let url = ctx.url_of(id).to_string();
    let (evicted, discoverable, listening, upstream) = match state.try_borrow_mut() {
        Ok(mut state) => (
            state.cache.clear(),
            state.rpc.discoverable.take(),
            state.rpc.listening.take(),
            std::mem::take(&mut state.rpc.upstream),
        ),
        Err(_) => {
            warn!("node {} dropped while borrowed; skipping deregistration", id);
            return;
        }
    };

    for target in upstream {
        match ctx.local_node(&target) {
            Some(local) => {
                if let Err(e) = local.remove_registrant(&url) {
                    warn!("could not drop {} from {}: {}", url, target, e);
                }
            }
            None => ctx.defer(Outbound {
                sender: None,
                target,
                action: Action::Deregister,
                args: Args {
                    url: Some(url.clone()),
                    ..Default::default()
                },
            }),
        }
    }
    if let Some(discoverable) = discoverable {
        discovery::withdraw(ctx, discoverable);
    }
    if let Some(row) = listening {
        discovery::forget_row(ctx, row);
    }
    if let Err(e) = registrants::unpersist_owner(ctx.db(), &url) {
        warn!("could not clear registrations of {}: {}", url, e);
    }
    drop(evicted);
    debug!("released node {}", id);
}
