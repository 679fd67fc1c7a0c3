//! The process context.
//!
//! One [`Context`] is built at startup and handed to everything that needs
//! the database, the registered node types, the routing table or the
//! configuration. Clones are cheap and share state.
//!
//! The routing table doubles as the node arena: every live node instance
//! has a slot holding its state and a keepalive count equal to the number of
//! [`Node`] handles in existence. When the count reaches zero the slot is
//! removed and the node is torn down explicitly.
//!
//! The router socket is bound when the context is built, so a node's URL
//! never changes over its life. [`Context::start`] begins serving it.
//!
//! Background work (router, deferred-removal sweep, heartbeats) runs on
//! `tokio::task::spawn_local`, so a started context must live inside a
//! [`tokio::task::LocalSet`].

use crate::config::RuntimeConfig;
use crate::error::{NodeError, NodeResult};
use crate::node::{Node, NodeState};
use crate::rpc::address::{NodeId, NodeUrl};
use crate::rpc::message::{Action, Args};
use crate::rpc::{client, registrants, router};
use crate::schema::{MigrationReport, Migrator, NodeDefinition, NodeSchema, SchemaRegistry};
use crate::store::Database;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Called when the process can no longer trust its distributed state.
pub type FatalHandler = Rc<dyn Fn(&str)>;

/// Exit status used by the default fatal handler
pub const FATAL_EXIT_CODE: i32 = 70;

fn default_fatal_handler() -> FatalHandler {
    Rc::new(|reason: &str| {
        error!("unrecoverable state, terminating: {}", reason);
        std::process::exit(FATAL_EXIT_CODE);
    })
}

/// A notification waiting to be delivered
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Outbound {
    /// Local node on whose behalf the call is made
    pub(crate) sender: Option<NodeId>,
    pub(crate) target: String,
    pub(crate) action: Action,
    pub(crate) args: Args,
}

impl Outbound {
    fn same_slot(&self, other: &Outbound) -> bool {
        self.target == other.target
            && self.action == other.action
            && self.args.stream == other.args.stream
            && self.sender == other.sender
    }
}

struct Slot {
    state: Rc<RefCell<NodeState>>,
    keepalive: usize,
}

pub(crate) struct ContextInner {
    config: RuntimeConfig,
    db: Database,
    registry: SchemaRegistry,
    arena: RefCell<HashMap<NodeId, Slot>>,
    next_id: Cell<u64>,
    endpoint: String,
    /// Bound but not yet served; taken by `start`
    listener: RefCell<Option<std::net::TcpListener>>,
    scope_depth: Cell<usize>,
    pending: RefCell<Vec<Outbound>>,
    deferred: RefCell<VecDeque<Outbound>>,
    fatal: FatalHandler,
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

pub(crate) type WeakContext = Weak<ContextInner>;

/// Shared handle to the process context
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("context", &self.inner.config.context)
            .field("endpoint", &self.endpoint())
            .field("live_nodes", &self.live_nodes())
            .finish()
    }
}

/// Collects node types and hooks before the context is built
pub struct ContextBuilder {
    config: RuntimeConfig,
    registry: SchemaRegistry,
    fatal: Option<FatalHandler>,
}

impl ContextBuilder {
    /// Register a node type described at runtime
    pub fn register(mut self, schema: NodeSchema) -> NodeResult<Self> {
        self.registry.register(schema)?;
        Ok(self)
    }

    /// Register a statically declared node type
    pub fn register_type<T: NodeDefinition>(self) -> NodeResult<Self> {
        let schema = T::schema()?;
        self.register(schema)
    }

    /// Replace the default fatal handler (log and exit)
    pub fn on_fatal(mut self, handler: impl Fn(&str) + 'static) -> Self {
        self.fatal = Some(Rc::new(handler));
        self
    }

    /// Open the database and migrate every registered type.
    pub fn build(self) -> NodeResult<Context> {
        self.config.validate()?;
        let db = Database::open(&self.config)?;
        let listener = std::net::TcpListener::bind(&self.config.rpc.listen_address)?;
        listener.set_nonblocking(true)?;
        let endpoint = listener.local_addr()?.to_string();
        let report = Migrator::new(&db, &self.registry).migrate_all()?;
        if !report.is_empty() {
            info!(
                "migrated context '{}': {} table(s), {} column(s), {} index(es)",
                self.config.context,
                report.created_tables.len(),
                report.added_columns.len(),
                report.created_indices.len()
            );
        }
        Ok(Context {
            inner: Rc::new(ContextInner {
                config: self.config,
                db,
                registry: self.registry,
                arena: RefCell::new(HashMap::new()),
                next_id: Cell::new(1),
                endpoint,
                listener: RefCell::new(Some(listener)),
                scope_depth: Cell::new(0),
                pending: RefCell::new(Vec::new()),
                deferred: RefCell::new(VecDeque::new()),
                fatal: self.fatal.unwrap_or_else(default_fatal_handler),
                tasks: RefCell::new(Vec::new()),
            }),
        })
    }
}

impl Context {
    pub fn builder(config: RuntimeConfig) -> ContextBuilder {
        ContextBuilder {
            registry: SchemaRegistry::new(&config.context),
            config,
            fatal: None,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.inner.registry
    }

    pub fn environment_id(&self) -> &str {
        &self.inner.config.environment_id
    }

    /// Run `f` in the global transaction.
    pub fn transaction<T>(&self, f: impl FnOnce(&Database) -> NodeResult<T>) -> NodeResult<T> {
        self.inner.db.transaction(f)
    }

    /// Re-run the migration over every registered type.
    pub fn migrate(&self) -> NodeResult<MigrationReport> {
        Migrator::new(&self.inner.db, &self.inner.registry).migrate_all()
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &WeakContext) -> Option<Context> {
        weak.upgrade().map(|inner| Context { inner })
    }

    pub fn ptr_eq(&self, other: &Context) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- routing table / arena ----

    pub(crate) fn adopt(&self, state: NodeState) -> Node {
        let id = self.allocate_id();
        self.adopt_as(id, state)
    }

    pub(crate) fn allocate_id(&self) -> NodeId {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);
        NodeId(id)
    }

    pub(crate) fn adopt_as(&self, id: NodeId, state: NodeState) -> Node {
        let state = Rc::new(RefCell::new(state));
        self.inner.arena.borrow_mut().insert(
            id,
            Slot {
                state: Rc::clone(&state),
                keepalive: 1,
            },
        );
        Node::from_parts(self.clone(), id, state)
    }

    pub(crate) fn retain(&self, id: NodeId) {
        if let Some(slot) = self.inner.arena.borrow_mut().get_mut(&id) {
            slot.keepalive += 1;
        }
    }

    /// Drop one keepalive; hands back the state once the last one is gone.
    pub(crate) fn release(&self, id: NodeId) -> Option<Rc<RefCell<NodeState>>> {
        let mut arena = self.inner.arena.borrow_mut();
        let slot = arena.get_mut(&id)?;
        slot.keepalive = slot.keepalive.saturating_sub(1);
        if slot.keepalive > 0 {
            return None;
        }
        arena.remove(&id).map(|slot| slot.state)
    }

    /// A new handle to a live node
    pub(crate) fn handle(&self, id: NodeId) -> Option<Node> {
        let state = self
            .inner
            .arena
            .borrow()
            .get(&id)
            .map(|slot| Rc::clone(&slot.state))?;
        self.retain(id);
        Some(Node::from_parts(self.clone(), id, state))
    }

    /// Handle to a node of this process addressed by URL
    pub(crate) fn local_node(&self, url: &str) -> Option<Node> {
        let url: NodeUrl = url.parse().ok()?;
        if !self.is_own_endpoint(&url.endpoint) {
            return None;
        }
        self.handle(url.node)
    }

    /// Number of node instances currently routable
    pub fn live_nodes(&self) -> usize {
        self.inner.arena.borrow().len()
    }

    pub fn keepalive(&self, id: NodeId) -> usize {
        self.inner.arena.borrow().get(&id).map_or(0, |slot| slot.keepalive)
    }

    // ---- endpoint ----

    /// Router address, bound when the context was built
    pub fn endpoint(&self) -> String {
        self.inner.endpoint.clone()
    }

    pub fn is_started(&self) -> bool {
        self.inner.listener.borrow().is_none()
    }

    pub(crate) fn is_own_endpoint(&self, endpoint: &str) -> bool {
        self.inner.endpoint == endpoint
    }

    pub fn url_of(&self, id: NodeId) -> NodeUrl {
        NodeUrl::new(&self.inner.endpoint, id)
    }

    /// Serve the router and start the deferred-removal sweep.
    ///
    /// Returns the endpoint; calling it again is a no-op.
    pub async fn start(&self) -> NodeResult<String> {
        let bound = match self.inner.listener.borrow_mut().take() {
            Some(bound) => bound,
            None => return Ok(self.endpoint()),
        };
        let listener = TcpListener::from_std(bound)?;
        info!("context '{}' routing on {}", self.inner.config.context, self.inner.endpoint);

        let router = tokio::task::spawn_local(router::serve(self.downgrade(), listener));
        let sweeper = tokio::task::spawn_local(sweep_loop(
            self.downgrade(),
            self.inner.config.sweep_interval(),
        ));
        self.inner.tasks.borrow_mut().extend([router, sweeper]);
        Ok(self.endpoint())
    }

    pub(crate) fn fatal(&self, reason: &str) {
        (self.inner.fatal)(reason)
    }

    // ---- outbound notifications ----

    /// Open a scope that holds back and coalesces notifications until
    /// [`NotificationScope::flush`].
    pub fn notification_scope(&self) -> NotificationScope {
        self.inner.scope_depth.set(self.inner.scope_depth.get() + 1);
        NotificationScope {
            ctx: self.clone(),
            open: true,
        }
    }

    /// Notifications held back by open scopes
    pub fn pending_notifications(&self) -> usize {
        self.inner.pending.borrow().len()
    }

    /// Send, or hold back while a scope is open.
    pub(crate) async fn send(&self, outbound: Vec<Outbound>) -> NodeResult<()> {
        if outbound.is_empty() {
            return Ok(());
        }
        if self.inner.scope_depth.get() > 0 {
            let mut pending = self.inner.pending.borrow_mut();
            for message in outbound {
                coalesce(&mut pending, message);
            }
            return Ok(());
        }
        self.deliver(outbound).await
    }

    async fn deliver(&self, outbound: Vec<Outbound>) -> NodeResult<()> {
        let results = join_all(
            outbound
                .iter()
                .map(|m| client::call(self, &m.target, m.action, m.args.clone())),
        )
        .await;
        let mut first_error = None;
        for (message, result) in outbound.iter().zip(results) {
            match result {
                Ok(_) => {}
                Err(NodeError::Dead(reason)) => {
                    debug!("{} is dead ({}), dropping it", message.target, reason);
                    if let Some(sender) = message.sender {
                        registrants::drop_registrant(self, sender, &message.target);
                    }
                }
                Err(e) => {
                    warn!("{:?} to {} failed: {}", message.action, message.target, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ---- deferred removal ----

    /// Queue a best-effort notification for the sweep task.
    pub(crate) fn defer(&self, message: Outbound) {
        let capacity = self.inner.config.housekeeping.deferred_queue_capacity;
        push_bounded(&mut self.inner.deferred.borrow_mut(), capacity, message);
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.deferred.borrow().len()
    }

    /// Deliver everything in the deferred queue; failures are dropped.
    pub async fn sweep(&self) -> usize {
        let batch: Vec<Outbound> = self.inner.deferred.borrow_mut().drain(..).collect();
        if batch.is_empty() {
            return 0;
        }
        let results = join_all(
            batch
                .iter()
                .map(|m| client::call(self, &m.target, m.action, m.args.clone())),
        )
        .await;
        for (message, result) in batch.iter().zip(results) {
            if let Err(e) = result {
                debug!("deferred {:?} to {} dropped: {}", message.action, message.target, e);
            }
        }
        batch.len()
    }
}

/// Append to a queue holding at most `capacity` messages (at least one),
/// dropping the oldest on overflow.
fn push_bounded(queue: &mut VecDeque<Outbound>, capacity: usize, message: Outbound) {
    if queue.len() >= capacity.max(1) {
        if let Some(dropped) = queue.pop_front() {
            warn!("deferred queue full, dropping {:?} to {}", dropped.action, dropped.target);
        }
    }
    queue.push_back(message);
}

fn coalesce(pending: &mut Vec<Outbound>, message: Outbound) {
    match pending.iter_mut().find(|p| p.same_slot(&message)) {
        Some(existing) => {
            for stream in message.args.origin {
                if !existing.args.origin.contains(&stream) {
                    existing.args.origin.push(stream);
                }
            }
            for url in message.args.trail {
                if !existing.args.trail.contains(&url) {
                    existing.args.trail.push(url);
                }
            }
        }
        None => pending.push(message),
    }
}

async fn sweep_loop(ctx: WeakContext, interval: std::time::Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let ctx = match Context::upgrade(&ctx) {
            Some(ctx) => ctx,
            None => break,
        };
        let swept = ctx.sweep().await;
        if swept > 0 {
            debug!("swept {} deferred notification(s)", swept);
        }
    }
}

/// Guard returned by [`Context::notification_scope`].
///
/// Dropping it without flushing hands the held notifications to the
/// deferred queue.
pub struct NotificationScope {
    ctx: Context,
    open: bool,
}

impl NotificationScope {
    /// Close the scope; the outermost scope sends everything held back.
    pub async fn flush(mut self) -> NodeResult<()> {
        self.open = false;
        match self.close() {
            Some(pending) => self.ctx.deliver(pending).await,
            None => Ok(()),
        }
    }

    fn close(&self) -> Option<Vec<Outbound>> {
        let inner = &self.ctx.inner;
        let depth = inner.scope_depth.get().saturating_sub(1);
        inner.scope_depth.set(depth);
        if depth > 0 {
            return None;
        }
        Some(std::mem::take(&mut *inner.pending.borrow_mut()))
    }
}

impl Drop for NotificationScope {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        if let Some(pending) = self.close() {
            for message in pending {
                self.ctx.defer(message);
            }
        }
    }
}
