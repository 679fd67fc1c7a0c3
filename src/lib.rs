//! # livenode
//!
//! A node runtime that projects relational rows into typed node instances
//! with memoized references, live invalidation and RPC proxies.
//!
//! ## Core Components
//!
//! * `schema` - Node type declarations, naming rules and the schema migrator
//! * `store` - Values, frames, the SQL executor and generated statements
//! * `node` - Node instances: result windows, attribute projection and the cache
//! * `rpc` - Addressing, wire protocol, router, registrants and discovery
//! * `context` - The process context: routing table, notification scopes, housekeeping
//! * `config` - Runtime configuration loaded from TOML
//! * `error` - Error types and handling
//!
//! ## Architecture
//!
//! A [`Context`] owns the database connection and the registered node types.
//! Searches build [`Node`] instances over the rows they match. Attributes that
//! reference other nodes are resolved lazily and cached; the referenced node
//! records the referencing node as a registrant, so that a write to it clears
//! the stale cache entry and the change propagates to everything depending
//! on it, across processes when the nodes live elsewhere.
//!
//! Everything runs on a single-threaded tokio runtime inside a
//! [`tokio::task::LocalSet`].

pub mod config;
pub mod context;
pub mod error;
pub mod node;
pub mod rpc;
pub mod schema;
pub mod store;

// Re-export main types for convenience
pub use config::RuntimeConfig;
pub use context::{Context, ContextBuilder, NotificationScope};
pub use error::{NodeError, NodeResult};
pub use node::{Attribute, Mode, Node, Search};
pub use rpc::{AccessPolicy, NodeId, NodeUrl};
pub use schema::{IndexDef, NodeDefinition, NodeSchema, SqlType, Stream};
pub use store::{Frame, ReadOptions, SearchKey, SortDirection, Value};
