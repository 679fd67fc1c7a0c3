//! Node RPC: addressing, the wire protocol, the router and client, interest
//! bookkeeping and discoverability.

pub mod address;
pub(crate) mod client;
pub mod discovery;
pub mod message;
pub mod policy;
pub mod registrants;
pub(crate) mod router;

pub use address::{NodeId, NodeUrl};
pub use message::{Action, Args, Reply, Request, Status, WireValue};
pub use policy::AccessPolicy;
pub use registrants::Role;
