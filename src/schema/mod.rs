//! Node type declarations and their mapping onto the backing store.

pub mod descriptor;
pub mod migrator;
pub mod naming;
pub mod registry;
pub mod stream;

pub use descriptor::{
    ForeignKey, ForeignKeyCatalog, IndexDef, NodeDefinition, NodeSchema, NodeSchemaBuilder, BY_ALL,
    BY_ID,
};
pub use migrator::{MigrationReport, Migrator};
pub use registry::SchemaRegistry;
pub use stream::{Presence, SqlType, Stream, StreamKind};
