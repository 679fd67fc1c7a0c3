//! Relational projection layer: values, frames, the SQL executor, generated
//! statements and the per-node store proxy.

pub mod database;
pub mod frame;
pub mod proxy;
pub mod statements;
pub mod value;

pub use database::{ColumnInfo, Database, SqlRow};
pub use frame::Frame;
pub use proxy::{ReadOptions, SearchKey, StoreProxy};
pub use statements::{SortDirection, StatementTable};
pub use value::Value;
