//! Persistence layer: libSQL-backed storage for configs, rules, messages,
//! logs and operations.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
