//! Persistence layer: libSQL-backed record of messages and their outcomes.

pub mod libsql_backend;
pub mod migrations;

pub use libsql_backend::{LabelChange, LibSqlStore};
