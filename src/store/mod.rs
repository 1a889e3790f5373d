//! Persistence layer: task storage and agent context lookup.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{NewTask, TaskPage, TaskRecord, TaskStore, TaskSummary, normalize_page};
