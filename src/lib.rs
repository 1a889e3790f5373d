//! Daigent: concurrent agent task runtime.

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod message;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod tools;
