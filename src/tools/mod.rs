//! Tools the agent can call, one per turn.

pub mod builtin;
pub mod catalog;
mod tool;

pub use catalog::ToolCatalog;
pub use tool::*;
