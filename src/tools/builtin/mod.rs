//! Built-in tools: workspace file access and the human-in-the-loop pair.

pub mod file;
pub mod interaction;

pub use file::ReadFileTool;
pub use interaction::{AskUserTool, FinishTaskTool};
