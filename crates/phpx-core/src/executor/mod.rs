//! Orchestration of resolution, proxying, and sandboxed execution.

pub mod script;
pub mod tool;

pub use script::{run_script, ScriptOptions};
pub use tool::{run_tool, ToolOptions};
