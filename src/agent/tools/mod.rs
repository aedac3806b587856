pub mod base;
pub mod registry;

pub use base::{FnTool, Tool, ToolArgs};
pub use registry::{RESERVED_NAMES, ToolRegistry};
