//! Built-in and configuration-materialised tools.
//!
//! The core ships four built-ins (`read_file`, `write_file`, `shell`, and
//! `grep`), all sandboxed to a workspace directory.  [`builtin_registry`]
//! assembles them.  Crew configuration may add further tools that execute as
//! shell commands or HTTP calls; see [`custom`].

pub mod custom;
pub mod filesystem;
pub mod grep;
pub mod shell;

use std::path::Path;
use std::sync::Arc;

use crate::cadre::error::CadreError;
use crate::cadre::tool::ToolRegistry;

pub use custom::{CommandTool, HttpTool};
pub use filesystem::{ReadFileTool, WriteFileTool};
pub use grep::GrepTool;
pub use shell::ShellTool;

/// Registry holding the built-in tools, sandboxed under `workspace`.
pub fn builtin_registry(workspace: &Path) -> Result<ToolRegistry, CadreError> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ReadFileTool::new(workspace)))?;
    registry.register(Arc::new(WriteFileTool::new(workspace)))?;
    registry.register(Arc::new(ShellTool::new(workspace)))?;
    registry.register(Arc::new(GrepTool::new(workspace)))?;
    Ok(registry)
}
