//! File read/write built-ins.
//!
//! Both tools are sandboxed: every path is resolved relative to the
//! workspace root and rejected if it escapes it (`../../../etc/passwd`
//! style traversal).  Symlinks are resolved before the containment check.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::cadre::error::CadreError;
use crate::cadre::tool::Tool;

/// Cap on bytes returned by `read_file`.
const MAX_READ_BYTES: u64 = 512 * 1024;

/// Resolve `requested` under `root`, rejecting escapes.
///
/// Paths that do not exist yet (write targets) are checked via their nearest
/// existing ancestor so symlinked parents cannot smuggle a write outside the
/// root.
fn resolve_sandboxed(root: &Path, requested: &str) -> Result<PathBuf, CadreError> {
    if requested.is_empty() {
        return Err(CadreError::tool("filesystem", "path must not be empty"));
    }
    let candidate = Path::new(requested);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let root_canonical = root
        .canonicalize()
        .map_err(|e| CadreError::tool("filesystem", format!("cannot resolve workspace root: {}", e)))?;

    let to_check = if joined.exists() {
        joined
            .canonicalize()
            .map_err(|e| CadreError::tool("filesystem", format!("cannot resolve path: {}", e)))?
    } else {
        // Canonicalize the nearest existing ancestor and re-attach the
        // non-existent suffix.
        let mut ancestor = joined.parent().map(Path::to_path_buf);
        let mut suffix = vec![joined.file_name().map(|n| n.to_os_string())];
        let canonical_parent = loop {
            match &ancestor {
                Some(dir) if dir.exists() => {
                    break dir.canonicalize().map_err(|e| {
                        CadreError::tool("filesystem", format!("cannot resolve parent: {}", e))
                    })?;
                }
                Some(dir) => {
                    suffix.push(dir.file_name().map(|n| n.to_os_string()));
                    ancestor = dir.parent().map(Path::to_path_buf);
                }
                None => break root_canonical.clone(),
            }
        };
        let mut rebuilt = canonical_parent;
        for part in suffix.into_iter().rev().flatten() {
            rebuilt.push(part);
        }
        rebuilt
    };

    if !to_check.starts_with(&root_canonical) {
        return Err(CadreError::tool(
            "filesystem",
            format!("path '{}' escapes the workspace", requested),
        ));
    }
    Ok(to_check)
}

/// Reads a UTF-8 file from the workspace.
pub struct ReadFileTool {
    root: PathBuf,
}

impl ReadFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 text file from the workspace. Input: {\"path\": \"relative/or/absolute/path\"}."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Path of the file to read"}
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let path = input["path"]
            .as_str()
            .ok_or_else(|| CadreError::tool("read_file", "missing required parameter 'path'"))?;
        let resolved = resolve_sandboxed(&self.root, path)?;

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| CadreError::tool("read_file", format!("{}: {}", path, e)))?;
        if metadata.is_dir() {
            return Err(CadreError::tool("read_file", format!("{} is a directory", path)));
        }
        if metadata.len() > MAX_READ_BYTES {
            return Err(CadreError::tool(
                "read_file",
                format!("{} is larger than the {} byte read limit", path, MAX_READ_BYTES),
            ));
        }
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| CadreError::tool("read_file", format!("{}: {}", path, e)))
    }
}

/// Writes a UTF-8 file into the workspace, creating parent directories.
pub struct WriteFileTool {
    root: PathBuf,
}

impl WriteFileTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 text file inside the workspace, creating parent directories. Input: {\"path\": \"...\", \"content\": \"...\"}."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "description": "Destination path"},
                "content": {"type": "string", "description": "File content to write"}
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let path = input["path"]
            .as_str()
            .ok_or_else(|| CadreError::tool("write_file", "missing required parameter 'path'"))?;
        let content = input["content"]
            .as_str()
            .ok_or_else(|| CadreError::tool("write_file", "missing required parameter 'content'"))?;
        let resolved = resolve_sandboxed(&self.root, path)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CadreError::tool("write_file", format!("{}: {}", path, e)))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| CadreError::tool("write_file", format!("{}: {}", path, e)))?;
        Ok(format!("wrote {} bytes to {}", content.len(), path))
    }
}
