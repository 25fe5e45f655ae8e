//! Grep built-in.
//!
//! Case-insensitive substring search over UTF-8 files under the workspace.
//! Hidden entries and unreadable/binary files are skipped; matches are
//! reported as `path:line_number:line` and capped.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::cadre::error::CadreError;
use crate::cadre::tool::Tool;

/// Cap on reported matches.
const MAX_MATCHES: usize = 200;

/// Cap on files visited per search.
const MAX_FILES: usize = 2_000;

/// Searches workspace files for a substring.
pub struct GrepTool {
    root: PathBuf,
}

impl GrepTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) {
        if files.len() >= MAX_FILES {
            return;
        }
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| !n.starts_with('.'))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();
        for path in paths {
            if files.len() >= MAX_FILES {
                return;
            }
            if path.is_dir() {
                Self::collect_files(&path, files);
            } else {
                files.push(path);
            }
        }
    }
}

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "grep"
    }

    fn description(&self) -> &str {
        "Search workspace files for a substring (case-insensitive). Input: {\"pattern\": \"...\", \"path\": \"optional/subdir\"}. Returns path:line:text matches."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": {"type": "string", "description": "Substring to search for"},
                "path": {"type": "string", "description": "Optional subdirectory or file to search"}
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let pattern = input["pattern"]
            .as_str()
            .ok_or_else(|| CadreError::tool("grep", "missing required parameter 'pattern'"))?;
        if pattern.is_empty() {
            return Err(CadreError::tool("grep", "pattern must not be empty"));
        }
        let needle = pattern.to_lowercase();

        let start = match input["path"].as_str() {
            Some(sub) => {
                let joined = self.root.join(sub);
                let root_canonical = self.root.canonicalize().map_err(|e| {
                    CadreError::tool("grep", format!("cannot resolve workspace root: {}", e))
                })?;
                let canonical = joined
                    .canonicalize()
                    .map_err(|e| CadreError::tool("grep", format!("{}: {}", sub, e)))?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(CadreError::tool(
                        "grep",
                        format!("path '{}' escapes the workspace", sub),
                    ));
                }
                canonical
            }
            None => self.root.clone(),
        };

        let root = self.root.clone();
        let matches = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            if start.is_dir() {
                Self::collect_files(&start, &mut files);
            } else {
                files.push(start);
            }

            let mut matches = Vec::new();
            'files: for file in files {
                let content = match std::fs::read_to_string(&file) {
                    Ok(content) => content,
                    Err(_) => continue, // binary or unreadable
                };
                let display = file
                    .strip_prefix(&root)
                    .unwrap_or(&file)
                    .to_string_lossy()
                    .to_string();
                for (idx, line) in content.lines().enumerate() {
                    if line.to_lowercase().contains(&needle) {
                        matches.push(format!("{}:{}:{}", display, idx + 1, line));
                        if matches.len() >= MAX_MATCHES {
                            break 'files;
                        }
                    }
                }
            }
            matches
        })
        .await
        .map_err(|e| CadreError::tool("grep", format!("search task failed: {}", e)))?;

        if matches.is_empty() {
            Ok(format!("no matches for '{}'", pattern))
        } else {
            Ok(matches.join("\n"))
        }
    }
}
