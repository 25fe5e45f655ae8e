//! Shell command built-in.
//!
//! Runs one command through `/bin/sh -c` in the workspace directory, with a
//! timeout and per-stream output caps.  On overflow or timeout the child is
//! killed before the error surfaces.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::cadre::error::CadreError;
use crate::cadre::tool::Tool;

/// Default timeout for a shell invocation.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Maximum bytes collected per stream.
const DEFAULT_MAX_OUTPUT: usize = 1024 * 1024;

/// Read from `reader`, failing once the stream exceeds `max_bytes`.
async fn read_limited<R: AsyncReadExt + Unpin>(
    mut reader: R,
    max_bytes: usize,
    stream_name: &'static str,
) -> Result<Vec<u8>, CadreError> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return Ok(buf),
            Ok(n) => {
                if buf.len() + n > max_bytes {
                    return Err(CadreError::tool(
                        "shell",
                        format!("{} exceeded the {} byte limit", stream_name, max_bytes),
                    ));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => return Err(CadreError::tool("shell", format!("{} read failed: {}", stream_name, e))),
        }
    }
}

/// Executes a shell command in the workspace.
pub struct ShellTool {
    workspace: PathBuf,
    timeout: Duration,
    max_output: usize,
}

impl ShellTool {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }

    /// Override the execution timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the per-stream output cap (builder pattern).
    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output = bytes;
        self
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command in the workspace directory. Input: {\"command\": \"ls -la\"}. Returns stdout; a non-zero exit reports stderr."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "The shell command to run"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let command = input["command"]
            .as_str()
            .ok_or_else(|| CadreError::tool("shell", "missing required parameter 'command'"))?;

        let max_output = self.max_output;
        let workspace = self.workspace.clone();
        let command_owned = command.to_string();

        let run = async move {
            let mut child = Command::new("/bin/sh")
                .arg("-c")
                .arg(&command_owned)
                .current_dir(&workspace)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| CadreError::tool("shell", format!("spawn failed: {}", e)))?;

            let stdout_pipe = child.stdout.take().expect("stdout was piped");
            let stderr_pipe = child.stderr.take().expect("stderr was piped");

            // Read both streams concurrently to avoid pipe-buffer deadlocks.
            let (stdout_result, stderr_result) = tokio::join!(
                read_limited(stdout_pipe, max_output, "stdout"),
                read_limited(stderr_pipe, max_output, "stderr"),
            );

            let (stdout_bytes, stderr_bytes) = match (stdout_result, stderr_result) {
                (Err(e), _) | (_, Err(e)) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return Err(e);
                }
                (Ok(out), Ok(err)) => (out, err),
            };

            let status = child
                .wait()
                .await
                .map_err(|e| CadreError::tool("shell", format!("wait failed: {}", e)))?;

            let stdout = String::from_utf8_lossy(&stdout_bytes).to_string();
            let stderr = String::from_utf8_lossy(&stderr_bytes).to_string();

            if status.success() {
                Ok(stdout)
            } else {
                Err(CadreError::tool(
                    "shell",
                    format!(
                        "command exited with status {}: {}",
                        status.code().unwrap_or(-1),
                        if stderr.is_empty() { stdout } else { stderr }
                    ),
                ))
            }
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(CadreError::tool(
                "shell",
                format!("command exceeded the {}s timeout", self.timeout.as_secs()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn captures_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellTool::new(dir.path());
        let out = shell
            .execute(&json!({"command": "printf 'hello from shell'"}))
            .await
            .unwrap();
        assert_eq!(out, "hello from shell");
    }

    #[tokio::test]
    async fn runs_in_workspace_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "here").unwrap();
        let shell = ShellTool::new(dir.path());
        let out = shell.execute(&json!({"command": "cat marker.txt"})).await.unwrap();
        assert_eq!(out, "here");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_tool_error() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellTool::new(dir.path());
        let err = shell
            .execute(&json!({"command": "echo boom >&2; exit 3"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "tool");
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let shell = ShellTool::new(dir.path()).with_timeout(Duration::from_millis(100));
        let err = shell.execute(&json!({"command": "sleep 5"})).await.unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }
}
