//! Configuration-materialised tools.
//!
//! Crew configuration may declare additional tools beyond the built-ins.
//! Each declaration materialises as either a [`CommandTool`] (a shell-command
//! invocation that receives the tool input as `CADRE_TOOL_INPUT`) or an
//! [`HttpTool`] (an HTTP call carrying the input as JSON).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::cadre::config::{ToolConfig, ToolKind};
use crate::cadre::error::CadreError;
use crate::cadre::tool::Tool;

/// Default timeout for materialised tools.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Generic JSON-object schema used when a declaration ships no schema of its
/// own; the model is free to pass any object.
fn permissive_schema() -> serde_json::Value {
    json!({"type": "object", "additionalProperties": true})
}

/// Materialise one configured tool declaration.
pub fn materialize(config: &ToolConfig, workspace: &PathBuf) -> Arc<dyn Tool> {
    match &config.kind {
        ToolKind::Command { command } => Arc::new(CommandTool::new(
            config.name.as_str(),
            config.description.as_str(),
            command.as_str(),
            workspace.clone(),
        )),
        ToolKind::Http { method, url } => Arc::new(HttpTool::new(
            config.name.as_str(),
            config.description.as_str(),
            method.as_str(),
            url.as_str(),
        )),
    }
}

/// A tool that runs a configured shell command.
///
/// The raw JSON input is exported as `CADRE_TOOL_INPUT`; stdout is the tool
/// result, and a non-zero exit surfaces stderr as the error.
pub struct CommandTool {
    name: String,
    description: String,
    command: String,
    workspace: PathBuf,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        command: impl Into<String>,
        workspace: PathBuf,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            command: command.into(),
            workspace,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Override the execution timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        permissive_schema()
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let payload = serde_json::to_string(input)?;
        let run = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .env("CADRE_TOOL_INPUT", &payload)
            .current_dir(&self.workspace)
            .stdin(std::process::Stdio::null())
            .output();

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => {
                result.map_err(|e| CadreError::tool(self.name.as_str(), format!("spawn failed: {}", e)))?
            }
            Err(_) => {
                return Err(CadreError::tool(
                    &self.name,
                    format!("command exceeded the {}s timeout", self.timeout.as_secs()),
                ))
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(CadreError::tool(
                &self.name,
                format!(
                    "command exited with status {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            ))
        }
    }
}

/// A tool that forwards its input to an HTTP endpoint.
///
/// `POST`/`PUT` send the input as a JSON body; `GET` appends the object's
/// scalar fields as query parameters.  Status ≥ 400 and transport errors
/// surface as tool failures.
pub struct HttpTool {
    name: String,
    description: String,
    method: String,
    url: String,
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        method: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            method: method.into().to_uppercase(),
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        permissive_schema()
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let request = match self.method.as_str() {
            "GET" => {
                let mut request = self.client.get(&self.url);
                if let Some(object) = input.as_object() {
                    let query: Vec<(String, String)> = object
                        .iter()
                        .filter_map(|(k, v)| match v {
                            serde_json::Value::String(s) => Some((k.clone(), s.clone())),
                            serde_json::Value::Number(n) => Some((k.clone(), n.to_string())),
                            serde_json::Value::Bool(b) => Some((k.clone(), b.to_string())),
                            _ => None,
                        })
                        .collect();
                    request = request.query(&query);
                }
                request
            }
            "PUT" => self.client.put(&self.url).json(input),
            _ => self.client.post(&self.url).json(input),
        };

        let response = request
            .send()
            .await
            .map_err(|e| CadreError::tool(self.name.as_str(), format!("request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CadreError::tool(self.name.as_str(), format!("reading response failed: {}", e)))?;

        if status.as_u16() >= 400 {
            return Err(CadreError::tool(
                &self.name,
                format!("endpoint returned status {}: {}", status.as_u16(), body),
            ));
        }
        Ok(body)
    }
}
