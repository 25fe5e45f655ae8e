//! Built-in hooks.
//!
//! Four subscribers ship with the core: a shell hook that hands events to an
//! external command, a webhook that POSTs them as JSON, a log hook that
//! writes a line through the `log` facade, and a pause hook that gates
//! execution on human input.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use crate::cadre::error::CadreError;
use crate::cadre::event::{Event, EventType, Hook};

/// Default timeout for webhook deliveries.
const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Runs a shell command for each event.
///
/// The event is exported through two environment variables:
/// `CADRE_EVENT_TYPE` (the wire name) and `CADRE_EVENT_JSON` (the full
/// payload).  stdout/stderr pass through to the parent process.
pub struct ShellHook {
    name: String,
    command: String,
    blocking: bool,
    filter: Vec<EventType>,
}

impl ShellHook {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            blocking: false,
            filter: Vec::new(),
        }
    }

    /// Make the hook blocking (builder pattern).
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Restrict the hook to specific event kinds (builder pattern).
    pub fn with_filter(mut self, filter: Vec<EventType>) -> Self {
        self.filter = filter;
        self
    }
}

#[async_trait]
impl Hook for ShellHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> Vec<EventType> {
        self.filter.clone()
    }

    fn blocking(&self) -> bool {
        self.blocking
    }

    async fn handle(&self, event: &Event) -> Result<(), CadreError> {
        let payload = serde_json::to_string(event)?;
        let status = tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(&self.command)
            .env("CADRE_EVENT_TYPE", event.event_type.as_str())
            .env("CADRE_EVENT_JSON", &payload)
            .stdin(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| CadreError::Io(format!("shell hook spawn failed: {}", e)))?;

        if !status.success() {
            return Err(CadreError::state(format!(
                "shell hook '{}' exited with status {}",
                self.name,
                status.code().unwrap_or(-1)
            )));
        }
        Ok(())
    }
}

/// POSTs each event as JSON to a URL.
///
/// Status ≥ 400 or a transport error is surfaced; combine with the blocking
/// flag to make delivery mandatory.
pub struct WebhookHook {
    name: String,
    url: String,
    blocking: bool,
    filter: Vec<EventType>,
    client: reqwest::Client,
}

impl WebhookHook {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_timeout(name, url, Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
    }

    /// Create a webhook with an explicit delivery timeout.
    pub fn with_timeout(
        name: impl Into<String>,
        url: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            blocking: false,
            filter: Vec::new(),
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
        }
    }

    /// Make the hook blocking (builder pattern).
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    /// Restrict the hook to specific event kinds (builder pattern).
    pub fn with_filter(mut self, filter: Vec<EventType>) -> Self {
        self.filter = filter;
        self
    }
}

#[async_trait]
impl Hook for WebhookHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> Vec<EventType> {
        self.filter.clone()
    }

    fn blocking(&self) -> bool {
        self.blocking
    }

    async fn handle(&self, event: &Event) -> Result<(), CadreError> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| CadreError::Network(format!("webhook '{}': {}", self.name, e)))?;
        let status = response.status().as_u16();
        if status >= 400 {
            return Err(CadreError::Api {
                status,
                message: format!("webhook '{}' delivery rejected", self.name),
            });
        }
        Ok(())
    }
}

/// Writes a structured line per event through the `log` facade.
/// Always non-blocking.
pub struct LogHook {
    name: String,
    level: log::Level,
    filter: Vec<EventType>,
}

impl LogHook {
    pub fn new(name: impl Into<String>, level: log::Level) -> Self {
        Self {
            name: name.into(),
            level,
            filter: Vec::new(),
        }
    }

    /// Restrict the hook to specific event kinds (builder pattern).
    pub fn with_filter(mut self, filter: Vec<EventType>) -> Self {
        self.filter = filter;
        self
    }
}

#[async_trait]
impl Hook for LogHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> Vec<EventType> {
        self.filter.clone()
    }

    async fn handle(&self, event: &Event) -> Result<(), CadreError> {
        log::log!(
            self.level,
            "event {} run={} data={}",
            event.event_type.as_str(),
            event.run_id().unwrap_or("-"),
            serde_json::to_string(&event.data).unwrap_or_default()
        );
        Ok(())
    }
}

/// Human-in-the-loop gate.  Always blocking: prints an interpolated message
/// to stderr and waits for one byte on stdin before letting the run continue.
///
/// The message template may reference `{type}`, `{run_id}`, and `{task}`.
pub struct PauseHook {
    name: String,
    message: String,
    filter: Vec<EventType>,
}

impl PauseHook {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            filter: Vec::new(),
        }
    }

    /// Restrict the hook to specific event kinds (builder pattern).
    pub fn with_filter(mut self, filter: Vec<EventType>) -> Self {
        self.filter = filter;
        self
    }

    fn interpolate(&self, event: &Event) -> String {
        let task = event
            .data
            .get("task")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        self.message
            .replace("{type}", event.event_type.as_str())
            .replace("{run_id}", event.run_id().unwrap_or("-"))
            .replace("{task}", task)
    }
}

#[async_trait]
impl Hook for PauseHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn filter(&self) -> Vec<EventType> {
        self.filter.clone()
    }

    fn blocking(&self) -> bool {
        true
    }

    async fn handle(&self, event: &Event) -> Result<(), CadreError> {
        eprintln!("{}", self.interpolate(event));
        eprint!("press enter to continue... ");
        let mut byte = [0u8; 1];
        tokio::io::stdin()
            .read(&mut byte)
            .await
            .map_err(|e| CadreError::Io(format!("pause hook read failed: {}", e)))?;
        Ok(())
    }
}
