//! Crate-wide error type.
//!
//! Every fallible operation in cadre returns [`CadreError`].  The enum mirrors
//! the runtime's error taxonomy: configuration problems are fatal at load
//! time, transient upstream failures are retryable, cancellation propagates
//! immediately, and tool failures stay local to the agent turn that caused
//! them.  Callers dispatch on [`CadreError::code`] (a stable string) or the
//! `is_*` predicates instead of pattern-matching display messages.

use std::error::Error;
use std::fmt;

/// API status codes that the retry decorator treats as transient.
const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 529];

/// All errors surfaced by the cadre runtime.
#[derive(Debug, Clone)]
pub enum CadreError {
    /// Invalid crew/agent/task declaration. Fatal at load time.
    Config(String),
    /// A provider was referenced but no client (or key) was registered for it.
    MissingCredential { provider: String },
    /// Upstream API returned a status code. Retryable for 429/5xx classes.
    Api { status: u16, message: String },
    /// Transport-level failure talking to an upstream service. Retryable.
    Network(String),
    /// An agent loop or retry loop hit its bound.
    IterationExhausted { scope: String, limit: usize },
    /// A tool returned an error or raised.
    Tool { tool: String, message: String },
    /// A tool name was looked up that is not registered.
    UnknownTool { tool: String },
    /// The run's cancellation token fired.
    Cancelled,
    /// A task or crew deadline elapsed.
    DeadlineExceeded,
    /// Run-state persistence or an illegal state transition failed.
    State(String),
    /// JSON (de)serialization failure.
    Json(String),
    /// Filesystem or process I/O failure.
    Io(String),
}

impl CadreError {
    /// Shorthand for a [`CadreError::Config`].
    pub fn config(message: impl Into<String>) -> Self {
        CadreError::Config(message.into())
    }

    /// Shorthand for a [`CadreError::State`].
    pub fn state(message: impl Into<String>) -> Self {
        CadreError::State(message.into())
    }

    /// Shorthand for a [`CadreError::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        CadreError::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            CadreError::Config(_) => "config",
            CadreError::MissingCredential { .. } => "missing_credential",
            CadreError::Api { .. } => "api",
            CadreError::Network(_) => "network",
            CadreError::IterationExhausted { .. } => "iteration_exhausted",
            CadreError::Tool { .. } => "tool",
            CadreError::UnknownTool { .. } => "unknown_tool",
            CadreError::Cancelled => "cancelled",
            CadreError::DeadlineExceeded => "deadline_exceeded",
            CadreError::State(_) => "state",
            CadreError::Json(_) => "json",
            CadreError::Io(_) => "io",
        }
    }

    /// Whether the provider retry decorator (or executor) may retry this error.
    ///
    /// Only transient upstream classes qualify: network failures and the
    /// 429/500/502/503/529 API statuses. Cancellation is never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            CadreError::Network(_) => true,
            CadreError::Api { status, .. } => RETRYABLE_STATUS.contains(status),
            _ => false,
        }
    }

    /// Whether this error originates from cancellation or an elapsed deadline.
    ///
    /// These short-circuit every retry loop in the runtime.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, CadreError::Cancelled | CadreError::DeadlineExceeded)
    }

    /// Human-readable remediation hint, where one is meaningful.
    pub fn remediation(&self) -> Option<String> {
        match self {
            CadreError::MissingCredential { provider } => Some(format!(
                "register a client for provider '{}' (or set its API key) before running the crew",
                provider
            )),
            CadreError::IterationExhausted { scope, limit } => Some(format!(
                "the {} reached its bound of {}; raise the limit or simplify the task so the agent can finish in fewer turns",
                scope, limit
            )),
            _ => None,
        }
    }
}

impl fmt::Display for CadreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CadreError::Config(msg) => write!(f, "configuration error: {}", msg),
            CadreError::MissingCredential { provider } => {
                write!(f, "no credential or client registered for provider '{}'", provider)
            }
            CadreError::Api { status, message } => {
                write!(f, "upstream API error (status {}): {}", status, message)
            }
            CadreError::Network(msg) => write!(f, "network error: {}", msg),
            CadreError::IterationExhausted { scope, limit } => {
                write!(f, "{} exhausted its {} iteration bound", scope, limit)
            }
            CadreError::Tool { tool, message } => {
                write!(f, "tool '{}' failed: {}", tool, message)
            }
            CadreError::UnknownTool { tool } => write!(f, "unknown tool: {}", tool),
            CadreError::Cancelled => write!(f, "context cancelled"),
            CadreError::DeadlineExceeded => write!(f, "context deadline exceeded"),
            CadreError::State(msg) => write!(f, "state error: {}", msg),
            CadreError::Json(msg) => write!(f, "serialization error: {}", msg),
            CadreError::Io(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl Error for CadreError {}

impl From<serde_json::Error> for CadreError {
    fn from(err: serde_json::Error) -> Self {
        CadreError::Json(err.to_string())
    }
}

impl From<std::io::Error> for CadreError {
    fn from(err: std::io::Error) -> Self {
        CadreError::Io(err.to_string())
    }
}

impl From<rusqlite::Error> for CadreError {
    fn from(err: rusqlite::Error) -> Self {
        CadreError::State(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_transient_classes() {
        for status in [429u16, 500, 502, 503, 529] {
            let err = CadreError::Api {
                status,
                message: "overloaded".into(),
            };
            assert!(err.is_retryable(), "status {} should be retryable", status);
        }
        for status in [400u16, 401, 403, 404, 422] {
            let err = CadreError::Api {
                status,
                message: "bad request".into(),
            };
            assert!(!err.is_retryable(), "status {} should not be retryable", status);
        }
    }

    #[test]
    fn cancellation_is_never_retryable() {
        assert!(CadreError::Cancelled.is_cancellation());
        assert!(CadreError::DeadlineExceeded.is_cancellation());
        assert!(!CadreError::Cancelled.is_retryable());
        assert!(!CadreError::DeadlineExceeded.is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(CadreError::config("x").code(), "config");
        assert_eq!(
            CadreError::UnknownTool { tool: "grep".into() }.code(),
            "unknown_tool"
        );
        assert_eq!(CadreError::Cancelled.code(), "cancelled");
    }

    #[test]
    fn remediation_present_where_meaningful() {
        let err = CadreError::IterationExhausted {
            scope: "agent loop".into(),
            limit: 10,
        };
        assert!(err.remediation().unwrap().contains("raise the limit"));
        assert!(CadreError::Network("reset".into()).remediation().is_none());
    }
}
