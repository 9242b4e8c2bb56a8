//! Core types for snippet execution

use livepad_common::{ConsoleType, ExecutionId, Language};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-request execution switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOptions {
    /// Caller timeout (None = the language's default timeout)
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Report expressions that evaluate to undefined / None
    #[serde(default)]
    pub show_undefined: bool,

    /// Inject loop guards
    #[serde(default = "default_true")]
    pub loop_protection: bool,

    /// Honour `//?` / `#?` markers
    #[serde(default = "default_true")]
    pub magic_comments: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            show_undefined: false,
            loop_protection: true,
            magic_comments: true,
        }
    }
}

/// Request to execute a snippet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: ExecutionId,
    pub code: String,
    pub language: Language,
    #[serde(default)]
    pub options: ExecutionOptions,
}

impl ExecutionRequest {
    /// Create a request with a fresh id and default options
    pub fn new(language: Language, code: impl Into<String>) -> Self {
        Self {
            id: ExecutionId::new(),
            code: code.into(),
            language,
            options: ExecutionOptions::default(),
        }
    }

    /// Set the caller timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn without_loop_protection(mut self) -> Self {
        self.options.loop_protection = false;
        self
    }
}

/// Captured console output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub console_type: ConsoleType,
    pub data: Vec<serde_json::Value>,
}

/// Value reported for a source line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugEntry {
    pub line: u32,
    pub data: serde_json::Value,
}

/// Result of a completed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub id: ExecutionId,
    pub language: Language,
    /// Value carried by the worker's `complete` message
    pub value: serde_json::Value,
    pub console: Vec<ConsoleEntry>,
    pub debug: Vec<DebugEntry>,
    pub duration_ms: u64,
    /// Whether the instrumented script came from the cache
    pub cache_hit: bool,
}

impl ExecutionReport {
    /// Debug value reported for a line, if any
    pub fn debug_at(&self, line: u32) -> Option<&serde_json::Value> {
        self.debug.iter().find(|d| d.line == line).map(|d| &d.data)
    }
}

/// Streamed notification for subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionEvent {
    pub language: Language,
    pub execution_id: Option<ExecutionId>,
    pub kind: EventKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Console(ConsoleEntry),
    Debug(DebugEntry),
    Status(String),
    Complete(serde_json::Value),
    Error(String),
}

impl ExecutionEvent {
    pub fn new(language: Language, execution_id: Option<ExecutionId>, kind: EventKind) -> Self {
        Self {
            language,
            execution_id,
            kind,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, EventKind::Complete(_) | EventKind::Error(_))
    }
}
