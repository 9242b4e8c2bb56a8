use crate::throttle::ThrottleError;
use livepad_common::{ErrorPayload, Language};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Syntax problem found while transpiling a snippet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} ({line}:{column})")]
pub struct TranspileError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl TranspileError {
    pub fn new(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Which side gave up on a slow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The worker enforced the caller timeout and reported it
    Soft,
    /// The worker never answered and the safety timeout fired
    Hard,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Soft => f.write_str("soft"),
            TimeoutKind::Hard => f.write_str("hard"),
        }
    }
}

/// Errors produced by the execution engine
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("{language} worker failed to initialize: {reason}")]
    Initialization { language: Language, reason: String },

    #[error("Transpile error: {0}")]
    Transpile(#[from] TranspileError),

    #[error("{name}: {message}")]
    Execution {
        name: String,
        message: String,
        stack: Option<String>,
    },

    #[error("Execution timed out after {after:?} ({kind} timeout)")]
    Timeout { kind: TimeoutKind, after: Duration },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("{language} worker crashed (exit code {code:?})")]
    Crash { language: Language, code: Option<i32> },

    #[error("{0} worker is unavailable until retried")]
    Unavailable(Language),

    #[error("No worker configured for {0}")]
    UnsupportedLanguage(Language),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Superseded by a newer request")]
    Superseded,

    #[error("Engine is shutting down")]
    Shutdown,
}

impl From<ThrottleError> for EngineError {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::Superseded => EngineError::Superseded,
            ThrottleError::Shutdown => EngineError::Shutdown,
        }
    }
}

impl EngineError {
    /// Map a worker `error` payload onto the taxonomy.
    pub fn from_worker(payload: ErrorPayload, timeout: Duration) -> Self {
        match payload.name.as_str() {
            "TimeoutError" => EngineError::Timeout {
                kind: TimeoutKind::Soft,
                after: timeout,
            },
            "CancellationError" => EngineError::Cancelled,
            "SyntaxError" | "TranspileError" => {
                let (line, column) = parse_location(payload.stack.as_deref());
                EngineError::Transpile(TranspileError::new(line, column, payload.message))
            }
            _ => EngineError::Execution {
                name: payload.name,
                message: payload.message,
                stack: payload.stack,
            },
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout { .. })
    }
}

/// Pulls `line:column` out of a worker stack trace such as `<snippet>:3:7`.
fn parse_location(stack: Option<&str>) -> (u32, u32) {
    let Some(stack) = stack else {
        return (0, 0);
    };
    for line in stack.lines() {
        let mut numbers = line
            .rsplit(':')
            .map(|part| part.trim_end_matches(')').trim())
            .map_while(|part| part.parse::<u32>().ok());
        if let (Some(column), Some(line_no)) = (numbers.next(), numbers.next()) {
            return (line_no, column);
        }
    }
    (0, 0)
}

pub type EngineResult<T> = Result<T, EngineError>;
