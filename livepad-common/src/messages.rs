//! Worker wire protocol
//!
//! Both directions are newline-delimited JSON objects tagged by `type`.

use crate::{ConsoleType, ExecutionId, Language};
use serde::{Deserialize, Serialize};

/// Options forwarded to the worker with every `execute`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOptions {
    /// Soft timeout the worker enforces itself, in milliseconds
    pub timeout: u64,
    #[serde(default)]
    pub show_undefined: bool,
    /// Name instrumented code calls to report values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_function: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspileOptions {
    pub language: Language,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// Messages sent from the host to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HostToWorkerMessage {
    Execute {
        id: ExecutionId,
        code: String,
        language: Language,
        options: WireOptions,
    },
    Cancel {
        id: ExecutionId,
    },
    Transpile {
        id: ExecutionId,
        code: String,
        options: TranspileOptions,
    },
    /// Run the interpreter's garbage collector
    Gc,
    /// Delete user bindings, keeping the listed names
    Reset {
        preserve: Vec<String>,
    },
}

impl HostToWorkerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HostToWorkerMessage::Execute { .. } => "execute",
            HostToWorkerMessage::Cancel { .. } => "cancel",
            HostToWorkerMessage::Transpile { .. } => "transpile",
            HostToWorkerMessage::Gc => "gc",
            HostToWorkerMessage::Reset { .. } => "reset",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub message: String,
}

/// Resource sample reported by a worker after each execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    #[serde(default)]
    pub heap_used: u64,
    #[serde(default)]
    pub heap_total: u64,
    #[serde(default)]
    pub object_count: u64,
}

/// Messages sent from a worker to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerToHostMessage {
    Ready,
    Console {
        id: ExecutionId,
        #[serde(rename = "consoleType")]
        console_type: ConsoleType,
        data: Vec<serde_json::Value>,
    },
    Debug {
        id: ExecutionId,
        line: u32,
        data: serde_json::Value,
    },
    Complete {
        id: ExecutionId,
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        id: ExecutionId,
        data: ErrorPayload,
    },
    Status {
        #[serde(default)]
        id: Option<ExecutionId>,
        data: StatusPayload,
    },
    Memory {
        data: MemoryReport,
    },
}

impl WorkerToHostMessage {
    /// Execution the message belongs to, if any
    pub fn execution_id(&self) -> Option<ExecutionId> {
        match self {
            WorkerToHostMessage::Console { id, .. }
            | WorkerToHostMessage::Debug { id, .. }
            | WorkerToHostMessage::Complete { id, .. }
            | WorkerToHostMessage::Error { id, .. } => Some(*id),
            WorkerToHostMessage::Status { id, .. } => *id,
            WorkerToHostMessage::Ready | WorkerToHostMessage::Memory { .. } => None,
        }
    }

    /// `complete` and `error` end an execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerToHostMessage::Complete { .. } | WorkerToHostMessage::Error { .. }
        )
    }
}
