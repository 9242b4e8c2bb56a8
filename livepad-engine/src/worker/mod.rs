//! Worker abstraction
//!
//! A worker is an opaque sequential executor for one language. The registry
//! only ever talks to it through a [`WorkerHandle`] (host to worker) and a
//! stream of [`WorkerEvent`]s (worker to host).

mod process;

use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use livepad_common::{HostToWorkerMessage, Language, WorkerToHostMessage};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use process::ProcessSpawner;

const CHANNEL_CAPACITY: usize = 256;

/// How a worker went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// Exit status, None when killed by a signal or unknown
    pub code: Option<i32>,
    pub reason: Option<String>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            reason: None,
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.reason) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(reason)) => f.write_str(reason),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Everything a worker reports
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(WorkerToHostMessage),
    /// Always the last event of a connection
    Exited(WorkerExit),
}

/// Host side sending half of a worker
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<HostToWorkerMessage>,
    shutdown: CancellationToken,
    pid: Option<u32>,
}

impl WorkerHandle {
    pub async fn send(&self, message: HostToWorkerMessage) -> EngineResult<()> {
        let kind = message.kind();
        self.tx
            .send(message)
            .await
            .map_err(|_| EngineError::Protocol(format!("worker closed before '{}' was sent", kind)))
    }

    /// Ask the worker to go away. The connection reports `Exited` afterwards.
    pub fn terminate(&self) {
        self.shutdown.cancel();
    }

    pub fn is_terminated(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// A freshly spawned worker
#[derive(Debug)]
pub struct WorkerConnection {
    pub handle: WorkerHandle,
    pub events: mpsc::Receiver<WorkerEvent>,
}

/// Worker side of an in-process channel pair
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub inbox: mpsc::Receiver<HostToWorkerMessage>,
    pub outbox: mpsc::Sender<WorkerEvent>,
    /// Cancelled when the host terminates the worker
    pub shutdown: CancellationToken,
}

impl WorkerEndpoint {
    /// Report a protocol message; false once the host stopped listening
    pub async fn emit(&self, message: WorkerToHostMessage) -> bool {
        self.outbox.send(WorkerEvent::Message(message)).await.is_ok()
    }

    /// Report the exit. Consumes the endpoint so nothing can follow it.
    pub async fn exit(self, exit: WorkerExit) {
        let _ = self.outbox.send(WorkerEvent::Exited(exit)).await;
    }
}

impl WorkerConnection {
    /// Connected pair of channels for workers that live in this process
    pub fn channel(pid: Option<u32>) -> (WorkerConnection, WorkerEndpoint) {
        let (host_tx, host_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let connection = WorkerConnection {
            handle: WorkerHandle {
                tx: host_tx,
                shutdown: shutdown.clone(),
                pid,
            },
            events: event_rx,
        };
        let endpoint = WorkerEndpoint {
            inbox: host_rx,
            outbox: event_tx,
            shutdown,
        };
        (connection, endpoint)
    }
}

/// Starts workers
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    /// Start a worker from `command`. Readiness is reported later via
    /// [`WorkerToHostMessage::Ready`].
    async fn spawn(&self, language: Language, command: &[String]) -> EngineResult<WorkerConnection>;

    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_pair_carries_messages_both_ways() {
        let (mut conn, mut endpoint) = WorkerConnection::channel(None);
        conn.handle.send(HostToWorkerMessage::Gc).await.unwrap();
        assert_eq!(endpoint.inbox.recv().await, Some(HostToWorkerMessage::Gc));

        assert!(endpoint.emit(WorkerToHostMessage::Ready).await);
        conn.handle.terminate();
        assert!(endpoint.shutdown.is_cancelled());
        endpoint.exit(WorkerExit::code(0)).await;

        assert_eq!(
            conn.events.recv().await,
            Some(WorkerEvent::Message(WorkerToHostMessage::Ready))
        );
        assert_eq!(
            conn.events.recv().await,
            Some(WorkerEvent::Exited(WorkerExit::code(0)))
        );
        assert_eq!(conn.events.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_to_closed_worker_is_protocol_error() {
        let (conn, endpoint) = WorkerConnection::channel(None);
        drop(endpoint);
        let err = conn.handle.send(HostToWorkerMessage::Gc).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(ref m) if m.contains("gc")));
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(WorkerExit::code(3).to_string(), "exit code 3");
        assert!(!WorkerExit::unknown("killed").is_clean());
        assert!(WorkerExit::code(0).is_clean());
    }
}
