//! Client for an external transpiler worker
//!
//! Speaks the worker protocol: `transpile` is answered by `complete` carrying
//! the output code, or by `error`.

use crate::error::{EngineError, TranspileError};
use crate::worker::{WorkerConnection, WorkerEvent, WorkerSpawner};
use livepad_common::{
    ExecutionId, HostToWorkerMessage, Language, TranspileOptions, WorkerToHostMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum TranspilerFailure {
    /// The transpiler looked at the code and rejected it
    Rejected(TranspileError),
    /// The transpiler could not be reached
    Unavailable(String),
}

pub struct TranspilerClient {
    language: Language,
    command: Vec<String>,
    spawner: Arc<dyn WorkerSpawner>,
    ready_timeout: Duration,
    request_timeout: Duration,
    worker: Mutex<Option<WorkerConnection>>,
}

impl TranspilerClient {
    pub fn new(
        language: Language,
        command: Vec<String>,
        spawner: Arc<dyn WorkerSpawner>,
        ready_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            language,
            command,
            spawner,
            ready_timeout,
            request_timeout,
            worker: Mutex::new(None),
        }
    }

    /// Transpile `code`, starting the transpiler worker on first use
    pub async fn transpile(&self, code: &str) -> Result<String, TranspilerFailure> {
        let mut guard = self.worker.lock().await;
        if guard.is_none() {
            *guard = Some(self.start().await?);
        }
        let conn = guard
            .as_mut()
            .ok_or_else(|| TranspilerFailure::Unavailable("transpiler not running".to_string()))?;

        let (result, alive) = self.exchange(conn, code).await;
        if !alive {
            if let Some(conn) = guard.take() {
                conn.handle.terminate();
            }
        }
        result
    }

    async fn start(&self) -> Result<WorkerConnection, TranspilerFailure> {
        let mut conn = self
            .spawner
            .spawn(self.language, &self.command)
            .await
            .map_err(|e| TranspilerFailure::Unavailable(e.to_string()))?;

        let ready = tokio::time::timeout(self.ready_timeout, async {
            while let Some(event) = conn.events.recv().await {
                match event {
                    WorkerEvent::Message(WorkerToHostMessage::Ready) => return true,
                    WorkerEvent::Message(_) => continue,
                    WorkerEvent::Exited(_) => return false,
                }
            }
            false
        })
        .await;

        match ready {
            Ok(true) => {
                tracing::info!(language = %self.language, "Transpiler worker ready");
                Ok(conn)
            }
            Ok(false) => Err(TranspilerFailure::Unavailable(
                "transpiler exited before ready".to_string(),
            )),
            Err(_) => {
                conn.handle.terminate();
                Err(TranspilerFailure::Unavailable(format!(
                    "transpiler not ready within {:?}",
                    self.ready_timeout
                )))
            }
        }
    }

    /// One request/response. The flag is false when the worker must be dropped.
    async fn exchange(
        &self,
        conn: &mut WorkerConnection,
        code: &str,
    ) -> (Result<String, TranspilerFailure>, bool) {
        let id = ExecutionId::new();
        let request = HostToWorkerMessage::Transpile {
            id,
            code: code.to_string(),
            options: TranspileOptions {
                language: self.language,
                file_name: Some(format!("snippet.{}", extension(self.language))),
            },
        };
        if let Err(e) = conn.handle.send(request).await {
            return (Err(TranspilerFailure::Unavailable(e.to_string())), false);
        }

        let request_timeout = self.request_timeout;
        let reply = tokio::time::timeout(request_timeout, async {
            while let Some(event) = conn.events.recv().await {
                let message = match event {
                    WorkerEvent::Message(message) => message,
                    WorkerEvent::Exited(exit) => {
                        return (
                            Err(TranspilerFailure::Unavailable(format!(
                                "transpiler exited ({})",
                                exit
                            ))),
                            false,
                        );
                    }
                };
                if message.execution_id() != Some(id) {
                    continue;
                }
                match message {
                    WorkerToHostMessage::Complete { data, .. } => {
                        return match data.as_str() {
                            Some(code) => (Ok(code.to_string()), true),
                            None => (
                                Err(TranspilerFailure::Unavailable(
                                    "transpiler returned no code".to_string(),
                                )),
                                true,
                            ),
                        };
                    }
                    WorkerToHostMessage::Error { data, .. } => {
                        let err = match EngineError::from_worker(data, request_timeout) {
                            EngineError::Transpile(err) => err,
                            other => TranspileError::new(0, 0, other.to_string()),
                        };
                        return (Err(TranspilerFailure::Rejected(err)), true);
                    }
                    _ => continue,
                }
            }
            (
                Err(TranspilerFailure::Unavailable("transpiler channel closed".to_string())),
                false,
            )
        })
        .await;

        reply.unwrap_or_else(|_| {
            (
                Err(TranspilerFailure::Unavailable(format!(
                    "transpiler gave no answer within {:?}",
                    request_timeout
                ))),
                false,
            )
        })
    }

    pub async fn shutdown(&self) {
        if let Some(conn) = self.worker.lock().await.take() {
            conn.handle.terminate();
        }
    }
}

fn extension(language: Language) -> &'static str {
    match language {
        Language::JavaScript => "js",
        Language::TypeScript => "ts",
        Language::Python => "py",
    }
}
