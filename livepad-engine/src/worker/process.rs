//! Process-based workers
//!
//! The worker is a child process speaking newline-delimited JSON on
//! stdin/stdout. Stderr is forwarded to the log.

use super::{WorkerConnection, WorkerEndpoint, WorkerEvent, WorkerExit, WorkerSpawner};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use livepad_common::{HostToWorkerMessage, Language, WorkerToHostMessage};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

/// Spawns each worker as a child process
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    working_dir: Option<PathBuf>,
}

impl ProcessSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative worker paths against `dir`
    pub fn with_working_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(&self, language: Language, command: &[String]) -> EngineResult<WorkerConnection> {
        let (program, args) = command.split_first().ok_or_else(|| EngineError::Initialization {
            language,
            reason: "empty worker command".to_string(),
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| EngineError::Initialization {
            language,
            reason: format!("failed to spawn {}: {}", program, e),
        })?;

        let pid = child.id();
        let missing_pipe = |name: &str| EngineError::Initialization {
            language,
            reason: format!("worker {} not captured", name),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;

        tracing::info!(%language, pid = ?pid, command = %command.join(" "), "Spawned worker process");

        let (connection, endpoint) = WorkerConnection::channel(pid);
        let WorkerEndpoint {
            inbox,
            outbox,
            shutdown,
        } = endpoint;

        tokio::spawn(write_messages(language, inbox, stdin));

        let reader = tokio::spawn(read_messages(language, stdout, outbox.clone()));

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%language, stderr = %line, "Worker stderr");
                }
            });
        }

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = shutdown.cancelled() => {
                    tracing::debug!(%language, pid = ?pid, "Terminating worker process");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(%language, error = %e, "Failed to kill worker process");
                    }
                    child.wait().await
                }
            };
            // Deliver everything the worker printed before reporting the exit.
            let _ = reader.await;
            let exit = match status {
                Ok(status) => match status.code() {
                    Some(code) => WorkerExit::code(code),
                    None => WorkerExit::unknown("terminated by signal"),
                },
                Err(e) => WorkerExit::unknown(format!("wait failed: {}", e)),
            };
            tracing::debug!(%language, pid = ?pid, %exit, "Worker process exited");
            let _ = outbox.send(WorkerEvent::Exited(exit)).await;
        });

        Ok(connection)
    }

    fn name(&self) -> &str {
        "process"
    }
}

async fn write_messages(
    language: Language,
    mut inbox: mpsc::Receiver<HostToWorkerMessage>,
    stdin: ChildStdin,
) {
    let mut writer = BufWriter::new(stdin);
    while let Some(message) = inbox.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(%language, error = %e, "Failed to encode worker message");
                continue;
            }
        };
        line.push('\n');
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            tracing::debug!(%language, error = %e, "Worker stdin closed");
            break;
        }
        tracing::trace!(%language, kind = message.kind(), "Sent worker message");
    }
}

async fn read_messages(language: Language, stdout: ChildStdout, outbox: mpsc::Sender<WorkerEvent>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%language, error = %e, "Failed to read worker stdout");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerToHostMessage>(trimmed) {
            Ok(message) => {
                if outbox.send(WorkerEvent::Message(message)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(%language, error = %e, line = %trimmed, "Ignoring non-protocol worker output");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    async fn next_event(conn: &mut WorkerConnection) -> WorkerEvent {
        tokio::time::timeout(Duration::from_secs(5), conn.events.recv())
            .await
            .expect("worker event timed out")
            .expect("worker channel closed")
    }

    #[tokio::test]
    async fn test_empty_command_fails_to_initialize() {
        let err = ProcessSpawner::new()
            .spawn(Language::Python, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Initialization { .. }));
    }

    #[tokio::test]
    async fn test_messages_then_exit_are_reported_in_order() {
        let mut conn = ProcessSpawner::new()
            .spawn(
                Language::JavaScript,
                &sh(r#"echo '{"type":"ready"}'; echo 'not json'; exit 3"#),
            )
            .await
            .unwrap();
        assert_eq!(
            next_event(&mut conn).await,
            WorkerEvent::Message(WorkerToHostMessage::Ready)
        );
        assert_eq!(
            next_event(&mut conn).await,
            WorkerEvent::Exited(WorkerExit::code(3))
        );
    }

    #[tokio::test]
    async fn test_stdin_messages_reach_the_process() {
        // Echoes the first line it receives back as the payload of a status message.
        let script = r#"read line; printf '{"type":"status","data":{"message":"%s"}}\n' "$(echo "$line" | tr -d '"{}')""#;
        let mut conn = ProcessSpawner::new()
            .spawn(Language::Python, &sh(script))
            .await
            .unwrap();
        conn.handle.send(HostToWorkerMessage::Gc).await.unwrap();
        match next_event(&mut conn).await {
            WorkerEvent::Message(WorkerToHostMessage::Status { data, .. }) => {
                assert_eq!(data.message, "type:gc");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_kills_a_hung_worker() {
        let mut conn = ProcessSpawner::new()
            .spawn(Language::Python, &sh("sleep 30"))
            .await
            .unwrap();
        conn.handle.terminate();
        match next_event(&mut conn).await {
            WorkerEvent::Exited(exit) => assert!(!exit.is_clean()),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
