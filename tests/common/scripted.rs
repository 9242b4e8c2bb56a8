//! In-process worker that understands just enough instrumented Python to
//! exercise the engine: debug calls with integer arithmetic, guarded
//! `while True` loops and `raise`, plus two trigger calls anywhere in a line.
//!
//! - `crash()` exits the worker with code 7
//! - `time.sleep(...)` never answers

use async_trait::async_trait;
use livepad_common::{
    ErrorPayload, ExecutionId, HostToWorkerMessage, Language, MemoryReport, WorkerToHostMessage,
};
use livepad_engine::{EngineResult, WorkerConnection, WorkerEndpoint, WorkerExit, WorkerSpawner};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct ScriptedSpawner {
    spawns: AtomicUsize,
    received: Arc<Mutex<Vec<HostToWorkerMessage>>>,
}

impl ScriptedSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Scripts the workers were asked to execute, in order
    pub fn executed(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|message| match message {
                HostToWorkerMessage::Execute { code, .. } => Some(code.clone()),
                _ => None,
            })
            .collect()
    }

    /// Kinds of every message the workers received
    pub fn received_kinds(&self) -> Vec<&'static str> {
        self.received.lock().unwrap().iter().map(|m| m.kind()).collect()
    }
}

#[async_trait]
impl WorkerSpawner for ScriptedSpawner {
    async fn spawn(&self, _language: Language, _command: &[String]) -> EngineResult<WorkerConnection> {
        let pid = self.spawns.fetch_add(1, Ordering::SeqCst) as u32 + 1;
        let (conn, endpoint) = WorkerConnection::channel(Some(pid));
        tracing::debug!(pid, "Spawned scripted worker");
        tokio::spawn(run_worker(endpoint, Arc::clone(&self.received)));
        Ok(conn)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

enum Outcome {
    Complete,
    Failed(ErrorPayload),
    Crash,
    Hang,
}

async fn run_worker(mut endpoint: WorkerEndpoint, received: Arc<Mutex<Vec<HostToWorkerMessage>>>) {
    endpoint.emit(WorkerToHostMessage::Ready).await;
    loop {
        let message = tokio::select! {
            _ = endpoint.shutdown.cancelled() => break,
            message = endpoint.inbox.recv() => message,
        };
        let Some(message) = message else {
            break;
        };
        received.lock().unwrap().push(message.clone());
        let HostToWorkerMessage::Execute { id, code, .. } = message else {
            continue;
        };

        match run_script(&mut endpoint, id, &code).await {
            Outcome::Complete => {
                endpoint
                    .emit(WorkerToHostMessage::Memory {
                        data: MemoryReport {
                            heap_used: 1024 * 1024,
                            heap_total: 2 * 1024 * 1024,
                            object_count: 100,
                        },
                    })
                    .await;
                endpoint
                    .emit(WorkerToHostMessage::Complete {
                        id,
                        data: serde_json::Value::Null,
                    })
                    .await;
            }
            Outcome::Failed(data) => {
                endpoint.emit(WorkerToHostMessage::Error { id, data }).await;
            }
            Outcome::Crash => {
                endpoint.exit(WorkerExit::code(7)).await;
                return;
            }
            Outcome::Hang => {}
        }
    }
    endpoint.exit(WorkerExit::unknown("terminated")).await;
}

async fn run_script(endpoint: &mut WorkerEndpoint, id: ExecutionId, code: &str) -> Outcome {
    for line in code.lines().map(str::trim) {
        if line.contains("crash()") {
            return Outcome::Crash;
        }
        if line.contains("time.sleep(") {
            return Outcome::Hang;
        }
        if let Some(rest) = line.strip_prefix("raise ") {
            let (name, message) = rest.split_once('(').unwrap_or((rest, ""));
            let message = message.trim_end_matches(')').trim_matches('"');
            return Outcome::Failed(ErrorPayload::new(name, message));
        }
        if let Some((max, interval)) = guarded_forever(line) {
            if let Err(payload) = spin(endpoint, id, max, interval).await {
                return Outcome::Failed(payload);
            }
            continue;
        }
        if let Some((line_no, expr)) = debug_call(line) {
            let data = match eval(expr) {
                Some(value) => value.to_string(),
                None => expr.to_string(),
            };
            endpoint
                .emit(WorkerToHostMessage::Debug {
                    id,
                    line: line_no,
                    data: serde_json::Value::String(data),
                })
                .await;
        }
    }
    Outcome::Complete
}

/// Runs a guarded infinite loop, polling for `cancel` at each checkpoint
async fn spin(endpoint: &mut WorkerEndpoint, id: ExecutionId, max: u64, interval: u64) -> Result<(), ErrorPayload> {
    let interval = interval.max(1);
    let mut iterations = 0u64;
    loop {
        iterations += 1;
        if iterations > max {
            return Err(ErrorPayload::new("RuntimeError", "loop limit exceeded"));
        }
        if iterations % interval == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
            while let Ok(message) = endpoint.inbox.try_recv() {
                if message == (HostToWorkerMessage::Cancel { id }) {
                    return Err(ErrorPayload::new(
                        "CancellationError",
                        format!("cancelled after {} iterations", iterations),
                    ));
                }
            }
        }
    }
}

/// `for __livepad_ in __livepad_while(lambda: (True), MAX, EVERY):`
fn guarded_forever(line: &str) -> Option<(u64, u64)> {
    let rest = line.strip_prefix("for __livepad_ in __livepad_while(lambda: (True), ")?;
    let rest = rest.strip_suffix("):")?;
    let (max, interval) = rest.split_once(", ")?;
    Some((max.trim().parse().ok()?, interval.trim().parse().ok()?))
}

/// `__livepad_debug(LINE, EXPR)`
fn debug_call(line: &str) -> Option<(u32, &str)> {
    let rest = line.strip_prefix("__livepad_debug(")?;
    let rest = rest.strip_suffix(')')?;
    let (line_no, expr) = rest.split_once(", ")?;
    Some((line_no.trim().parse().ok()?, expr.trim()))
}

/// Integer `+ - * /` with parentheses
pub fn eval(expr: &str) -> Option<i64> {
    let tokens: Vec<char> = expr.chars().filter(|c| !c.is_whitespace()).collect();
    let mut pos = 0;
    let value = sum(&tokens, &mut pos)?;
    (pos == tokens.len()).then_some(value)
}

fn sum(tokens: &[char], pos: &mut usize) -> Option<i64> {
    let mut value = product(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos).filter(|c| matches!(c, '+' | '-')) {
        *pos += 1;
        let rhs = product(tokens, pos)?;
        value = if op == '+' { value + rhs } else { value - rhs };
    }
    Some(value)
}

fn product(tokens: &[char], pos: &mut usize) -> Option<i64> {
    let mut value = atom(tokens, pos)?;
    while let Some(&op) = tokens.get(*pos).filter(|c| matches!(c, '*' | '/')) {
        *pos += 1;
        let rhs = atom(tokens, pos)?;
        value = if op == '*' { value * rhs } else { value.checked_div(rhs)? };
    }
    Some(value)
}

fn atom(tokens: &[char], pos: &mut usize) -> Option<i64> {
    match tokens.get(*pos)? {
        '(' => {
            *pos += 1;
            let value = sum(tokens, pos)?;
            (tokens.get(*pos) == Some(&')')).then(|| *pos += 1)?;
            Some(value)
        }
        '-' => {
            *pos += 1;
            atom(tokens, pos).map(|v| -v)
        }
        c if c.is_ascii_digit() => {
            let start = *pos;
            while tokens.get(*pos).is_some_and(|c| c.is_ascii_digit()) {
                *pos += 1;
            }
            tokens[start..*pos].iter().collect::<String>().parse().ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval() {
        assert_eq!(eval("1 + 1"), Some(2));
        assert_eq!(eval("(2 + 3) * 4 - -1"), Some(21));
        assert_eq!(eval("7 / 0"), None);
        assert_eq!(eval("x + 1"), None);
    }

    #[test]
    fn test_script_shapes() {
        assert_eq!(debug_call("__livepad_debug(3, (1 + 2))"), Some((3, "(1 + 2)")));
        assert_eq!(
            guarded_forever("for __livepad_ in __livepad_while(lambda: (True), 500, 50):"),
            Some((500, 50))
        );
        assert_eq!(guarded_forever("for x in range(3):"), None);
    }
}
