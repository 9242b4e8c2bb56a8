//! Executor registry
//!
//! Owns one worker slot per configured language and is the only component
//! that talks to workers. Executions on a language are serialized by a turn
//! lock, so a worker never runs two snippets at once and terminal messages
//! arrive in submission order.
//!
//! Slot phases: `Uninitialized -> Initializing -> Ready`, back to
//! `Uninitialized` when the worker exits or is recycled, and `Unavailable`
//! once the restart policy gives up.

mod supervisor;
mod transpiler;

pub use supervisor::{RestartDecision, RestartPolicy, Supervisor};
pub use transpiler::{TranspilerClient, TranspilerFailure};

use crate::cache::{CacheKey, ScriptCache};
use crate::config::{EngineConfig, LanguageConfig, LivepadConfig};
use crate::error::{EngineError, EngineResult, TimeoutKind};
use crate::instrument::{InstrumentOptions, Instrumentor};
use crate::memory::{CleanupLevel, MemoryManager, MemoryStats};
use crate::types::{
    ConsoleEntry, DebugEntry, EventKind, ExecutionEvent, ExecutionReport, ExecutionRequest,
};
use crate::worker::{WorkerConnection, WorkerEvent, WorkerExit, WorkerHandle, WorkerSpawner};
use futures::future::{BoxFuture, FutureExt, Shared};
use livepad_common::{
    ExecutionId, HostToWorkerMessage, Language, WireOptions, WorkerToHostMessage,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Cache shared by the registry and its owner
pub type SharedCache = Arc<tokio::sync::Mutex<ScriptCache<PreparedScript>>>;

/// Instrumented script as posted to a worker
#[derive(Debug, Clone)]
pub struct PreparedScript {
    pub key: CacheKey,
    pub code: String,
    pub prepared_at: chrono::DateTime<chrono::Utc>,
}

/// Observable state of a language slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerPhase {
    Uninitialized,
    Initializing,
    Ready,
    Busy,
    Unavailable,
}

type InitFuture = Shared<BoxFuture<'static, EngineResult<()>>>;

enum Phase {
    Uninitialized,
    Initializing(InitFuture),
    Ready(WorkerState),
    Unavailable,
}

struct WorkerState {
    handle: WorkerHandle,
    generation: u64,
    busy: bool,
    current_execution: Option<ExecutionId>,
}

struct LanguageSlot {
    language: Language,
    config: LanguageConfig,
    options: InstrumentOptions,
    phase: Mutex<Phase>,
    /// Held for the whole of an execution
    turn: tokio::sync::Mutex<()>,
    memory: Mutex<MemoryManager>,
    supervisor: Supervisor,
    generations: AtomicU64,
    transpiler: Option<TranspilerClient>,
}

struct PendingExecution {
    language: Language,
    generation: u64,
    timeout: Duration,
    responder: oneshot::Sender<EngineResult<Completion>>,
    console: Vec<ConsoleEntry>,
    debug: Vec<DebugEntry>,
}

struct Completion {
    value: serde_json::Value,
    console: Vec<ConsoleEntry>,
    debug: Vec<DebugEntry>,
}

struct Inner {
    config: EngineConfig,
    slots: HashMap<Language, LanguageSlot>,
    spawner: Arc<dyn WorkerSpawner>,
    cache: SharedCache,
    instrumentor: Instrumentor,
    pending: Mutex<HashMap<ExecutionId, PendingExecution>>,
    events: broadcast::Sender<ExecutionEvent>,
    shutdown: CancellationToken,
}

/// Per-language worker lifecycle and execution dispatch
#[derive(Clone)]
pub struct ExecutorRegistry {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecutorRegistry {
    pub fn new(
        config: &LivepadConfig,
        spawner: Arc<dyn WorkerSpawner>,
        cache: SharedCache,
    ) -> anyhow::Result<Self> {
        let (events, _) = broadcast::channel(config.engine.event_capacity);
        let mut slots = HashMap::new();

        for (language, lang_config) in config.language_configs()? {
            let escalation_events = events.clone();
            let memory = MemoryManager::new(config.memory.clone()).with_escalation(Arc::new(
                move |stats: &MemoryStats| {
                    let message = format!(
                        "{} interpreter memory critical ({} bytes in use), restarting worker",
                        language, stats.heap_used
                    );
                    let _ = escalation_events.send(ExecutionEvent::new(
                        language,
                        None,
                        EventKind::Status(message),
                    ));
                },
            ));

            let transpiler = lang_config.transpiler_command.clone().map(|command| {
                TranspilerClient::new(
                    language,
                    command,
                    Arc::clone(&spawner),
                    config.engine.ready_timeout,
                    lang_config.default_timeout + config.engine.safety_grace,
                )
            });

            slots.insert(
                language,
                LanguageSlot {
                    language,
                    options: InstrumentOptions::for_language(&lang_config),
                    config: lang_config,
                    phase: Mutex::new(Phase::Uninitialized),
                    turn: tokio::sync::Mutex::new(()),
                    memory: Mutex::new(memory),
                    supervisor: Supervisor::new(config.engine.restart.clone()),
                    generations: AtomicU64::new(0),
                    transpiler,
                },
            );
        }

        tracing::debug!(
            languages = slots.len(),
            spawner = spawner.name(),
            "Executor registry created"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config: config.engine.clone(),
                slots,
                spawner,
                cache,
                instrumentor: Instrumentor::new(),
                pending: Mutex::new(HashMap::new()),
                events,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    /// Configured languages, sorted
    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.inner.slots.keys().copied().collect();
        languages.sort();
        languages
    }

    /// Start the language's worker if needed and wait until it is ready.
    ///
    /// Concurrent callers share one initialization.
    pub async fn initialize(&self, language: Language) -> EngineResult<()> {
        self.inner.initialize(language).await
    }

    /// Instrument, dispatch and await one execution
    pub async fn execute(&self, request: ExecutionRequest) -> EngineResult<ExecutionReport> {
        self.inner.execute(request).await
    }

    /// Ask the owning worker to stop an execution. Returns whether the id was
    /// pending; the worker only stops at its next checkpoint.
    pub async fn cancel_execution(&self, id: ExecutionId) -> bool {
        self.inner.cancel_execution(id).await
    }

    /// Clear the restart counter and an `Unavailable` mark
    pub fn retry(&self, language: Language) -> EngineResult<()> {
        let slot = self.inner.slot(language)?;
        slot.supervisor.reset();
        let mut phase = lock(&slot.phase);
        if matches!(*phase, Phase::Unavailable) {
            *phase = Phase::Uninitialized;
            tracing::info!(%language, "Language marked for retry");
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.events.subscribe()
    }

    pub fn phase(&self, language: Language) -> Option<WorkerPhase> {
        let slot = self.inner.slots.get(&language)?;
        let phase = lock(&slot.phase);
        Some(match &*phase {
            Phase::Uninitialized => WorkerPhase::Uninitialized,
            Phase::Initializing(_) => WorkerPhase::Initializing,
            Phase::Ready(worker) if worker.busy => WorkerPhase::Busy,
            Phase::Ready(_) => WorkerPhase::Ready,
            Phase::Unavailable => WorkerPhase::Unavailable,
        })
    }

    /// Execution the language's worker is running, if any
    pub fn current_execution(&self, language: Language) -> Option<ExecutionId> {
        let slot = self.inner.slots.get(&language)?;
        match &*lock(&slot.phase) {
            Phase::Ready(worker) => worker.current_execution,
            _ => None,
        }
    }

    /// Process id of the language's worker, when it is a process
    pub fn worker_pid(&self, language: Language) -> Option<u32> {
        let slot = self.inner.slots.get(&language)?;
        match &*lock(&slot.phase) {
            Phase::Ready(worker) => worker.handle.pid(),
            _ => None,
        }
    }

    pub fn memory_stats(&self, language: Language) -> Option<MemoryStats> {
        let slot = self.inner.slots.get(&language)?;
        let stats = lock(&slot.memory).stats();
        Some(stats)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn cache(&self) -> &SharedCache {
        &self.inner.cache
    }

    /// Terminate every worker and reject everything pending
    pub async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}

/// Clears the busy flag and the pending entry however `execute` ends
struct BusyGuard<'a> {
    inner: &'a Inner,
    slot: &'a LanguageSlot,
    generation: u64,
    id: ExecutionId,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.pending).remove(&self.id);
        if let Phase::Ready(worker) = &mut *lock(&self.slot.phase) {
            if worker.generation == self.generation {
                worker.busy = false;
                worker.current_execution = None;
            }
        }
    }
}

impl Inner {
    fn slot(&self, language: Language) -> EngineResult<&LanguageSlot> {
        self.slots
            .get(&language)
            .ok_or(EngineError::UnsupportedLanguage(language))
    }

    fn emit(&self, language: Language, id: Option<ExecutionId>, kind: EventKind) {
        let _ = self.events.send(ExecutionEvent::new(language, id, kind));
    }

    async fn initialize(self: &Arc<Self>, language: Language) -> EngineResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        let slot = self.slot(language)?;
        let init = {
            let mut phase = lock(&slot.phase);
            match &*phase {
                Phase::Ready(_) => return Ok(()),
                Phase::Unavailable => return Err(EngineError::Unavailable(language)),
                Phase::Initializing(init) => init.clone(),
                Phase::Uninitialized => {
                    let task = tokio::spawn(Arc::clone(self).start_worker(language));
                    let init = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(EngineError::Initialization {
                                language,
                                reason: format!("initialization task failed: {}", e),
                            })
                        })
                    }
                    .boxed()
                    .shared();
                    *phase = Phase::Initializing(init.clone());
                    init
                }
            }
        };
        init.await
    }

    async fn start_worker(self: Arc<Self>, language: Language) -> EngineResult<()> {
        let slot = self.slot(language)?;
        let generation = slot.generations.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(%language, generation, "Initializing worker");

        match self.spawn_ready(slot, generation).await {
            Ok(handle) => {
                if self.shutdown.is_cancelled() {
                    handle.terminate();
                    *lock(&slot.phase) = Phase::Uninitialized;
                    return Err(EngineError::Shutdown);
                }
                *lock(&slot.phase) = Phase::Ready(WorkerState {
                    handle,
                    generation,
                    busy: false,
                    current_execution: None,
                });
                slot.supervisor.reset();
                lock(&slot.memory).reset();
                tracing::info!(%language, generation, "Worker ready");
                Ok(())
            }
            Err(err) => {
                *lock(&slot.phase) = Phase::Uninitialized;
                tracing::warn!(%language, generation, error = %err, "Worker failed to initialize");
                self.emit(language, None, EventKind::Status(err.to_string()));
                self.schedule_restart(language, &err.to_string());
                Err(err)
            }
        }
    }

    /// Spawn a worker and wait for its `ready` message
    async fn spawn_ready(
        self: &Arc<Self>,
        slot: &LanguageSlot,
        generation: u64,
    ) -> EngineResult<WorkerHandle> {
        let language = slot.language;
        let WorkerConnection { handle, events } = self
            .spawner
            .spawn(language, &slot.config.worker_command)
            .await
            .map_err(|e| match e {
                EngineError::Initialization { .. } => e,
                other => EngineError::Initialization {
                    language,
                    reason: other.to_string(),
                },
            })?;

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(route_events(
            Arc::downgrade(self),
            language,
            generation,
            events,
            ready_tx,
        ));

        match tokio::time::timeout(self.config.ready_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(_)) => {
                handle.terminate();
                Err(EngineError::Initialization {
                    language,
                    reason: "worker exited before sending ready".to_string(),
                })
            }
            Err(_) => {
                handle.terminate();
                Err(EngineError::Initialization {
                    language,
                    reason: format!("no ready message within {:?}", self.config.ready_timeout),
                })
            }
        }
    }

    fn schedule_restart(self: &Arc<Self>, language: Language, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Ok(slot) = self.slot(language) else {
            return;
        };
        match slot.supervisor.record_failure() {
            RestartDecision::Retry { attempt, delay } => {
                tracing::info!(
                    %language,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    reason,
                    "Scheduling worker restart"
                );
                let registry = Arc::downgrade(self);
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let Some(inner) = registry.upgrade() else {
                        return;
                    };
                    if let Err(e) = inner.initialize(language).await {
                        tracing::debug!(%language, attempt, error = %e, "Restart attempt failed");
                    }
                });
            }
            RestartDecision::GiveUp { attempts } => {
                {
                    let mut phase = lock(&slot.phase);
                    if matches!(*phase, Phase::Uninitialized) {
                        *phase = Phase::Unavailable;
                    }
                }
                tracing::error!(%language, attempts, reason, "Worker restarts exhausted");
                self.emit(
                    language,
                    None,
                    EventKind::Status(format!(
                        "{} worker unavailable after {} restart attempts, retry required",
                        language, attempts
                    )),
                );
            }
        }
    }

    async fn execute(self: &Arc<Self>, request: ExecutionRequest) -> EngineResult<ExecutionReport> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::Shutdown);
        }
        let language = request.language;
        let id = request.id;
        let slot = self.slot(language)?;
        let started = Instant::now();

        let (script, cache_hit) = self.prepare(slot, &request).await?;

        let _turn = slot.turn.lock().await;
        self.initialize(language).await?;

        let timeout = request.options.timeout.unwrap_or(slot.config.default_timeout);
        let (handle, generation) = {
            let mut phase = lock(&slot.phase);
            let Phase::Ready(worker) = &mut *phase else {
                return Err(EngineError::Crash {
                    language,
                    code: None,
                });
            };
            worker.busy = true;
            worker.current_execution = Some(id);
            (worker.handle.clone(), worker.generation)
        };
        let _busy = BusyGuard {
            inner: self,
            slot,
            generation,
            id,
        };

        let (tx, mut rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingExecution {
                language,
                generation,
                timeout,
                responder: tx,
                console: Vec::new(),
                debug: Vec::new(),
            },
        );

        tracing::debug!(
            %language,
            execution_id = %id,
            generation,
            cache_key = script.key.short(),
            cache_hit,
            "Dispatching execution"
        );
        handle
            .send(HostToWorkerMessage::Execute {
                id,
                code: script.code.clone(),
                language,
                options: WireOptions {
                    timeout: timeout.as_millis() as u64,
                    show_undefined: request.options.show_undefined,
                    debug_function: Some(slot.config.debug_function_name.clone()),
                },
            })
            .await?;

        let safety = timeout + self.config.safety_grace;
        let outcome = tokio::select! {
            reply = &mut rx => reply.unwrap_or(Err(EngineError::Shutdown)),
            _ = tokio::time::sleep(safety) => {
                if lock(&self.pending).remove(&id).is_none() {
                    // The reply raced the timer.
                    rx.try_recv().unwrap_or(Err(EngineError::Shutdown))
                } else {
                    tracing::warn!(
                        %language,
                        execution_id = %id,
                        after_ms = safety.as_millis() as u64,
                        "Worker missed the safety timeout"
                    );
                    let err = EngineError::Timeout {
                        kind: TimeoutKind::Hard,
                        after: safety,
                    };
                    self.emit(language, Some(id), EventKind::Error(err.to_string()));
                    if self.config.recycle_on_hard_timeout {
                        self.recycle(slot, generation, "hard timeout");
                    }
                    Err(err)
                }
            }
        };

        let worker_alive = !matches!(
            outcome,
            Err(EngineError::Crash { .. })
                | Err(EngineError::Shutdown)
                | Err(EngineError::Timeout {
                    kind: TimeoutKind::Hard,
                    ..
                })
        );
        if worker_alive && slot.config.memory_management {
            self.manage_memory(slot, generation, &handle).await;
        }

        let completion = outcome?;
        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(%language, execution_id = %id, duration_ms, cache_hit, "Execution complete");
        Ok(ExecutionReport {
            id,
            language,
            value: completion.value,
            console: completion.console,
            debug: completion.debug,
            duration_ms,
            cache_hit,
        })
    }

    /// Instrument the request and look the result up in the script cache
    async fn prepare(
        &self,
        slot: &LanguageSlot,
        request: &ExecutionRequest,
    ) -> EngineResult<(Arc<PreparedScript>, bool)> {
        let code = if slot.config.instrument {
            self.instrument(slot, request).await?
        } else {
            request.code.clone()
        };
        let lookup = self
            .cache
            .lock()
            .await
            .get_or_create(&code, |key, code| PreparedScript {
                key: key.clone(),
                code: code.to_string(),
                prepared_at: chrono::Utc::now(),
            });
        Ok((lookup.artifact, lookup.hit))
    }

    async fn instrument(&self, slot: &LanguageSlot, request: &ExecutionRequest) -> EngineResult<String> {
        let language = slot.language;
        let options = slot.options.clone().with_request(&request.options);
        let instrumentor = &self.instrumentor;

        let source = instrumentor.preprocess(&request.code, language, &options);
        let transpiled = match &slot.transpiler {
            Some(transpiler) => match transpiler.transpile(&source).await {
                Ok(code) => Ok(code),
                Err(TranspilerFailure::Rejected(err)) => Err(err),
                Err(TranspilerFailure::Unavailable(reason)) => {
                    tracing::warn!(%language, %reason, "External transpiler unavailable, using built-in");
                    instrumentor.transpile(&source, language)
                }
            },
            None => instrumentor.transpile(&source, language),
        };

        let code = match transpiled {
            Ok(code) => instrumentor.postprocess(&code, language, &options),
            Err(err) => instrumentor.recover(&source, language, &options, err)?,
        };
        Ok(code)
    }

    async fn manage_memory(&self, slot: &LanguageSlot, generation: u64, handle: &WorkerHandle) {
        let language = slot.language;
        let level = lock(&slot.memory).after_execution();
        let message = match level {
            CleanupLevel::None => return,
            CleanupLevel::Light => HostToWorkerMessage::Gc,
            CleanupLevel::Full => HostToWorkerMessage::Reset {
                preserve: lock(&slot.memory).preserved_names().to_vec(),
            },
            CleanupLevel::Critical => {
                self.recycle(slot, generation, "memory critical");
                return;
            }
        };
        if let Err(e) = handle.send(message).await {
            tracing::debug!(%language, %level, error = %e, "Cleanup request not delivered");
        }
    }

    /// Retire the worker of `generation` so the next execution spawns a new one
    fn recycle(&self, slot: &LanguageSlot, generation: u64, reason: &str) {
        let language = slot.language;
        let retired = {
            let mut phase = lock(&slot.phase);
            match &*phase {
                Phase::Ready(worker) if worker.generation == generation => {
                    let handle = worker.handle.clone();
                    *phase = Phase::Uninitialized;
                    Some(handle)
                }
                _ => None,
            }
        };
        if let Some(handle) = retired {
            tracing::info!(%language, generation, reason, "Recycling worker");
            handle.terminate();
            self.reject_pending(
                |p| p.language == language && p.generation == generation,
                || EngineError::Crash {
                    language,
                    code: None,
                },
            );
        }
    }

    async fn cancel_execution(&self, id: ExecutionId) -> bool {
        let owner = lock(&self.pending)
            .get(&id)
            .map(|p| (p.language, p.generation));
        let Some((language, generation)) = owner else {
            return false;
        };
        let handle = self.slots.get(&language).and_then(|slot| match &*lock(&slot.phase) {
            Phase::Ready(worker) if worker.generation == generation => Some(worker.handle.clone()),
            _ => None,
        });
        if let Some(handle) = handle {
            tracing::debug!(%language, execution_id = %id, "Requesting cancellation");
            if let Err(e) = handle.send(HostToWorkerMessage::Cancel { id }).await {
                tracing::debug!(%language, execution_id = %id, error = %e, "Cancel not delivered");
            }
        }
        true
    }

    fn reject_pending(
        &self,
        matches: impl Fn(&PendingExecution) -> bool,
        error: impl Fn() -> EngineError,
    ) -> usize {
        let rejected: Vec<(ExecutionId, PendingExecution)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<ExecutionId> = pending
                .iter()
                .filter(|(_, p)| matches(p))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p)))
                .collect()
        };
        let count = rejected.len();
        for (id, execution) in rejected {
            let err = error();
            self.emit(execution.language, Some(id), EventKind::Error(err.to_string()));
            let _ = execution.responder.send(Err(err));
        }
        count
    }

    /// Apply one worker message
    fn route(&self, language: Language, generation: u64, message: WorkerToHostMessage) {
        match message {
            WorkerToHostMessage::Ready => {}
            WorkerToHostMessage::Console {
                id,
                console_type,
                data,
            } => {
                let entry = ConsoleEntry { console_type, data };
                let known = lock(&self.pending)
                    .get_mut(&id)
                    .map(|p| p.console.push(entry.clone()))
                    .is_some();
                if known {
                    self.emit(language, Some(id), EventKind::Console(entry));
                } else {
                    tracing::trace!(%language, execution_id = %id, "Dropping late console output");
                }
            }
            WorkerToHostMessage::Debug { id, line, data } => {
                let entry = DebugEntry { line, data };
                let known = lock(&self.pending)
                    .get_mut(&id)
                    .map(|p| p.debug.push(entry.clone()))
                    .is_some();
                if known {
                    self.emit(language, Some(id), EventKind::Debug(entry));
                } else {
                    tracing::trace!(%language, execution_id = %id, "Dropping late debug output");
                }
            }
            WorkerToHostMessage::Complete { id, data } => {
                let Some(execution) = lock(&self.pending).remove(&id) else {
                    tracing::debug!(%language, execution_id = %id, "Completion for unknown execution");
                    return;
                };
                self.emit(language, Some(id), EventKind::Complete(data.clone()));
                let _ = execution.responder.send(Ok(Completion {
                    value: data,
                    console: execution.console,
                    debug: execution.debug,
                }));
            }
            WorkerToHostMessage::Error { id, data } => {
                let Some(execution) = lock(&self.pending).remove(&id) else {
                    tracing::debug!(%language, execution_id = %id, "Error for unknown execution");
                    return;
                };
                let err = EngineError::from_worker(data, execution.timeout);
                tracing::debug!(%language, execution_id = %id, error = %err, "Execution failed");
                self.emit(language, Some(id), EventKind::Error(err.to_string()));
                let _ = execution.responder.send(Err(err));
            }
            WorkerToHostMessage::Status { id, data } => {
                tracing::debug!(%language, message = %data.message, "Worker status");
                self.emit(language, id, EventKind::Status(data.message));
            }
            WorkerToHostMessage::Memory { data } => {
                if let Some(slot) = self.slots.get(&language) {
                    if slot.generations.load(Ordering::SeqCst) == generation {
                        lock(&slot.memory).observe(data);
                    }
                }
            }
        }
    }

    fn on_exit(self: &Arc<Self>, language: Language, generation: u64, exit: WorkerExit) {
        let Ok(slot) = self.slot(language) else {
            return;
        };
        let current = {
            let mut phase = lock(&slot.phase);
            match &*phase {
                Phase::Ready(worker) if worker.generation == generation => {
                    *phase = Phase::Uninitialized;
                    true
                }
                _ => false,
            }
        };
        if !current {
            tracing::debug!(%language, generation, %exit, "Retired worker exited");
            return;
        }

        let rejected = self.reject_pending(
            |p| p.language == language && p.generation == generation,
            || EngineError::Crash {
                language,
                code: exit.code,
            },
        );
        if self.shutdown.is_cancelled() {
            return;
        }
        if exit.is_clean() {
            tracing::info!(%language, generation, rejected, "Worker exited");
            self.emit(
                language,
                None,
                EventKind::Status(format!("{} worker exited", language)),
            );
            return;
        }

        tracing::warn!(%language, generation, %exit, rejected, "Worker crashed");
        self.emit(
            language,
            None,
            EventKind::Status(format!("{} worker crashed ({})", language, exit)),
        );
        self.schedule_restart(language, &exit.to_string());
    }

    async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        tracing::info!("Shutting down executor registry");
        for slot in self.slots.values() {
            let old = std::mem::replace(&mut *lock(&slot.phase), Phase::Uninitialized);
            if let Phase::Ready(worker) = old {
                worker.handle.terminate();
            }
            if let Some(transpiler) = &slot.transpiler {
                transpiler.shutdown().await;
            }
        }
        self.reject_pending(|_| true, || EngineError::Shutdown);
    }
}

/// Feed one worker incarnation's events into the registry
async fn route_events(
    registry: Weak<Inner>,
    language: Language,
    generation: u64,
    mut events: mpsc::Receiver<WorkerEvent>,
    ready: oneshot::Sender<()>,
) {
    let mut ready = Some(ready);
    let mut exit = None;
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message(WorkerToHostMessage::Ready) => match ready.take() {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => tracing::debug!(%language, generation, "Ignoring repeated ready"),
            },
            WorkerEvent::Message(message) => {
                let Some(inner) = registry.upgrade() else {
                    return;
                };
                tracing::trace!(%language, generation, ?message, "Worker message");
                inner.route(language, generation, message);
            }
            WorkerEvent::Exited(worker_exit) => {
                exit = Some(worker_exit);
                break;
            }
        }
    }
    drop(ready);
    let exit = exit.unwrap_or_else(|| WorkerExit::unknown("worker channel closed"));
    if let Some(inner) = registry.upgrade() {
        inner.on_exit(language, generation, exit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::worker::WorkerEndpoint;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Echo worker: completes every execution with its code. `hang` never
    /// replies, `crash` exits with status 7, `silent` workers never send ready.
    struct EchoSpawner {
        spawns: AtomicUsize,
        silent: bool,
    }

    impl EchoSpawner {
        fn new(silent: bool) -> Arc<Self> {
            Arc::new(Self {
                spawns: AtomicUsize::new(0),
                silent,
            })
        }
    }

    async fn echo(mut endpoint: WorkerEndpoint, silent: bool) {
        if !silent {
            endpoint.emit(WorkerToHostMessage::Ready).await;
        }
        loop {
            let message = tokio::select! {
                _ = endpoint.shutdown.cancelled() => break,
                message = endpoint.inbox.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            let HostToWorkerMessage::Execute { id, code, .. } = message else {
                continue;
            };
            if code.contains("crash") {
                endpoint.exit(WorkerExit::code(7)).await;
                return;
            }
            if code.contains("hang") {
                continue;
            }
            endpoint
                .emit(WorkerToHostMessage::Complete {
                    id,
                    data: serde_json::Value::String(code),
                })
                .await;
        }
        endpoint.exit(WorkerExit::unknown("terminated")).await;
    }

    #[async_trait]
    impl WorkerSpawner for EchoSpawner {
        async fn spawn(&self, _: Language, _: &[String]) -> EngineResult<WorkerConnection> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let (conn, endpoint) = WorkerConnection::channel(None);
            tokio::spawn(echo(endpoint, self.silent));
            Ok(conn)
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    fn registry(spawner: Arc<EchoSpawner>) -> ExecutorRegistry {
        let mut config = LivepadConfig::with_default_languages();
        config.engine.ready_timeout = Duration::from_millis(200);
        config.engine.safety_grace = Duration::from_millis(50);
        config.engine.restart.base_delay = Duration::from_secs(60);
        for lang in config.languages.values_mut() {
            lang.instrument = false;
            lang.memory_management = false;
        }
        let cache = Arc::new(tokio::sync::Mutex::new(ScriptCache::new(&CacheConfig::default())));
        ExecutorRegistry::new(&config, spawner, cache).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_initialize_spawns_once() {
        let spawner = EchoSpawner::new(false);
        let registry = registry(spawner.clone());
        let (a, b) = tokio::join!(
            registry.initialize(Language::Python),
            registry.initialize(Language::Python)
        );
        a.unwrap();
        b.unwrap();
        registry.initialize(Language::Python).await.unwrap();
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 1);
        assert_eq!(registry.phase(Language::Python), Some(WorkerPhase::Ready));
    }

    #[tokio::test]
    async fn test_missing_ready_is_initialization_error() {
        let registry = registry(EchoSpawner::new(true));
        let err = registry.initialize(Language::JavaScript).await.unwrap_err();
        assert_matches!(err, EngineError::Initialization { .. });
        assert_eq!(
            registry.phase(Language::JavaScript),
            Some(WorkerPhase::Uninitialized)
        );
    }

    #[tokio::test]
    async fn test_execute_reports_cache_hit_on_repeat() {
        let registry = registry(EchoSpawner::new(false));
        let first = registry
            .execute(ExecutionRequest::new(Language::JavaScript, "1 + 1"))
            .await
            .unwrap();
        assert_eq!(first.value, serde_json::json!("1 + 1"));
        assert!(!first.cache_hit);
        let second = registry
            .execute(ExecutionRequest::new(Language::JavaScript, "1 + 1"))
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(registry.phase(Language::JavaScript), Some(WorkerPhase::Ready));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_hard_timeout_clears_busy_and_recycles() {
        let spawner = EchoSpawner::new(false);
        let registry = registry(spawner.clone());
        let request = ExecutionRequest::new(Language::Python, "hang").with_timeout(Duration::from_millis(50));
        let started = Instant::now();
        let err = registry.execute(request).await.unwrap_err();
        assert_matches!(
            err,
            EngineError::Timeout {
                kind: TimeoutKind::Hard,
                ..
            }
        );
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(
            registry.phase(Language::Python),
            Some(WorkerPhase::Uninitialized)
        );

        registry
            .execute(ExecutionRequest::new(Language::Python, "ok"))
            .await
            .unwrap();
        assert_eq!(spawner.spawns.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_crash_rejects_execution() {
        let registry = registry(EchoSpawner::new(false));
        let err = registry
            .execute(ExecutionRequest::new(Language::Python, "crash"))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            EngineError::Crash {
                language: Language::Python,
                code: Some(7)
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_shutdown() {
        let registry = registry(EchoSpawner::new(false));
        assert!(!registry.cancel_execution(ExecutionId::new()).await);
        registry.initialize(Language::Python).await.unwrap();
        registry.shutdown().await;
        assert_matches!(
            registry
                .execute(ExecutionRequest::new(Language::Python, "1"))
                .await,
            Err(EngineError::Shutdown)
        );
        assert_matches!(
            registry.initialize(Language::Python).await,
            Err(EngineError::Shutdown)
        );
    }
}
