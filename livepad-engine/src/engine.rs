//! Application context
//!
//! Owns the registry, the throttler and the shared script cache. There is no
//! global state: create an [`Engine`] with [`Engine::start`] and dispose of it
//! with [`Engine::shutdown`].

use crate::cache::{CacheMetrics, ScriptCache};
use crate::config::LivepadConfig;
use crate::error::{EngineResult, TranspileError};
use crate::instrument::{InstrumentOptions, Instrumentor};
use crate::memory::MemoryStats;
use crate::registry::{ExecutorRegistry, SharedCache, WorkerPhase};
use crate::throttle::{Priority, ThrottleStats, Throttler};
use crate::types::{ExecutionEvent, ExecutionOptions, ExecutionReport, ExecutionRequest};
use crate::worker::WorkerSpawner;
use livepad_common::{ExecutionId, Language};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Snapshot of every component's counters
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub cache: CacheMetrics,
    pub throttle: ThrottleStats,
    pub languages: BTreeMap<Language, LanguageStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LanguageStats {
    pub phase: WorkerPhase,
    pub memory: MemoryStats,
}

pub struct Engine {
    config: LivepadConfig,
    registry: ExecutorRegistry,
    throttler: Throttler,
    cache: SharedCache,
    instrumentor: Instrumentor,
}

impl Engine {
    /// Build the engine. Workers are started lazily or by [`Engine::warm_up`].
    pub fn start(config: LivepadConfig, spawner: Arc<dyn WorkerSpawner>) -> anyhow::Result<Self> {
        config.validate()?;
        let cache: SharedCache = Arc::new(Mutex::new(ScriptCache::new(&config.cache)));
        let registry = ExecutorRegistry::new(&config, spawner, Arc::clone(&cache))?;
        let throttler = Throttler::new(config.throttle.clone());
        tracing::info!(languages = ?registry.languages(), "Engine started");
        Ok(Self {
            config,
            registry,
            throttler,
            cache,
            instrumentor: Instrumentor::new(),
        })
    }

    pub fn config(&self) -> &LivepadConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Initialize the given languages' workers up front
    pub async fn warm_up(&self, languages: &[Language]) -> EngineResult<()> {
        for language in languages {
            self.registry.initialize(*language).await?;
        }
        Ok(())
    }

    /// Run through the throttler.
    ///
    /// A normal-priority request still waiting when a newer one arrives fails
    /// with [`crate::EngineError::Superseded`].
    pub async fn run(&self, request: ExecutionRequest, priority: Priority) -> EngineResult<ExecutionReport> {
        let registry = self.registry.clone();
        let id = request.id;
        self.throttler
            .schedule(id.to_string(), priority, move || async move {
                registry.execute(request).await
            })
            .await?
    }

    /// Run immediately, bypassing the throttler
    pub async fn execute(&self, request: ExecutionRequest) -> EngineResult<ExecutionReport> {
        self.registry.execute(request).await
    }

    pub async fn cancel(&self, id: ExecutionId) -> bool {
        self.registry.cancel_execution(id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.registry.subscribe()
    }

    /// The source a worker would receive for `code`, using the built-in
    /// transpiler
    pub fn instrument(
        &self,
        code: &str,
        language: Language,
        options: &ExecutionOptions,
    ) -> Result<String, TranspileError> {
        let instrument_options = self
            .config
            .language(language)
            .map(InstrumentOptions::for_language)
            .unwrap_or_default()
            .with_request(options);
        self.instrumentor.transform(code, language, &instrument_options)
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
        tracing::debug!("Script cache cleared");
    }

    pub async fn stats(&self) -> EngineStats {
        let cache = self.cache.lock().await.metrics();
        let throttle = self.throttler.stats().await;
        let languages = self
            .registry
            .languages()
            .into_iter()
            .filter_map(|language| {
                let phase = self.registry.phase(language)?;
                let memory = self.registry.memory_stats(language)?;
                Some((language, LanguageStats { phase, memory }))
            })
            .collect();
        EngineStats {
            cache,
            throttle,
            languages,
        }
    }

    /// Reject queued work and stop every worker
    pub async fn shutdown(&self) {
        self.throttler.shutdown().await;
        self.registry.shutdown().await;
        tracing::info!("Engine stopped");
    }
}
