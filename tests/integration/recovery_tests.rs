//! Crashes, hard timeouts, exhausted restarts and shutdown

use crate::common::{eventually, start_engine, test_config, ScriptedSpawner};
use assert_matches::assert_matches;
use async_trait::async_trait;
use livepad_engine::{
    EngineError, EngineResult, EventKind, ExecutionRequest, Language, TimeoutKind,
    WorkerConnection, WorkerPhase, WorkerSpawner,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::assert_ok;

#[tokio::test]
async fn test_crash_rejects_execution_and_worker_comes_back() {
    let spawner = ScriptedSpawner::new();
    let engine = start_engine(test_config(), spawner.clone());
    let mut events = engine.subscribe();

    let err = engine
        .execute(ExecutionRequest::new(Language::Python, "print(1)\ncrash()\n"))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        EngineError::Crash {
            language: Language::Python,
            code: Some(7)
        }
    );

    let mut saw_crash_status = false;
    while let Ok(event) = events.try_recv() {
        if let EventKind::Status(message) = &event.kind {
            saw_crash_status |= message.contains("crashed");
        }
    }
    assert!(saw_crash_status);

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(5 - 2)\n"))
            .await
    );
    assert_eq!(report.debug_at(1), Some(&serde_json::json!("3")));
    assert_eq!(spawner.spawns(), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_hard_timeout_recycles_worker() {
    let mut config = test_config();
    if let Some(python) = config.languages.get_mut("python") {
        python.default_timeout = Duration::from_millis(100);
    }
    let spawner = ScriptedSpawner::new();
    let engine = start_engine(config, spawner.clone());

    let started = Instant::now();
    let err = engine
        .execute(ExecutionRequest::new(Language::Python, "import time\ntime.sleep(60)\n"))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_matches!(
        err,
        EngineError::Timeout {
            kind: TimeoutKind::Hard,
            ..
        }
    );
    // caller timeout + safety grace, plus scheduling slack
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(2));
    assert_ne!(engine.registry().phase(Language::Python), Some(WorkerPhase::Busy));
    assert_eq!(engine.registry().current_execution(Language::Python), None);
    assert_eq!(engine.registry().pending_count(), 0);

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(9)\n"))
            .await
    );
    assert_eq!(report.debug_at(1), Some(&serde_json::json!("9")));
    assert_eq!(spawner.spawns(), 2);

    engine.shutdown().await;
}

/// Every spawn fails outright
#[derive(Default)]
struct BrokenSpawner {
    attempts: AtomicUsize,
}

#[async_trait]
impl WorkerSpawner for BrokenSpawner {
    async fn spawn(&self, language: Language, _: &[String]) -> EngineResult<WorkerConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(EngineError::Initialization {
            language,
            reason: "interpreter not installed".to_string(),
        })
    }

    fn name(&self) -> &str {
        "broken"
    }
}

#[tokio::test]
async fn test_exhausted_restarts_mark_language_unavailable() {
    let spawner = Arc::new(BrokenSpawner::default());
    let engine = start_engine(test_config(), spawner.clone());

    let err = engine
        .execute(ExecutionRequest::new(Language::Python, "print(1)\n"))
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Initialization { language: Language::Python, .. });

    assert!(
        eventually(|| engine.registry().phase(Language::Python) == Some(WorkerPhase::Unavailable))
            .await
    );
    // first attempt plus three restarts
    assert_eq!(spawner.attempts.load(Ordering::SeqCst), 4);

    let err = engine
        .execute(ExecutionRequest::new(Language::Python, "print(1)\n"))
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Unavailable(Language::Python));

    engine.registry().retry(Language::Python).unwrap();
    assert_eq!(
        engine.registry().phase(Language::Python),
        Some(WorkerPhase::Uninitialized)
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_rejects_running_execution() {
    let mut config = test_config();
    if let Some(python) = config.languages.get_mut("python") {
        python.default_timeout = Duration::from_secs(30);
    }
    let spawner = ScriptedSpawner::new();
    let engine = Arc::new(start_engine(config, spawner.clone()));

    let running = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .execute(ExecutionRequest::new(Language::Python, "time.sleep(60)\n"))
                .await
        })
    };
    assert!(eventually(|| spawner.executed().len() == 1).await);

    engine.shutdown().await;
    assert_matches!(running.await.unwrap(), Err(EngineError::Shutdown));
    assert_matches!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(1)\n"))
            .await,
        Err(EngineError::Shutdown)
    );
}

#[tokio::test]
async fn test_unconfigured_language_is_rejected() {
    let mut config = test_config();
    config.languages.remove("typescript");
    let engine = start_engine(config, ScriptedSpawner::new());

    assert_matches!(
        engine
            .execute(ExecutionRequest::new(Language::TypeScript, "let x: number = 1;"))
            .await,
        Err(EngineError::UnsupportedLanguage(Language::TypeScript))
    );
    assert_eq!(engine.registry().languages().len(), 2);

    engine.shutdown().await;
}
