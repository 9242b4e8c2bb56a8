//! Engine behaviour against scripted workers: reporting, caching, throttling,
//! loop guards and cancellation

use crate::common::{drain_events, eventually, start_engine, test_config, ScriptedSpawner};
use assert_matches::assert_matches;
use livepad_engine::{
    CleanupLevel, DebugEntry, EngineError, EventKind, ExecutionRequest, Language, Priority,
    WorkerPhase,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_print_reports_value_then_completes() {
    let spawner = ScriptedSpawner::new();
    let engine = start_engine(test_config(), spawner.clone());
    let mut events = engine.subscribe();

    let request = ExecutionRequest::new(Language::Python, "print(1 + 1)\n");
    let id = request.id;
    let report = assert_ok!(engine.execute(request).await);

    assert_eq!(
        report.debug,
        vec![DebugEntry {
            line: 1,
            data: serde_json::json!("2"),
        }]
    );
    assert!(!report.cache_hit);

    let kinds: Vec<EventKind> = drain_events(&mut events, id).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds.len(), 2);
    assert_matches!(&kinds[0], EventKind::Debug(entry) if entry.line == 1);
    assert_matches!(&kinds[1], EventKind::Complete(_));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_repeat_execution_is_served_from_cache() {
    let spawner = ScriptedSpawner::new();
    let engine = start_engine(test_config(), spawner.clone());

    let first = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(1 + 1)\n"))
            .await
    );
    let second = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(1 + 1)\n"))
            .await
    );

    assert!(!first.cache_hit);
    assert!(second.cache_hit);
    assert_eq!(second.debug_at(1), Some(&serde_json::json!("2")));

    let stats = engine.stats().await;
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.cache.misses, 1);
    assert_eq!(stats.cache.entries, 1);

    let executed = spawner.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0], executed[1]);
    assert_eq!(executed[0], "__livepad_debug(1, 1 + 1)\n");
    assert_eq!(spawner.spawns(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cache_budget_evicts_by_second_to_last_access() {
    let mut config = test_config();
    for language in config.languages.values_mut() {
        language.instrument = false;
    }
    // Room for two 5-byte scripts plus their per-entry overhead
    config.cache.max_memory_bytes = 1100;
    let engine = start_engine(config, ScriptedSpawner::new());

    for code in ["a = 1", "b = 2", "a = 1", "c = 3", "b = 2"] {
        assert_ok!(engine.execute(ExecutionRequest::new(Language::Python, code)).await);
    }

    let cache = engine.registry().cache().lock().await;
    assert!(cache.contains("a = 1"));
    assert!(cache.contains("b = 2"));
    assert!(!cache.contains("c = 3"));
    assert!(cache.current_memory() <= 1100);

    let metrics = cache.metrics();
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.evictions, 2);
}

#[tokio::test]
async fn test_newer_normal_run_supersedes_queued_one() {
    let engine = start_engine(test_config(), ScriptedSpawner::new());

    let (stale, fresh) = tokio::join!(
        engine.run(ExecutionRequest::new(Language::Python, "print(1)\n"), Priority::Normal),
        engine.run(ExecutionRequest::new(Language::Python, "print(2)\n"), Priority::Normal),
    );

    assert_matches!(stale, Err(EngineError::Superseded));
    let fresh = assert_ok!(fresh);
    assert_eq!(fresh.debug_at(1), Some(&serde_json::json!("2")));

    let stats = engine.stats().await;
    assert_eq!(stats.throttle.superseded, 1);
    assert_eq!(stats.throttle.executed, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_loop_limit_leaves_worker_responsive() {
    let mut config = test_config();
    if let Some(python) = config.languages.get_mut("python") {
        python.max_iterations = 500;
        python.check_interval = 50;
    }
    let spawner = ScriptedSpawner::new();
    let engine = start_engine(config, spawner.clone());

    let err = assert_err!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "while True:\n    pass\n"))
            .await
    );
    assert_matches!(
        err,
        EngineError::Execution { ref name, ref message, .. }
            if name == "RuntimeError" && message == "loop limit exceeded"
    );

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(2 * 3)\n"))
            .await
    );
    assert_eq!(report.debug_at(1), Some(&serde_json::json!("6")));
    assert_eq!(spawner.spawns(), 1);
    assert_eq!(engine.registry().phase(Language::Python), Some(WorkerPhase::Ready));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_cancel_interrupts_guarded_loop() {
    let mut config = test_config();
    if let Some(python) = config.languages.get_mut("python") {
        python.max_iterations = u64::MAX;
        python.check_interval = 100;
        python.default_timeout = Duration::from_secs(30);
    }
    let spawner = ScriptedSpawner::new();
    let engine = Arc::new(start_engine(config, spawner.clone()));

    let request = ExecutionRequest::new(Language::Python, "while True:\n    pass\n");
    let id = request.id;
    let started = Instant::now();
    let running = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.execute(request).await })
    };

    assert!(eventually(|| spawner.executed().len() == 1).await);
    assert_eq!(engine.registry().current_execution(Language::Python), Some(id));
    assert_eq!(engine.registry().phase(Language::Python), Some(WorkerPhase::Busy));
    assert!(engine.cancel(id).await);

    assert_matches!(running.await.unwrap(), Err(EngineError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(engine.registry().current_execution(Language::Python), None);
    assert!(!engine.cancel(id).await);

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(4 / 2)\n"))
            .await
    );
    assert_eq!(report.debug_at(1), Some(&serde_json::json!("2")));
    assert_eq!(spawner.spawns(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_worker_errors_keep_their_name() {
    let engine = start_engine(test_config(), ScriptedSpawner::new());

    let err = assert_err!(
        engine
            .execute(ExecutionRequest::new(
                Language::Python,
                "print(1)\nraise ValueError(\"bad input\")\n"
            ))
            .await
    );
    assert_eq!(err.to_string(), "ValueError: bad input");

    let err = assert_err!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "raise TimeoutError(\"slow\")\n"))
            .await
    );
    assert!(err.is_timeout());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_memory_cleanups_follow_execution_count() {
    let mut config = test_config();
    config.memory.light_every = 1;
    config.memory.full_every = 2;
    if let Some(python) = config.languages.get_mut("python") {
        python.memory_management = true;
    }
    let spawner = ScriptedSpawner::new();
    let engine = start_engine(config, spawner.clone());

    for _ in 0..2 {
        assert_ok!(
            engine
                .execute(ExecutionRequest::new(Language::Python, "print(3)\n"))
                .await
        );
    }

    assert!(eventually(|| spawner.received_kinds().len() == 4).await);
    assert_eq!(
        spawner.received_kinds(),
        vec!["execute", "gc", "execute", "reset"]
    );
    let memory = engine.registry().memory_stats(Language::Python).unwrap();
    assert_eq!(memory.total_executions, 2);
    assert_eq!(memory.last_cleanup, Some(CleanupLevel::Full));

    engine.shutdown().await;
}
