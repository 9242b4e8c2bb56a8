//! Common test utilities shared across integration and E2E tests

pub mod scripted;

pub use scripted::*;

use livepad_engine::{Engine, ExecutionEvent, ExecutionId, LivepadConfig, WorkerSpawner};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("livepad_engine=debug")
        .with_test_writer()
        .try_init();
}

/// Defaults tightened so failure paths resolve in milliseconds
pub fn test_config() -> LivepadConfig {
    let mut config = LivepadConfig::with_default_languages();
    config.engine.ready_timeout = Duration::from_millis(500);
    config.engine.safety_grace = Duration::from_millis(100);
    config.engine.restart.base_delay = Duration::from_millis(20);
    config.engine.restart.max_delay = Duration::from_millis(100);
    config.throttle.min_delay = Duration::from_millis(5);
    config.throttle.max_delay = Duration::from_millis(20);
    for language in config.languages.values_mut() {
        language.memory_management = false;
    }
    config
}

pub fn start_engine(config: LivepadConfig, spawner: Arc<dyn WorkerSpawner>) -> Engine {
    setup_test_logging();
    Engine::start(config, spawner).expect("engine should start")
}

/// Events already delivered for `id`, in order
pub fn drain_events(rx: &mut broadcast::Receiver<ExecutionEvent>, id: ExecutionId) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.execution_id == Some(id) {
            events.push(event);
        }
    }
    events
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
