//! Engines built from configuration files

use crate::common::{setup_test_logging, ScriptedSpawner};
use livepad_engine::{Engine, ExecutionRequest, Language, LivepadConfig};
use std::io::Write;
use std::time::Duration;

const CONFIG: &str = r#"
[engine]
ready_timeout = "2s"
safety_grace = "250ms"

[engine.restart]
max_attempts = 1
base_delay = "10ms"

[cache]
max_memory_bytes = 4096

[languages.python]
worker_command = ["python3", "-u", "workers/python.py"]
default_timeout = "1s"
debug_function_name = "__livepad_debug"
max_iterations = 200
"#;

#[tokio::test]
async fn test_engine_from_config_file() -> anyhow::Result<()> {
    setup_test_logging();
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(CONFIG.as_bytes())?;

    let config = LivepadConfig::load(Some(file.path()))?;
    assert_eq!(config.engine.safety_grace, Duration::from_millis(250));
    assert_eq!(config.engine.restart.max_attempts, 1);
    assert_eq!(config.cache.max_memory_bytes, 4096);

    let spawner = ScriptedSpawner::new();
    let engine = Engine::start(config, spawner.clone())?;
    assert_eq!(engine.registry().languages(), vec![Language::Python]);

    let result = engine
        .execute(ExecutionRequest::new(Language::Python, "while True:\n    pass\nprint(1)\n"))
        .await;
    assert!(result.is_err());
    assert!(spawner.executed()[0].contains("__livepad_while(lambda: (True), 200, 100)"));

    let stats = engine.stats().await;
    assert_eq!(stats.cache.max_memory, 4096);
    assert_eq!(stats.languages.len(), 1);

    engine.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_explicit_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    assert!(LivepadConfig::load(Some(&missing)).is_err());
}
