//! Full round trips through the bundled Node.js and Python workers.
//!
//! Each test returns early when its interpreter is not installed.

use crate::common::{setup_test_logging, test_config};
use assert_matches::assert_matches;
use livepad_engine::{
    ConsoleType, Engine, EngineError, ExecutionRequest, Language, LivepadConfig, ProcessSpawner,
};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

fn installed(program: &str) -> bool {
    let found = Command::new(program)
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success());
    if !found {
        eprintln!("skipping: {} is not installed", program);
    }
    found
}

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(PathBuf::from)
        .unwrap_or_default()
}

fn process_engine(mut config: LivepadConfig) -> Engine {
    setup_test_logging();
    config.engine.ready_timeout = Duration::from_secs(10);
    config.engine.safety_grace = Duration::from_secs(2);
    for language in config.languages.values_mut() {
        language.default_timeout = Duration::from_secs(5);
    }
    let spawner = ProcessSpawner::with_working_dir(workspace_root());
    Engine::start(config, Arc::new(spawner)).expect("engine should start")
}

#[tokio::test]
async fn test_python_reports_prints_and_expressions() {
    if !installed("python3") {
        return;
    }
    let engine = process_engine(test_config());

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(
                Language::Python,
                "x = 2 * 3\nprint(x + 1)\nx\nimport sys\nsys.stdout.write('hi\\n')\n"
            ))
            .await
    );
    assert_eq!(report.debug_at(2), Some(&serde_json::json!("7")));
    assert_eq!(report.debug_at(3), Some(&serde_json::json!("6")));
    assert_eq!(report.console.len(), 1);
    assert_eq!(report.console[0].console_type, ConsoleType::Log);
    assert_eq!(report.console[0].data, vec![serde_json::json!("hi")]);

    // bindings survive between executions
    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(x * 10)\n"))
            .await
    );
    assert_eq!(report.debug_at(1), Some(&serde_json::json!("60")));
    assert!(engine.registry().worker_pid(Language::Python).is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_python_loop_limit_and_syntax_errors() {
    if !installed("python3") {
        return;
    }
    let mut config = test_config();
    if let Some(python) = config.languages.get_mut("python") {
        python.max_iterations = 1000;
    }
    let engine = process_engine(config);

    let err = engine
        .execute(ExecutionRequest::new(Language::Python, "n = 0\nwhile True:\n    n += 1\n"))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        EngineError::Execution { ref message, .. } if message == "loop limit exceeded"
    );

    let err = engine
        .execute(ExecutionRequest::new(Language::Python, "def broken(:\n    pass\n"))
        .await
        .unwrap_err();
    assert_matches!(err, EngineError::Transpile(ref e) if e.line == 1);

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::Python, "print(n)\n"))
            .await
    );
    assert_eq!(report.debug_at(1), Some(&serde_json::json!("1000")));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_python_walrus_loop_counts_each_entry_separately() {
    if !installed("python3") {
        return;
    }
    let mut config = test_config();
    if let Some(python) = config.languages.get_mut("python") {
        python.max_iterations = 1000;
    }
    let engine = process_engine(config);

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(
                Language::Python,
                "total = 0\nfor i in range(300):\n    j = 0\n    while (j := j + 1) < 50:\n        total += 1\nprint(total)\n"
            ))
            .await
    );
    assert_eq!(report.debug_at(6), Some(&serde_json::json!("14700")));

    let err = engine
        .execute(ExecutionRequest::new(
            Language::Python,
            "k = 0\nwhile (k := k + 1):\n    pass\n",
        ))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        EngineError::Execution { ref message, .. } if message == "loop limit exceeded"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn test_javascript_braceless_loops_hit_the_limit() {
    if !installed("node") {
        return;
    }
    let mut config = test_config();
    if let Some(js) = config.languages.get_mut("javascript") {
        js.max_iterations = 1000;
    }
    let engine = process_engine(config);

    for code in [
        "let n = 0\nwhile (true)\n  n++\n",
        "let x = 0\nwhile (true) if (x < 0) break;\n",
        "let y = 0\ndo y++; while (true)\n",
    ] {
        let err = engine
            .execute(ExecutionRequest::new(Language::JavaScript, code))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            EngineError::Execution { ref name, ref message, .. }
                if name == "RangeError" && message == "loop limit exceeded"
        );
    }
    assert!(engine.registry().worker_pid(Language::JavaScript).is_some());

    engine.shutdown().await;
}

#[tokio::test]
async fn test_javascript_and_typescript_share_the_node_worker_script() {
    if !installed("node") {
        return;
    }
    let engine = process_engine(test_config());

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(
                Language::JavaScript,
                "const a = [1, 2, 3];\nconsole.log(a.length);\na.map(x => x * 2)\nconsole.warn('careful')\n"
            ))
            .await
    );
    assert_eq!(report.debug_at(2), Some(&serde_json::json!("3")));
    assert_eq!(report.debug_at(3), Some(&serde_json::json!("[ 2, 4, 6 ]")));
    assert_eq!(report.console.len(), 1);
    assert_eq!(report.console[0].console_type, ConsoleType::Warn);

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(
                Language::TypeScript,
                "interface Point { x: number }\nconst p: Point = { x: 4 } satisfies Point;\np.x * 2\nnamespace Geo { export const scale = 3 }\nGeo.scale * p.x\n"
            ))
            .await
    );
    assert_eq!(report.debug_at(3), Some(&serde_json::json!("8")));
    assert_eq!(report.debug_at(5), Some(&serde_json::json!("12")));

    engine.shutdown().await;
}

#[tokio::test]
async fn test_javascript_soft_timeout_is_reported_by_the_worker() {
    if !installed("node") {
        return;
    }
    let mut config = test_config();
    if let Some(js) = config.languages.get_mut("javascript") {
        js.max_iterations = u64::MAX;
    }
    let engine = process_engine(config);

    let err = engine
        .execute(
            ExecutionRequest::new(Language::JavaScript, "while (true) {}\n")
                .with_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert_matches!(
        err,
        EngineError::Timeout {
            kind: livepad_engine::TimeoutKind::Soft,
            ..
        }
    );

    let report = assert_ok!(
        engine
            .execute(ExecutionRequest::new(Language::JavaScript, "1 + 1\n"))
            .await
    );
    assert_eq!(report.debug_at(1), Some(&serde_json::json!("2")));

    engine.shutdown().await;
}
