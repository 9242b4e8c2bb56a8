//! CLI command implementations

use anyhow::{anyhow, Context, Result};
use clap::Args;
use livepad_engine::{
    Engine, EngineError, EventKind, ExecutionEvent, ExecutionId, ExecutionOptions,
    ExecutionReport, ExecutionRequest, Language, LivepadConfig, Priority, ProcessSpawner,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct GlobalOptions {
    pub config: Option<PathBuf>,
    pub worker_dir: Option<PathBuf>,
}

/// Execution switches shared by the file commands
#[derive(Args, Debug, Clone)]
pub struct ExecArgs {
    /// Language (default: from the file extension)
    #[arg(short, long)]
    pub language: Option<Language>,

    /// Caller timeout in milliseconds
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Report expressions that evaluate to undefined / None
    #[arg(long)]
    pub show_undefined: bool,

    /// Do not inject loop guards
    #[arg(long)]
    pub no_loop_protection: bool,

    /// Ignore `//?` and `#?` markers
    #[arg(long)]
    pub no_magic_comments: bool,
}

impl ExecArgs {
    fn options(&self) -> ExecutionOptions {
        ExecutionOptions {
            timeout: self.timeout.map(Duration::from_millis),
            show_undefined: self.show_undefined,
            loop_protection: !self.no_loop_protection,
            magic_comments: !self.no_magic_comments,
        }
    }

    fn language_for(&self, file: &Path) -> Result<Language> {
        if let Some(language) = self.language {
            return Ok(language);
        }
        file.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Language::from_extension)
            .ok_or_else(|| {
                anyhow!(
                    "Cannot tell the language of {}; pass --language",
                    file.display()
                )
            })
    }

    fn request(&self, file: &Path, code: String) -> Result<ExecutionRequest> {
        Ok(ExecutionRequest::new(self.language_for(file)?, code).with_options(self.options()))
    }
}

fn start_engine(options: &GlobalOptions) -> Result<Engine> {
    let config = LivepadConfig::load(options.config.as_deref())?;
    let spawner = match &options.worker_dir {
        Some(dir) => ProcessSpawner::with_working_dir(dir),
        None => ProcessSpawner::new(),
    };
    Engine::start(config, Arc::new(spawner))
}

async fn read_source(file: &Path) -> Result<String> {
    tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))
}

/// Execute once. Returns false when the execution failed.
pub async fn run(options: &GlobalOptions, file: &Path, exec: &ExecArgs, json: bool) -> Result<bool> {
    let code = read_source(file).await?;
    let request = exec.request(file, code)?;
    let engine = start_engine(options)?;

    let printer = (!json).then(|| {
        let done = CancellationToken::new();
        let task = tokio::spawn(print_events(engine.subscribe(), request.id, done.clone()));
        (task, done)
    });

    info!(file = %file.display(), language = %request.language, "Running file");
    let result = engine.execute(request).await;

    if let Some((task, done)) = printer {
        done.cancel();
        let _ = task.await;
    }
    engine.shutdown().await;

    match result {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_summary(&report);
            }
            Ok(true)
        }
        Err(err) => {
            eprintln!("✗ {}", err);
            Ok(false)
        }
    }
}

/// Print the instrumented source
pub fn instrument(options: &GlobalOptions, file: &Path, exec: &ExecArgs) -> Result<bool> {
    let code = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let language = exec.language_for(file)?;
    let config = LivepadConfig::load(options.config.as_deref())?;
    let engine = Engine::start(config, Arc::new(ProcessSpawner::new()))?;

    match engine.instrument(&code, language, &exec.options()) {
        Ok(instrumented) => {
            print!("{}", instrumented);
            Ok(true)
        }
        Err(err) => {
            eprintln!("✗ {}", EngineError::Transpile(err));
            Ok(false)
        }
    }
}

/// Re-run on every change until Ctrl-C
pub async fn watch(options: &GlobalOptions, file: &Path, exec: &ExecArgs, interval_ms: u64) -> Result<bool> {
    let language = exec.language_for(file)?;
    let engine = Arc::new(start_engine(options)?);
    if let Err(e) = engine.warm_up(&[language]).await {
        warn!(%language, error = %e, "Worker not ready yet, will retry on first run");
    }

    let mut events = engine.subscribe();
    let event_printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Output too fast, events dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(10)));
    let mut last_seen: Option<SystemTime> = None;

    eprintln!("Watching {} (Ctrl-C to stop)", file.display());
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                let modified = match tokio::fs::metadata(file).await.and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(e) => {
                        debug!(file = %file.display(), error = %e, "Cannot stat watched file");
                        continue;
                    }
                };
                if last_seen == Some(modified) {
                    continue;
                }
                last_seen = Some(modified);

                let code = match read_source(file).await {
                    Ok(code) => code,
                    Err(e) => {
                        warn!(error = %e, "Skipping run");
                        continue;
                    }
                };
                let request = exec.request(file, code)?;
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    match engine.run(request, Priority::Normal).await {
                        Ok(report) => print_summary(&report),
                        Err(EngineError::Superseded) => debug!("Run superseded by a newer change"),
                        Err(err) => eprintln!("✗ {}", err),
                    }
                });
            }
        }
    }

    engine.shutdown().await;
    event_printer.abort();
    Ok(true)
}

pub fn print_config(options: &GlobalOptions) -> Result<bool> {
    let config = LivepadConfig::load(options.config.as_deref())?;
    print!("{}", config.to_toml()?);
    Ok(true)
}

/// Print events of `id` until its terminal event, or until `done` fires and
/// the backlog is drained
async fn print_events(
    mut events: broadcast::Receiver<ExecutionEvent>,
    id: ExecutionId,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) if event.execution_id == Some(id) || event.execution_id.is_none() => {
                    print_event(&event);
                    if event.is_terminal() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Output too fast, events dropped"),
                Err(RecvError::Closed) => return,
            },
            _ = done.cancelled() => {
                while let Ok(event) = events.try_recv() {
                    if event.execution_id == Some(id) {
                        print_event(&event);
                    }
                }
                return;
            }
        }
    }
}

fn print_event(event: &ExecutionEvent) {
    if let Some(line) = format_event(event) {
        match event.kind {
            EventKind::Error(_) | EventKind::Status(_) => eprintln!("{}", line),
            _ => println!("{}", line),
        }
    }
}

fn format_event(event: &ExecutionEvent) -> Option<String> {
    match &event.kind {
        EventKind::Debug(entry) => Some(format!("{:>4} │ {}", entry.line, display_value(&entry.data))),
        EventKind::Console(entry) => {
            let text: Vec<String> = entry.data.iter().map(display_value).collect();
            Some(format!("   {} │ {}", entry.console_type, text.join(" ")))
        }
        EventKind::Status(message) => Some(format!("[{}] {}", event.language, message)),
        EventKind::Error(_) | EventKind::Complete(_) => None,
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_summary(report: &ExecutionReport) {
    let cached = if report.cache_hit { ", cached" } else { "" };
    eprintln!(
        "✓ {} in {}ms ({} values{})",
        report.language,
        report.duration_ms,
        report.debug.len(),
        cached
    );
}
