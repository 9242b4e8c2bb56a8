mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "livepad")]
#[command(about = "Run JavaScript, TypeScript and Python snippets with per-line results")]
#[command(version = "0.2.0")]
pub struct Cli {
    /// Configuration file (default: ~/.config/livepad/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory worker commands are started in
    #[arg(long, global = true)]
    pub worker_dir: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a file once and print its results
    Run {
        file: PathBuf,

        #[command(flatten)]
        exec: commands::ExecArgs,

        /// Print the execution report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the instrumented source a worker would receive
    Instrument {
        file: PathBuf,

        #[command(flatten)]
        exec: commands::ExecArgs,
    },
    /// Re-run a file whenever it changes (Ctrl-C to stop)
    Watch {
        file: PathBuf,

        #[command(flatten)]
        exec: commands::ExecArgs,

        /// Polling interval in milliseconds
        #[arg(long, default_value_t = 250)]
        interval: u64,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_file.as_deref())?;

    let options = commands::GlobalOptions {
        config: cli.config,
        worker_dir: cli.worker_dir,
    };

    let success = match cli.command {
        Commands::Run { file, exec, json } => commands::run(&options, &file, &exec, json).await?,
        Commands::Instrument { file, exec } => commands::instrument(&options, &file, &exec)?,
        Commands::Watch {
            file,
            exec,
            interval,
        } => commands::watch(&options, &file, &exec, interval).await?,
        Commands::Config => commands::print_config(&options)?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

/// Console logging filtered by `LIVEPAD_LOG` / `RUST_LOG`, plus an optional
/// plain-text file layer. The returned guard flushes the file on drop.
fn init_tracing(
    verbose: bool,
    log_file: Option<&std::path::Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let log_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("LIVEPAD_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "livepad={},livepad_engine={},livepad_common={}",
                log_level, log_level, log_level
            ))
        });

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow::anyhow!("--log-file needs a file name"))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true),
        )
        .with(file_layer)
        .with(filter)
        .init();

    Ok(guard)
}
