mod cli;
mod context;
mod model;
mod plugin;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

use cli::Cli;
use context::AppContext;
use model::config::LoggingConfig;

fn main() -> ExitCode {
    // `--help` and `--version` exit here, before any directory is touched.
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("mediaport: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // The log file location comes from the config, so anything reported while
    // loading it goes to stderr.
    let bootstrap = bootstrap_subscriber(std::io::stderr, env_filter("info"));
    let mut ctx = tracing::subscriber::with_default(bootstrap, || {
        AppContext::from_env(cli.portable_flag())
    })?;

    let _guard = init_logging(&ctx.config.config().log_dir(), &ctx.config.config().logging);
    tracing::info!(
        "mediaport {} starting (portable: {}, source: {:?})",
        env!("CARGO_PKG_VERSION"),
        ctx.portable.enabled,
        ctx.portable.source
    );

    let result = cli::run(cli.command, &mut ctx);
    if let Err(err) = &result {
        tracing::error!("{err:#}");
    }
    result
}

/// Logs go to a daily file in `log_dir`, never stdout.
fn init_logging(log_dir: &std::path::Path, logging: &LoggingConfig) -> Option<WorkerGuard> {
    if !logging.file_enabled {
        return None;
    }

    let file_appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("mediaport")
        .filename_suffix("log")
        .max_log_files(logging.keep_days.max(1))
        .build(log_dir)
    {
        Ok(appender) => appender,
        Err(err) => {
            eprintln!("mediaport: file logging disabled: {err}");
            return None;
        }
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_env_filter(env_filter(&logging.level))
        .init();

    Some(guard)
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("mediaport={level}")))
}

fn bootstrap_subscriber<W>(
    writer: W,
    filter: EnvFilter,
) -> impl tracing::Subscriber + Send + Sync + 'static
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_env_filter(filter)
        .finish()
}
