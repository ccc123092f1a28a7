use crate::clock::{Clock, SystemClock};
use crate::config::parse::{load_or_default, ConfigError};
use crate::config::resolve_config_path;
use crate::config::types::Config;
use crate::pipeline::{Pipeline, PipelineError, PipelineReport};
use crate::sink::{open_sink, SinkError};
use crate::source::timestamp::TimestampError;
use crate::source::FileSource;
use crate::transform::{DeadLetterError, DeadLetterSink, JsonLinesDeadLetter, LogDeadLetter};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("timestamp extraction error: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("dead-letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Command-line overrides for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config: Option<PathBuf>,
    pub input: Option<PathBuf>,
    pub output: Option<PathBuf>,
}

/// Load config, apply CLI overrides.
pub fn prepare_config(options: &RunOptions) -> Result<Config, ConfigError> {
    let config_path = resolve_config_path(options.config.as_deref());
    match &config_path {
        Some(path) => info!(config_path = %path.display(), "Loading configuration"),
        None => info!("No config file found, using defaults"),
    }

    let mut config = load_or_default(config_path.as_deref())?;
    if let Some(input) = &options.input {
        config.source.input = input.clone();
    }
    if let Some(output) = &options.output {
        config.sink.output = output.clone();
    }
    Ok(config)
}

pub async fn run(options: RunOptions) -> Result<PipelineReport, RunError> {
    let config = prepare_config(&options)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    info!(
        topic = %config.source.topic,
        input = %config.source.input.display(),
        output = %config.sink.output.display(),
        "Starting ingestion"
    );
    let source = Arc::new(FileSource::new(
        config.source.topic.clone(),
        &config.source.input,
        config.source.timestamp.as_ref(),
        Arc::clone(&clock),
    )?);
    let sink = open_sink(&config.sink.output)?;
    let dead_letter: Arc<dyn DeadLetterSink> = match &config.dead_letter.path {
        Some(path) => Arc::new(JsonLinesDeadLetter::open(path).await?),
        None => Arc::new(LogDeadLetter::new()),
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, draining");
            signal_token.cancel();
        }
    });

    let result = Pipeline::new(config, source, sink, dead_letter, clock)
        .run(shutdown)
        .await;

    match result {
        Ok(report) => {
            info!(
                windows = report.windows_committed,
                rows = report.rows_written,
                "Ingestion complete"
            );
            Ok(report)
        }
        Err(e) => {
            error!(error = %e, "Ingestion failed");
            Err(e.into())
        }
    }
}
