use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use judge_engine::runtime::RuntimeRegistry;
use judge_engine::{
    FsProblemRepository, JudgeConfig, JudgeEngine, JudgeError, JudgePool, JudgeRequest,
};

/// Line written for a job that produced no verdict
#[derive(Debug, Serialize)]
struct JobError {
    submission_id: String,
    error: String,
    kind: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // stdout carries results, so logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("judge_engine=info".parse()?),
        )
        .init();

    info!("Starting Judge Worker...");

    let config = JudgeConfig::from_env().context("Failed to load configuration")?;

    let languages = config.language_table()?;
    info!("Loaded languages: {}", languages.names().join(", "));

    let registry = RuntimeRegistry::from_languages(
        &languages,
        Arc::new(config.sandbox()?),
        config.runtime_settings(),
    );
    let repository = FsProblemRepository::new(&config.problems_dir);
    let pool = Arc::new(JudgePool::new(
        Arc::new(JudgeEngine::new(Arc::new(registry))),
        Arc::new(repository),
        config.max_workers,
    ));
    info!("Judge pool ready with {} workers", pool.size());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling in-flight submissions");
                cancel.cancel();
            }
        });
    }

    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(write_results(rx));

    info!("Waiting for jobs...");

    let mut jobs = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read job from stdin")?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }

        let request: JudgeRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to parse job: {}", e);
                let _ = tx.send(error_line(&JobError {
                    submission_id: String::new(),
                    error: format!("invalid job: {}", e),
                    kind: "invalid_job",
                }));
                continue;
            }
        };

        info!(
            "Received judge job: submission_id={}, problem_id={}, language={}",
            request.submission_id, request.problem_id, request.language
        );

        let pool = Arc::clone(&pool);
        let cancel = cancel.clone();
        let tx = tx.clone();
        jobs.spawn(async move {
            let line = match pool.judge_by_id(&request, &cancel).await {
                Ok(result) => serde_json::to_string(&result).unwrap_or_else(|e| {
                    error_line(&JobError {
                        submission_id: request.submission_id.clone(),
                        error: format!("failed to serialize result: {}", e),
                        kind: "infrastructure",
                    })
                }),
                Err(e) => {
                    log_job_error(&request, &e);
                    error_line(&JobError {
                        submission_id: request.submission_id.clone(),
                        error: e.to_string(),
                        kind: e.kind(),
                    })
                }
            };
            let _ = tx.send(line);
        });
    }

    while let Some(joined) = jobs.join_next().await {
        if let Err(e) = joined {
            error!("Judge task failed: {}", e);
        }
    }

    drop(tx);
    writer.await.context("Result writer failed")??;

    info!("Judge Worker stopped");
    Ok(())
}

/// Single writer so result lines never interleave
async fn write_results(mut rx: mpsc::UnboundedReceiver<String>) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    while let Some(line) = rx.recv().await {
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn error_line(job_error: &JobError) -> String {
    serde_json::to_string(job_error).unwrap_or_else(|_| {
        format!(
            "{{\"submission_id\":{:?},\"error\":\"unserializable error\"}}",
            job_error.submission_id
        )
    })
}

fn log_job_error(request: &JudgeRequest, err: &JudgeError) {
    match err {
        JudgeError::Infrastructure(_) => {
            error!("Failed to judge submission {}: {}", request.submission_id, err)
        }
        _ => warn!("Rejected submission {}: {}", request.submission_id, err),
    }
}
