use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rustyingest::{
    config, logging,
    index::ScopeFilter,
    service::{IngestService, PipelineComponents, QueryInput, StatusReport},
};
use walkdir::WalkDir;

#[derive(Parser)]
#[command(
    name = "rusty-ingest",
    about = "Ingest every file under a directory and report the pipeline outcome"
)]
struct Cli {
    /// Directory whose files are ingested.
    dir: PathBuf,
    /// Run a similarity query once ingestion settles.
    #[arg(long)]
    query: Option<String>,
    #[arg(long, default_value_t = 5)]
    top_k: usize,
    /// Tag submitted documents with this user.
    #[arg(long)]
    user: Option<String>,
    /// Tag submitted documents with this tenant.
    #[arg(long)]
    tenant: Option<String>,
    #[arg(long, default_value_t = 250)]
    poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::init_config().context("Failed to load configuration")?;
    logging::init_tracing();

    let files = collect_files(&cli.dir)?;
    if files.is_empty() {
        bail!("no files found under {}", cli.dir.display());
    }

    let service = IngestService::new(PipelineComponents::from_config(config)?);
    service.start().await;

    let mut document_ids = Vec::with_capacity(files.len());
    for (document_id, path) in files {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| document_id.clone());
        service
            .enqueue(
                &document_id,
                bytes,
                &filename,
                cli.user.clone(),
                cli.tenant.clone(),
            )
            .await?;
        document_ids.push(document_id);
    }
    service.close();

    let poll = Duration::from_millis(cli.poll_ms);
    let reports = wait_for_terminal(&service, &document_ids, poll).await?;
    for report in &reports {
        println!("{}", serde_json::to_string_pretty(report)?);
    }
    println!("{}", serde_json::to_string_pretty(&service.metrics_snapshot())?);

    if let Some(query) = cli.query {
        let filter = ScopeFilter {
            document_ids: None,
            user_id: cli.user,
            tenant_id: cli.tenant,
        };
        let hits = service
            .query(QueryInput::Text(query), cli.top_k, &filter)
            .await?;
        println!("{}", serde_json::to_string_pretty(&hits)?);
    }

    service.stop().await;
    Ok(())
}

/// Regular files under `dir`, keyed by their `/`-separated path relative to `dir`.
fn collect_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(dir).unwrap_or(entry.path());
        let document_id = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push((document_id, entry.into_path()));
    }
    Ok(files)
}

async fn wait_for_terminal(
    service: &IngestService,
    document_ids: &[String],
    poll: Duration,
) -> Result<Vec<StatusReport>> {
    loop {
        let pool = service.get_queue_status();
        let mut reports = Vec::with_capacity(document_ids.len());
        for document_id in document_ids {
            if let Some(report) = service.get_status(document_id).await? {
                reports.push(report);
            }
        }

        // A failed attempt waiting for its retry still holds a busy worker.
        let settled = pool.queue_depth == 0
            && pool.busy_workers == 0
            && reports.iter().all(|report| {
                report.attempt_count > 0
                    && report.vector_stage.is_terminal()
                    && report.metadata_stage.is_terminal()
            });
        if settled {
            return Ok(reports);
        }
        tracing::debug!(
            queue_depth = pool.queue_depth,
            busy = pool.busy_workers,
            "Waiting for documents to settle"
        );
        tokio::time::sleep(poll).await;
    }
}
