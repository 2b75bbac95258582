use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use data_extractors::config;
use data_extractors::connector;
use data_extractors::db;
use data_extractors::extractor::ExtractionProfile;
use data_extractors::jobs::{self, LogManager, PipelineRequest};
use data_extractors::model::{ExtractionSummary, ExtractionType, Provider};
use data_extractors::storage::{self, StorageKind};

#[derive(Debug, Parser)]
#[command(author, version, about = "Extract objects from a SaaS source into storage")]
struct Args {
    /// Source: salesforce, zoho, sugarcrm, meta_ads, github, notion
    provider: Provider,

    /// Objects to extract; defaults to everything the source lists
    objects: Vec<String>,

    /// full or incremental
    #[arg(long = "type", default_value = "full")]
    extraction_type: ExtractionType,

    /// Days to look back for incremental extraction
    #[arg(long, default_value_t = 7)]
    days: i64,

    /// Explicit change cut-off (overrides --days)
    #[arg(long)]
    since: Option<String>,

    /// local, s3 or postgres
    #[arg(long, default_value = "local")]
    storage: StorageKind,

    /// Bookkeeping connection to attach the run to
    #[arg(long)]
    connection_id: Option<i64>,

    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn since_date(args: &Args) -> Option<String> {
    match args.extraction_type {
        ExtractionType::Full => None,
        ExtractionType::Incremental => Some(args.since.clone().unwrap_or_else(|| {
            (Utc::now() - Duration::days(args.days))
                .format("%Y-%m-%dT00:00:00Z")
                .to_string()
        })),
    }
}

async fn run(args: Args) -> Result<(String, ExtractionSummary)> {
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let source = connector::from_config(args.provider, &cfg)?;
    let mut sink = storage::from_config(args.storage, &cfg).await?;

    let objects = if args.objects.is_empty() {
        source.validate_connection().await?;
        let listed = source.list_objects().await?;
        listed.into_iter().map(|o| o.id).collect::<Vec<_>>()
    } else {
        args.objects.clone()
    };
    if objects.is_empty() {
        return Err(anyhow!("no objects to extract from {}", args.provider));
    }

    let profile = ExtractionProfile::defaults(args.provider)
        .with_overrides(&cfg.extraction_for(args.provider.as_str()));
    let req = PipelineRequest {
        connection_id: args.connection_id,
        objects,
        extraction_type: args.extraction_type,
        since: since_date(&args),
        profile,
    };
    if let Some(since) = &req.since {
        info!(%since, "incremental extraction");
    }

    let logs = LogManager::new();
    let (job_id, summary) =
        jobs::run_pipeline(&pool, &logs, source.as_ref(), sink.as_ref(), &req).await?;
    sink.close().await?;
    Ok((job_id, summary))
}

/// Log level comes from `RUST_LOG`, else from the config file when it loads.
fn log_filter(config: &Path) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config::load(Some(config))
            .map(|cfg| cfg.app.log_level)
            .unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    })
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&args.config))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    match run(args).await {
        Ok((job_id, summary)) => {
            println!("{:#}", json!(summary));
            if !summary.success {
                error!(%job_id, errors = ?summary.errors, "extraction finished with errors");
                std::process::exit(1);
            }
            info!(
                %job_id,
                records = summary.total_records(),
                seconds = summary.execution_time_seconds,
                "extraction complete"
            );
        }
        Err(err) => {
            error!("{:#}", err);
            println!("{}", json!({ "error": format!("{:#}", err) }));
            std::process::exit(1);
        }
    }
}
