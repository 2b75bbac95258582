use clap::Parser;
use serde_json::{json, Value};
use std::io::Read;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use data_extractors::config;
use data_extractors::model::Record;
use data_extractors::storage::postgres::PostgresStorage;
use data_extractors::storage::StorageManager;

/// Read a JSON array of objects from stdin and insert it into a Postgres table.
#[derive(Parser, Debug)]
struct Args {
    /// Target table; created with TEXT columns when missing
    table: String,

    /// YAML config holding `storage.postgres`; `DATABASE_URL` wins when set
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn fail(message: impl std::fmt::Display) -> ! {
    println!("{}", json!({ "error": message.to_string() }));
    std::process::exit(1);
}

fn connection_url(args: &Args) -> Option<String> {
    std::env::var("DATABASE_URL")
        .ok()
        .filter(|u| u.starts_with("postgres"))
        .or_else(|| {
            config::load(Some(&args.config))
                .ok()
                .and_then(|cfg| cfg.storage.postgres)
                .map(|pg| pg.connection_url)
        })
}

fn parse_records(raw: &str) -> Result<Vec<Record>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| format!("Invalid JSON data: {}", e))?;
    let Value::Array(items) = value else {
        return Err("Invalid JSON data: expected an array".into());
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(map) => Ok(map),
            _ => Err("Invalid JSON data: expected an array of objects".to_string()),
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let mut raw = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut raw) {
        fail(format!("Failed to read stdin: {}", err));
    }
    let records = parse_records(&raw).unwrap_or_else(|e| fail(e));

    let Some(url) = connection_url(&args) else {
        fail("Postgres connection URL is not configured");
    };
    let mut storage = PostgresStorage::new(url);
    if let Err(err) = storage.connect().await {
        fail(format!("Exception: {}", err));
    }
    info!(table = %args.table, count = records.len(), "saving records");
    let saved = match storage.save(&records, &args.table).await {
        Ok(n) => n,
        Err(err) => fail(format!("Exception: {}", err)),
    };
    let _ = storage.close().await;
    println!("{}", json!({ "status": "success", "records_saved": saved }));
}
