use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use data_extractors::config;
use data_extractors::connector::notion::{NotionConnector, DEFAULT_VERSION};
use data_extractors::connector::Connector;
use data_extractors::model::QueryParams;

/// Print every row of a Notion database, flattened to plain values, as JSON.
#[derive(Parser, Debug)]
struct Args {
    /// Database ID
    database_id: String,

    /// YAML config holding `connectors.notion`; `NOTION_TOKEN` is used when absent
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn fail(message: impl std::fmt::Display) -> ! {
    println!("{}", json!({ "error": message.to_string() }));
    std::process::exit(1);
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
    let notion = match config::load(Some(&args.config))
        .ok()
        .and_then(|cfg| cfg.connectors.notion)
    {
        Some(n) => NotionConnector::new(n.token, n.version),
        None => match std::env::var("NOTION_TOKEN") {
            Ok(token) if !token.trim().is_empty() => {
                NotionConnector::new(token, DEFAULT_VERSION.to_string())
            }
            _ => fail("Notion token is not configured"),
        },
    };

    match notion
        .fetch_data(&args.database_id, &QueryParams::default())
        .await
    {
        Ok(rows) => println!("{}", json!(rows)),
        Err(err) => fail(format!("Failed to fetch data: {}", err)),
    }
}
