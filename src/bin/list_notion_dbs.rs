use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use data_extractors::config;
use data_extractors::connector::notion::{NotionConnector, DEFAULT_VERSION};
use data_extractors::connector::Connector;

/// List the Notion databases shared with the integration as JSON.
#[derive(Parser, Debug)]
struct Args {
    /// YAML config holding `connectors.notion`; `NOTION_TOKEN` is used when absent
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

fn fail(message: impl std::fmt::Display) -> ! {
    println!("{}", json!({ "error": message.to_string() }));
    std::process::exit(1);
}

fn notion_from(args: &Args) -> Option<NotionConnector> {
    let from_config = config::load(Some(&args.config))
        .ok()
        .and_then(|cfg| cfg.connectors.notion);
    match from_config {
        Some(n) => Some(NotionConnector::new(n.token, n.version)),
        None => std::env::var("NOTION_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty())
            .map(|t| NotionConnector::new(t, DEFAULT_VERSION.to_string())),
    }
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
    let Some(notion) = notion_from(&args) else {
        fail("Notion token is not configured");
    };
    if !notion.is_token_valid().await {
        fail("Invalid token");
    }
    match notion.list_objects().await {
        Ok(databases) => println!("{}", json!(databases)),
        Err(err) => fail(err),
    }
}
