use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use data_extractors::connector::github::GitHubConnector;
use data_extractors::connector::Connector;
use data_extractors::model::QueryParams;

/// Print the issues of one repository as JSON.
#[derive(Parser, Debug)]
struct Args {
    /// Personal access token
    token: String,

    /// Repository as `owner/name`
    repo: String,

    /// Only issues updated at or after this ISO 8601 timestamp
    #[arg(long)]
    since: Option<String>,
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
    let github = GitHubConnector::new(args.token);
    if !github.is_token_valid().await {
        fail("Invalid token");
    }

    let params = QueryParams {
        filters: args.since.map(|since| json!({ "since": since })),
        ..Default::default()
    };
    match github.fetch_data(&args.repo, &params).await {
        Ok(issues) => println!("{}", json!({ "issues": issues })),
        Err(err) => fail(err),
    }
}
