use clap::Parser;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use data_extractors::connector::github::GitHubConnector;
use data_extractors::connector::Connector;

/// List the repositories visible to a GitHub token as JSON.
#[derive(Parser, Debug)]
struct Args {
    /// Personal access token
    token: String,
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
    match github.list_objects().await {
        Ok(repos) => println!("{}", json!({ "repos": repos })),
        Err(err) => fail(err),
    }
}
