use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use data_extractors::config;
use data_extractors::oauth::{OAuthFlow, OAuthProvider, Pkce};

/// Authorization-code helpers for connector onboarding. Prints JSON.
#[derive(Parser, Debug)]
struct Args {
    /// YAML config holding the `oauth.<provider>` client
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the consent URL; prints the state (and PKCE verifier) to keep for the callback
    AuthorizeUrl {
        provider: String,
        #[arg(long)]
        state: Option<String>,
    },
    /// Exchange the code returned to the redirect URI for tokens
    Exchange {
        provider: String,
        code: String,
        #[arg(long)]
        code_verifier: Option<String>,
    },
    /// Trade a refresh token for a fresh access token
    Refresh {
        provider: String,
        refresh_token: String,
    },
}

fn flow(cfg: &config::Config, provider: &str) -> Result<OAuthFlow> {
    let provider: OAuthProvider = provider.parse()?;
    Ok(OAuthFlow::from_config(provider, cfg)?)
}

async fn run(args: Args) -> Result<serde_json::Value> {
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    match args.command {
        Command::AuthorizeUrl { provider, state } => {
            let flow = flow(&cfg, &provider)?;
            let state = state.unwrap_or_else(|| Uuid::new_v4().to_string());
            let pkce = flow.provider().requires_pkce().then(Pkce::generate);
            let url = flow.authorize_url(&state, pkce.as_ref())?;
            Ok(json!({
                "url": url.as_str(),
                "state": state,
                "code_verifier": pkce.map(|p| p.verifier),
            }))
        }
        Command::Exchange {
            provider,
            code,
            code_verifier,
        } => {
            let token = flow(&cfg, &provider)?
                .exchange_code(&code, code_verifier.as_deref())
                .await?;
            Ok(serde_json::to_value(token)?)
        }
        Command::Refresh {
            provider,
            refresh_token,
        } => {
            let token = flow(&cfg, &provider)?.refresh(&refresh_token).await?;
            Ok(serde_json::to_value(token)?)
        }
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

    match run(Args::parse()).await {
        Ok(out) => println!("{}", out),
        Err(err) => {
            println!("{}", json!({ "error": format!("{:#}", err) }));
            std::process::exit(1);
        }
    }
}
