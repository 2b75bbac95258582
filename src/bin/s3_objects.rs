use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use data_extractors::config;
use data_extractors::storage::s3::{CompletedPart, S3Storage};

/// Object operations against the configured S3 bucket. Prints JSON.
#[derive(Parser, Debug)]
struct Args {
    /// YAML config holding `storage.s3`
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Presigned URL for a direct upload
    PresignPut {
        key: String,
        #[arg(long, default_value_t = 3600)]
        expires: u64,
    },
    /// Presigned URL for a direct download
    PresignGet {
        key: String,
        #[arg(long, default_value_t = 3600)]
        expires: u64,
    },
    List {
        #[arg(default_value = "")]
        prefix: String,
    },
    Delete {
        key: String,
    },
    Rename {
        from: String,
        to: String,
    },
    /// Start a multipart upload and print its upload id
    MultipartStart {
        key: String,
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Presigned URL for one part of a multipart upload
    MultipartPartUrl {
        key: String,
        upload_id: String,
        part_number: u32,
        #[arg(long, default_value_t = 3600)]
        expires: u64,
    },
    /// Complete an upload; parts given as `NUMBER:ETAG`
    MultipartComplete {
        key: String,
        upload_id: String,
        #[arg(required = true)]
        parts: Vec<String>,
    },
    MultipartAbort {
        key: String,
        upload_id: String,
    },
}

fn parse_part(raw: &str) -> Result<CompletedPart> {
    let (number, etag) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("part must look like NUMBER:ETAG, got {}", raw))?;
    Ok(CompletedPart {
        part_number: number.trim().parse().context("part number")?,
        etag: etag.to_string(),
    })
}

async fn run(args: Args) -> Result<serde_json::Value> {
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let s3_cfg = cfg
        .storage
        .s3
        .clone()
        .ok_or_else(|| anyhow!("storage.s3 is not configured"))?;
    let s3 = S3Storage::new(s3_cfg)?;

    Ok(match args.command {
        Command::PresignPut { key, expires } => {
            let url = s3.presigned_put_url(&key, Duration::from_secs(expires))?;
            json!({ "url": url, "key": key })
        }
        Command::PresignGet { key, expires } => {
            let url = s3.presigned_get_url(&key, Duration::from_secs(expires))?;
            json!({ "url": url, "key": key })
        }
        Command::List { prefix } => json!({ "objects": s3.list_objects(&prefix).await? }),
        Command::Delete { key } => {
            s3.delete_object(&key).await?;
            json!({ "deleted": key })
        }
        Command::Rename { from, to } => {
            s3.rename_object(&from, &to).await?;
            json!({ "from": from, "to": to })
        }
        Command::MultipartStart { key, content_type } => {
            let upload_id = s3
                .create_multipart_upload(&key, content_type.as_deref())
                .await?;
            json!({ "uploadId": upload_id, "key": key })
        }
        Command::MultipartPartUrl {
            key,
            upload_id,
            part_number,
            expires,
        } => {
            let url =
                s3.presign_part_url(&key, &upload_id, part_number, Duration::from_secs(expires))?;
            json!({ "url": url, "partNumber": part_number })
        }
        Command::MultipartComplete {
            key,
            upload_id,
            parts,
        } => {
            let parts = parts
                .iter()
                .map(|p| parse_part(p))
                .collect::<Result<Vec<_>>>()?;
            s3.complete_multipart_upload(&key, &upload_id, &parts).await?;
            json!({ "key": key, "parts": parts.len() })
        }
        Command::MultipartAbort { key, upload_id } => {
            s3.abort_multipart_upload(&key, &upload_id).await?;
            json!({ "aborted": upload_id })
        }
    })
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
