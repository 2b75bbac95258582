//! Error types shared by connectors and storage backends.
use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("rate limited by {provider}: {body}")]
    RateLimited { provider: &'static str, body: String },
    #[error("{provider} API error {status}: {body}")]
    Api {
        provider: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("data extraction failed: {0}")]
    DataExtraction(String),
    #[error("transformation failed: {0}")]
    Transformation(String),
    #[error("missing configuration: {0}")]
    NotConfigured(&'static str),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ConnectorError {
    /// Map a non-success response into the matching error variant.
    pub async fn from_response(provider: &'static str, res: reqwest::Response) -> Self {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED => {
                ConnectorError::Authentication(format!("{} returned 401: {}", provider, body))
            }
            StatusCode::TOO_MANY_REQUESTS => ConnectorError::RateLimited { provider, body },
            _ => ConnectorError::Api {
                provider,
                status,
                body,
            },
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ConnectorError::Authentication(_))
    }
}

pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("backend error {status}: {body}")]
    Backend { status: StatusCode, body: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
