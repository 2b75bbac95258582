//! S3 (and S3-compatible) object storage over SigV4-signed REST calls.
//!
//! Objects are addressed path-style: `{endpoint}/{bucket}/{key}`. The
//! `StorageManager` methods prefix keys with the configured base path; the
//! object operations (presign, multipart, list, delete, rename) take
//! bucket-absolute keys as handed in by the caller.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::sigv4::{sha256_hex, Signer};
use super::{Payload, RetrieveAs, Retrieved, StorageManager};
use crate::config::S3Config;
use crate::error::{StorageError, StorageResult};

pub const DEFAULT_PRESIGN_EXPIRY: Duration = Duration::from_secs(3600);
/// SigV4 presigned URLs are capped at seven days.
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 3600;

static CONTENTS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<Contents>(.*?)</Contents>").expect("valid regex"));
static KEY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"<Key>(.*?)</Key>").expect("valid regex"));
static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<Size>(\d+)</Size>").expect("valid regex"));
static LAST_MODIFIED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<LastModified>(.*?)</LastModified>").expect("valid regex"));
static NEXT_TOKEN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<NextContinuationToken>(.*?)</NextContinuationToken>").expect("valid regex")
});
static TRUNCATED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<IsTruncated>true</IsTruncated>").expect("valid regex"));
static UPLOAD_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<UploadId>(.*?)</UploadId>").expect("valid regex"));

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ListPage {
    pub objects: Vec<ObjectEntry>,
    pub next_token: Option<String>,
}

pub struct S3Storage {
    http: Client,
    signer: Signer,
    endpoint: Url,
    bucket: String,
    base_path: String,
    connected: bool,
}

impl fmt::Debug for S3Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Storage")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

fn xml_unescape(s: &str) -> String {
    s.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Parse one `ListObjectsV2` response body.
pub fn parse_list_page(xml: &str) -> ListPage {
    let objects = CONTENTS_RE
        .captures_iter(xml)
        .filter_map(|c| {
            let block = c.get(1)?.as_str();
            let key = KEY_RE.captures(block)?.get(1)?.as_str();
            Some(ObjectEntry {
                key: xml_unescape(key),
                size: SIZE_RE
                    .captures(block)
                    .and_then(|s| s[1].parse().ok())
                    .unwrap_or(0),
                last_modified: LAST_MODIFIED_RE
                    .captures(block)
                    .map(|m| m[1].to_string()),
            })
        })
        .collect();
    let next_token = if TRUNCATED_RE.is_match(xml) {
        NEXT_TOKEN_RE.captures(xml).map(|c| xml_unescape(&c[1]))
    } else {
        None
    };
    ListPage {
        objects,
        next_token,
    }
}

/// `CompleteMultipartUpload` body with parts in ascending part-number order.
pub fn complete_body(parts: &[CompletedPart]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_by_key(|p| p.part_number);
    let mut xml = String::from("<CompleteMultipartUpload>");
    for p in &sorted {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            p.part_number,
            xml_escape(&p.etag)
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

impl S3Storage {
    pub fn new(cfg: S3Config) -> StorageResult<Self> {
        let endpoint = match cfg.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            Some(e) => e.to_string(),
            None => format!("https://s3.{}.amazonaws.com", cfg.region),
        };
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| StorageError::Validation(format!("invalid S3 endpoint: {}", e)))?;
        Ok(Self {
            http: crate::connector::http_client(),
            signer: Signer::s3(&cfg.access_key, &cfg.secret_key, &cfg.region),
            endpoint,
            bucket: cfg.bucket,
            base_path: cfg.base_path,
            connected: false,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Base-path-prefixed key for a storage-relative `path`.
    pub fn full_key(&self, path: &str) -> String {
        let base = self.base_path.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        if base.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", base, path)
        }
    }

    fn object_path(&self, key: &str) -> String {
        if key.is_empty() {
            format!("/{}", self.bucket)
        } else {
            format!("/{}/{}", self.bucket, key)
        }
    }

    async fn send(
        &self,
        method: Method,
        key: &str,
        query: &[(String, String)],
        headers: &[(String, String)],
        body: Option<Vec<u8>>,
    ) -> StorageResult<reqwest::Response> {
        let payload_hash = sha256_hex(body.as_deref().unwrap_or_default());
        let signed = self.signer.sign(
            method.as_str(),
            &self.endpoint,
            &self.object_path(key),
            query,
            headers,
            &payload_hash,
            Utc::now(),
        );
        let mut req = self.http.request(method, &signed.url);
        for (k, v) in &signed.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        Ok(req.send().await?)
    }

    async fn check(res: reqwest::Response, key: &str) -> StorageResult<reqwest::Response> {
        match res.status() {
            s if s.is_success() => Ok(res),
            StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
            status => {
                let body = res.text().await.unwrap_or_default();
                error!(%status, key, "S3 request failed");
                Err(StorageError::Backend { status, body })
            }
        }
    }

    fn presign(
        &self,
        method: &str,
        key: &str,
        query: &[(String, String)],
        expires: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidInput("key is required".into()));
        }
        let secs = expires.as_secs().clamp(1, MAX_PRESIGN_SECS);
        Ok(self
            .signer
            .presign(method, &self.endpoint, &self.object_path(key), query, secs, now))
    }

    /// Time-limited URL the client can PUT the object body to.
    pub fn presigned_put_url(&self, key: &str, expires: Duration) -> StorageResult<String> {
        self.presign("PUT", key, &[], expires, Utc::now())
    }

    pub fn presigned_get_url(&self, key: &str, expires: Duration) -> StorageResult<String> {
        self.presign("GET", key, &[], expires, Utc::now())
    }

    /// One page of `ListObjectsV2` under `prefix`.
    pub async fn list_page(&self, prefix: &str, token: Option<&str>) -> StorageResult<ListPage> {
        let mut query = vec![("list-type".to_string(), "2".to_string())];
        if !prefix.is_empty() {
            query.push(("prefix".into(), prefix.to_string()));
        }
        if let Some(t) = token {
            query.push(("continuation-token".into(), t.to_string()));
        }
        let res = self.send(Method::GET, "", &query, &[], None).await?;
        let res = Self::check(res, &self.bucket).await?;
        Ok(parse_list_page(&res.text().await?))
    }

    /// Every object under `prefix`, following continuation tokens.
    #[instrument(skip(self))]
    pub async fn list_objects(&self, prefix: &str) -> StorageResult<Vec<ObjectEntry>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.list_page(prefix, token.as_deref()).await?;
            out.extend(page.objects);
            match page.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        Ok(out)
    }

    pub async fn delete_object(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidInput("key is required".into()));
        }
        let res = self.send(Method::DELETE, key, &[], &[], None).await?;
        Self::check(res, key).await?;
        info!(key, "deleted object");
        Ok(())
    }

    /// Server-side copy to `to`, then delete `from`.
    pub async fn rename_object(&self, from: &str, to: &str) -> StorageResult<()> {
        if from.is_empty() || to.is_empty() {
            return Err(StorageError::InvalidInput("source and destination keys are required".into()));
        }
        let source = super::sigv4::encode_path(&self.object_path(from));
        let res = self
            .send(
                Method::PUT,
                to,
                &[],
                &[("x-amz-copy-source".into(), source)],
                None,
            )
            .await?;
        let res = Self::check(res, from).await?;
        // CopyObject can answer 200 with an <Error> body.
        let body = res.text().await.unwrap_or_default();
        if body.contains("<Error>") {
            return Err(StorageError::Backend {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body,
            });
        }
        self.delete_object(from).await?;
        info!(from, to, "renamed object");
        Ok(())
    }

    /// Start a multipart upload and return its upload id.
    pub async fn create_multipart_upload(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> StorageResult<String> {
        if key.is_empty() {
            return Err(StorageError::InvalidInput("key is required".into()));
        }
        let headers: Vec<(String, String)> = content_type
            .map(|ct| vec![("content-type".to_string(), ct.to_string())])
            .unwrap_or_default();
        let res = self
            .send(
                Method::POST,
                key,
                &[("uploads".into(), String::new())],
                &headers,
                None,
            )
            .await?;
        let body = Self::check(res, key).await?.text().await?;
        UPLOAD_ID_RE
            .captures(&body)
            .map(|c| xml_unescape(&c[1]))
            .ok_or_else(|| StorageError::Backend {
                status: StatusCode::BAD_GATEWAY,
                body,
            })
    }

    pub fn presign_part_url(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        expires: Duration,
    ) -> StorageResult<String> {
        if upload_id.is_empty() || !(1..=10_000).contains(&part_number) {
            return Err(StorageError::InvalidInput(
                "uploadId and a part number between 1 and 10000 are required".into(),
            ));
        }
        let query = [
            ("partNumber".to_string(), part_number.to_string()),
            ("uploadId".to_string(), upload_id.to_string()),
        ];
        self.presign("PUT", key, &query, expires, Utc::now())
    }

    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> StorageResult<()> {
        if parts.is_empty() {
            return Err(StorageError::InvalidInput("at least one part is required".into()));
        }
        let body = complete_body(parts).into_bytes();
        let res = self
            .send(
                Method::POST,
                key,
                &[("uploadId".into(), upload_id.to_string())],
                &[("content-type".into(), "application/xml".into())],
                Some(body),
            )
            .await?;
        let text = Self::check(res, key).await?.text().await.unwrap_or_default();
        if text.contains("<Error>") {
            return Err(StorageError::Backend {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: text,
            });
        }
        info!(key, parts = parts.len(), "completed multipart upload");
        Ok(())
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> StorageResult<()> {
        let res = self
            .send(
                Method::DELETE,
                key,
                &[("uploadId".into(), upload_id.to_string())],
                &[],
                None,
            )
            .await?;
        Self::check(res, key).await?;
        warn!(key, "aborted multipart upload");
        Ok(())
    }
}

#[async_trait]
impl StorageManager for S3Storage {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn connect(&mut self) -> StorageResult<()> {
        self.validate().await?;
        self.connected = true;
        info!(bucket = %self.bucket, "connected to S3 bucket");
        Ok(())
    }

    async fn validate(&self) -> StorageResult<()> {
        let res = self.send(Method::HEAD, "", &[], &[], None).await?;
        match res.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StorageError::Validation(format!(
                "bucket {} does not exist",
                self.bucket
            ))),
            StatusCode::FORBIDDEN => Err(StorageError::Validation(format!(
                "access denied to bucket {}",
                self.bucket
            ))),
            status => Err(StorageError::Backend {
                status,
                body: res.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn store(
        &self,
        payload: Payload,
        path: &str,
        metadata: Option<&Map<String, Value>>,
    ) -> StorageResult<String> {
        let key = self.full_key(path);
        let mut headers = vec![
            ("content-type".to_string(), payload.content_type().to_string()),
            ("x-amz-meta-timestamp".to_string(), Utc::now().timestamp().to_string()),
            (
                "x-amz-meta-record_count".to_string(),
                payload.record_count().unwrap_or(0).to_string(),
            ),
        ];
        if let Some(meta) = metadata {
            for (k, v) in meta {
                let v = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                headers.push((format!("x-amz-meta-{}", k.to_ascii_lowercase()), v));
            }
        }
        let body = match &payload {
            Payload::Records(r) => serde_json::to_vec(r)?,
            Payload::Json(v) => serde_json::to_vec(v)?,
            other => other.to_bytes()?,
        };
        let res = self.send(Method::PUT, &key, &[], &headers, Some(body)).await?;
        Self::check(res, &key).await?;
        let uri = format!("s3://{}/{}", self.bucket, key);
        info!(%uri, "stored data");
        Ok(uri)
    }

    async fn retrieve(&self, path: &str, as_type: RetrieveAs) -> StorageResult<Retrieved> {
        let key = self.full_key(path);
        let res = self.send(Method::GET, &key, &[], &[], None).await?;
        let bytes = Self::check(res, &key).await?.bytes().await?.to_vec();
        Ok(match as_type {
            RetrieveAs::Bytes => Retrieved::Bytes(bytes),
            RetrieveAs::Text => Retrieved::Text(String::from_utf8_lossy(&bytes).into_owned()),
            RetrieveAs::Json => match serde_json::from_slice(&bytes) {
                Ok(v) => Retrieved::Json(v),
                Err(_) => {
                    warn!(key, "retrieved object is not valid JSON");
                    Retrieved::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
            },
        })
    }

    /// Keys under `path`, relative to the base path.
    async fn list(&self, path: &str) -> StorageResult<Vec<String>> {
        let mut prefix = self.full_key(path);
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        let base_prefix = format!("{}/", self.base_path.trim_end_matches('/'));
        Ok(self
            .list_objects(&prefix)
            .await?
            .into_iter()
            .map(|o| match o.key.strip_prefix(&base_prefix) {
                Some(rel) if !self.base_path.is_empty() => rel.to_string(),
                _ => o.key,
            })
            .collect())
    }

    async fn close(&mut self) -> StorageResult<()> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(base_path: &str) -> S3Storage {
        S3Storage::new(S3Config {
            access_key: "AK".into(),
            secret_key: "SK".into(),
            bucket: "bkt".into(),
            region: "us-east-1".into(),
            base_path: base_path.into(),
            endpoint_url: Some("http://127.0.0.1:9000".into()),
        })
        .unwrap()
    }

    #[test]
    fn full_key_joins_base_path() {
        assert_eq!(storage("exports/").full_key("/a/b.json"), "exports/a/b.json");
        assert_eq!(storage("").full_key("a.json"), "a.json");
    }

    #[test]
    fn list_page_parses_contents_and_token() {
        let xml = r#"<?xml version="1.0"?>
<ListBucketResult>
  <IsTruncated>true</IsTruncated>
  <Contents><Key>exports/a&amp;b.json</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified><Size>42</Size></Contents>
  <Contents><Key>exports/c.json</Key><Size>7</Size></Contents>
  <NextContinuationToken>tok==</NextContinuationToken>
</ListBucketResult>"#;
        let page = parse_list_page(xml);
        assert_eq!(page.objects.len(), 2);
        assert_eq!(page.objects[0].key, "exports/a&b.json");
        assert_eq!(page.objects[0].size, 42);
        assert_eq!(page.objects[1].last_modified, None);
        assert_eq!(page.next_token.as_deref(), Some("tok=="));
    }

    #[test]
    fn complete_body_sorts_parts() {
        let body = complete_body(&[
            CompletedPart { part_number: 2, etag: "\"b\"".into() },
            CompletedPart { part_number: 1, etag: "\"a\"".into() },
        ]);
        let first = body.find("<PartNumber>1</PartNumber>").unwrap();
        let second = body.find("<PartNumber>2</PartNumber>").unwrap();
        assert!(first < second);
        assert!(body.contains("<ETag>\"a\"</ETag>"));
    }

    #[test]
    fn presigned_part_url_carries_upload_id() {
        let s = storage("");
        let url = s
            .presign_part_url("big.bin", "up-1", 3, DEFAULT_PRESIGN_EXPIRY)
            .unwrap();
        assert!(url.starts_with("http://127.0.0.1:9000/bkt/big.bin?"));
        assert!(url.contains("partNumber=3"));
        assert!(url.contains("uploadId=up-1"));
        assert!(url.contains("X-Amz-Expires=3600"));
        assert!(s.presign_part_url("big.bin", "up-1", 0, DEFAULT_PRESIGN_EXPIRY).is_err());
    }

    #[test]
    fn presign_requires_key() {
        assert!(matches!(
            storage("").presigned_put_url("", DEFAULT_PRESIGN_EXPIRY),
            Err(StorageError::InvalidInput(_))
        ));
    }
}
