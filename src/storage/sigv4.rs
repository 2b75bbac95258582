//! AWS Signature Version 4 for S3 REST calls and presigned URLs.
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub(crate) const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

type HmacSha256 = Hmac<Sha256>;

fn hmac(key: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key size");
    mac.update(msg);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// `kSigning = HMAC(HMAC(HMAC(HMAC("AWS4"+secret, date), region), service), "aws4_request")`
pub(crate) fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

/// Percent-encode everything outside the unreserved set; `/` kept as-is in paths.
pub(crate) fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k).into_owned(),
                urlencoding::encode(v).into_owned(),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// A request ready to hand to the HTTP client.
#[derive(Debug, Clone)]
pub(crate) struct SignedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Clone)]
pub(crate) struct Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: &'static str,
}

impl Signer {
    pub(crate) fn s3(access_key: &str, secret_key: &str, region: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            region: region.to_string(),
            service: "s3",
        }
    }

    fn scope(&self, date: &str) -> String {
        format!("{}/{}/{}/aws4_request", date, self.region, self.service)
    }

    fn host(endpoint: &Url) -> String {
        let host = endpoint.host_str().unwrap_or_default();
        match endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    fn signature(&self, date: &str, amz_date: &str, canonical_request: &str) -> String {
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            ALGORITHM,
            amz_date,
            self.scope(date),
            sha256_hex(canonical_request.as_bytes())
        );
        let key = signing_key(&self.secret_key, date, &self.region, self.service);
        hex::encode(hmac(&key, string_to_sign.as_bytes()))
    }

    /// Header-signed request for `method {endpoint}{path}?{query}`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn sign(
        &self,
        method: &str,
        endpoint: &Url,
        path: &str,
        query: &[(String, String)],
        extra_headers: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> SignedRequest {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let host = Self::host(endpoint);
        let uri = encode_path(path);
        let query_string = canonical_query(query);

        let mut headers: Vec<(String, String)> = vec![
            ("host".into(), host.clone()),
            ("x-amz-content-sha256".into(), payload_hash.to_string()),
            ("x-amz-date".into(), amz_date.clone()),
        ];
        headers.extend(
            extra_headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string())),
        );
        headers.sort();

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();
        let signed_headers = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, uri, query_string, canonical_headers, signed_headers, payload_hash
        );
        let signature = self.signature(&date, &amz_date, &canonical_request);

        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM,
            self.access_key,
            self.scope(&date),
            signed_headers,
            signature
        );
        headers.retain(|(k, _)| k != "host");
        headers.push(("authorization".into(), authorization));

        SignedRequest {
            url: build_url(endpoint, &host, &uri, &query_string),
            headers,
        }
    }

    /// Query-signed URL valid for `expires_secs`, signing only the host header.
    pub(crate) fn presign(
        &self,
        method: &str,
        endpoint: &Url,
        path: &str,
        query: &[(String, String)],
        expires_secs: u64,
        now: DateTime<Utc>,
    ) -> String {
        let date = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let host = Self::host(endpoint);
        let uri = encode_path(path);

        let mut q: Vec<(String, String)> = query.to_vec();
        q.push(("X-Amz-Algorithm".into(), ALGORITHM.into()));
        q.push((
            "X-Amz-Credential".into(),
            format!("{}/{}", self.access_key, self.scope(&date)),
        ));
        q.push(("X-Amz-Date".into(), amz_date.clone()));
        q.push(("X-Amz-Expires".into(), expires_secs.to_string()));
        q.push(("X-Amz-SignedHeaders".into(), "host".into()));
        let query_string = canonical_query(&q);

        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\n\nhost\n{}",
            method, uri, query_string, host, UNSIGNED_PAYLOAD
        );
        let signature = self.signature(&date, &amz_date, &canonical_request);
        let full_query = format!("{}&X-Amz-Signature={}", query_string, signature);
        build_url(endpoint, &host, &uri, &full_query)
    }
}

fn build_url(endpoint: &Url, host: &str, uri: &str, query: &str) -> String {
    if query.is_empty() {
        format!("{}://{}{}", endpoint.scheme(), host, uri)
    } else {
        format!("{}://{}{}?{}", endpoint.scheme(), host, uri, query)
    }
}
