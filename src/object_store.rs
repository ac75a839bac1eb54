//! Object storage for original file bytes.
//!
//! [`S3ObjectStore`] speaks the S3 REST API directly with AWS Signature V4
//! (pure Rust: `hmac` + `sha2`). With a custom `endpoint_url` (MinIO, Ceph,
//! LocalStack) requests are path-style: `<endpoint>/<bucket>/<key>`;
//! otherwise they go to `<bucket>.s3.<region>.amazonaws.com`.
//!
//! Credentials come from `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and
//! optionally `AWS_SESSION_TOKEN`.
//!
//! File uploads are streamed from disk and signed with `UNSIGNED-PAYLOAD`,
//! so memory use does not grow with the file size.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

use crate::config::StorageConfig;
use crate::models::FileCategory;

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket that raw uploads go to, or `None` when storage is not configured.
    fn raw_bucket(&self) -> Option<&str>;

    /// Upload `bytes` and return the durable `s3://bucket/key` URI.
    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<String>;

    /// Upload a local file. The default reads it into memory first.
    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        self.put(bucket, key, bytes).await
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Used when `[storage]` is absent. Every upload fails, so callers fall
/// back to `local://` references.
pub struct DisabledObjectStore;

#[async_trait]
impl ObjectStore for DisabledObjectStore {
    fn raw_bucket(&self) -> Option<&str> {
        None
    }

    async fn put(&self, _bucket: &str, _key: &str, _bytes: Vec<u8>) -> Result<String> {
        bail!("object storage is not configured")
    }

    async fn put_file(&self, _bucket: &str, _key: &str, _path: &Path) -> Result<String> {
        bail!("object storage is not configured")
    }
}

/// Object key for a raw upload: `raw/YYYY/MM/DD/<category>/<8-hex>_<name>`.
///
/// Path separators in `name` become `_` so the key has exactly the
/// expected depth.
pub fn object_key(name: &str, category: FileCategory, now: DateTime<Utc>) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    let short_id = &uuid::Uuid::new_v4().simple().to_string()[..8];
    format!(
        "raw/{}/{}/{}_{}",
        now.format("%Y/%m/%d"),
        category.as_str(),
        short_id,
        sanitized
    )
}

/// Fallback reference when no durable copy could be made.
pub fn local_uri(name: &str) -> String {
    format!("local://{}", name)
}

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

pub struct S3ObjectStore {
    config: StorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3ObjectStore {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Self::with_credentials(config, AwsCredentials::from_env()?)
    }

    fn with_credentials(config: &StorageConfig, creds: AwsCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            config: config.clone(),
            creds,
            client,
        })
    }

    /// `(scheme, host, canonical path)` for an object or, with an empty key, the bucket.
    fn locate(&self, bucket: &str, key: &str) -> (String, String, String) {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        match self.config.endpoint_url {
            Some(ref endpoint) => {
                let scheme = if endpoint.starts_with("http://") {
                    "http"
                } else {
                    "https"
                };
                let host = endpoint
                    .trim_start_matches("https://")
                    .trim_start_matches("http://")
                    .trim_end_matches('/')
                    .to_string();
                let path = if key.is_empty() {
                    format!("/{}", uri_encode(bucket))
                } else {
                    format!("/{}/{}", uri_encode(bucket), encoded_key)
                };
                (scheme.to_string(), host, path)
            }
            None => (
                "https".to_string(),
                format!("{}.s3.{}.amazonaws.com", bucket, self.config.region),
                format!("/{}", encoded_key),
            ),
        }
    }

    fn signed_request(
        &self,
        method: reqwest::Method,
        bucket: &str,
        key: &str,
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let (scheme, host, path) = self.locate(bucket, key);
        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.to_string()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            path,
            canonical_headers,
            signed_headers,
            payload_hash
        );
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );
        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut builder = self
            .client
            .request(method, format!("{}://{}{}", scheme, host, path))
            .header("Authorization", authorization)
            .header("x-amz-content-sha256", payload_hash)
            .header("x-amz-date", amz_date);
        if let Some(ref token) = self.creds.session_token {
            builder = builder.header("x-amz-security-token", token);
        }
        builder
    }

    /// Signed PUT whose body streams `path` from disk.
    async fn file_request(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
    ) -> Result<reqwest::RequestBuilder> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        Ok(self
            .signed_request(reqwest::Method::PUT, bucket, key, UNSIGNED_PAYLOAD)
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file))))
    }
}

async fn check_put(
    sent: reqwest::Result<reqwest::Response>,
    bucket: &str,
    key: &str,
) -> Result<String> {
    let resp = sent.with_context(|| format!("Failed to upload s3://{}/{}", bucket, key))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!(
            "S3 PutObject failed (HTTP {}): {}",
            status,
            body.chars().take(500).collect::<String>()
        );
    }
    Ok(format!("s3://{}/{}", bucket, key))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn raw_bucket(&self) -> Option<&str> {
        Some(&self.config.raw_bucket)
    }

    async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>) -> Result<String> {
        let payload_hash = hex_sha256(&bytes);
        let sent = self
            .signed_request(reqwest::Method::PUT, bucket, key, &payload_hash)
            .body(bytes)
            .send()
            .await;
        check_put(sent, bucket, key).await
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> Result<String> {
        let sent = self.file_request(bucket, key, path).await?.send().await;
        check_put(sent, bucket, key).await
    }

    /// `HEAD` on the raw bucket.
    async fn ping(&self) -> Result<()> {
        let bucket = self.config.raw_bucket.clone();
        let resp = self
            .signed_request(reqwest::Method::HEAD, &bucket, "", &hex_sha256(b""))
            .send()
            .await
            .with_context(|| format!("Failed to reach bucket {}", bucket))?;
        if !resp.status().is_success() {
            bail!("HEAD bucket {} returned HTTP {}", bucket, resp.status());
        }
        Ok(())
    }
}

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// RFC 3986 encoding of everything but `A-Z a-z 0-9 - _ . ~`.
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}
