//! Report publishing
//!
//! The encoded report is uploaded with a public-read ACL and a link to it is
//! posted as a comment on the pull request under review. Both targets sit
//! behind traits so the pipeline can run against fakes.

use crate::metrics::record_publish;
use crate::utils::sanitize_filename;
use crate::{DiffError, GithubSettings, Report, S3Settings};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const USER_AGENT: &str = concat!("story-diff/", env!("CARGO_PKG_VERSION"));
const SIGNED_HEADERS: &str = "content-type;host;x-amz-acl;x-amz-content-sha256;x-amz-date";

/// Everything but RFC 3986 unreserved characters and the path separator
const OBJECT_PATH: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

type HmacSha256 = Hmac<Sha256>;

/// Public blob storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `data` under `key` with public read access and return its URL
    async fn put_public(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String, DiffError>;
}

/// Review thread commenting
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommentPoster: Send + Sync {
    async fn post_comment(&self, thread: u64, body: &str) -> Result<(), DiffError>;
}

pub struct Publisher {
    store: Arc<dyn ObjectStore>,
    poster: Arc<dyn CommentPoster>,
}

impl Publisher {
    pub fn new(store: Arc<dyn ObjectStore>, poster: Arc<dyn CommentPoster>) -> Self {
        Self { store, poster }
    }

    /// Upload the report, then comment a link to it on `thread`
    ///
    /// No comment is posted when the upload fails.
    pub async fn publish(&self, report: &Report, key: &str, thread: u64) -> Result<String, DiffError> {
        let result = self.upload_and_comment(report, key, thread).await;
        record_publish(result.is_ok());
        result
    }

    async fn upload_and_comment(&self, report: &Report, key: &str, thread: u64) -> Result<String, DiffError> {
        let url = self
            .store
            .put_public(key, report.png.clone(), "image/png")
            .await?;
        info!("Report uploaded to {}", url);

        self.poster.post_comment(thread, &comment_body(&url)).await?;
        info!("Commented on #{}", thread);
        Ok(url)
    }
}

pub fn comment_body(url: &str) -> String {
    format!("![Visual difference]({url})")
}

/// Object key for the report: the commit it belongs to, or a random name
pub fn report_key(commit_sha: Option<&str>) -> String {
    let stem = commit_sha
        .map(sanitize_filename)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    format!("{stem}.png")
}

/// S3 (or S3-compatible) uploads signed with AWS Signature Version 4
pub struct S3ObjectStore {
    client: reqwest::Client,
    bucket: String,
    region: String,
    access_key_id: String,
    secret_access_key: String,
    endpoint: Option<String>,
}

impl S3ObjectStore {
    pub fn new(settings: &S3Settings) -> Result<Self, DiffError> {
        let missing = |field: &str| DiffError::Configuration(format!("publish.s3.{field} is not set"));
        let client = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            client,
            bucket: settings.bucket.clone().ok_or_else(|| missing("bucket"))?,
            region: settings.region.clone().ok_or_else(|| missing("region"))?,
            access_key_id: settings
                .access_key_id
                .clone()
                .ok_or_else(|| missing("access_key_id"))?,
            secret_access_key: settings
                .secret_access_key
                .clone()
                .ok_or_else(|| missing("secret_access_key"))?,
            endpoint: settings.endpoint.clone(),
        })
    }

    /// `(url, host, canonical path)` of an object
    fn location(&self, key: &str) -> Result<(String, String, String), DiffError> {
        let encoded_key = uri_encode_path(key);
        match &self.endpoint {
            Some(endpoint) => {
                let base = url::Url::parse(endpoint)
                    .map_err(|e| DiffError::Configuration(format!("invalid S3 endpoint: {e}")))?;
                let host = match (base.host_str(), base.port()) {
                    (Some(host), Some(port)) => format!("{host}:{port}"),
                    (Some(host), None) => host.to_string(),
                    _ => {
                        return Err(DiffError::Configuration(
                            "S3 endpoint has no host".to_string(),
                        ))
                    }
                };
                let path = format!("/{}/{}", uri_encode_path(&self.bucket), encoded_key);
                let url = format!("{}{}", endpoint.trim_end_matches('/'), path);
                Ok((url, host, path))
            }
            None => {
                let host = format!("{}.s3.{}.amazonaws.com", self.bucket, self.region);
                let path = format!("/{encoded_key}");
                Ok((format!("https://{host}{path}"), host, path))
            }
        }
    }

    /// Headers of a signed public-read PUT, `authorization` last
    fn signed_headers(
        &self,
        host: &str,
        path: &str,
        payload: &[u8],
        content_type: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(&'static str, String)>, DiffError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = hex::encode(Sha256::digest(payload));

        let canonical_request = format!(
            "PUT\n{path}\n\ncontent-type:{content_type}\nhost:{host}\nx-amz-acl:public-read\n\
             x-amz-content-sha256:{payload_hash}\nx-amz-date:{amz_date}\n\n{SIGNED_HEADERS}\n{payload_hash}"
        );
        let scope = format!("{date}/{}/s3/aws4_request", self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(&self.secret_access_key, &date, &self.region, "s3")?;
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        Ok(vec![
            ("content-type", content_type.to_string()),
            ("x-amz-acl", "public-read".to_string()),
            ("x-amz-content-sha256", payload_hash),
            ("x-amz-date", amz_date),
            (
                "authorization",
                format!(
                    "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={SIGNED_HEADERS}, Signature={signature}",
                    self.access_key_id
                ),
            ),
        ])
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_public(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<String, DiffError> {
        let (url, host, path) = self.location(key)?;
        let headers = self.signed_headers(&host, &path, &data, content_type, Utc::now())?;

        debug!("Uploading {} bytes to {}", data.len(), url);
        let mut request = self.client.put(&url).body(data);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DiffError::Publish(format!("upload returned {status}: {body}")));
        }
        Ok(url)
    }
}

/// Posts issue comments through the GitHub REST API
pub struct GithubCommentPoster {
    client: reqwest::Client,
    api_url: String,
    repository: String,
    token: String,
}

impl GithubCommentPoster {
    pub fn new(settings: &GithubSettings) -> Result<Self, DiffError> {
        let missing = |field: &str| DiffError::Configuration(format!("publish.github.{field} is not set"));
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            repository: settings.repository.clone().ok_or_else(|| missing("repository"))?,
            token: settings.token.clone().ok_or_else(|| missing("token"))?,
        })
    }

    fn comments_url(&self, thread: u64) -> String {
        format!("{}/repos/{}/issues/{}/comments", self.api_url, self.repository, thread)
    }
}

#[async_trait]
impl CommentPoster for GithubCommentPoster {
    async fn post_comment(&self, thread: u64, body: &str) -> Result<(), DiffError> {
        let response = self
            .client
            .post(self.comments_url(thread))
            .bearer_auth(&self.token)
            .header("accept", "application/vnd.github+json")
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DiffError::Publish(format!("comment returned {status}: {body}")));
        }
        Ok(())
    }
}

/// HMAC-SHA256 (RFC 2104)
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], DiffError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| DiffError::Publish(format!("invalid signing key: {e}")))?;
    mac.update(data);

    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// SigV4 key derivation for one day, region and service
pub fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Result<[u8; 32], DiffError> {
    let k_date = hmac_sha256(format!("AWS4{secret}").as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// Percent-encode an object path for the canonical request; `/` is kept
fn uri_encode_path(path: &str) -> String {
    utf8_percent_encode(path, OBJECT_PATH).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn report() -> Report {
        Report {
            png: vec![0x89, b'P', b'N', b'G'],
            width: 1024,
            height: 10,
            artifact_count: 1,
        }
    }

    fn s3_settings() -> S3Settings {
        S3Settings {
            bucket: Some("diffs".to_string()),
            region: Some("eu-west-1".to_string()),
            access_key_id: Some("AKIDEXAMPLE".to_string()),
            secret_access_key: Some("wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string()),
            endpoint: None,
        }
    }

    #[test]
    fn test_hmac_sha256_rfc4231() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_signing_key_derivation() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20120215",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "f4780e2d9f65fa895f9c67b32ce1baf0b0d8a43505a000a1a9e090d414db404d"
        );
    }

    #[test]
    fn test_signed_headers_shape() {
        let store = S3ObjectStore::new(&s3_settings()).unwrap();
        let (url, host, path) = store.location("abc123.png").unwrap();
        assert_eq!(url, "https://diffs.s3.eu-west-1.amazonaws.com/abc123.png");
        assert_eq!(host, "diffs.s3.eu-west-1.amazonaws.com");

        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let headers = store
            .signed_headers(&host, &path, b"png", "image/png", now)
            .unwrap();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(get("x-amz-acl"), "public-read");
        assert_eq!(get("x-amz-date"), "20240501T123000Z");
        assert_eq!(get("x-amz-content-sha256"), hex::encode(Sha256::digest(b"png")));

        let authorization = get("authorization");
        assert!(authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/eu-west-1/s3/aws4_request, \
             SignedHeaders=content-type;host;x-amz-acl;x-amz-content-sha256;x-amz-date, Signature="
        ));
        let signature = authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);

        // deterministic for the same inputs
        assert_eq!(
            headers,
            store
                .signed_headers(&host, &path, b"png", "image/png", now)
                .unwrap()
        );
    }

    #[test]
    fn test_path_style_endpoint() {
        let settings = S3Settings {
            endpoint: Some("http://localhost:9000/".to_string()),
            ..s3_settings()
        };
        let store = S3ObjectStore::new(&settings).unwrap();
        let (url, host, path) = store.location("feature branch.png").unwrap();
        assert_eq!(url, "http://localhost:9000/diffs/feature%20branch.png");
        assert_eq!(host, "localhost:9000");
        assert_eq!(path, "/diffs/feature%20branch.png");
    }

    #[test]
    fn test_object_path_encoding() {
        assert_eq!(uri_encode_path("a-b_c.d~e/f.png"), "a-b_c.d~e/f.png");
        assert_eq!(uri_encode_path("feature/ä b+c.png"), "feature/%C3%A4%20b%2Bc.png");
    }

    #[test]
    fn test_incomplete_settings_are_rejected() {
        let settings = S3Settings {
            bucket: None,
            ..s3_settings()
        };
        assert!(matches!(
            S3ObjectStore::new(&settings),
            Err(DiffError::Configuration(_))
        ));
        assert!(GithubCommentPoster::new(&GithubSettings::default()).is_err());
    }

    #[test]
    fn test_comments_url() {
        let settings = GithubSettings {
            token: Some("t".to_string()),
            repository: Some("acme/app".to_string()),
            pull_request: Some(7),
            api_url: "https://github.example.com/api/v3/".to_string(),
        };
        let poster = GithubCommentPoster::new(&settings).unwrap();
        assert_eq!(
            poster.comments_url(7),
            "https://github.example.com/api/v3/repos/acme/app/issues/7/comments"
        );
    }

    #[test]
    fn test_report_key() {
        assert_eq!(report_key(Some("abc123")), "abc123.png");
        assert_eq!(report_key(Some("refs/heads/x")), "refs_heads_x.png");

        let random = report_key(None);
        assert!(random.ends_with(".png"));
        assert_eq!(random.len(), 36 + 4);
    }

    #[tokio::test]
    async fn test_publish_uploads_then_comments() {
        let mut store = MockObjectStore::new();
        store
            .expect_put_public()
            .withf(|key, data, content_type| {
                key == "abc.png" && data.len() == 4 && content_type == "image/png"
            })
            .times(1)
            .returning(|key, _, _| Ok(format!("https://diffs.example.com/{key}")));

        let mut poster = MockCommentPoster::new();
        poster
            .expect_post_comment()
            .withf(|thread, body| {
                *thread == 12 && body == "![Visual difference](https://diffs.example.com/abc.png)"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let publisher = Publisher::new(Arc::new(store), Arc::new(poster));
        let url = publisher.publish(&report(), "abc.png", 12).await.unwrap();
        assert_eq!(url, "https://diffs.example.com/abc.png");
    }

    #[tokio::test]
    async fn test_failed_upload_skips_comment() {
        let mut store = MockObjectStore::new();
        store
            .expect_put_public()
            .times(1)
            .returning(|_, _, _| Err(DiffError::Publish("denied".to_string())));

        let mut poster = MockCommentPoster::new();
        poster.expect_post_comment().never();

        let publisher = Publisher::new(Arc::new(store), Arc::new(poster));
        let result = publisher.publish(&report(), "abc.png", 12).await;
        assert!(matches!(result, Err(DiffError::Publish(_))));
    }
}
