//! HTTP content fetcher for scheduled and webhook-triggered imports.
//!
//! Downloads are streamed against a byte ceiling, retried with configurable
//! backoff, and hashed on the fly so duplicate content can be detected
//! before any parsing happens.

use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::error::{ImportError, Result};
use crate::models::{AuthConfig, RetryConfig};

const USER_AGENT: &str = "geocatalog/0.4 (+https://github.com/geocatalog/geocatalog)";

/// Minimum request timeout. Callers may ask for less; they do not get it.
const TIMEOUT_FLOOR: Duration = Duration::from_secs(5);

/// Fallback when neither the schedule, the server, nor content sniffing
/// can name a type.
const OCTET_STREAM: &str = "application/octet-stream";

/// Per-fetch options, typically derived from a [`ScheduledImport`].
///
/// [`ScheduledImport`]: crate::models::ScheduledImport
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub auth: AuthConfig,
    pub timeout: Duration,
    /// Hard ceiling on downloaded bytes; exceeding it aborts mid-stream.
    pub max_bytes: u64,
    pub retry: RetryConfig,
    /// Declared content type that overrides whatever the server claims.
    pub expected_content_type: Option<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            auth: AuthConfig::None,
            timeout: Duration::from_secs(30),
            max_bytes: 50 * 1024 * 1024,
            retry: RetryConfig::default(),
            expected_content_type: None,
        }
    }
}

/// Outcome of a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub bytes: Vec<u8>,
    /// SHA-256 of the body, hex encoded.
    pub content_hash: String,
    pub mime_type: String,
    /// Filename from Content-Disposition, when the server sent one.
    pub filename: Option<String>,
    /// Attempts consumed, including the successful one.
    pub attempts: u32,
}

/// HTTP client wrapper carrying retry and size policy.
#[derive(Clone)]
pub struct FetchClient {
    client: reqwest::Client,
}

impl FetchClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout.max(TIMEOUT_FLOOR))
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| ImportError::Fetch {
                url: String::new(),
                message: format!("failed to build HTTP client: {}", e),
                attempts: 0,
            })?;
        Ok(Self { client })
    }

    /// Fetch `url`, retrying per `options.retry`. Oversized responses are
    /// permanent failures and are not retried.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> Result<FetchedContent> {
        let headers = options.auth.headers();
        let mut attempts = 0u32;
        let mut last_error = String::new();

        while attempts <= options.retry.max_retries {
            if attempts > 0 {
                let delay = options.retry.delay_for_attempt(attempts);
                tracing::debug!(url, attempt = attempts, delay_ms = delay.as_millis() as u64, "retrying fetch");
                tokio::time::sleep(delay).await;
            }
            attempts += 1;

            match self.attempt(url, &headers, options).await {
                Ok((bytes, mime_type, filename)) => {
                    let content_hash = hex::encode(Sha256::digest(&bytes));
                    tracing::info!(url, size = bytes.len(), attempts, "fetched source");
                    return Ok(FetchedContent {
                        bytes,
                        content_hash,
                        mime_type,
                        filename,
                        attempts,
                    });
                }
                Err(e @ ImportError::ContentTooLarge { .. }) => {
                    return Err(e);
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(url, attempt = attempts, error = %last_error, "fetch attempt failed");
                }
            }
        }

        Err(ImportError::Fetch {
            url: url.to_string(),
            message: last_error,
            attempts,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        headers: &[(String, String)],
        options: &FetchOptions,
    ) -> Result<(Vec<u8>, String, Option<String>)> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let mut response = request.send().await.map_err(|e| ImportError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
            attempts: 0,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImportError::Fetch {
                url: url.to_string(),
                message: format!("HTTP {}", status.as_u16()),
                attempts: 0,
            });
        }

        // Reject early when the server declares an oversized body.
        if let Some(declared) = response.content_length() {
            if declared > options.max_bytes {
                return Err(ImportError::ContentTooLarge {
                    received: declared,
                    limit: options.max_bytes,
                });
            }
        }

        let server_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let filename = response
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition_filename);

        // Stream the body so the ceiling holds even when Content-Length lies
        // or is absent.
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| ImportError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
            attempts: 0,
        })? {
            if bytes.len() as u64 + chunk.len() as u64 > options.max_bytes {
                return Err(ImportError::ContentTooLarge {
                    received: bytes.len() as u64 + chunk.len() as u64,
                    limit: options.max_bytes,
                });
            }
            bytes.extend_from_slice(&chunk);
        }

        let mime = resolve_mime_type(
            options.expected_content_type.as_deref(),
            server_type.as_deref(),
            &bytes,
        );
        Ok((bytes, mime, filename))
    }
}

/// Resolve the effective MIME type: an explicit expectation wins, then the
/// server header, then content sniffing.
pub fn resolve_mime_type(expected: Option<&str>, server: Option<&str>, bytes: &[u8]) -> String {
    if let Some(expected) = expected {
        let trimmed = expected.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    if let Some(server) = server {
        let base = server.split(';').next().unwrap_or("").trim();
        if !base.is_empty() && base != OCTET_STREAM {
            return base.to_string();
        }
    }
    infer::get(bytes)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Parse a filename out of a Content-Disposition header value. Handles both
/// `filename="name.csv"` and RFC 5987 `filename*=UTF-8''name.csv`.
pub fn parse_content_disposition_filename(header: &str) -> Option<String> {
    if let Some(start) = header.find("filename*=") {
        let rest = &header[start + 10..];
        if let Some(quote_start) = rest.find("''") {
            let encoded = rest[quote_start + 2..].split([';', ' ']).next()?;
            if let Ok(decoded) = urlencoding::decode(encoded) {
                let filename = decoded.trim().to_string();
                if !filename.is_empty() {
                    return Some(filename);
                }
            }
        }
    }

    if let Some(start) = header.find("filename=") {
        let rest = &header[start + 9..];
        let filename = if let Some(quoted) = rest.strip_prefix('"') {
            quoted.split('"').next()
        } else {
            rest.split([';', ' ']).next()
        };
        if let Some(name) = filename {
            let name = name.trim().to_string();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_type_overrides_server_header() {
        let mime = resolve_mime_type(Some("text/csv"), Some("application/json"), b"{}");
        assert_eq!(mime, "text/csv");
    }

    #[test]
    fn test_server_header_strips_parameters() {
        let mime = resolve_mime_type(None, Some("text/csv; charset=utf-8"), b"a,b\n1,2\n");
        assert_eq!(mime, "text/csv");
    }

    #[test]
    fn test_octet_stream_header_falls_through_to_sniffing() {
        // xlsx files are zip containers; infer identifies the magic bytes.
        let zip_magic = b"PK\x03\x04rest-of-archive";
        let mime = resolve_mime_type(None, Some(OCTET_STREAM), zip_magic);
        assert_eq!(mime, "application/zip");
    }

    #[test]
    fn test_unknown_bytes_default_to_octet_stream() {
        let mime = resolve_mime_type(None, None, b"plain text with no magic");
        assert_eq!(mime, OCTET_STREAM);
    }

    #[test]
    fn test_parse_content_disposition_quoted() {
        let header = r#"attachment; filename="events.csv""#;
        assert_eq!(
            parse_content_disposition_filename(header),
            Some("events.csv".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_rfc5987_precedence() {
        let header = r#"attachment; filename="fallback.csv"; filename*=UTF-8''city%20events.csv"#;
        assert_eq!(
            parse_content_disposition_filename(header),
            Some("city events.csv".to_string())
        );
    }

    #[test]
    fn test_parse_content_disposition_none() {
        assert_eq!(parse_content_disposition_filename("attachment"), None);
    }

    #[test]
    fn test_timeout_floor_applied() {
        // Construction succeeds; the floor is enforced inside the builder.
        let client = FetchClient::new(Duration::from_millis(1));
        assert!(client.is_ok());
    }
}
