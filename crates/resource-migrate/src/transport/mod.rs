//! Authenticated HTTP layer for one endpoint.
//!
//! Every request goes through the endpoint's [`RateLimiter`]. Responses are
//! classified into [`MigrateError`] variants by status code, so callers (and
//! the retry policy) never look at raw statuses.

mod download;
mod pagination;
mod rate_limit;

pub use download::{collect_limited, DownloadLimits, Downloaded};
pub use pagination::{extract_items, page_from_response, Cursor, Page};
pub use rate_limit::RateLimiter;

use crate::config::{EndpointConfig, MigrationConfig};
use crate::error::{MigrateError, Result};
use crate::retry::RetryPolicy;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Longest error body excerpt kept in error messages.
const MAX_ERROR_DETAIL: usize = 500;

/// Body of an [`ApiRequest`]. Kept as plain data so the request can be
/// rebuilt for every attempt.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<FormPart>),
}

#[derive(Debug, Clone)]
pub enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        content_type: Option<String>,
        data: Bytes,
    },
}

/// A request relative to the endpoint's API root (or an absolute URL).
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    pub fn patch_json(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::PATCH,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Json(body),
        }
    }

    pub fn post_multipart(path: impl Into<String>, parts: Vec<FormPart>) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Multipart(parts),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Request counters for one endpoint.
#[derive(Debug, Default)]
struct RequestStats {
    requests: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the request counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub success_rate: f64,
}

/// HTTP client bound to one endpoint.
pub struct Transport {
    label: &'static str,
    api_url: String,
    api_key: HeaderValue,
    client: reqwest::Client,
    limiter: RateLimiter,
    policy: RetryPolicy,
    stats: RequestStats,
}

impl Transport {
    /// Build a transport for `endpoint`. `label` names it in logs and errors.
    pub fn new(
        label: &'static str,
        endpoint: &EndpointConfig,
        migration: &MigrationConfig,
    ) -> Result<Self> {
        let mut api_key = HeaderValue::from_str(&endpoint.api_key).map_err(|_| {
            MigrateError::Config(format!("{}.api_key contains invalid characters", label))
        })?;
        api_key.set_sensitive(true);

        let client = reqwest::Client::builder()
            .timeout(endpoint.timeout())
            .danger_accept_invalid_certs(!endpoint.verify_ssl)
            .user_agent(concat!("resource-migrate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MigrateError::Config(format!("Failed to build {} client: {}", label, e)))?;

        if !endpoint.verify_ssl {
            warn!("TLS certificate verification disabled for {}", label);
        }

        Ok(Self {
            label,
            api_url: endpoint.api_url(),
            api_key,
            client,
            limiter: RateLimiter::new(migration.rate_limit_delay()),
            policy: RetryPolicy::from_config(migration),
            stats: RequestStats::default(),
        })
    }

    /// Replace the retry policy used by [`send`](Self::send).
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.api_url, path)
        } else {
            format!("{}/{}", self.api_url, path)
        }
    }

    /// One attempt, no retries.
    #[instrument(skip(self, request), fields(endpoint = self.label, request = %request.describe()))]
    pub async fn send_once(&self, request: &ApiRequest) -> Result<Value> {
        self.limiter.acquire().await;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let mut builder = self
            .client
            .request(request.method.clone(), self.url(&request.path))
            .header(API_KEY_HEADER, self.api_key.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Multipart(parts) => builder.multipart(build_form(parts)?),
        };

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(MigrateError::transport(e));
            }
        };

        let status = response.status();
        if status.is_success() {
            let text = response.text().await.map_err(MigrateError::transport)?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| {
                MigrateError::Validation(format!(
                    "Invalid JSON response from {}: {}",
                    request.path, e
                ))
            });
        }

        self.stats.errors.fetch_add(1, Ordering::Relaxed);
        let retry_after = parse_retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        let err = classify_status(
            self.label,
            &request.path,
            status,
            &error_detail(&body),
            retry_after,
        );
        if let Some(delay) = err.retry_after() {
            self.limiter.pause_for(delay).await;
        }
        debug!("{} failed: {}", request.describe(), err);
        Err(err)
    }

    /// Send with the transport's retry policy.
    pub async fn send(&self, request: &ApiRequest) -> Result<Value> {
        self.policy
            .call(&request.describe(), |_| self.send_once(request))
            .await
    }

    /// GET with retries.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.send(&ApiRequest::get(path)).await
    }

    /// Fetch the page at `cursor` with `limit` items, retrying transient errors.
    ///
    /// A 404 on a listing ends it rather than failing.
    pub async fn fetch_page(
        &self,
        path: &str,
        query: &[(String, String)],
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page<Value>> {
        let offset = cursor.map(Cursor::as_offset).unwrap_or(0);
        let mut request = ApiRequest::get(path);
        request.query = query.to_vec();
        let request = request.query("limit", limit).query("offset", offset);

        match self.send(&request).await {
            Ok(response) => Ok(page_from_response(response, offset, limit)),
            Err(MigrateError::NotFound(_)) => Ok(Page::last(Vec::new())),
            Err(e) => Err(e),
        }
    }

    /// Download `url` within `limits`, retrying transient errors.
    pub async fn download(&self, url: &str, limits: &DownloadLimits) -> Result<Downloaded> {
        self.policy
            .call(&format!("download {}", url), |_| self.download_once(url, limits))
            .await
    }

    /// Download `url` within `limits` with a single attempt.
    #[instrument(skip(self, limits), fields(endpoint = self.label))]
    pub async fn download_once(&self, url: &str, limits: &DownloadLimits) -> Result<Downloaded> {
        self.limiter.acquire().await;
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let full_url = self.url(url);
        let mut builder = self.client.get(&full_url);
        // Presigned storage URLs must not receive the API key
        if full_url.starts_with(&self.api_url) {
            builder = builder.header(API_KEY_HEADER, self.api_key.clone());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(MigrateError::transport(e));
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.stats.errors.fetch_add(1, Ordering::Relaxed);
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(
                self.label,
                url,
                status,
                &error_detail(&body),
                retry_after,
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        limits.check_content_type(url, content_type.as_deref())?;
        limits.check_length(url, response.content_length())?;

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(MigrateError::transport));
        let data = collect_limited(Box::pin(stream), url, limits).await?;
        debug!("Downloaded {} bytes from {}", data.len(), url);

        Ok(Downloaded { content_type, data })
    }

    /// Single cheap request to verify reachability and credentials.
    pub async fn probe(&self) -> Result<Duration> {
        let started = Instant::now();
        self.send_once(&ApiRequest::get("/datasets").query("limit", 1))
            .await?;
        Ok(started.elapsed())
    }

    pub fn stats(&self) -> StatsSnapshot {
        let requests = self.stats.requests.load(Ordering::Relaxed);
        let errors = self.stats.errors.load(Ordering::Relaxed);
        let success_rate = if requests > 0 {
            (requests - errors.min(requests)) as f64 / requests as f64
        } else {
            0.0
        };
        StatsSnapshot {
            requests,
            errors,
            success_rate,
        }
    }
}

fn build_form(parts: &[FormPart]) -> Result<reqwest::multipart::Form> {
    let mut form = reqwest::multipart::Form::new();
    for part in parts {
        form = match part {
            FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
            FormPart::File {
                name,
                file_name,
                content_type,
                data,
            } => {
                let mut file = reqwest::multipart::Part::stream(reqwest::Body::from(data.clone()))
                    .file_name(file_name.clone());
                if let Some(content_type) = content_type {
                    file = file.mime_str(content_type).map_err(|e| {
                        MigrateError::Validation(format!(
                            "Invalid content type '{}' for {}: {}",
                            content_type, file_name, e
                        ))
                    })?;
                }
                form.part(name.clone(), file)
            }
        };
    }
    Ok(form)
}

/// Map a non-success status to an error variant.
pub fn classify_status(
    endpoint: &str,
    path: &str,
    status: StatusCode,
    detail: &str,
    retry_after: Option<Duration>,
) -> MigrateError {
    let code = status.as_u16();
    let message = if detail.is_empty() {
        format!("{} {}", code, path)
    } else {
        format!("{} {}: {}", code, path, detail)
    };
    match code {
        401 | 403 => MigrateError::Authentication {
            endpoint: endpoint.to_string(),
            message,
        },
        404 => MigrateError::NotFound(message),
        408 => MigrateError::Network(message),
        409 => MigrateError::Conflict(message),
        429 => MigrateError::RateLimited {
            message,
            retry_after,
        },
        500..=599 => MigrateError::Server {
            status: code,
            message,
        },
        _ => MigrateError::Validation(message),
    }
}

/// Human-readable detail from an error body: the `detail` or `message`
/// field of a JSON object, else the start of the raw text.
pub fn error_detail(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "message"] {
            match map.get(key) {
                Some(Value::String(s)) => return s.clone(),
                Some(Value::Null) | None => {}
                Some(other) => return other.to_string(),
            }
        }
    }
    body.trim().chars().take(MAX_ERROR_DETAIL).collect()
}

/// `Retry-After` in delay-seconds form. HTTP dates are ignored.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    let secs: f64 = value.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}
