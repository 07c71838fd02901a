//! Durable run state, raw payload snapshots, and the page transport for
//! jobwatch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::StatusCode;
use scraper::{Html, Selector};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-storage";

/// Per-source sets of already-notified posting ids.
///
/// One JSON file per source under the state root, holding a sorted list of
/// id strings. The set is monotone non-decreasing across runs: ids are only
/// ever added, so a posting that disappears upstream can never be
/// re-announced if it reappears.
#[derive(Debug, Clone)]
pub struct SeenIdStore {
    root: PathBuf,
}

impl SeenIdStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_path(&self, source_id: &str) -> PathBuf {
        self.root.join(format!("{source_id}.json"))
    }

    /// Missing or unreadable state degrades to an empty set so the run can
    /// proceed; the next persist rewrites the file in canonical form.
    pub async fn load(&self, source_id: &str) -> BTreeSet<String> {
        let path = self.state_path(source_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(source_id, path = %path.display(), "no prior id state");
                return BTreeSet::new();
            }
            Err(err) => {
                warn!(
                    source_id,
                    path = %path.display(),
                    %err,
                    "unreadable id state, starting from empty"
                );
                return BTreeSet::new();
            }
        };

        match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(ids) => ids.into_iter().collect(),
            Err(err) => {
                warn!(
                    source_id,
                    path = %path.display(),
                    %err,
                    "corrupt id state, starting from empty"
                );
                BTreeSet::new()
            }
        }
    }

    /// Persists the full set as a sorted JSON list via temp-file rename.
    pub async fn save(&self, source_id: &str, ids: &BTreeSet<String>) -> anyhow::Result<()> {
        let path = self.state_path(source_id);
        let sorted: Vec<&String> = ids.iter().collect();
        let bytes = serde_json::to_vec_pretty(&sorted)
            .with_context(|| format!("serializing id state for {source_id}"))?;
        write_atomic(&path, &bytes).await
    }
}

/// Hash-addressed archive of the raw payload behind each successful
/// extraction, kept for post-mortems when a provider changes shape.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn snapshot_path(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        strategy: &str,
        content_hash: &str,
    ) -> PathBuf {
        let day = captured_at.format("%Y%m%d").to_string();
        self.root
            .join(day)
            .join(source_id)
            .join(format!("{strategy}-{content_hash}.json"))
    }

    /// Archives one payload. Identical bytes captured again on the same day
    /// land on the same path and are not rewritten.
    pub async fn archive(
        &self,
        captured_at: DateTime<Utc>,
        source_id: &str,
        strategy: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let path = self.snapshot_path(captured_at, source_id, strategy, &content_hash);

        let exists = fs::try_exists(&path)
            .await
            .with_context(|| format!("checking snapshot path {}", path.display()))?;
        if exists {
            return Ok(StoredSnapshot {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        write_atomic(&path, bytes).await?;
        Ok(StoredSnapshot {
            content_hash,
            path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

/// Writes bytes to a sibling temp file, then renames into place so readers
/// never observe a partial file.
async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "renaming {} into place at {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {reason}")]
    Json { url: String, reason: String },
}

/// Everything the extraction strategies need from the outside world.
///
/// All three operations are fallible and bounded: strategies treat any error
/// as grounds to fall through, never to abort the source.
#[async_trait]
pub trait Transport: Send + Sync {
    /// GET a structured endpoint with query parameters and parse the body
    /// as JSON. Non-2xx statuses are errors carrying the status code.
    async fn fetch_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, TransportError>;

    /// Load a listing page and return the JSON payloads of background
    /// endpoints it references whose URL contains any of `needles`, within
    /// the settle budget. An empty vec means the page loaded but nothing
    /// matching was captured.
    async fn capture_responses(
        &self,
        page_url: &str,
        needles: &[String],
    ) -> Result<Vec<Value>, TransportError>;

    /// Load a page and return the outer HTML of the elements matched by the
    /// first selector in `selectors` that yields at least one element.
    async fn select_fragments(
        &self,
        page_url: &str,
        selectors: &[String],
    ) -> Result<Vec<String>, TransportError>;
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct PageClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
    /// Maximum number of discovered background endpoints probed per page.
    pub capture_limit: usize,
    /// Overall budget for one capture pass across all probed endpoints.
    pub settle_budget: Duration,
}

impl Default for PageClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backoff: BackoffPolicy::default(),
            capture_limit: 5,
            settle_budget: Duration::from_secs(6),
        }
    }
}

/// Production [`Transport`] over plain HTTP.
///
/// Pages are fetched rather than rendered, so "background responses" are
/// recovered by scanning the markup for endpoint URLs and probing them
/// directly. The trait boundary keeps a rendering client swappable without
/// touching any strategy.
#[derive(Debug)]
pub struct PageClient {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    capture_limit: usize,
    settle_budget: Duration,
    endpoint_re: Regex,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl PageClient {
    pub fn new(config: PageClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building http client")?;

        let endpoint_re = Regex::new(r#"["'](https?://[^"'<>\s]+|/[A-Za-z0-9][^"'<>\s]*)["']"#)
            .context("compiling endpoint discovery pattern")?;

        Ok(Self {
            client,
            backoff: config.backoff,
            capture_limit: config.capture_limit.max(1),
            settle_budget: config.settle_budget,
            endpoint_re,
        })
    }

    async fn get_bytes(
        &self,
        url: &str,
        query: &[(String, String)],
        accept: Option<&'static str>,
    ) -> Result<FetchedPage, TransportError> {
        let mut attempt = 0usize;
        loop {
            let mut request = self.client.get(url);
            if !query.is_empty() {
                request = request.query(&query);
            }
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedPage {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, url, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(TransportError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, url, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(TransportError::Request(err));
                }
            }
        }
    }

    /// Endpoint URLs referenced by the page whose text contains any needle,
    /// absolutized against the page origin, deduplicated in order of first
    /// appearance and capped at the configured probe limit.
    fn discover_endpoints(&self, html: &str, page_url: &str, needles: &[String]) -> Vec<String> {
        let origin = page_origin(page_url);
        let mut found: Vec<String> = Vec::new();

        for caps in self.endpoint_re.captures_iter(html) {
            if found.len() >= self.capture_limit {
                break;
            }
            let Some(m) = caps.get(1) else { continue };
            let candidate = m.as_str().replace("&amp;", "&");

            if !needles.iter().any(|needle| candidate.contains(needle)) {
                continue;
            }

            let absolute = if candidate.starts_with('/') {
                match &origin {
                    Some(origin) => format!("{origin}{candidate}"),
                    None => continue,
                }
            } else {
                candidate
            };

            if absolute == page_url || found.contains(&absolute) {
                continue;
            }
            found.push(absolute);
        }

        found
    }
}

#[async_trait]
impl Transport for PageClient {
    async fn fetch_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, TransportError> {
        let page = self.get_bytes(url, query, Some("application/json")).await?;
        serde_json::from_slice(&page.body).map_err(|err| TransportError::Json {
            url: page.final_url,
            reason: err.to_string(),
        })
    }

    async fn capture_responses(
        &self,
        page_url: &str,
        needles: &[String],
    ) -> Result<Vec<Value>, TransportError> {
        let page = self.get_bytes(page_url, &[], None).await?;
        let html = String::from_utf8_lossy(&page.body);
        let endpoints = self.discover_endpoints(&html, page_url, needles);

        let mut payloads = Vec::new();
        let started = Instant::now();
        for endpoint in endpoints {
            if started.elapsed() >= self.settle_budget {
                debug!(page_url, "capture settle budget exhausted");
                break;
            }
            match self.fetch_json(&endpoint, &[]).await {
                Ok(payload) => payloads.push(payload),
                Err(err) => {
                    debug!(endpoint, %err, "captured endpoint did not yield JSON");
                }
            }
        }
        Ok(payloads)
    }

    async fn select_fragments(
        &self,
        page_url: &str,
        selectors: &[String],
    ) -> Result<Vec<String>, TransportError> {
        let page = self.get_bytes(page_url, &[], None).await?;
        let html = String::from_utf8_lossy(&page.body);
        Ok(match_fragments(&html, selectors))
    }
}

/// Outer HTML of the elements matched by the first selector that matches
/// anything. Unparseable selector candidates are skipped.
fn match_fragments(html: &str, selectors: &[String]) -> Vec<String> {
    let document = Html::parse_document(html);
    for raw in selectors {
        let selector = match Selector::parse(raw) {
            Ok(selector) => selector,
            Err(err) => {
                warn!(selector = raw.as_str(), %err, "skipping unparseable selector");
                continue;
            }
        };
        let matched: Vec<String> = document.select(&selector).map(|el| el.html()).collect();
        if !matched.is_empty() {
            return matched;
        }
    }
    Vec::new()
}

/// `https://host/path?q=1` -> `https://host`.
fn page_origin(url: &str) -> Option<String> {
    let scheme_end = url.find("://")? + 3;
    let rest = &url[scheme_end..];
    let host_len = rest
        .find(|c| c == '/' || c == '?' || c == '#')
        .unwrap_or(rest.len());
    if host_len == 0 {
        return None;
    }
    Some(url[..scheme_end + host_len].to_string())
}
