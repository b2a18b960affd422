//! Shared HTTP fetcher + atomic media storage for the harvester.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use harvest_core::FailureKind;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ORIGIN};
pub use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-storage";

const ERROR_BODY_LIMIT: usize = 512;

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: u64,
    pub replaced_existing: bool,
}

/// Per-profile media directory tree rooted at the download destination.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn profile_dir(&self, profile_id: &str) -> anyhow::Result<PathBuf> {
        if profile_id.is_empty()
            || profile_id == "."
            || profile_id == ".."
            || profile_id.contains(|c: char| c == '/' || c == '\\')
        {
            bail!("profile id {profile_id:?} is not usable as a directory name");
        }
        Ok(self.root.join(profile_id))
    }

    /// Create `root/profile_id` if missing. Safe to call repeatedly.
    pub async fn ensure_profile_dir(&self, profile_id: &str) -> anyhow::Result<PathBuf> {
        let dir = self.profile_dir(profile_id)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating media directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Stream a response body to `root/profile_id/file_name` via a temp file + rename.
    ///
    /// An existing file with the same name is replaced. The destination never
    /// holds a partially written body.
    pub async fn write_response(
        &self,
        profile_id: &str,
        file_name: &str,
        mut response: OpenedResponse,
    ) -> anyhow::Result<StoredFile> {
        let dir = self.ensure_profile_dir(profile_id).await?;
        let absolute_path = dir.join(file_name);
        let relative_path = PathBuf::from(profile_id).join(file_name);
        let replaced_existing = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking media path {}", absolute_path.display()))?;

        let temp_path = dir.join(format!(".{}.part", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp media file {}", temp_path.display()))?;

        let url = response.final_url.clone();
        let mut hasher = Sha256::new();
        let mut byte_size = 0u64;
        let streamed = async {
            while let Some(chunk) = response
                .response
                .chunk()
                .await
                .with_context(|| format!("reading body of {url}"))?
            {
                hasher.update(&chunk);
                byte_size += chunk.len() as u64;
                file.write_all(&chunk)
                    .await
                    .with_context(|| format!("writing temp media file {}", temp_path.display()))?;
            }
            file.flush()
                .await
                .with_context(|| format!("flushing temp media file {}", temp_path.display()))?;
            Ok::<(), anyhow::Error>(())
        }
        .await;
        drop(file);

        if let Err(err) = streamed {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp media file {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredFile {
            content_hash: hex::encode(hasher.finalize()),
            relative_path,
            absolute_path,
            byte_size,
            replaced_existing,
        })
    }
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

/// Bounded exponential backoff applied per request. `max_retries == 0` disables retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub origin: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            user_agent: None,
            accept: Some("application/json, text/plain, */*".to_string()),
            origin: None,
            global_concurrency: 16,
            per_host_concurrency: 8,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacing toward the remote host: a burst of `capacity` requests,
/// then one more per `refill_every`.
#[derive(Debug)]
pub struct RequestPacer {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<PacerState>,
}

#[derive(Debug, Clone, Copy)]
struct PacerState {
    tokens: u32,
    last_refill: Instant,
}

impl RequestPacer {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every.max(Duration::from_millis(1)),
            state: Mutex::new(PacerState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Wait until a request slot is free and consume it.
    pub async fn acquire(&self) {
        loop {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let elapsed = now.duration_since(state.last_refill);
            let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
            if refills > 0 {
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                // Keep the remainder so slow callers do not lose partial refills.
                state.last_refill = if state.tokens == self.capacity {
                    now
                } else {
                    state.last_refill + self.refill_every * refills
                };
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let wait = (state.last_refill + self.refill_every).saturating_duration_since(now);
            drop(state);
            debug!(wait_ms = wait.as_millis() as u64, "pacing request");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Process-wide HTTP client. Every stage and worker shares one instance.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    pacer: Option<RequestPacer>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

/// Successful response whose body has not been read yet.
///
/// Holds the fetcher's concurrency permits until dropped.
#[derive(Debug)]
pub struct OpenedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub attempts: usize,
    response: reqwest::Response,
    _permits: (OwnedSemaphorePermit, OwnedSemaphorePermit),
}

impl OpenedResponse {
    pub async fn bytes(self) -> Result<FetchedResponse, FetchError> {
        let Self {
            status,
            final_url,
            attempts,
            response,
            _permits,
        } = self;
        match response.bytes().await {
            Ok(body) => Ok(FetchedResponse {
                status,
                final_url,
                body: body.to_vec(),
                attempts,
            }),
            Err(source) => Err(FetchError::Request {
                url: final_url,
                attempts,
                source,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Request {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
        attempts: usize,
    },
    #[error("invalid url {url}")]
    InvalidUrl { url: String },
    #[error("http fetcher is shutting down")]
    Closed,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::HttpStatus { .. } => FailureKind::RemoteError,
            FetchError::InvalidUrl { .. } => FailureKind::InvalidPayload,
            FetchError::Request { .. } | FetchError::Closed => FailureKind::Unreachable,
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            FetchError::Request { attempts, .. } | FetchError::HttpStatus { attempts, .. } => {
                *attempts
            }
            FetchError::InvalidUrl { .. } | FetchError::Closed => 0,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            FetchError::HttpStatus { body, .. } if !body.is_empty() => Some(body.as_str()),
            _ => None,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(accept) = &config.accept {
            headers.insert(
                ACCEPT,
                HeaderValue::from_str(accept).context("invalid Accept header value")?,
            );
        }
        if let Some(origin) = &config.origin {
            headers.insert(
                ORIGIN,
                HeaderValue::from_str(origin).context("invalid Origin header value")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacer = config.token_bucket.map(RequestPacer::new);

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            pacer,
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    /// Fetch `url` and read the whole body.
    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        self.open(run_id, url).await?.bytes().await
    }

    /// Single attempt regardless of the backoff policy. Any 2xx is returned
    /// as-is, so callers needing an exact status check it themselves.
    pub async fn fetch_once(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        self.open_with(run_id, url, 0).await?.bytes().await
    }

    /// Issue a GET (with retries per the backoff policy) and hand back the
    /// successful response before its body is read.
    pub async fn open(&self, run_id: Uuid, url: &str) -> Result<OpenedResponse, FetchError> {
        self.open_with(run_id, url, self.backoff.max_retries).await
    }

    async fn open_with(
        &self,
        run_id: Uuid,
        url: &str,
        max_retries: usize,
    ) -> Result<OpenedResponse, FetchError> {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .ok_or_else(|| FetchError::InvalidUrl {
                url: url.to_string(),
            })?;

        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_host = self
            .per_host_semaphore(&host)
            .await
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", %run_id, host = %host, url);
        let (response, attempts) = self
            .send_with_retry(url, max_retries)
            .instrument(span)
            .await?;

        Ok(OpenedResponse {
            status: response.status(),
            final_url: response.url().to_string(),
            attempts,
            response,
            _permits: (global, per_host),
        })
    }

    async fn send_with_retry(
        &self,
        url: &str,
        max_retries: usize,
    ) -> Result<(reqwest::Response, usize), FetchError> {
        let mut attempts = 0usize;
        loop {
            if let Some(pacer) = &self.pacer {
                pacer.acquire().await;
            }
            attempts += 1;
            let may_retry = attempts <= max_retries;

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok((resp, attempts));
                    }

                    if may_retry && classify_status(status) == RetryDisposition::Retryable {
                        debug!(%status, attempts, "retryable status, backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempts - 1)).await;
                        continue;
                    }

                    let final_url = resp.url().to_string();
                    let body = truncate_body(resp.text().await.unwrap_or_default());
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body,
                        attempts,
                    });
                }
                Err(err) => {
                    if may_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        debug!(error = %err, attempts, "retryable transport error, backing off");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempts - 1)).await;
                        continue;
                    }
                    return Err(FetchError::Request {
                        url: url.to_string(),
                        attempts,
                        source: err,
                    });
                }
            }
        }
    }
}

fn truncate_body(mut body: String) -> String {
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
