//! Platform API adapter contract + payload parsing for profile, metadata and post listings.

use std::fmt;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_core::{
    FailureKind, FileRef, LastUpdated, Post, Profile, ProfileKey, ProfileMetadata, Service,
    MAX_POST_COUNT,
};
use harvest_storage::{FetchError, HttpFetcher, StatusCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-adapters";

/// Fields every catalog entry must carry.
pub const REQUIRED_CATALOG_FIELDS: [&str; 4] = ["name", "id", "service", "favorited"];

const UNKNOWN: &str = "Unknown";

static SAFE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\- ]{1,100}$").expect("static pattern compiles"));

pub fn is_safe_display_name(name: &str) -> bool {
    SAFE_NAME.is_match(name)
}

/// Response shape of the paginated post listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostPageShape {
    /// `GET /api/v1/{service}/user/{id}?o={offset}` returning a JSON array.
    #[default]
    BareArray,
    /// `GET /api/v1/{service}/user/{id}/posts-legacy?o={offset}` with posts under `results`.
    LegacyEnvelope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub platform_id: String,
    pub base_url: String,
    pub media_prefix: String,
    #[serde(default)]
    pub post_pages: PostPageShape,
}

impl PlatformConfig {
    pub fn coomer() -> Self {
        Self {
            platform_id: "coomer".to_string(),
            base_url: "https://coomer.su".to_string(),
            media_prefix: "https://coomer.su/data".to_string(),
            post_pages: PostPageShape::BareArray,
        }
    }

    pub fn kemono() -> Self {
        Self {
            platform_id: "kemono".to_string(),
            base_url: "https://kemono.su".to_string(),
            media_prefix: "https://kemono.su/data".to_string(),
            post_pages: PostPageShape::BareArray,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new_run() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct PayloadError(pub String);

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid payload from {url}: {source}")]
    InvalidPayload {
        url: String,
        #[source]
        source: PayloadError,
    },
}

impl AdapterError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AdapterError::Fetch(err) => err.kind(),
            AdapterError::InvalidPayload { .. } => FailureKind::InvalidPayload,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AdapterError::Fetch(err) => err.status(),
            AdapterError::InvalidPayload { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum RejectReason {
    NotAnObject,
    MissingField(&'static str),
    WrongType(&'static str),
    UnsafeName(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotAnObject => f.write_str("entry is not a JSON object"),
            RejectReason::MissingField(field) => write!(f, "missing required field `{field}`"),
            RejectReason::WrongType(field) => write!(f, "field `{field}` has an unexpected type"),
            RejectReason::UnsafeName(name) => write!(f, "profile name {name:?} is not safe"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedEntry {
    pub index: usize,
    pub reason: RejectReason,
}

/// Result of validating the profile listing, entry by entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogParse {
    pub accepted: Vec<Profile>,
    pub rejected: Vec<RejectedEntry>,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform_id(&self) -> &str;

    /// Download URL for a media path.
    fn media_url(&self, remote_path: &str) -> String;

    /// Fetch the service version string. Any failure means the service is down.
    async fn probe(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<String, AdapterError>;

    async fn fetch_catalog(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<CatalogParse, AdapterError>;

    async fn fetch_metadata(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        profile: &ProfileKey,
    ) -> Result<ProfileMetadata, AdapterError>;

    async fn fetch_post_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        profile: &ProfileKey,
        offset: u64,
    ) -> Result<Vec<Post>, AdapterError>;
}

/// JSON API adapter. Both supported platforms share the endpoint layout and
/// differ only in host names and the post page shape.
#[derive(Debug, Clone)]
pub struct ApiAdapter {
    config: PlatformConfig,
}

impl ApiAdapter {
    pub fn new(config: PlatformConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    fn base(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn user_root(&self, profile: &ProfileKey) -> String {
        format!(
            "{}/api/v1/{}/user/{}",
            self.base(),
            urlencoding::encode(profile.service.as_str()),
            urlencoding::encode(&profile.id)
        )
    }

    pub fn version_url(&self) -> String {
        format!("{}/api/v1/app_version", self.base())
    }

    pub fn catalog_url(&self) -> String {
        format!("{}/api/v1/creators.txt", self.base())
    }

    pub fn metadata_url(&self, profile: &ProfileKey) -> String {
        format!("{}/posts-legacy", self.user_root(profile))
    }

    pub fn post_page_url(&self, profile: &ProfileKey, offset: u64) -> String {
        match self.config.post_pages {
            PostPageShape::BareArray => format!("{}?o={offset}", self.user_root(profile)),
            PostPageShape::LegacyEnvelope => {
                format!("{}/posts-legacy?o={offset}", self.user_root(profile))
            }
        }
    }
}

#[async_trait]
impl PlatformAdapter for ApiAdapter {
    fn platform_id(&self) -> &str {
        &self.config.platform_id
    }

    fn media_url(&self, remote_path: &str) -> String {
        let prefix = self.config.media_prefix.trim_end_matches('/');
        if remote_path.starts_with('/') {
            format!("{prefix}{remote_path}")
        } else {
            format!("{prefix}/{remote_path}")
        }
    }

    async fn probe(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Result<String, AdapterError> {
        let resp = http.fetch_once(ctx.run_id, &self.version_url()).await?;
        let body = String::from_utf8_lossy(&resp.body).trim().to_string();
        if resp.status != StatusCode::OK {
            return Err(FetchError::HttpStatus {
                status: resp.status.as_u16(),
                url: resp.final_url,
                body,
                attempts: resp.attempts,
            }
            .into());
        }
        Ok(body)
    }

    async fn fetch_catalog(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<CatalogParse, AdapterError> {
        let url = self.catalog_url();
        let resp = http.fetch_bytes(ctx.run_id, &url).await?;
        parse_catalog(&resp.body).map_err(|source| AdapterError::InvalidPayload { url, source })
    }

    async fn fetch_metadata(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        profile: &ProfileKey,
    ) -> Result<ProfileMetadata, AdapterError> {
        let url = self.metadata_url(profile);
        let resp = http.fetch_bytes(ctx.run_id, &url).await?;
        parse_metadata(profile, &resp.body)
            .map_err(|source| AdapterError::InvalidPayload { url, source })
    }

    async fn fetch_post_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        profile: &ProfileKey,
        offset: u64,
    ) -> Result<Vec<Post>, AdapterError> {
        let url = self.post_page_url(profile, offset);
        let resp = http.fetch_bytes(ctx.run_id, &url).await?;
        parse_post_page(self.config.post_pages, profile, &resp.body)
            .map_err(|source| AdapterError::InvalidPayload { url, source })
    }
}

pub fn adapter_for_platform(config: PlatformConfig) -> Option<Box<dyn PlatformAdapter>> {
    match config.platform_id.as_str() {
        "coomer" | "kemono" => Some(Box::new(ApiAdapter::new(config))),
        _ => None,
    }
}

fn parse_json(body: &[u8]) -> Result<JsonValue, PayloadError> {
    serde_json::from_slice(body).map_err(|e| PayloadError(format!("body is not valid JSON: {e}")))
}

/// Accepts a JSON string or integer as an identifier.
fn json_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) if n.is_u64() || n.is_i64() => Some(n.to_string()),
        _ => None,
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_count(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::Number(n) => n.as_u64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Validate one raw catalog entry.
pub fn validate_catalog_entry(entry: &JsonValue) -> Result<Profile, RejectReason> {
    let obj = entry.as_object().ok_or(RejectReason::NotAnObject)?;
    if let Some(missing) = REQUIRED_CATALOG_FIELDS
        .iter()
        .find(|field| !obj.contains_key(**field))
    {
        return Err(RejectReason::MissingField(*missing));
    }

    let name = obj
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or(RejectReason::WrongType("name"))?;
    if !is_safe_display_name(name) {
        return Err(RejectReason::UnsafeName(name.to_string()));
    }
    let id = obj
        .get("id")
        .and_then(json_id)
        .ok_or(RejectReason::WrongType("id"))?;
    let service = obj
        .get("service")
        .and_then(JsonValue::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or(RejectReason::WrongType("service"))?;
    let favorited_count = obj
        .get("favorited")
        .and_then(JsonValue::as_u64)
        .ok_or(RejectReason::WrongType("favorited"))?;

    Ok(Profile {
        id,
        service: Service::from(service.to_string()),
        display_name: name.to_string(),
        favorited_count,
    })
}

/// Parse the full profile listing. Only a body that is not a JSON array fails
/// as a whole; individual bad entries are rejected and the rest kept in order.
pub fn parse_catalog(body: &[u8]) -> Result<CatalogParse, PayloadError> {
    let value = parse_json(body)?;
    let entries = value
        .as_array()
        .ok_or_else(|| PayloadError("profile listing is not a JSON array".to_string()))?;

    let mut parsed = CatalogParse::default();
    for (index, entry) in entries.iter().enumerate() {
        match validate_catalog_entry(entry) {
            Ok(profile) => parsed.accepted.push(profile),
            Err(reason) => {
                debug!(index, %reason, "rejecting catalog entry");
                parsed.rejected.push(RejectedEntry { index, reason });
            }
        }
    }
    Ok(parsed)
}

/// Read aggregate counters from a `posts-legacy` document.
pub fn parse_metadata(profile: &ProfileKey, body: &[u8]) -> Result<ProfileMetadata, PayloadError> {
    let value = parse_json(body)?;
    if !value.is_object() {
        return Err(PayloadError("profile document is not a JSON object".to_string()));
    }

    let reported = json_path(&value, &["props", "count"])
        .and_then(json_count)
        .unwrap_or(0);
    let post_count = reported.min(MAX_POST_COUNT);
    if post_count < reported {
        warn!(profile = %profile, reported, clamped = post_count, "clamping implausible post count");
    }
    let last_updated = match json_path(&value, &["props", "artist", "updated"]) {
        Some(JsonValue::String(s)) => LastUpdated::parse(Some(s)),
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .map(LastUpdated::from_epoch_seconds)
            .unwrap_or(LastUpdated::Never),
        _ => LastUpdated::Never,
    };
    let name = json_path(&value, &["props", "artist", "name"])
        .and_then(JsonValue::as_str)
        .unwrap_or(UNKNOWN)
        .to_string();
    let external_id = json_path(&value, &["props", "artist", "external_id"])
        .and_then(json_id)
        .unwrap_or_else(|| UNKNOWN.to_string());

    Ok(ProfileMetadata {
        id: profile.id.clone(),
        service: profile.service.clone(),
        post_count,
        last_updated,
        name,
        external_id,
    })
}

/// `{name, path}` object, or nothing when either field is missing or empty.
pub fn file_ref_from_json(value: &JsonValue) -> Option<FileRef> {
    let name = value.get("name")?.as_str()?;
    let path = value.get("path")?.as_str()?;
    if name.is_empty() || path.is_empty() {
        return None;
    }
    Some(FileRef::new(name, path))
}

/// A missing id leaves `Post::id` empty; the post's files are still kept.
fn post_from_json(profile: &ProfileKey, obj: &Map<String, JsonValue>) -> Post {
    let id = obj.get("id").and_then(json_id).unwrap_or_default();
    let profile_id = obj
        .get("user")
        .and_then(json_id)
        .unwrap_or_else(|| profile.id.clone());
    let service = obj
        .get("service")
        .and_then(JsonValue::as_str)
        .map(|s| Service::from(s.to_string()))
        .unwrap_or_else(|| profile.service.clone());
    let title = obj
        .get("title")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let published = obj
        .get("published")
        .and_then(JsonValue::as_str)
        .and_then(|s| LastUpdated::parse(Some(s)).timestamp());

    let primary_file = obj.get("file").and_then(file_ref_from_json);
    let attachments = match obj.get("attachments") {
        Some(JsonValue::Array(items)) => {
            let refs: Vec<FileRef> = items.iter().filter_map(file_ref_from_json).collect();
            if refs.len() < items.len() {
                debug!(post_id = %id, skipped = items.len() - refs.len(), "skipping malformed attachments");
            }
            refs
        }
        _ => Vec::new(),
    };

    Post {
        id,
        profile_id,
        service,
        title,
        published,
        primary_file,
        attachments,
    }
}

/// Parse one page of the post listing according to its shape.
pub fn parse_post_page(
    shape: PostPageShape,
    profile: &ProfileKey,
    body: &[u8],
) -> Result<Vec<Post>, PayloadError> {
    let value = parse_json(body)?;
    let entries = match shape {
        PostPageShape::BareArray => value.as_array(),
        PostPageShape::LegacyEnvelope => value.get("results").and_then(JsonValue::as_array),
    }
    .ok_or_else(|| PayloadError(format!("post page does not match {shape:?} shape")))?;

    let mut posts = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let Some(obj) = entry.as_object() else {
            debug!(index, profile = %profile, "skipping non-object post entry");
            continue;
        };
        let post = post_from_json(profile, obj);
        if post.id.is_empty() {
            debug!(index, profile = %profile, "post without an id");
        }
        posts.push(post);
    }
    Ok(posts)
}

/// Flatten posts into file references: each post's primary file, then its
/// attachments, in post order. Not deduplicated.
pub fn extract_file_refs(posts: &[Post]) -> Vec<FileRef> {
    posts.iter().flat_map(Post::file_refs).cloned().collect()
}
