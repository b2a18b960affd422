//! Harvest pipeline orchestration: reachability gate, catalog, metadata, pagination, downloads, run reports.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::future::ready;
use futures::stream::{self, StreamExt};
use harvest_adapters::{
    adapter_for_platform, extract_file_refs, AdapterError, PlatformAdapter, RejectedEntry,
};
pub use harvest_adapters::{AdapterContext, CatalogParse, PlatformConfig, PostPageShape};
use harvest_core::{FailureKind, Post, Profile, ProfileKey, ProfileMetadata, Service};
use harvest_download::{DownloadManager, DownloadReport, DEFAULT_WORKERS};
use harvest_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, MediaStore, TokenBucketConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-sync";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub platform: PlatformConfig,
    pub download_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_concurrency: usize,
    pub download_workers: usize,
    pub max_retries: usize,
    /// Politeness cap toward the remote host. `None` disables the token bucket.
    pub requests_per_second: Option<u32>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            platform: PlatformConfig::coomer(),
            download_dir: PathBuf::from("./downloads"),
            reports_dir: PathBuf::from("./reports"),
            workspace_root: PathBuf::from("."),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 5,
            page_concurrency: 4,
            download_workers: DEFAULT_WORKERS,
            max_retries: 0,
            requests_per_second: None,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut platform = match std::env::var("HARVEST_PLATFORM").as_deref() {
            Ok("kemono") => PlatformConfig::kemono(),
            _ => PlatformConfig::coomer(),
        };
        if let Ok(base_url) = std::env::var("HARVEST_BASE_URL") {
            platform.base_url = base_url;
        }
        if let Ok(media_prefix) = std::env::var("HARVEST_MEDIA_PREFIX") {
            platform.media_prefix = media_prefix;
        }
        if let Ok(shape) = std::env::var("HARVEST_POST_PAGES") {
            platform.post_pages = match shape.as_str() {
                "legacy_envelope" => PostPageShape::LegacyEnvelope,
                _ => PostPageShape::BareArray,
            };
        }

        let workspace_root = std::env::var("HARVEST_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);
        Self {
            platform,
            download_dir: std::env::var("HARVEST_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            reports_dir: std::env::var("HARVEST_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| workspace_root.join("reports")),
            workspace_root,
            user_agent: std::env::var("HARVEST_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("HARVEST_HTTP_TIMEOUT_SECS")
                .unwrap_or(defaults.http_timeout_secs),
            page_concurrency: env_parse("HARVEST_PAGE_CONCURRENCY")
                .unwrap_or(defaults.page_concurrency),
            download_workers: env_parse("HARVEST_DOWNLOAD_WORKERS")
                .unwrap_or(defaults.download_workers),
            max_retries: env_parse("HARVEST_MAX_RETRIES").unwrap_or(defaults.max_retries),
            requests_per_second: env_parse("HARVEST_REQUESTS_PER_SECOND"),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let workers = self.download_workers.max(1) + self.page_concurrency.max(1);
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            origin: Some(self.platform.base_url.trim_end_matches('/').to_string()),
            global_concurrency: workers,
            per_host_concurrency: workers,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..Default::default()
            },
            token_bucket: self
                .requests_per_second
                .filter(|rps| *rps > 0)
                .map(|rps| TokenBucketConfig {
                    capacity: rps,
                    refill_every: Duration::from_millis(1000 / u64::from(rps)).max(Duration::from_millis(1)),
                }),
            ..Default::default()
        }
    }
}

/// Optional `profiles.yaml`: when it lists enabled targets, only those are harvested.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetRegistry {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub service: Service,
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TargetRegistry {
    pub fn enabled_keys(&self) -> Vec<ProfileKey> {
        self.targets
            .iter()
            .filter(|t| t.enabled)
            .map(|t| ProfileKey::new(t.service.clone(), t.id.clone()))
            .collect()
    }
}

/// Downstream consumer of validated records (e.g. a relational store).
pub trait RecordSink: Send + Sync {
    fn accept_profiles(&self, profiles: &[Profile]) -> anyhow::Result<()>;
    fn accept_metadata(&self, metadata: &ProfileMetadata) -> anyhow::Result<()>;
    fn accept_posts(&self, profile: &ProfileKey, posts: &[Post]) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct NoopRecordSink;

impl RecordSink for NoopRecordSink {
    fn accept_profiles(&self, _profiles: &[Profile]) -> anyhow::Result<()> {
        Ok(())
    }

    fn accept_metadata(&self, _metadata: &ProfileMetadata) -> anyhow::Result<()> {
        Ok(())
    }

    fn accept_posts(&self, _profile: &ProfileKey, _posts: &[Post]) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PageFailure {
    pub offset: u64,
    pub kind: FailureKind,
    pub cause: FailureKind,
    pub status: Option<u16>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PostPagination {
    pub metadata: Option<ProfileMetadata>,
    pub posts: Vec<Post>,
    pub pages_requested: usize,
    pub pages_fetched: usize,
    pub skipped_pages: Vec<PageFailure>,
    pub pages_not_dispatched: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileHarvest {
    pub profile: ProfileKey,
    pub metadata: Option<ProfileMetadata>,
    pub posts: usize,
    pub file_refs: usize,
    pub pages_fetched: usize,
    pub skipped_pages: Vec<PageFailure>,
    pub pages_not_dispatched: usize,
    pub downloads: DownloadReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cancelled: bool,
    pub profiles_accepted: usize,
    pub profiles_rejected: usize,
    pub profiles_harvested: usize,
    pub profiles_without_metadata: usize,
    pub pages_fetched: usize,
    pub pages_skipped: usize,
    pub pages_not_dispatched: usize,
    pub posts_seen: usize,
    pub files_succeeded: usize,
    pub files_duplicate: usize,
    pub files_failed: usize,
    pub files_not_dispatched: usize,
    pub retries: usize,
    pub reports_dir: String,
}

#[derive(Debug, Serialize)]
struct HarvestRunRecord<'a> {
    summary: &'a HarvestRunSummary,
    platform: &'a PlatformConfig,
    rejected_profiles: &'a [RejectedEntry],
    profiles: &'a [ProfileHarvest],
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("{base_url} is unreachable; aborting harvest run")]
    Unreachable { base_url: String },
    #[error("no adapter registered for platform {0}")]
    UnknownPlatform(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct HarvestPipeline {
    config: HarvestConfig,
    http: Arc<HttpFetcher>,
    adapter: Arc<dyn PlatformAdapter>,
    downloads: DownloadManager,
    sink: Box<dyn RecordSink>,
    cancel: CancellationToken,
}

impl HarvestPipeline {
    pub fn new(config: HarvestConfig) -> Result<Self, HarvestError> {
        let adapter: Arc<dyn PlatformAdapter> = adapter_for_platform(config.platform.clone())
            .map(Arc::from)
            .ok_or_else(|| HarvestError::UnknownPlatform(config.platform.platform_id.clone()))?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let cancel = CancellationToken::new();
        let downloads = DownloadManager::new(
            http.clone(),
            adapter.clone(),
            MediaStore::new(config.download_dir.clone()),
            config.download_workers,
            cancel.clone(),
        );
        Ok(Self {
            config,
            http,
            adapter,
            downloads,
            sink: Box::<NoopRecordSink>::default(),
            cancel,
        })
    }

    pub fn with_sink(mut self, sink: Box<dyn RecordSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Cancelling stops new pages, profiles and downloads from being dispatched.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn downloads(&self) -> &DownloadManager {
        &self.downloads
    }

    pub async fn probe(&self, ctx: &AdapterContext) -> bool {
        match self.adapter.probe(&self.http, ctx).await {
            Ok(version) => {
                info!(platform = self.adapter.platform_id(), version = %version, "remote service reachable");
                true
            }
            Err(err) => {
                warn!(
                    platform = self.adapter.platform_id(),
                    status = ?err.status(),
                    error = %err,
                    "reachability probe failed"
                );
                false
            }
        }
    }

    /// Full profile catalog. Any fetch failure yields an empty catalog.
    pub async fn fetch_profiles(&self, ctx: &AdapterContext) -> CatalogParse {
        match self.adapter.fetch_catalog(&self.http, ctx).await {
            Ok(catalog) => {
                for rejected in &catalog.rejected {
                    warn!(index = rejected.index, reason = %rejected.reason, "skipping catalog entry");
                }
                info!(
                    accepted = catalog.accepted.len(),
                    rejected = catalog.rejected.len(),
                    "profile catalog fetched"
                );
                catalog
            }
            Err(err) => {
                warn!(status = ?err.status(), error = %err, "failed to fetch profile catalog");
                CatalogParse::default()
            }
        }
    }

    pub async fn resolve_metadata(
        &self,
        ctx: &AdapterContext,
        profile: &ProfileKey,
    ) -> Option<ProfileMetadata> {
        match self.adapter.fetch_metadata(&self.http, ctx, profile).await {
            Ok(metadata) => {
                info!(
                    profile = %profile,
                    posts = metadata.post_count,
                    last_updated = %metadata.last_updated,
                    "resolved profile metadata"
                );
                Some(metadata)
            }
            Err(err) => {
                warn!(profile = %profile, status = ?err.status(), error = %err, "failed to resolve profile metadata");
                None
            }
        }
    }

    /// Resolve metadata, then walk every listing page of `profile`.
    pub async fn paginate_posts(&self, ctx: &AdapterContext, profile: &ProfileKey) -> PostPagination {
        match self.resolve_metadata(ctx, profile).await {
            Some(metadata) => self.paginate_with_metadata(ctx, metadata).await,
            None => {
                info!(profile = %profile, "no posts: metadata unavailable");
                PostPagination::default()
            }
        }
    }

    pub async fn paginate_with_metadata(
        &self,
        ctx: &AdapterContext,
        metadata: ProfileMetadata,
    ) -> PostPagination {
        let key = metadata.key();
        let planned = usize::try_from(metadata.planned_pages()).unwrap_or(usize::MAX);
        if planned == 0 {
            info!(profile = %key, "no posts");
            return PostPagination {
                metadata: Some(metadata),
                ..Default::default()
            };
        }

        let key_ref = &key;
        let pages: Vec<(u64, Result<Vec<Post>, AdapterError>)> = stream::iter(metadata.page_offsets())
            .take_while(|_| ready(!self.cancel.is_cancelled()))
            .map(|offset| async move {
                let page = self
                    .adapter
                    .fetch_post_page(&self.http, ctx, key_ref, offset)
                    .await;
                (offset, page)
            })
            .buffered(self.config.page_concurrency.max(1))
            .collect()
            .await;

        let mut result = PostPagination {
            metadata: Some(metadata),
            pages_requested: planned,
            pages_not_dispatched: planned.saturating_sub(pages.len()),
            ..Default::default()
        };
        for (offset, page) in pages {
            match page {
                Ok(posts) => {
                    if posts.is_empty() {
                        debug!(profile = %key, offset, "empty page");
                    }
                    result.pages_fetched += 1;
                    result.posts.extend(posts);
                }
                Err(err) => {
                    warn!(
                        profile = %key,
                        offset,
                        status = ?err.status(),
                        error = %err,
                        "skipping post page"
                    );
                    result.skipped_pages.push(PageFailure {
                        offset,
                        kind: FailureKind::PartialPageFailure,
                        cause: err.kind(),
                        status: err.status(),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            profile = %key,
            pages = result.pages_fetched,
            skipped = result.skipped_pages.len(),
            posts = result.posts.len(),
            "pagination finished"
        );
        result
    }

    /// Paginate, extract and download one profile.
    pub async fn harvest_profile(&self, ctx: &AdapterContext, profile: &ProfileKey) -> ProfileHarvest {
        let pagination = self.paginate_posts(ctx, profile).await;

        if let Some(metadata) = &pagination.metadata {
            if let Err(err) = self.sink.accept_metadata(metadata) {
                warn!(profile = %profile, error = %format!("{err:#}"), "record sink rejected metadata");
            }
        }
        if !pagination.posts.is_empty() {
            if let Err(err) = self.sink.accept_posts(profile, &pagination.posts) {
                warn!(profile = %profile, error = %format!("{err:#}"), "record sink rejected posts");
            }
        }

        let file_refs = extract_file_refs(&pagination.posts);
        let downloads = if pagination.metadata.is_some() {
            self.downloads.download(ctx, &file_refs, &profile.id).await
        } else {
            DownloadReport::new(profile.id.clone())
        };

        ProfileHarvest {
            profile: profile.clone(),
            posts: pagination.posts.len(),
            file_refs: file_refs.len(),
            pages_fetched: pagination.pages_fetched,
            skipped_pages: pagination.skipped_pages,
            pages_not_dispatched: pagination.pages_not_dispatched,
            metadata: pagination.metadata,
            downloads,
        }
    }

    /// Probe, then harvest the `profiles.yaml` targets or, without any, the full catalog.
    pub async fn run_once(&self) -> Result<HarvestRunSummary, HarvestError> {
        let ctx = AdapterContext::new_run();
        let span = info_span!("harvest_run", run_id = %ctx.run_id);
        async {
            self.ensure_reachable(&ctx).await?;

            let registry = self.load_target_registry().await?;
            let (catalog, targets) = match registry.map(|r| r.enabled_keys()) {
                Some(keys) if !keys.is_empty() => {
                    info!(targets = keys.len(), "harvesting configured targets");
                    (CatalogParse::default(), keys)
                }
                _ => {
                    let catalog = self.fetch_profiles(&ctx).await;
                    if let Err(err) = self.sink.accept_profiles(&catalog.accepted) {
                        warn!(error = %format!("{err:#}"), "record sink rejected profiles");
                    }
                    let keys = catalog.accepted.iter().map(Profile::key).collect();
                    (catalog, keys)
                }
            };

            Ok::<_, HarvestError>(self.harvest_targets(&ctx, catalog, &targets).await)
        }
        .instrument(span)
        .await
    }

    /// Probe, then harvest exactly `profiles` without consulting the catalog.
    pub async fn run_for_profiles(
        &self,
        profiles: &[ProfileKey],
    ) -> Result<HarvestRunSummary, HarvestError> {
        let ctx = AdapterContext::new_run();
        let span = info_span!("harvest_run", run_id = %ctx.run_id);
        async {
            self.ensure_reachable(&ctx).await?;
            Ok(self
                .harvest_targets(&ctx, CatalogParse::default(), profiles)
                .await)
        }
        .instrument(span)
        .await
    }

    async fn ensure_reachable(&self, ctx: &AdapterContext) -> Result<(), HarvestError> {
        if self.probe(ctx).await {
            Ok(())
        } else {
            Err(HarvestError::Unreachable {
                base_url: self.config.platform.base_url.clone(),
            })
        }
    }

    async fn harvest_targets(
        &self,
        ctx: &AdapterContext,
        catalog: CatalogParse,
        targets: &[ProfileKey],
    ) -> HarvestRunSummary {
        let mut harvests = Vec::with_capacity(targets.len());
        for profile in targets {
            if self.cancel.is_cancelled() {
                info!(remaining = targets.len() - harvests.len(), "run cancelled, not starting more profiles");
                break;
            }
            let harvest = self
                .harvest_profile(ctx, profile)
                .instrument(info_span!("profile", profile = %profile))
                .await;
            harvests.push(harvest);
        }

        let finished_at = Utc::now();
        let reports_dir = self.config.reports_dir.join(ctx.run_id.to_string());
        let summary = summarize(
            ctx,
            finished_at,
            self.cancel.is_cancelled(),
            &catalog,
            &harvests,
            &reports_dir,
        );
        if let Err(err) = self
            .write_reports(&reports_dir, &summary, &catalog, &harvests)
            .await
        {
            warn!(
                reports_dir = %reports_dir.display(),
                error = %format!("{err:#}"),
                "failed to write run reports"
            );
        }

        info!(
            profiles = summary.profiles_harvested,
            pages_fetched = summary.pages_fetched,
            pages_skipped = summary.pages_skipped,
            files_succeeded = summary.files_succeeded,
            files_duplicate = summary.files_duplicate,
            files_failed = summary.files_failed,
            "harvest run complete"
        );
        summary
    }

    async fn load_target_registry(&self) -> anyhow::Result<Option<TargetRegistry>> {
        let path = self.config.workspace_root.join("profiles.yaml");
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(registry))
    }

    async fn write_reports(
        &self,
        reports_dir: &Path,
        summary: &HarvestRunSummary,
        catalog: &CatalogParse,
        harvests: &[ProfileHarvest],
    ) -> anyhow::Result<()> {
        fs::create_dir_all(reports_dir)
            .await
            .with_context(|| format!("creating {}", reports_dir.display()))?;

        let brief = format!(
            "# Harvest Run\n\n- Run ID: `{}`\n- Platform: {}\n- Started: {}\n- Finished: {}\n- Cancelled: {}\n\n## Profiles\n- Accepted: {}\n- Rejected: {}\n- Harvested: {}\n- Without metadata: {}\n\n## Pages\n- Fetched: {}\n- Skipped: {}\n- Not dispatched: {}\n- Posts: {}\n\n## Files\n- Succeeded: {}\n- Skipped as duplicate: {}\n- Failed: {}\n- Not dispatched: {}\n- Retries: {}\n\n## Per Profile\n{}\n",
            summary.run_id,
            self.config.platform.platform_id,
            summary.started_at,
            summary.finished_at,
            summary.cancelled,
            summary.profiles_accepted,
            summary.profiles_rejected,
            summary.profiles_harvested,
            summary.profiles_without_metadata,
            summary.pages_fetched,
            summary.pages_skipped,
            summary.pages_not_dispatched,
            summary.posts_seen,
            summary.files_succeeded,
            summary.files_duplicate,
            summary.files_failed,
            summary.files_not_dispatched,
            summary.retries,
            harvests
                .iter()
                .map(|h| format!(
                    "- {}: posts={} files={} ok={} dup={} failed={}",
                    h.profile,
                    h.posts,
                    h.file_refs,
                    h.downloads.succeeded.len(),
                    h.downloads.duplicates.len(),
                    h.downloads.failures.len()
                ))
                .collect::<Vec<_>>()
                .join("\n")
        );
        fs::write(reports_dir.join("harvest_brief.md"), brief)
            .await
            .context("writing harvest_brief.md")?;

        let record = HarvestRunRecord {
            summary,
            platform: &self.config.platform,
            rejected_profiles: &catalog.rejected,
            profiles: harvests,
        };
        let json = serde_json::to_vec_pretty(&record).context("serializing harvest run record")?;
        fs::write(reports_dir.join("harvest_run.json"), json)
            .await
            .context("writing harvest_run.json")?;
        Ok(())
    }
}

fn summarize(
    ctx: &AdapterContext,
    finished_at: DateTime<Utc>,
    cancelled: bool,
    catalog: &CatalogParse,
    harvests: &[ProfileHarvest],
    reports_dir: &Path,
) -> HarvestRunSummary {
    HarvestRunSummary {
        run_id: ctx.run_id,
        started_at: ctx.started_at,
        finished_at,
        cancelled,
        profiles_accepted: catalog.accepted.len(),
        profiles_rejected: catalog.rejected.len(),
        profiles_harvested: harvests.len(),
        profiles_without_metadata: harvests.iter().filter(|h| h.metadata.is_none()).count(),
        pages_fetched: harvests.iter().map(|h| h.pages_fetched).sum(),
        pages_skipped: harvests.iter().map(|h| h.skipped_pages.len()).sum(),
        pages_not_dispatched: harvests.iter().map(|h| h.pages_not_dispatched).sum(),
        posts_seen: harvests.iter().map(|h| h.posts).sum(),
        files_succeeded: harvests.iter().map(|h| h.downloads.succeeded.len()).sum(),
        files_duplicate: harvests.iter().map(|h| h.downloads.duplicates.len()).sum(),
        files_failed: harvests.iter().map(|h| h.downloads.failures.len()).sum(),
        files_not_dispatched: harvests.iter().map(|h| h.downloads.not_dispatched.len()).sum(),
        retries: harvests.iter().map(|h| h.downloads.retries()).sum(),
        reports_dir: reports_dir.display().to_string(),
    }
}

pub fn pipeline_from_env() -> Result<HarvestPipeline, HarvestError> {
    HarvestPipeline::new(HarvestConfig::from_env())
}

pub async fn run_harvest_once_from_env() -> Result<HarvestRunSummary, HarvestError> {
    pipeline_from_env()?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const USER_PATH: &str = "/api/v1/onlyfans/user/alice";
    const LEGACY_PATH: &str = "/api/v1/onlyfans/user/alice/posts-legacy";

    fn config(server: &MockServer, dir: &TempDir) -> HarvestConfig {
        HarvestConfig {
            platform: PlatformConfig {
                platform_id: "coomer".into(),
                base_url: server.uri(),
                media_prefix: format!("{}/data", server.uri()),
                post_pages: PostPageShape::BareArray,
            },
            download_dir: dir.path().join("media"),
            reports_dir: dir.path().join("reports"),
            workspace_root: dir.path().to_path_buf(),
            page_concurrency: 2,
            download_workers: 2,
            ..Default::default()
        }
    }

    fn alice() -> ProfileKey {
        ProfileKey::new(Service::OnlyFans, "alice")
    }

    fn page_of(ids: std::ops::Range<u32>) -> serde_json::Value {
        serde_json::Value::Array(
            ids.map(|i| json!({"id": i.to_string(), "user": "alice", "service": "onlyfans", "file": {}}))
                .collect(),
        )
    }

    async fn mount_metadata(server: &MockServer, count: u64) {
        Mock::given(method("GET"))
            .and(path(LEGACY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "props": {"count": count, "artist": {"name": "alice", "updated": "2024-05-01T08:30:00"}}
            })))
            .mount(server)
            .await;
    }

    async fn mount_page(server: &MockServer, offset: u64, response: ResponseTemplate, expect: u64) {
        Mock::given(method("GET"))
            .and(path(USER_PATH))
            .and(query_param("o", offset.to_string()))
            .respond_with(response)
            .expect(expect)
            .mount(server)
            .await;
    }

    async fn mount_version(server: &MockServer, status: u16) {
        Mock::given(method("GET"))
            .and(path("/api/v1/app_version"))
            .respond_with(ResponseTemplate::new(status).set_body_string("2.0.1"))
            .mount(server)
            .await;
    }

    #[derive(Default)]
    struct CollectingSink {
        profiles: Mutex<Vec<Profile>>,
        metadata: Mutex<Vec<ProfileMetadata>>,
    }

    impl RecordSink for Arc<CollectingSink> {
        fn accept_profiles(&self, profiles: &[Profile]) -> anyhow::Result<()> {
            self.profiles.lock().unwrap().extend_from_slice(profiles);
            Ok(())
        }

        fn accept_metadata(&self, metadata: &ProfileMetadata) -> anyhow::Result<()> {
            self.metadata.lock().unwrap().push(metadata.clone());
            Ok(())
        }

        fn accept_posts(&self, _profile: &ProfileKey, _posts: &[Post]) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn post_count_120_requests_three_pages() {
        let server = MockServer::start().await;
        mount_metadata(&server, 120).await;
        mount_page(&server, 0, ResponseTemplate::new(200).set_body_json(page_of(0..50)), 1).await;
        mount_page(&server, 50, ResponseTemplate::new(200).set_body_json(page_of(50..100)), 1).await;
        mount_page(&server, 100, ResponseTemplate::new(200).set_body_json(page_of(100..120)), 1).await;
        mount_page(&server, 150, ResponseTemplate::new(200).set_body_json(json!([])), 0).await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        let result = pipeline.paginate_posts(&AdapterContext::new_run(), &alice()).await;

        assert_eq!(result.pages_requested, 3);
        assert_eq!(result.pages_fetched, 3);
        assert_eq!(result.posts.len(), 120);
        let ids: Vec<u32> = result.posts.iter().map(|p| p.id.parse().unwrap()).collect();
        assert_eq!(ids, (0..120).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failing_page_is_skipped_and_pagination_continues() {
        let server = MockServer::start().await;
        mount_metadata(&server, 120).await;
        mount_page(&server, 0, ResponseTemplate::new(200).set_body_json(page_of(0..50)), 1).await;
        mount_page(&server, 50, ResponseTemplate::new(500).set_body_string("boom"), 1).await;
        mount_page(&server, 100, ResponseTemplate::new(200).set_body_json(page_of(100..120)), 1).await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        let result = pipeline.paginate_posts(&AdapterContext::new_run(), &alice()).await;

        assert_eq!(result.pages_fetched, 2);
        assert_eq!(result.posts.len(), 70);
        assert_eq!(result.skipped_pages.len(), 1);
        let skipped = &result.skipped_pages[0];
        assert_eq!(skipped.offset, 50);
        assert_eq!(skipped.kind, FailureKind::PartialPageFailure);
        assert_eq!(skipped.cause, FailureKind::RemoteError);
        assert_eq!(skipped.status, Some(500));
    }

    #[tokio::test]
    async fn zero_posts_issue_no_page_requests() {
        let server = MockServer::start().await;
        mount_metadata(&server, 0).await;
        Mock::given(method("GET"))
            .and(path(USER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        let result = pipeline.paginate_posts(&AdapterContext::new_run(), &alice()).await;
        assert!(result.metadata.is_some());
        assert!(result.posts.is_empty());
        assert_eq!(result.pages_requested, 0);
    }

    #[tokio::test]
    async fn missing_metadata_skips_pagination() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(LEGACY_PATH))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(USER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        let ctx = AdapterContext::new_run();
        assert!(pipeline.resolve_metadata(&ctx, &alice()).await.is_none());
        let harvest = pipeline.harvest_profile(&ctx, &alice()).await;
        assert!(harvest.metadata.is_none());
        assert_eq!(harvest.downloads.attempted(), 0);
    }

    #[tokio::test]
    async fn unreachable_service_aborts_before_catalog() {
        let server = MockServer::start().await;
        mount_version(&server, 503).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/creators.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        let err = pipeline.run_once().await.expect_err("probe fails");
        assert!(matches!(err, HarvestError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn catalog_failure_is_an_empty_catalog() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/creators.txt"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        let catalog = pipeline.fetch_profiles(&AdapterContext::new_run()).await;
        assert!(catalog.accepted.is_empty());
        assert!(catalog.rejected.is_empty());
    }

    #[tokio::test]
    async fn full_run_downloads_each_path_once_and_writes_reports() {
        let server = MockServer::start().await;
        mount_version(&server, 200).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/creators.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "alice", "name": "alice", "service": "onlyfans", "favorited": 10},
                {"id": "mallory", "name": "../../etc", "service": "onlyfans", "favorited": 1}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        mount_metadata(&server, 2).await;
        mount_page(
            &server,
            0,
            ResponseTemplate::new(200).set_body_json(json!([
                {"id": "1", "file": {"name": "a.jpg", "path": "/x/a.jpg"}, "attachments": [{"name": "b.jpg", "path": "/y/b.jpg"}]},
                {"id": "2", "file": {}, "attachments": [{"name": "a.jpg", "path": "/x/a.jpg"}]}
            ])),
            1,
        )
        .await;
        for (route, body) in [("/data/x/a.jpg", "AAA"), ("/data/y/b.jpg", "BB")] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .expect(1)
                .mount(&server)
                .await;
        }

        let dir = tempdir().unwrap();
        let sink = Arc::new(CollectingSink::default());
        let pipeline = HarvestPipeline::new(config(&server, &dir))
            .unwrap()
            .with_sink(Box::new(sink.clone()));
        let summary = pipeline.run_once().await.expect("run succeeds");

        assert_eq!(summary.profiles_accepted, 1);
        assert_eq!(summary.profiles_rejected, 1);
        assert_eq!(summary.profiles_harvested, 1);
        assert_eq!(summary.pages_fetched, 1);
        assert_eq!(summary.posts_seen, 2);
        assert_eq!(summary.files_succeeded, 2);
        assert_eq!(summary.files_duplicate, 1);
        assert_eq!(summary.files_failed, 0);
        assert!(!summary.cancelled);

        let media = dir.path().join("media").join("alice");
        assert_eq!(std::fs::read_to_string(media.join("a.jpg")).unwrap(), "AAA");
        assert_eq!(std::fs::read_to_string(media.join("b.jpg")).unwrap(), "BB");

        let reports = PathBuf::from(&summary.reports_dir);
        assert!(reports.join("harvest_brief.md").exists());
        let record: serde_json::Value =
            serde_json::from_slice(&std::fs::read(reports.join("harvest_run.json")).unwrap()).unwrap();
        assert_eq!(record["summary"]["files_succeeded"], 2);
        assert_eq!(record["rejected_profiles"][0]["index"], 1);

        assert_eq!(sink.profiles.lock().unwrap().len(), 1);
        assert_eq!(sink.metadata.lock().unwrap()[0].post_count, 2);
    }

    #[tokio::test]
    async fn target_registry_replaces_catalog() {
        let server = MockServer::start().await;
        mount_version(&server, 200).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/creators.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;
        mount_metadata(&server, 0).await;
        Mock::given(method("GET"))
            .and(path("/api/v1/onlyfans/user/bob/posts-legacy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("profiles.yaml"),
            "targets:\n  - service: onlyfans\n    id: alice\n  - service: onlyfans\n    id: bob\n    enabled: false\n",
        )
        .unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        let summary = pipeline.run_once().await.expect("run succeeds");
        assert_eq!(summary.profiles_harvested, 1);
        assert_eq!(summary.profiles_accepted, 0);
    }

    #[tokio::test]
    async fn cancelled_run_starts_no_profiles() {
        let server = MockServer::start().await;
        mount_version(&server, 200).await;
        Mock::given(method("GET"))
            .and(path(LEGACY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        pipeline.cancel_token().cancel();
        let summary = pipeline.run_for_profiles(&[alice()]).await.expect("run");
        assert!(summary.cancelled);
        assert_eq!(summary.profiles_harvested, 0);
    }

    #[tokio::test]
    async fn probe_requires_exactly_200() {
        let server = MockServer::start().await;
        mount_version(&server, 204).await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        assert!(!pipeline.probe(&AdapterContext::new_run()).await);
    }

    #[tokio::test]
    async fn probe_sends_one_request_even_with_retries_enabled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/app_version"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(HarvestConfig {
            max_retries: 3,
            ..config(&server, &dir)
        })
        .unwrap();
        assert!(!pipeline.probe(&AdapterContext::new_run()).await);
    }

    #[tokio::test]
    async fn refused_connection_aborts_run_as_unreachable() {
        let server = MockServer::start().await;
        let dir = tempdir().unwrap();
        let config = config(&server, &dir);
        drop(server);

        let pipeline = HarvestPipeline::new(config).unwrap();
        let err = pipeline.run_once().await.expect_err("nothing listens");
        assert!(matches!(err, HarvestError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn report_write_failure_keeps_the_run_summary() {
        let server = MockServer::start().await;
        mount_version(&server, 200).await;
        mount_metadata(&server, 1).await;
        mount_page(
            &server,
            0,
            ResponseTemplate::new(200)
                .set_body_json(json!([{"id": "1", "file": {"name": "a.jpg", "path": "/x/a.jpg"}}])),
            1,
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/data/x/a.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_string("AAA"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let pipeline = HarvestPipeline::new(HarvestConfig {
            reports_dir: blocker.join("reports"),
            ..config(&server, &dir)
        })
        .unwrap();

        let summary = pipeline.run_for_profiles(&[alice()]).await.expect("run completes");
        assert_eq!(summary.files_succeeded, 1);
        assert!(dir.path().join("media").join("alice").join("a.jpg").exists());
    }

    #[tokio::test]
    async fn cancelled_pagination_reports_undispatched_pages() {
        let server = MockServer::start().await;
        mount_metadata(&server, 120).await;
        Mock::given(method("GET"))
            .and(path(USER_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let pipeline = HarvestPipeline::new(config(&server, &dir)).unwrap();
        pipeline.cancel_token().cancel();
        let ctx = AdapterContext::new_run();
        let harvest = pipeline.harvest_profile(&ctx, &alice()).await;
        assert_eq!(harvest.pages_fetched, 0);
        assert_eq!(harvest.pages_not_dispatched, 3);

        let summary = summarize(
            &ctx,
            Utc::now(),
            true,
            &CatalogParse::default(),
            &[harvest],
            dir.path(),
        );
        assert_eq!(summary.pages_not_dispatched, 3);
    }

    #[test]
    fn http_config_carries_fixed_headers_and_retry_default() {
        let config = HarvestConfig {
            requests_per_second: Some(4),
            ..Default::default()
        };
        let http = config.http_client_config();
        assert_eq!(http.timeout, Duration::from_secs(5));
        assert_eq!(http.origin.as_deref(), Some("https://coomer.su"));
        assert_eq!(http.user_agent.as_deref(), Some(DEFAULT_USER_AGENT));
        assert_eq!(http.backoff.max_retries, 0);
        let bucket = http.token_bucket.expect("bucket");
        assert_eq!(bucket.capacity, 4);
        assert_eq!(bucket.refill_every, Duration::from_millis(250));
    }

    #[test]
    fn unknown_platform_is_rejected() {
        let mut config = HarvestConfig::default();
        config.platform.platform_id = "nowhere".into();
        assert!(matches!(
            HarvestPipeline::new(config),
            Err(HarvestError::UnknownPlatform(_))
        ));
    }
}
