//! Download manager: fetches each referenced media file once into a per-profile directory.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::ready;
use futures::stream::{self, StreamExt};
use harvest_adapters::{AdapterContext, PlatformAdapter};
use harvest_core::{DownloadTask, FailureKind, FileRef};
use harvest_storage::{FetchError, HttpFetcher, MediaStore};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "harvest-download";

pub const DEFAULT_WORKERS: usize = 4;

/// Remote paths already claimed by a worker during this process.
///
/// `claim` is an atomic check-and-insert, so two workers can never both
/// fetch the same path.
#[derive(Debug, Clone, Default)]
pub struct SeenPaths {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl SeenPaths {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the caller now owns `remote_path`.
    pub fn claim(&self, remote_path: &str) -> bool {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        set.insert(remote_path.to_string())
    }

    pub fn release(&self, remote_path: &str) -> bool {
        let mut set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        set.remove(remote_path)
    }

    pub fn contains(&self, remote_path: &str) -> bool {
        let set = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        set.contains(remote_path)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadedFile {
    pub file_ref: FileRef,
    pub path: PathBuf,
    pub bytes: u64,
    pub sha256: String,
    pub attempts: usize,
    pub replaced_existing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadFailureCause {
    /// Remote answered with a non-success status.
    Status,
    Transport,
    Storage,
    /// `remote_path` has no usable final segment.
    InvalidPath,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadFailure {
    pub file_ref: FileRef,
    pub url: String,
    pub cause: DownloadFailureCause,
    pub status: Option<u16>,
    pub message: String,
    pub attempts: usize,
}

impl DownloadFailure {
    pub fn kind(&self) -> FailureKind {
        match self.cause {
            DownloadFailureCause::InvalidPath => FailureKind::InvalidPayload,
            _ => FailureKind::DownloadFailure,
        }
    }

    fn from_fetch(task: &DownloadTask, url: String, err: &FetchError) -> Self {
        let cause = if err.status().is_some() {
            DownloadFailureCause::Status
        } else {
            DownloadFailureCause::Transport
        };
        let message = match err.body() {
            Some(body) => format!("{err}: {body}"),
            None => err.to_string(),
        };
        Self {
            file_ref: task.file_ref.clone(),
            url,
            cause,
            status: err.status(),
            message,
            attempts: err.attempts(),
        }
    }
}

/// Per-profile outcome of one `download` call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    pub profile_id: String,
    pub succeeded: Vec<DownloadedFile>,
    pub duplicates: Vec<FileRef>,
    pub failures: Vec<DownloadFailure>,
    /// Refs left untouched because the run was cancelled.
    pub not_dispatched: Vec<FileRef>,
}

impl DownloadReport {
    pub fn new(profile_id: impl Into<String>) -> Self {
        Self {
            profile_id: profile_id.into(),
            ..Default::default()
        }
    }

    /// Files a GET was issued for.
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failures.iter().filter(|f| f.attempts > 0).count()
    }

    pub fn retries(&self) -> usize {
        self.succeeded
            .iter()
            .map(|f| f.attempts)
            .chain(self.failures.iter().map(|f| f.attempts))
            .map(|attempts| attempts.saturating_sub(1))
            .sum()
    }

    pub fn failed_refs(&self) -> Vec<FileRef> {
        self.failures.iter().map(|f| f.file_ref.clone()).collect()
    }

    pub fn merge(&mut self, other: DownloadReport) {
        self.succeeded.extend(other.succeeded);
        self.duplicates.extend(other.duplicates);
        self.failures.extend(other.failures);
        self.not_dispatched.extend(other.not_dispatched);
    }

    fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Succeeded(file) => self.succeeded.push(file),
            FileOutcome::Duplicate(file_ref) => self.duplicates.push(file_ref),
            FileOutcome::Failed(failure) => self.failures.push(failure),
        }
    }
}

#[derive(Debug)]
enum FileOutcome {
    Succeeded(DownloadedFile),
    Duplicate(FileRef),
    Failed(DownloadFailure),
}

pub struct DownloadManager {
    http: Arc<HttpFetcher>,
    adapter: Arc<dyn PlatformAdapter>,
    store: MediaStore,
    seen: SeenPaths,
    workers: usize,
    cancel: CancellationToken,
}

impl DownloadManager {
    pub fn new(
        http: Arc<HttpFetcher>,
        adapter: Arc<dyn PlatformAdapter>,
        store: MediaStore,
        workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            http,
            adapter,
            store,
            seen: SeenPaths::new(),
            workers: workers.max(1),
            cancel,
        }
    }

    pub fn with_seen_paths(mut self, seen: SeenPaths) -> Self {
        self.seen = seen;
        self
    }

    pub fn seen_paths(&self) -> &SeenPaths {
        &self.seen
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    /// Download every distinct `remote_path` in `file_refs` into `destination/profile_id`.
    ///
    /// Individual failures are recorded and never stop the batch.
    pub async fn download(
        &self,
        ctx: &AdapterContext,
        file_refs: &[FileRef],
        profile_id: &str,
    ) -> DownloadReport {
        let mut report = DownloadReport::new(profile_id);
        if let Err(err) = self.store.ensure_profile_dir(profile_id).await {
            let message = format!("{err:#}");
            warn!(profile_id, error = %message, "cannot prepare destination, failing batch");
            for file_ref in file_refs {
                // Paths owned by another batch, or repeated here, stay duplicates so that
                // retry_failed never releases a claim this batch does not hold.
                if !self.seen.claim(&file_ref.remote_path) {
                    report.duplicates.push(file_ref.clone());
                    continue;
                }
                report.failures.push(DownloadFailure {
                    file_ref: file_ref.clone(),
                    url: self.adapter.media_url(&file_ref.remote_path),
                    cause: DownloadFailureCause::Storage,
                    status: None,
                    message: message.clone(),
                    attempts: 0,
                });
            }
            return report;
        }

        let outcomes: Vec<FileOutcome> = stream::iter(file_refs)
            .take_while(|_| ready(!self.cancel.is_cancelled()))
            .map(|file_ref| {
                self.dispatch(
                    ctx,
                    DownloadTask {
                        file_ref: file_ref.clone(),
                        destination_profile_id: profile_id.to_string(),
                    },
                )
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let dispatched = outcomes.len();
        for outcome in outcomes {
            report.record(outcome);
        }
        if dispatched < file_refs.len() {
            report.not_dispatched = file_refs[dispatched..].to_vec();
            info!(
                profile_id,
                not_dispatched = report.not_dispatched.len(),
                "cancelled before all downloads were dispatched"
            );
        }

        info!(
            profile_id,
            attempted = report.attempted(),
            succeeded = report.succeeded.len(),
            duplicates = report.duplicates.len(),
            failed = report.failures.len(),
            retries = report.retries(),
            "download batch finished"
        );
        report
    }

    /// Release the failed paths of `report` and download just those again.
    pub async fn retry_failed(&self, ctx: &AdapterContext, report: &DownloadReport) -> DownloadReport {
        let refs = report.failed_refs();
        for file_ref in &refs {
            self.seen.release(&file_ref.remote_path);
        }
        self.download(ctx, &refs, &report.profile_id).await
    }

    async fn dispatch(&self, ctx: &AdapterContext, task: DownloadTask) -> FileOutcome {
        let url = self.adapter.media_url(&task.file_ref.remote_path);

        let Some(file_name) = task.file_ref.file_name() else {
            warn!(remote_path = %task.file_ref.remote_path, "no usable filename in remote path");
            return FileOutcome::Failed(DownloadFailure {
                file_ref: task.file_ref.clone(),
                url,
                cause: DownloadFailureCause::InvalidPath,
                status: None,
                message: "remote path has no final segment".to_string(),
                attempts: 0,
            });
        };

        if !self.seen.claim(&task.file_ref.remote_path) {
            debug!(remote_path = %task.file_ref.remote_path, "already claimed, skipping");
            return FileOutcome::Duplicate(task.file_ref);
        }

        let opened = match self.http.open(ctx.run_id, &url).await {
            Ok(opened) => opened,
            Err(err) => {
                warn!(
                    url = %url,
                    status = ?err.status(),
                    body = err.body().unwrap_or_default(),
                    error = %err,
                    "download failed"
                );
                return FileOutcome::Failed(DownloadFailure::from_fetch(&task, url, &err));
            }
        };
        let attempts = opened.attempts;

        match self
            .store
            .write_response(&task.destination_profile_id, file_name, opened)
            .await
        {
            Ok(stored) => {
                debug!(
                    url = %url,
                    path = %stored.absolute_path.display(),
                    bytes = stored.byte_size,
                    "downloaded"
                );
                FileOutcome::Succeeded(DownloadedFile {
                    path: stored.absolute_path,
                    bytes: stored.byte_size,
                    sha256: stored.content_hash,
                    attempts,
                    replaced_existing: stored.replaced_existing,
                    file_ref: task.file_ref,
                })
            }
            Err(err) => {
                let message = format!("{err:#}");
                warn!(url = %url, error = %message, "writing download failed");
                FileOutcome::Failed(DownloadFailure {
                    file_ref: task.file_ref.clone(),
                    url,
                    cause: DownloadFailureCause::Storage,
                    status: None,
                    message,
                    attempts,
                })
            }
        }
    }
}
