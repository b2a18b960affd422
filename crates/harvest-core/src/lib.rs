//! Core domain model for the creator archive harvester.

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "harvest-core";

/// Posts returned per listing page by the remote API.
pub const PAGE_SIZE: u64 = 50;

/// Upper bound accepted for a reported post count. Larger values are clamped.
pub const MAX_POST_COUNT: u64 = 1_000_000;

/// Value reported for `lastUpdated` when the remote omits it.
pub const LAST_UPDATED_SENTINEL: &str = "00:00:00";

/// Number of listing pages to request for a profile with `post_count` posts.
///
/// Always one page more than the exact division, so the last page may come
/// back short or empty.
pub fn page_count(post_count: u64) -> u64 {
    post_count / PAGE_SIZE + 1
}

/// Listing offsets in request order: `0, 50, 100, ...`. Produced lazily.
pub fn page_offsets(post_count: u64) -> impl Iterator<Item = u64> {
    (0..page_count(post_count)).map(|i| i * PAGE_SIZE)
}

/// Sub-platform a profile belongs to. Serialized as its API path segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Service {
    OnlyFans,
    Fansly,
    CandFans,
    Other(String),
}

impl Service {
    pub fn as_str(&self) -> &str {
        match self {
            Service::OnlyFans => "onlyfans",
            Service::Fansly => "fansly",
            Service::CandFans => "candfans",
            Service::Other(raw) => raw.as_str(),
        }
    }
}

impl FromStr for Service {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "onlyfans" => Service::OnlyFans,
            "fansly" => Service::Fansly,
            "candfans" => Service::CandFans,
            other => Service::Other(other.to_string()),
        })
    }
}

impl From<String> for Service {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(service) => service,
            Err(never) => match never {},
        }
    }
}

impl From<Service> for String {
    fn from(value: Service) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a profile: `(service, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileKey {
    pub service: Service,
    pub id: String,
}

impl ProfileKey {
    pub fn new(service: Service, id: impl Into<String>) -> Self {
        Self {
            service,
            id: id.into(),
        }
    }
}

impl fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.id)
    }
}

/// Validated catalog entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub service: Service,
    pub display_name: String,
    pub favorited_count: u64,
}

impl Profile {
    pub fn key(&self) -> ProfileKey {
        ProfileKey::new(self.service.clone(), self.id.clone())
    }
}

/// Last-update marker reported by the per-profile endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LastUpdated {
    At(NaiveDateTime),
    Unparsed(String),
    Never,
}

impl LastUpdated {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Self::Never;
        };
        if raw == LAST_UPDATED_SENTINEL {
            return Self::Never;
        }
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Self::At(parsed.naive_utc());
        }
        for format in [
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%dT%H:%M:%S",
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%d %H:%M:%S",
        ] {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
                return Self::At(parsed);
            }
        }
        if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
            return Self::At(parsed.naive_utc());
        }
        Self::Unparsed(raw.to_string())
    }

    pub fn from_epoch_seconds(secs: i64) -> Self {
        match DateTime::from_timestamp(secs, 0) {
            Some(ts) => Self::At(ts.naive_utc()),
            None => Self::Unparsed(secs.to_string()),
        }
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Self::At(ts) => Some(*ts),
            _ => None,
        }
    }
}

impl From<String> for LastUpdated {
    fn from(value: String) -> Self {
        Self::parse(Some(&value))
    }
}

impl From<LastUpdated> for String {
    fn from(value: LastUpdated) -> Self {
        value.to_string()
    }
}

impl fmt::Display for LastUpdated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At(ts) => write!(f, "{}", ts.format("%Y-%m-%dT%H:%M:%S")),
            Self::Unparsed(raw) => f.write_str(raw),
            Self::Never => f.write_str(LAST_UPDATED_SENTINEL),
        }
    }
}

/// Aggregate counters for one profile, resolved once per harvest run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub id: String,
    pub service: Service,
    pub post_count: u64,
    pub last_updated: LastUpdated,
    pub name: String,
    pub external_id: String,
}

impl ProfileMetadata {
    pub fn key(&self) -> ProfileKey {
        ProfileKey::new(self.service.clone(), self.id.clone())
    }

    /// Pages pagination will request; zero when the profile has no posts.
    pub fn planned_pages(&self) -> u64 {
        if self.post_count == 0 {
            0
        } else {
            page_count(self.post_count)
        }
    }

    pub fn page_offsets(&self) -> impl Iterator<Item = u64> {
        (0..self.planned_pages()).map(|i| i * PAGE_SIZE)
    }
}

/// Reference to one remote media file. `remote_path` is the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub remote_path: String,
}

impl FileRef {
    pub fn new(name: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote_path: remote_path.into(),
        }
    }

    /// Final path segment of `remote_path`, if it is usable as a local filename.
    pub fn file_name(&self) -> Option<&str> {
        let segment = self.remote_path.rsplit('/').next()?;
        match segment {
            "" | "." | ".." => None,
            s if s.contains('\\') => None,
            s => Some(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub profile_id: String,
    pub service: Service,
    pub title: String,
    pub published: Option<NaiveDateTime>,
    pub primary_file: Option<FileRef>,
    pub attachments: Vec<FileRef>,
}

impl Post {
    /// Primary file first, then attachments in order.
    pub fn file_refs(&self) -> impl Iterator<Item = &FileRef> {
        self.primary_file.iter().chain(self.attachments.iter())
    }
}

/// One unit of work for the download manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub file_ref: FileRef,
    pub destination_profile_id: String,
}

/// Failure taxonomy shared by every stage and surfaced in run reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    InvalidPayload,
    RemoteError,
    PartialPageFailure,
    DownloadFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::Unreachable => "unreachable",
            FailureKind::InvalidPayload => "invalid_payload",
            FailureKind::RemoteError => "remote_error",
            FailureKind::PartialPageFailure => "partial_page_failure",
            FailureKind::DownloadFailure => "download_failure",
        };
        f.write_str(label)
    }
}
