//! I/O leaf for GSP: the never-throwing feed fetcher, the content-addressed
//! raw-object archive, the partitioned manifest writer, and the archive-side
//! retention planner.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use gsp_core::RawManifestRecord;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "gsp-storage";

pub const MANIFEST_SUFFIX: &str = ".manifest.json";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// Result of one feed fetch. All failure is data: the collector records a
/// manifest row even for a failed fetch, so nothing here returns `Err`.
#[derive(Debug, Clone)]
pub struct FeedFetch {
    pub ok: bool,
    /// HTTP status; a transport-level failure maps to 0.
    pub http_status: u16,
    pub duration_ms: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Raw payload bytes, present only when `ok`.
    pub body: Option<Vec<u8>>,
    /// Transport or status error, present only when not `ok`.
    pub error: Option<String>,
}

fn header_string(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Perform one GET against a feed URL, capturing timing and caching headers.
pub async fn fetch_feed(client: &reqwest::Client, url: &str) -> FeedFetch {
    use reqwest::header;

    let started = Instant::now();
    let response = match client.get(url).send().await {
        Ok(response) => response,
        Err(err) => {
            return FeedFetch {
                ok: false,
                http_status: 0,
                duration_ms: started.elapsed().as_millis() as u64,
                etag: None,
                last_modified: None,
                content_length: None,
                content_type: None,
                content_encoding: None,
                body: None,
                error: Some(err.to_string()),
            }
        }
    };

    let status = response.status();
    let headers = response.headers().clone();
    let etag = header_string(&headers, header::ETAG);
    let last_modified = header_string(&headers, header::LAST_MODIFIED);
    let content_type = header_string(&headers, header::CONTENT_TYPE);
    let content_encoding = header_string(&headers, header::CONTENT_ENCODING);
    let header_length = header_string(&headers, header::CONTENT_LENGTH).and_then(|v| v.parse().ok());

    if !status.is_success() {
        return FeedFetch {
            ok: false,
            http_status: status.as_u16(),
            duration_ms: started.elapsed().as_millis() as u64,
            etag,
            last_modified,
            content_length: header_length,
            content_type,
            content_encoding,
            body: None,
            error: Some(format!("http status {} for {}", status.as_u16(), url)),
        };
    }

    match response.bytes().await {
        Ok(bytes) => {
            let body = bytes.to_vec();
            FeedFetch {
                ok: true,
                http_status: status.as_u16(),
                duration_ms: started.elapsed().as_millis() as u64,
                etag,
                last_modified,
                content_length: header_length.or(Some(body.len() as i64)),
                content_type,
                content_encoding,
                body: Some(body),
                error: None,
            }
        }
        Err(err) => FeedFetch {
            ok: false,
            http_status: status.as_u16(),
            duration_ms: started.elapsed().as_millis() as u64,
            etag,
            last_modified,
            content_length: header_length,
            content_type,
            content_encoding,
            body: None,
            error: Some(format!("reading body: {err}")),
        },
    }
}

/// Content-addressed raw object written under the archive root.
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub sha256: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Manifest file written under the archive root.
#[derive(Debug, Clone)]
pub struct WrittenManifest {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    /// True when a manifest already existed at the partitioned path; the
    /// existing file is never rewritten.
    pub skipped: bool,
}

/// The on-disk archive: immutable raw objects plus append-only manifests.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
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

    /// `objects/sha256=<first2>/<next2>/<fullhex><ext>`; the two-level shard
    /// bounds directory fan-out.
    pub fn object_relative_path(digest: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from("objects")
            .join(format!("sha256={}", &digest[..2]))
            .join(&digest[2..4])
            .join(format!("{digest}.{ext}"))
    }

    /// `feed=<name>/dt=<yyyy-mm-dd>/hour=<hh>/<timestamp>.manifest.json`.
    pub fn manifest_relative_path(feed_name: &str, collected_at: DateTime<Utc>) -> PathBuf {
        PathBuf::from(format!("feed={feed_name}"))
            .join(format!("dt={}", collected_at.format("%Y-%m-%d")))
            .join(format!("hour={}", collected_at.format("%H")))
            .join(format!(
                "{}{}",
                collected_at.format("%Y-%m-%dT%H%M%S%.3fZ"),
                MANIFEST_SUFFIX
            ))
    }

    /// Write `bytes` at their hash-derived path. Write-once: an existing file
    /// at that path is byte-identical by construction, so the write is
    /// skipped and reported as deduplicated.
    pub async fn write_raw_object(&self, bytes: &[u8], extension: &str) -> anyhow::Result<StoredObject> {
        let sha256 = Self::sha256_hex(bytes);
        let relative_path = Self::object_relative_path(&sha256, extension);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking object path {}", absolute_path.display()))?
        {
            debug!(sha256, path = %relative_path.display(), "raw object already archived");
            return Ok(StoredObject {
                sha256,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        match self.write_new_file(&absolute_path, bytes).await {
            Ok(()) => Ok(StoredObject {
                sha256,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            // A concurrent writer won the rename; same bytes by construction.
            Err(err) if is_already_exists(&err) => Ok(StoredObject {
                sha256,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            }),
            Err(err) => Err(err),
        }
    }

    /// Serialize `record` to its partitioned manifest path, stamping the
    /// record's own `manifest_path` field first. Write-once.
    pub async fn write_manifest(&self, record: &RawManifestRecord) -> anyhow::Result<WrittenManifest> {
        let relative_path = Self::manifest_relative_path(&record.feed_name, record.collected_at);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking manifest path {}", absolute_path.display()))?
        {
            warn!(path = %relative_path.display(), "manifest already written; leaving existing file");
            return Ok(WrittenManifest {
                relative_path,
                absolute_path,
                skipped: true,
            });
        }

        let mut stamped = record.clone();
        stamped.manifest_path = Some(relative_path.display().to_string());
        let bytes = serde_json::to_vec_pretty(&stamped).context("serializing manifest")?;

        match self.write_new_file(&absolute_path, &bytes).await {
            Ok(()) => Ok(WrittenManifest {
                relative_path,
                absolute_path,
                skipped: false,
            }),
            Err(err) if is_already_exists(&err) => Ok(WrittenManifest {
                relative_path,
                absolute_path,
                skipped: true,
            }),
            Err(err) => Err(err),
        }
    }

    // Atomic create: temp file in the final directory, then rename. The
    // rename target existing means another writer finished first.
    async fn write_new_file(&self, absolute_path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = absolute_path
            .parent()
            .context("archive path always has a parent")?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

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

        if fs::try_exists(absolute_path).await.unwrap_or(false) {
            let _ = fs::remove_file(&temp_path).await;
            return Err(anyhow::Error::new(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", absolute_path.display()),
            )));
        }

        match fs::rename(&temp_path, absolute_path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

fn is_already_exists(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|io| io.kind() == std::io::ErrorKind::AlreadyExists)
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeBasisSource {
    /// Timestamp extracted from the manifest's own JSON.
    Logical,
    /// Filesystem modification time.
    Mtime,
}

impl AgeBasisSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgeBasisSource::Logical => "logical",
            AgeBasisSource::Mtime => "mtime",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveFileEntry {
    pub path: PathBuf,
    pub bytes: u64,
    pub age_basis: DateTime<Utc>,
    pub age_basis_source: AgeBasisSource,
}

/// A computed, inspectable deletion plan. Produced separately from
/// application so operators can audit it before files are unlinked.
#[derive(Debug, Clone, Serialize)]
pub struct RetentionPlan {
    pub age_candidates: Vec<PathBuf>,
    pub size_candidates: Vec<PathBuf>,
    /// Merged, deduplicated, sorted oldest-first (ties broken by path).
    pub delete_set: Vec<ArchiveFileEntry>,
    pub total_files_before: usize,
    pub total_files_after: usize,
    pub total_bytes_before: u64,
    pub total_bytes_after: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetentionOutcome {
    pub deleted_files: usize,
    pub deleted_bytes: u64,
}

/// Compute a deletion plan over every file under `root`.
///
/// Age candidates are files whose age basis predates `now - retention_days`
/// (skipped entirely when `retention_days` is `None`). If the bytes left
/// after age-based removal still exceed `max_archive_bytes`, the remaining
/// files are consumed oldest-first until the total fits under the cap.
pub fn plan_retention(
    root: &Path,
    retention_days: Option<i64>,
    max_archive_bytes: Option<u64>,
    now: DateTime<Utc>,
) -> anyhow::Result<RetentionPlan> {
    let mut entries = Vec::new();
    walk_files(root, &mut entries)?;
    entries.sort_by(|a, b| {
        a.age_basis
            .cmp(&b.age_basis)
            .then_with(|| a.path.cmp(&b.path))
    });

    let total_files_before = entries.len();
    let total_bytes_before = entries.iter().map(|e| e.bytes).sum::<u64>();

    let age_cutoff = retention_days.map(|days| now - chrono::Duration::days(days));
    let age_candidates: Vec<PathBuf> = match age_cutoff {
        Some(cutoff) => entries
            .iter()
            .filter(|e| e.age_basis < cutoff)
            .map(|e| e.path.clone())
            .collect(),
        None => Vec::new(),
    };

    let mut remaining_bytes = entries
        .iter()
        .filter(|e| !age_candidates.contains(&e.path))
        .map(|e| e.bytes)
        .sum::<u64>();

    let mut size_candidates = Vec::new();
    if let Some(cap) = max_archive_bytes {
        for entry in &entries {
            if remaining_bytes <= cap {
                break;
            }
            if age_candidates.contains(&entry.path) {
                continue;
            }
            size_candidates.push(entry.path.clone());
            remaining_bytes -= entry.bytes;
        }
    }

    let delete_set: Vec<ArchiveFileEntry> = entries
        .iter()
        .filter(|e| age_candidates.contains(&e.path) || size_candidates.contains(&e.path))
        .cloned()
        .collect();
    let deleted_bytes = delete_set.iter().map(|e| e.bytes).sum::<u64>();

    let plan = RetentionPlan {
        age_candidates,
        size_candidates,
        total_files_after: total_files_before - delete_set.len(),
        total_bytes_after: total_bytes_before - deleted_bytes,
        delete_set,
        total_files_before,
        total_bytes_before,
    };
    info!(
        files_before = plan.total_files_before,
        files_after = plan.total_files_after,
        bytes_before = plan.total_bytes_before,
        bytes_after = plan.total_bytes_after,
        age_candidates = plan.age_candidates.len(),
        size_candidates = plan.size_candidates.len(),
        "retention plan computed"
    );
    Ok(plan)
}

/// Unlink every file in the plan's delete set. Already-missing files are
/// tolerated; the outcome tallies what was actually deleted.
pub fn apply_retention(plan: &RetentionPlan) -> anyhow::Result<RetentionOutcome> {
    let mut deleted_files = 0usize;
    let mut deleted_bytes = 0u64;
    for entry in &plan.delete_set {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => {
                deleted_files += 1;
                deleted_bytes += entry.bytes;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %entry.path.display(), "planned file already gone");
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("deleting {}", entry.path.display()));
            }
        }
    }
    info!(deleted_files, deleted_bytes, "retention plan applied");
    Ok(RetentionOutcome {
        deleted_files,
        deleted_bytes,
    })
}

fn walk_files(dir: &Path, out: &mut Vec<ArchiveFileEntry>) -> anyhow::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("reading entry under {}", dir.display()))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("stat {}", path.display()))?;
        if file_type.is_dir() {
            walk_files(&path, out)?;
        } else if file_type.is_file() {
            let metadata = entry
                .metadata()
                .with_context(|| format!("stat {}", path.display()))?;
            let (age_basis, age_basis_source) = age_basis_for(&path, &metadata);
            out.push(ArchiveFileEntry {
                path,
                bytes: metadata.len(),
                age_basis,
                age_basis_source,
            });
        }
    }
    Ok(())
}

// Manifests carry their own provenance timestamps; prefer those over mtime
// so a re-synced archive (fresh mtimes) still ages out on schedule.
fn age_basis_for(path: &Path, metadata: &std::fs::Metadata) -> (DateTime<Utc>, AgeBasisSource) {
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(MANIFEST_SUFFIX))
        .unwrap_or(false)
    {
        if let Some(logical) = manifest_logical_timestamp(path) {
            return (logical, AgeBasisSource::Logical);
        }
    }
    let mtime = metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    (mtime, AgeBasisSource::Mtime)
}

fn manifest_logical_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let text = std::fs::read_to_string(path).ok()?;
    let doc: serde_json::Value = serde_json::from_str(&text).ok()?;
    for field in ["publisher_last_updated", "collected_at"] {
        if let Some(ts) = doc
            .get(field)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        {
            return Some(ts.with_timezone(&Utc));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gsp_core::{parser_fingerprint, FeedKind, LOADER_SCHEMA_VERSION};
    use tempfile::tempdir;

    fn record(collected_at: DateTime<Utc>, publisher: Option<DateTime<Utc>>) -> RawManifestRecord {
        let kind = FeedKind::StationStatus;
        RawManifestRecord {
            system_id: "bixi".into(),
            feed_name: kind.feed_name().into(),
            collected_at,
            publisher_last_updated: publisher,
            ttl: Some(60),
            http_status: 200,
            ok: true,
            etag: None,
            content_length: Some(2),
            content_type: Some("application/json".into()),
            content_encoding: None,
            last_modified: None,
            duration_ms: 12,
            raw_object_sha256: Some(Archive::sha256_hex(b"{}")),
            object_path: None,
            manifest_path: None,
            parse_schema_id: kind.parse_schema_id().into(),
            parser_fingerprint: parser_fingerprint(kind.parse_schema_id(), LOADER_SCHEMA_VERSION),
            loader_schema_version: LOADER_SCHEMA_VERSION.into(),
            gbfs_version: Some("2.3".into()),
            source_url: "https://x/station_status.json".into(),
        }
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn transport_failure_is_data_not_error() {
        let client = build_http_client(&HttpClientConfig {
            timeout: Duration::from_millis(500),
            user_agent: Some("gsp-test".into()),
        })
        .expect("client");
        // Nothing listens on port 9; connection is refused immediately.
        let fetch = fetch_feed(&client, "http://127.0.0.1:9/gbfs.json").await;
        assert!(!fetch.ok);
        assert_eq!(fetch.http_status, 0);
        assert!(fetch.body.is_none());
        assert!(fetch.error.is_some());
    }

    #[test]
    fn object_paths_shard_by_digest_prefix() {
        let digest = Archive::sha256_hex(b"payload");
        let path = Archive::object_relative_path(&digest, "json");
        let rendered = path.display().to_string();
        assert!(rendered.starts_with(&format!("objects/sha256={}/{}/", &digest[..2], &digest[2..4])));
        assert!(rendered.ends_with(&format!("{digest}.json")));
    }

    #[tokio::test]
    async fn raw_object_writes_once_and_dedups() {
        let dir = tempdir().expect("tempdir");
        let archive = Archive::new(dir.path());

        let first = archive.write_raw_object(b"{\"a\":1}", "json").await.expect("first");
        let second = archive.write_raw_object(b"{\"a\":1}", "json").await.expect("second");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.sha256, second.sha256);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn manifest_write_is_write_once() {
        let dir = tempdir().expect("tempdir");
        let archive = Archive::new(dir.path());
        let rec = record(ts(1), Some(ts(1)));

        let first = archive.write_manifest(&rec).await.expect("first");
        let second = archive.write_manifest(&rec).await.expect("second");
        assert!(!first.skipped);
        assert!(second.skipped);

        let text = std::fs::read_to_string(&first.absolute_path).expect("read back");
        let doc: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(
            doc.get("manifest_path").and_then(|v| v.as_str()),
            Some(first.relative_path.display().to_string().as_str())
        );
        assert!(first
            .relative_path
            .display()
            .to_string()
            .starts_with("feed=station_status/dt=2026-03-01/hour=12/"));
    }

    #[tokio::test]
    async fn plan_selects_aged_manifests_by_logical_timestamp() {
        let dir = tempdir().expect("tempdir");
        let archive = Archive::new(dir.path());
        // Both files have fresh mtimes; only the logical ages differ.
        let old = archive.write_manifest(&record(ts(1), Some(ts(1)))).await.expect("old");
        let fresh = archive
            .write_manifest(&record(ts(20), Some(ts(20))))
            .await
            .expect("fresh");

        let now = ts(21) + chrono::Duration::days(20); // old is 40 days, fresh is 21
        let plan = plan_retention(dir.path(), Some(30), None, now).expect("plan");

        assert_eq!(plan.age_candidates, vec![old.absolute_path.clone()]);
        assert_eq!(plan.delete_set.len(), 1);
        assert_eq!(plan.delete_set[0].age_basis_source, AgeBasisSource::Logical);
        assert_eq!(plan.total_files_before, 2);
        assert_eq!(plan.total_files_after, 1);
        assert!(fresh.absolute_path.exists());
    }

    #[test]
    fn plain_files_age_by_mtime() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("objects").join("blob.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{}").unwrap();

        // mtime is "now", so a 30-day cutoff keeps it.
        let plan = plan_retention(dir.path(), Some(30), None, Utc::now()).expect("plan");
        assert!(plan.delete_set.is_empty());
        assert_eq!(plan.total_files_before, 1);

        // A `now` 40 days ahead ages the same file out.
        let plan = plan_retention(
            dir.path(),
            Some(30),
            None,
            Utc::now() + chrono::Duration::days(40),
        )
        .expect("plan");
        assert_eq!(plan.delete_set.len(), 1);
        assert_eq!(plan.delete_set[0].age_basis_source, AgeBasisSource::Mtime);
    }

    #[tokio::test]
    async fn size_cap_consumes_oldest_first() {
        let dir = tempdir().expect("tempdir");
        let archive = Archive::new(dir.path());
        let oldest = archive.write_manifest(&record(ts(1), Some(ts(1)))).await.expect("w");
        let middle = archive.write_manifest(&record(ts(2), Some(ts(2)))).await.expect("w");
        let newest = archive.write_manifest(&record(ts(3), Some(ts(3)))).await.expect("w");

        let sizes: Vec<u64> = [&oldest, &middle, &newest]
            .iter()
            .map(|m| std::fs::metadata(&m.absolute_path).unwrap().len())
            .collect();
        let total: u64 = sizes.iter().sum();
        // Cap below the total but big enough to keep the two newest.
        let cap = total - sizes[0] - 1;

        let plan = plan_retention(dir.path(), None, Some(cap), ts(4)).expect("plan");
        assert!(plan.age_candidates.is_empty());
        assert_eq!(
            plan.size_candidates,
            vec![oldest.absolute_path.clone(), middle.absolute_path.clone()]
        );
        assert!(plan.total_bytes_after <= cap);
    }

    #[tokio::test]
    async fn apply_deletes_exactly_the_planned_files() {
        let dir = tempdir().expect("tempdir");
        let archive = Archive::new(dir.path());
        let doomed = archive.write_manifest(&record(ts(1), Some(ts(1)))).await.expect("w");
        let kept = archive.write_manifest(&record(ts(20), Some(ts(20)))).await.expect("w");
        let doomed_bytes = std::fs::metadata(&doomed.absolute_path).unwrap().len();

        let now = ts(21) + chrono::Duration::days(20);
        let plan = plan_retention(dir.path(), Some(30), None, now).expect("plan");
        let outcome = apply_retention(&plan).expect("apply");

        assert_eq!(outcome.deleted_files, 1);
        assert_eq!(outcome.deleted_bytes, doomed_bytes);
        assert!(!doomed.absolute_path.exists());
        assert!(kept.absolute_path.exists());

        // Re-applying tolerates the already-missing file.
        let outcome = apply_retention(&plan).expect("reapply");
        assert_eq!(outcome.deleted_files, 0);
    }
}
