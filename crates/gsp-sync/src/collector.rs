//! One collection pass: discovery, per-feed fetch, archive, manifest.

use chrono::{DateTime, Utc};
use gsp_core::{parser_fingerprint, FeedKind, RawManifestRecord, SystemConfig, LOADER_SCHEMA_VERSION};
use gsp_feeds::{peek_envelope, resolve_discovery, DiscoveryDocument, NamedFeed, DEFAULT_LANGUAGE};
use gsp_storage::{fetch_feed, Archive, FeedFetch};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Summary of one collection run over a system's feeds.
#[derive(Debug, Clone, Serialize)]
pub struct CollectSummary {
    pub run_id: Uuid,
    pub system_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub discovery_ttl: Option<i64>,
    pub feeds_ok: usize,
    pub feeds_failed: usize,
    pub objects_new: usize,
    pub objects_deduped: usize,
    pub manifest_paths: Vec<String>,
}

/// Resolve the system's discovery document into named feed URLs. Fatal on
/// an unreachable document or an empty feed list; with no feeds there is
/// nothing safe to continue with.
pub async fn discover(
    client: &reqwest::Client,
    system: &SystemConfig,
) -> anyhow::Result<DiscoveryDocument> {
    let fetch = fetch_feed(client, &system.discovery_url).await;
    if !fetch.ok {
        anyhow::bail!(
            "discovery fetch for {} failed: {}",
            system.system_id,
            fetch.error.as_deref().unwrap_or("unknown error")
        );
    }
    let body = fetch.body.as_deref().unwrap_or_default();
    resolve_discovery(body, DEFAULT_LANGUAGE).map_err(|err| {
        anyhow::anyhow!(
            "resolving discovery document for {}: {err}",
            system.system_id
        )
    })
}

/// Run discovery once, then fetch/archive/manifest each requested feed (or
/// every parseable discovered feed when `requested` is empty).
pub async fn run_collect(
    client: &reqwest::Client,
    archive: &Archive,
    system: &SystemConfig,
    requested: &[String],
) -> anyhow::Result<CollectSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let doc = discover(client, system).await?;

    let targets: Vec<NamedFeed> = if requested.is_empty() {
        let (targets, unhandled) = parseable_targets(&doc.feeds);
        for name in &unhandled {
            info!(
                run_id = %run_id,
                system_id = %system.system_id,
                feed = %name,
                "discovered feed has no parser; not collecting"
            );
        }
        targets
    } else {
        requested
            .iter()
            .filter_map(|name| {
                let found = doc.feeds.iter().find(|f| &f.name == name).cloned();
                if found.is_none() {
                    warn!(
                        run_id = %run_id,
                        system_id = %system.system_id,
                        feed = %name,
                        "requested feed not present in discovery document; skipping"
                    );
                }
                found
            })
            .collect()
    };

    let mut summary = CollectSummary {
        run_id,
        system_id: system.system_id.clone(),
        started_at,
        finished_at: started_at,
        discovery_ttl: doc.ttl,
        feeds_ok: 0,
        feeds_failed: 0,
        objects_new: 0,
        objects_deduped: 0,
        manifest_paths: Vec::new(),
    };

    for feed in &targets {
        let Some(kind) = FeedKind::from_feed_name(&feed.name) else {
            debug!(run_id = %run_id, feed = %feed.name, "no parser for feed; skipping");
            continue;
        };
        let collected_at = Utc::now();
        let fetch = fetch_feed(client, &feed.url).await;

        let (record, deduplicated) =
            archive_fetch(archive, system, kind, feed, collected_at, &fetch, &doc).await?;
        match deduplicated {
            Some(true) => summary.objects_deduped += 1,
            Some(false) => summary.objects_new += 1,
            None => {}
        }
        let written = archive.write_manifest(&record).await?;
        summary
            .manifest_paths
            .push(written.relative_path.display().to_string());

        if fetch.ok {
            summary.feeds_ok += 1;
            info!(
                run_id = %run_id,
                system_id = %system.system_id,
                feed = %feed.name,
                http_status = fetch.http_status,
                duration_ms = fetch.duration_ms,
                sha256 = record.raw_object_sha256.as_deref().unwrap_or(""),
                deduplicated = deduplicated.unwrap_or(false),
                manifest = %written.relative_path.display(),
                "feed collected"
            );
        } else {
            summary.feeds_failed += 1;
            warn!(
                run_id = %run_id,
                system_id = %system.system_id,
                feed = %feed.name,
                http_status = fetch.http_status,
                error = fetch.error.as_deref().unwrap_or(""),
                manifest = %written.relative_path.display(),
                "feed fetch failed; manifest recorded"
            );
        }
    }

    summary.finished_at = Utc::now();
    Ok(summary)
}

// Splits discovered feeds into collectable targets and the names of feeds
// with no registered parser; the caller reports the latter.
fn parseable_targets(discovered: &[NamedFeed]) -> (Vec<NamedFeed>, Vec<String>) {
    let mut targets = Vec::new();
    let mut unhandled = Vec::new();
    for feed in discovered {
        if FeedKind::from_feed_name(&feed.name).is_some() {
            targets.push(feed.clone());
        } else {
            unhandled.push(feed.name.clone());
        }
    }
    (targets, unhandled)
}

// Archives the payload (when there is one) and assembles the manifest row.
// The second return value is the archive's dedup verdict, absent when the
// fetch produced no body.
async fn archive_fetch(
    archive: &Archive,
    system: &SystemConfig,
    kind: FeedKind,
    feed: &NamedFeed,
    collected_at: DateTime<Utc>,
    fetch: &FeedFetch,
    doc: &DiscoveryDocument,
) -> anyhow::Result<(RawManifestRecord, Option<bool>)> {
    let mut record = RawManifestRecord {
        system_id: system.system_id.clone(),
        feed_name: feed.name.clone(),
        collected_at,
        publisher_last_updated: None,
        ttl: doc.ttl,
        http_status: fetch.http_status,
        ok: fetch.ok,
        etag: fetch.etag.clone(),
        content_length: fetch.content_length,
        content_type: fetch.content_type.clone(),
        content_encoding: fetch.content_encoding.clone(),
        last_modified: fetch.last_modified.clone(),
        duration_ms: fetch.duration_ms,
        raw_object_sha256: None,
        object_path: None,
        manifest_path: None,
        parse_schema_id: kind.parse_schema_id().to_string(),
        parser_fingerprint: parser_fingerprint(kind.parse_schema_id(), LOADER_SCHEMA_VERSION),
        loader_schema_version: LOADER_SCHEMA_VERSION.to_string(),
        gbfs_version: doc.version.clone(),
        source_url: feed.url.clone(),
    };

    let mut deduplicated = None;
    if let Some(body) = &fetch.body {
        let meta = peek_envelope(body);
        record.publisher_last_updated = meta.last_updated;
        record.ttl = meta.ttl.or(doc.ttl);
        record.gbfs_version = meta.version.or_else(|| doc.version.clone());

        let ext = match fetch.content_type.as_deref() {
            Some(ct) if ct.contains("json") => "json",
            _ => "bin",
        };
        let stored = archive.write_raw_object(body, ext).await?;
        record.raw_object_sha256 = Some(stored.sha256);
        record.object_path = Some(stored.relative_path.display().to_string());
        deduplicated = Some(stored.deduplicated);
    }

    Ok((record, deduplicated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(name: &str) -> NamedFeed {
        NamedFeed {
            name: name.to_string(),
            url: format!("https://x/{name}.json"),
        }
    }

    #[test]
    fn unparseable_discovered_feeds_are_reported_not_dropped() {
        let discovered = vec![
            feed("station_information"),
            feed("free_bike_status"),
            feed("station_status"),
            feed("system_pricing_plans"),
        ];
        let (targets, unhandled) = parseable_targets(&discovered);
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|f| FeedKind::from_feed_name(&f.name).is_some()));
        assert_eq!(
            unhandled,
            vec!["free_bike_status".to_string(), "system_pricing_plans".to_string()]
        );
    }
}
