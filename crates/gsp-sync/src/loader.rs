//! The idempotency and consistency core: loads one manifest plus its
//! archived object into the relational history, inside one transaction.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use gsp_core::{
    grade_status_row, scd_transition, FeedKind, RawManifestRecord, ScdAttributes, ScdTransition,
    StationInformationRow, StationStatusRow,
};
use serde::Serialize;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{fmt_ts, parse_ts};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("manifest carries no raw object hash; there is nothing to load")]
    MissingObjectHash,
    #[error("manifest names no archived object path")]
    MissingObjectPath,
    #[error("no parser registered for feed `{0}`")]
    UnknownFeed(String),
}

/// Result of one manifest load. A conflict is a reported outcome, not an
/// error: retrying the same manifest will never yield a different result,
/// but other manifests are unaffected.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadOutcome {
    pub logical_snapshot_id: i64,
    pub deduped: bool,
    pub conflict: bool,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub scd_opened: u64,
    pub scd_closed: u64,
    pub lifecycle_upserts: u64,
}

/// Load one manifest. Every write happens inside a single transaction;
/// any error rolls the whole load back. Dedup and conflict short-circuit
/// after committing only the audit rows.
pub async fn load_manifest(
    pool: &SqlitePool,
    archive_root: &Path,
    manifest: &RawManifestRecord,
) -> anyhow::Result<LoadOutcome> {
    let raw_hash = manifest
        .raw_object_sha256
        .clone()
        .ok_or(LoadError::MissingObjectHash)?;
    let kind = FeedKind::from_feed_name(&manifest.feed_name)
        .ok_or_else(|| LoadError::UnknownFeed(manifest.feed_name.clone()))?;
    let publisher_ts = match manifest.publisher_last_updated {
        Some(ts) => ts,
        None => {
            // Weaker identity: the publisher declared nothing, so collection
            // time stands in for it.
            warn!(
                system_id = %manifest.system_id,
                feed = %manifest.feed_name,
                "manifest has no publisher timestamp; falling back to collection time"
            );
            manifest.collected_at
        }
    };

    let mut tx = pool.begin().await.context("beginning load transaction")?;

    insert_audit_rows(&mut tx, manifest).await?;

    // Insert-or-read-back on the snapshot identity. A single
    // unique-constrained insert attempt keeps this safe under concurrent
    // writers: the loser observes the winner's row.
    let inserted = sqlx::query(
        "INSERT INTO logical_snapshots \
         (system_id, feed_name, publisher_last_updated, loader_schema_version, \
          raw_object_sha256, parser_fingerprint, loaded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(&manifest.system_id)
    .bind(&manifest.feed_name)
    .bind(fmt_ts(publisher_ts))
    .bind(&manifest.loader_schema_version)
    .bind(&raw_hash)
    .bind(&manifest.parser_fingerprint)
    .bind(fmt_ts(Utc::now()))
    .execute(&mut *tx)
    .await
    .context("inserting logical snapshot")?;

    if inserted.rows_affected() == 0 {
        let existing = sqlx::query(
            "SELECT id, raw_object_sha256 FROM logical_snapshots \
             WHERE system_id = ? AND feed_name = ? \
               AND publisher_last_updated = ? AND loader_schema_version = ?",
        )
        .bind(&manifest.system_id)
        .bind(&manifest.feed_name)
        .bind(fmt_ts(publisher_ts))
        .bind(&manifest.loader_schema_version)
        .fetch_one(&mut *tx)
        .await
        .context("reading back existing logical snapshot")?;
        let existing_id: i64 = existing.get("id");
        let existing_hash: String = existing.get("raw_object_sha256");

        if existing_hash != raw_hash {
            // Same identity, different content: the publisher changed bytes
            // without changing its declared timestamp. History stays as-is;
            // only the audit rows land.
            tx.commit().await.context("committing audit rows on conflict")?;
            warn!(
                system_id = %manifest.system_id,
                feed = %manifest.feed_name,
                publisher_last_updated = %fmt_ts(publisher_ts),
                existing_sha256 = %existing_hash,
                incoming_sha256 = %raw_hash,
                "logical snapshot conflict; refusing to overwrite history"
            );
            return Ok(LoadOutcome {
                logical_snapshot_id: existing_id,
                conflict: true,
                ..LoadOutcome::default()
            });
        }

        tx.commit().await.context("committing audit rows on dedup")?;
        info!(
            system_id = %manifest.system_id,
            feed = %manifest.feed_name,
            logical_snapshot_id = existing_id,
            "exact content already loaded; deduped"
        );
        return Ok(LoadOutcome {
            logical_snapshot_id: existing_id,
            deduped: true,
            ..LoadOutcome::default()
        });
    }

    let snapshot_id = inserted.last_insert_rowid();
    let object_rel = manifest
        .object_path
        .as_ref()
        .ok_or(LoadError::MissingObjectPath)?;
    let object_abs = archive_root.join(object_rel);
    let bytes = tokio::fs::read(&object_abs)
        .await
        .with_context(|| format!("reading archived object {}", object_abs.display()))?;

    let mut outcome = LoadOutcome {
        logical_snapshot_id: snapshot_id,
        ..LoadOutcome::default()
    };

    match kind {
        FeedKind::StationInformation => {
            let parsed = gsp_feeds::parse_station_information(&bytes)
                .context("parsing station_information payload")?;
            outcome.rows_skipped += parsed.skipped as u64;
            load_station_information(
                &mut tx,
                &manifest.system_id,
                snapshot_id,
                publisher_ts,
                &parsed.rows,
                &mut outcome,
            )
            .await?;
        }
        FeedKind::StationStatus => {
            let parsed = gsp_feeds::parse_station_status(&bytes)
                .context("parsing station_status payload")?;
            outcome.rows_skipped += parsed.skipped as u64;
            load_station_status(
                &mut tx,
                &manifest.system_id,
                snapshot_id,
                publisher_ts,
                &parsed.rows,
                &mut outcome,
            )
            .await?;
        }
    }

    info!(
        system_id = %manifest.system_id,
        feed = %manifest.feed_name,
        logical_snapshot_id = snapshot_id,
        rows_written = outcome.rows_written,
        rows_skipped = outcome.rows_skipped,
        scd_opened = outcome.scd_opened,
        scd_closed = outcome.scd_closed,
        lifecycle_upserts = outcome.lifecycle_upserts,
        "manifest loaded"
    );
    tx.commit().await.context("committing manifest load")?;
    Ok(outcome)
}

async fn insert_audit_rows(
    tx: &mut Transaction<'_, Sqlite>,
    manifest: &RawManifestRecord,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO raw_manifests \
         (system_id, feed_name, collected_at, publisher_last_updated, ttl, http_status, ok, \
          duration_ms, raw_object_sha256, object_path, manifest_path, parse_schema_id, \
          parser_fingerprint, loader_schema_version, gbfs_version, source_url) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(&manifest.system_id)
    .bind(&manifest.feed_name)
    .bind(fmt_ts(manifest.collected_at))
    .bind(manifest.publisher_last_updated.map(fmt_ts))
    .bind(manifest.ttl)
    .bind(manifest.http_status as i64)
    .bind(manifest.ok)
    .bind(manifest.duration_ms as i64)
    .bind(&manifest.raw_object_sha256)
    .bind(&manifest.object_path)
    .bind(&manifest.manifest_path)
    .bind(&manifest.parse_schema_id)
    .bind(&manifest.parser_fingerprint)
    .bind(&manifest.loader_schema_version)
    .bind(&manifest.gbfs_version)
    .bind(&manifest.source_url)
    .execute(&mut **tx)
    .await
    .context("inserting raw manifest audit row")?;

    sqlx::query(
        "INSERT INTO fetch_attempts (system_id, feed_name, requested_at, http_status, ok, duration_ms) \
         VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(&manifest.system_id)
    .bind(&manifest.feed_name)
    .bind(fmt_ts(manifest.collected_at))
    .bind(manifest.http_status as i64)
    .bind(manifest.ok)
    .bind(manifest.duration_ms as i64)
    .execute(&mut **tx)
    .await
    .context("inserting fetch attempt row")?;
    Ok(())
}

async fn load_station_information(
    tx: &mut Transaction<'_, Sqlite>,
    system_id: &str,
    snapshot_id: i64,
    publisher_ts: DateTime<Utc>,
    rows: &[StationInformationRow],
    outcome: &mut LoadOutcome,
) -> anyhow::Result<()> {
    for row in rows {
        let inserted = sqlx::query(
            "INSERT INTO snapshot_station_information \
             (snapshot_id, station_id, name, lat, lon, capacity, region_id, rental_methods) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(snapshot_id)
        .bind(&row.station_id)
        .bind(&row.name)
        .bind(row.lat)
        .bind(row.lon)
        .bind(row.capacity)
        .bind(&row.region_id)
        .bind(serde_json::to_string(&row.rental_methods).context("encoding rental methods")?)
        .execute(&mut **tx)
        .await
        .context("inserting station information row")?;
        if inserted.rows_affected() == 0 {
            outcome.rows_skipped += 1;
            continue;
        }
        outcome.rows_written += 1;

        let active = sqlx::query(
            "SELECT id, name, lat, lon, capacity FROM stations_scd \
             WHERE system_id = ? AND station_id = ? AND is_active = 1",
        )
        .bind(system_id)
        .bind(&row.station_id)
        .fetch_optional(&mut **tx)
        .await
        .context("reading active SCD row")?;
        let active_attrs = active.as_ref().map(|r| ScdAttributes {
            name: r.get("name"),
            lat: r.get("lat"),
            lon: r.get("lon"),
            capacity: r.get("capacity"),
        });

        match scd_transition(&ScdAttributes::from(row), active_attrs.as_ref()) {
            ScdTransition::Unchanged => {}
            ScdTransition::Open { close_active } => {
                if close_active {
                    if let Some(active_row) = &active {
                        let active_id: i64 = active_row.get("id");
                        sqlx::query(
                            "UPDATE stations_scd SET valid_to = ?, is_active = 0 WHERE id = ?",
                        )
                        .bind(fmt_ts(publisher_ts))
                        .bind(active_id)
                        .execute(&mut **tx)
                        .await
                        .context("closing active SCD row")?;
                        outcome.scd_closed += 1;
                    }
                }
                sqlx::query(
                    "INSERT INTO stations_scd \
                     (system_id, station_id, name, lat, lon, capacity, valid_from, valid_to, is_active) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, NULL, 1)",
                )
                .bind(system_id)
                .bind(&row.station_id)
                .bind(&row.name)
                .bind(row.lat)
                .bind(row.lon)
                .bind(row.capacity)
                .bind(fmt_ts(publisher_ts))
                .execute(&mut **tx)
                .await
                .context("opening SCD row")?;
                outcome.scd_opened += 1;
            }
        }

        // Status only ever becomes more terminal, so the upsert never
        // touches it: a retired station stays retired.
        sqlx::query(
            "INSERT INTO station_lifecycle \
             (system_id, station_id, first_seen, last_seen, last_active, status) \
             VALUES (?, ?, ?, ?, NULL, 'active') \
             ON CONFLICT(system_id, station_id) DO UPDATE SET \
               last_seen = MAX(station_lifecycle.last_seen, excluded.last_seen)",
        )
        .bind(system_id)
        .bind(&row.station_id)
        .bind(fmt_ts(publisher_ts))
        .bind(fmt_ts(publisher_ts))
        .execute(&mut **tx)
        .await
        .context("upserting station lifecycle")?;
        outcome.lifecycle_upserts += 1;
    }
    Ok(())
}

async fn load_station_status(
    tx: &mut Transaction<'_, Sqlite>,
    system_id: &str,
    snapshot_id: i64,
    publisher_ts: DateTime<Utc>,
    rows: &[StationStatusRow],
    outcome: &mut LoadOutcome,
) -> anyhow::Result<()> {
    for row in rows {
        let effective_ts = row.last_reported.unwrap_or(publisher_ts);

        // Watermark: latest effective timestamp previously recorded for
        // this station, excluding the snapshot being loaded so intra-batch
        // re-runs never self-block.
        let watermark: Option<String> = sqlx::query(
            "SELECT MAX(effective_ts) AS watermark FROM snapshot_station_status \
             WHERE system_id = ? AND station_id = ? AND snapshot_id <> ?",
        )
        .bind(system_id)
        .bind(&row.station_id)
        .bind(snapshot_id)
        .fetch_one(&mut **tx)
        .await
        .context("reading station watermark")?
        .get("watermark");
        let watermark = watermark.as_deref().map(parse_ts).transpose()?;

        let grade = grade_status_row(row, effective_ts, watermark);
        let flags: Vec<&str> = grade.flags.iter().map(|f| f.as_str()).collect();

        let inserted = sqlx::query(
            "INSERT INTO snapshot_station_status \
             (snapshot_id, system_id, station_id, num_bikes_available, num_docks_available, \
              num_bikes_disabled, num_docks_disabled, is_installed, is_renting, is_returning, \
              last_reported, effective_ts, bucket_quality, is_serving_grade, quality_flags) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(snapshot_id)
        .bind(system_id)
        .bind(&row.station_id)
        .bind(row.num_bikes_available)
        .bind(row.num_docks_available)
        .bind(row.num_bikes_disabled)
        .bind(row.num_docks_disabled)
        .bind(row.is_installed)
        .bind(row.is_renting)
        .bind(row.is_returning)
        .bind(row.last_reported.map(fmt_ts))
        .bind(fmt_ts(effective_ts))
        .bind(grade.bucket_quality.as_str())
        .bind(grade.is_serving_grade)
        .bind(serde_json::to_string(&flags).context("encoding quality flags")?)
        .execute(&mut **tx)
        .await
        .context("inserting station status row")?;
        if inserted.rows_affected() == 0 {
            outcome.rows_skipped += 1;
            continue;
        }
        outcome.rows_written += 1;

        if grade.is_serving_grade {
            sqlx::query(
                "INSERT INTO station_lifecycle \
                 (system_id, station_id, first_seen, last_seen, last_active, status) \
                 VALUES (?, ?, ?, ?, ?, 'active') \
                 ON CONFLICT(system_id, station_id) DO UPDATE SET \
                   last_seen = MAX(station_lifecycle.last_seen, excluded.last_seen), \
                   last_active = MAX(COALESCE(station_lifecycle.last_active, excluded.last_active), \
                                     excluded.last_active)",
            )
            .bind(system_id)
            .bind(&row.station_id)
            .bind(fmt_ts(publisher_ts))
            .bind(fmt_ts(publisher_ts))
            .bind(fmt_ts(effective_ts))
            .execute(&mut **tx)
            .await
            .context("upserting station lifecycle activity")?;
            outcome.lifecycle_upserts += 1;
        }
    }
    Ok(())
}

/// Aggregate result of a bulk load pass over the archive.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadRunSummary {
    pub scanned: usize,
    pub loaded: usize,
    pub deduped: usize,
    pub conflicts: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Load every manifest under the archive root, oldest first, optionally
/// restricted to one system. Failed loads are logged and counted;
/// processing of other manifests continues.
pub async fn load_all_manifests(
    pool: &SqlitePool,
    archive_root: &Path,
    system: Option<&str>,
) -> anyhow::Result<LoadRunSummary> {
    let mut paths = Vec::new();
    collect_manifest_paths(archive_root, &mut paths)?;

    let mut manifests: Vec<(RawManifestRecord, PathBuf)> = Vec::new();
    let mut summary = LoadRunSummary::default();
    for path in paths {
        summary.scanned += 1;
        // One bad file must not stall catch-up over the rest of the archive.
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable manifest file; skipping");
                summary.failed += 1;
                continue;
            }
        };
        match serde_json::from_str::<RawManifestRecord>(&text) {
            Ok(record) => manifests.push((record, path)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unparseable manifest; skipping");
                summary.failed += 1;
            }
        }
    }
    manifests.sort_by_key(|(record, _)| record.collected_at);

    for (record, path) in manifests {
        if matches!(system, Some(id) if record.system_id != id) {
            summary.skipped += 1;
            continue;
        }
        if !record.ok || record.raw_object_sha256.is_none() {
            summary.skipped += 1;
            continue;
        }
        if FeedKind::from_feed_name(&record.feed_name).is_none() {
            summary.skipped += 1;
            continue;
        }
        match load_manifest(pool, archive_root, &record).await {
            Ok(outcome) if outcome.conflict => summary.conflicts += 1,
            Ok(outcome) if outcome.deduped => summary.deduped += 1,
            Ok(_) => summary.loaded += 1,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "manifest load failed");
                summary.failed += 1;
            }
        }
    }

    info!(
        scanned = summary.scanned,
        loaded = summary.loaded,
        deduped = summary.deduped,
        conflicts = summary.conflicts,
        skipped = summary.skipped,
        failed = summary.failed,
        "bulk manifest load finished"
    );
    Ok(summary)
}

fn collect_manifest_paths(dir: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.with_context(|| format!("reading entry under {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_manifest_paths(&path, out)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(gsp_storage::MANIFEST_SUFFIX))
            .unwrap_or(false)
        {
            out.push(path);
        }
    }
    Ok(())
}
