//! Relational hot-window pruning.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::fmt_ts;

/// Rows deleted per hot-window table by one prune pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PruneSummary {
    pub bucket_aggregates: u64,
    pub snapshot_station_rows: u64,
    pub logical_snapshots: u64,
    pub raw_manifests: u64,
    pub fetch_attempts: u64,
}

/// Delete rows older than `cutoff` from each hot-window table, scoped to
/// one system. One DELETE per table (cheap per-table counts), all inside a
/// single transaction so a failure prunes nothing.
pub async fn prune_hot_window(
    pool: &SqlitePool,
    system_id: &str,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<PruneSummary> {
    let cutoff_text = fmt_ts(cutoff);
    let mut tx = pool.begin().await.context("beginning prune transaction")?;

    // Snapshot child rows go first, keyed through their owning snapshots,
    // so the logical_snapshots delete never orphans them.
    let status_rows = sqlx::query(
        "DELETE FROM snapshot_station_status WHERE snapshot_id IN \
         (SELECT id FROM logical_snapshots WHERE system_id = ? AND publisher_last_updated < ?)",
    )
    .bind(system_id)
    .bind(&cutoff_text)
    .execute(&mut *tx)
    .await
    .context("pruning snapshot station status rows")?
    .rows_affected();

    let information_rows = sqlx::query(
        "DELETE FROM snapshot_station_information WHERE snapshot_id IN \
         (SELECT id FROM logical_snapshots WHERE system_id = ? AND publisher_last_updated < ?)",
    )
    .bind(system_id)
    .bind(&cutoff_text)
    .execute(&mut *tx)
    .await
    .context("pruning snapshot station information rows")?
    .rows_affected();

    let logical_snapshots = sqlx::query(
        "DELETE FROM logical_snapshots WHERE system_id = ? AND publisher_last_updated < ?",
    )
    .bind(system_id)
    .bind(&cutoff_text)
    .execute(&mut *tx)
    .await
    .context("pruning logical snapshots")?
    .rows_affected();

    let bucket_aggregates = sqlx::query(
        "DELETE FROM station_bucket_aggregates WHERE system_id = ? AND bucket_ts < ?",
    )
    .bind(system_id)
    .bind(&cutoff_text)
    .execute(&mut *tx)
    .await
    .context("pruning bucket aggregates")?
    .rows_affected();

    let raw_manifests =
        sqlx::query("DELETE FROM raw_manifests WHERE system_id = ? AND collected_at < ?")
            .bind(system_id)
            .bind(&cutoff_text)
            .execute(&mut *tx)
            .await
            .context("pruning raw manifests")?
            .rows_affected();

    let fetch_attempts =
        sqlx::query("DELETE FROM fetch_attempts WHERE system_id = ? AND requested_at < ?")
            .bind(system_id)
            .bind(&cutoff_text)
            .execute(&mut *tx)
            .await
            .context("pruning fetch attempts")?
            .rows_affected();

    tx.commit().await.context("committing prune")?;

    let summary = PruneSummary {
        bucket_aggregates,
        snapshot_station_rows: status_rows + information_rows,
        logical_snapshots,
        raw_manifests,
        fetch_attempts,
    };
    info!(
        system_id,
        cutoff = %cutoff_text,
        bucket_aggregates = summary.bucket_aggregates,
        snapshot_station_rows = summary.snapshot_station_rows,
        logical_snapshots = summary.logical_snapshots,
        raw_manifests = summary.raw_manifests,
        fetch_attempts = summary.fetch_attempts,
        "hot window pruned"
    );
    Ok(summary)
}
