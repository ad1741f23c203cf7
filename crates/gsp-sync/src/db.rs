//! SQLite schema and connection helpers.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text (microsecond
//! precision), so lexicographic `MAX`/`<` in SQL agrees with chronological
//! order and decoding never depends on driver-specific formats.

use std::str::FromStr;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

pub const SCHEMA: &str = r#"
-- Append-only provenance log; one row per fetch attempt ever loaded.
CREATE TABLE IF NOT EXISTS raw_manifests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    system_id TEXT NOT NULL,
    feed_name TEXT NOT NULL,
    collected_at TEXT NOT NULL,
    publisher_last_updated TEXT,
    ttl INTEGER,
    http_status INTEGER NOT NULL,
    ok INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    raw_object_sha256 TEXT,
    object_path TEXT,
    manifest_path TEXT,
    parse_schema_id TEXT NOT NULL,
    parser_fingerprint TEXT NOT NULL,
    loader_schema_version TEXT NOT NULL,
    gbfs_version TEXT,
    source_url TEXT NOT NULL
);

-- Full-identity dedup for audit inserts: a re-collected manifest with
-- corrected content (different hash) is a new audit row, not a silent
-- drop. COALESCE keeps hashless failed-fetch rows deduplicating too,
-- since NULLs never compare equal under a plain UNIQUE constraint.
CREATE UNIQUE INDEX IF NOT EXISTS idx_raw_manifests_identity
    ON raw_manifests(system_id, feed_name, collected_at, source_url,
                     COALESCE(raw_object_sha256, ''));

-- Relational mirror of the fetch log, appended at load time so the audit
-- trail survives archive retention.
CREATE TABLE IF NOT EXISTS fetch_attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    system_id TEXT NOT NULL,
    feed_name TEXT NOT NULL,
    requested_at TEXT NOT NULL,
    http_status INTEGER NOT NULL,
    ok INTEGER NOT NULL,
    duration_ms INTEGER NOT NULL,
    UNIQUE(system_id, feed_name, requested_at)
);

-- One row per idempotency unit. The UNIQUE constraint is the race arbiter
-- for insert-or-read-back.
CREATE TABLE IF NOT EXISTS logical_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    system_id TEXT NOT NULL,
    feed_name TEXT NOT NULL,
    publisher_last_updated TEXT NOT NULL,
    loader_schema_version TEXT NOT NULL,
    raw_object_sha256 TEXT NOT NULL,
    parser_fingerprint TEXT NOT NULL,
    loaded_at TEXT NOT NULL,
    UNIQUE(system_id, feed_name, publisher_last_updated, loader_schema_version)
);

CREATE TABLE IF NOT EXISTS snapshot_station_information (
    snapshot_id INTEGER NOT NULL REFERENCES logical_snapshots(id),
    station_id TEXT NOT NULL,
    name TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    capacity INTEGER,
    region_id TEXT,
    rental_methods TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, station_id)
);

CREATE TABLE IF NOT EXISTS snapshot_station_status (
    snapshot_id INTEGER NOT NULL REFERENCES logical_snapshots(id),
    system_id TEXT NOT NULL,
    station_id TEXT NOT NULL,
    num_bikes_available INTEGER,
    num_docks_available INTEGER,
    num_bikes_disabled INTEGER,
    num_docks_disabled INTEGER,
    is_installed INTEGER,
    is_renting INTEGER,
    is_returning INTEGER,
    last_reported TEXT,
    effective_ts TEXT NOT NULL,
    bucket_quality TEXT NOT NULL,
    is_serving_grade INTEGER NOT NULL,
    quality_flags TEXT NOT NULL,
    PRIMARY KEY (snapshot_id, station_id)
);

CREATE INDEX IF NOT EXISTS idx_status_station_effective
    ON snapshot_station_status(system_id, station_id, effective_ts);

-- SCD2 history of station identity attributes; at most one active row per
-- station, maintained by the loader.
CREATE TABLE IF NOT EXISTS stations_scd (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    system_id TEXT NOT NULL,
    station_id TEXT NOT NULL,
    name TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    capacity INTEGER,
    valid_from TEXT NOT NULL,
    valid_to TEXT,
    is_active INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scd_active
    ON stations_scd(system_id, station_id, is_active);

CREATE TABLE IF NOT EXISTS station_lifecycle (
    system_id TEXT NOT NULL,
    station_id TEXT NOT NULL,
    first_seen TEXT NOT NULL,
    last_seen TEXT NOT NULL,
    last_active TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    PRIMARY KEY (system_id, station_id)
);

-- Short-horizon aggregate hot table. Populated by downstream consumers of
-- the history; owned here only for retention.
CREATE TABLE IF NOT EXISTS station_bucket_aggregates (
    system_id TEXT NOT NULL,
    station_id TEXT NOT NULL,
    bucket_ts TEXT NOT NULL,
    bikes_available_avg REAL,
    docks_available_avg REAL,
    observation_count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (system_id, station_id, bucket_ts)
);
"#;

/// Open a pool on `database_url` (`sqlite://path` or `sqlite::memory:`),
/// creating the database file when missing. A single connection keeps
/// in-memory databases coherent and serializes writers.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {database_url}"))
}

pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("applying schema")?;
    Ok(())
}

pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(text: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("parsing stored timestamp {text}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn schema_applies_cleanly_twice() {
        let pool = connect("sqlite::memory:").await.expect("connect");
        migrate(&pool).await.expect("first migrate");
        migrate(&pool).await.expect("second migrate");
    }

    #[test]
    fn stored_timestamps_round_trip_and_sort_lexicographically() {
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap();
        let later = earlier + chrono::Duration::milliseconds(250);
        let (a, b) = (fmt_ts(earlier), fmt_ts(later));
        assert!(a < b);
        assert_eq!(parse_ts(&a).unwrap(), earlier);
        assert_eq!(parse_ts(&b).unwrap(), later);
    }
}
