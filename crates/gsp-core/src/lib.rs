//! Core domain model and pure pipeline logic for GSP.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "gsp-core";

/// Bumped whenever the relational shape of loaded rows changes. Part of the
/// logical-snapshot identity, so a bump makes old content loadable again
/// under the new schema without colliding with prior history.
pub const LOADER_SCHEMA_VERSION: &str = "3";

/// The GBFS feeds this pipeline knows how to parse and load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedKind {
    StationInformation,
    StationStatus,
}

impl FeedKind {
    pub fn feed_name(&self) -> &'static str {
        match self {
            FeedKind::StationInformation => "station_information",
            FeedKind::StationStatus => "station_status",
        }
    }

    pub fn parse_schema_id(&self) -> &'static str {
        match self {
            FeedKind::StationInformation => "station_information/v1",
            FeedKind::StationStatus => "station_status/v1",
        }
    }

    pub fn from_feed_name(name: &str) -> Option<Self> {
        match name {
            "station_information" => Some(FeedKind::StationInformation),
            "station_status" => Some(FeedKind::StationStatus),
            _ => None,
        }
    }
}

/// Hash over the schema identifiers that govern parsing and loading.
///
/// Changes whenever either identifier changes, even for byte-identical
/// payloads, so downstream consumers can detect "needs reprocessing".
pub fn parser_fingerprint(parse_schema_id: &str, loader_schema_version: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parse_schema_id.as_bytes());
    hasher.update(b":");
    hasher.update(loader_schema_version.as_bytes());
    hex::encode(hasher.finalize())
}

/// One provenance record per fetch attempt. Immutable once written; the
/// JSON field set is a stable contract consumed by the loader and by the
/// archive retention planner's logical-age lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawManifestRecord {
    pub system_id: String,
    pub feed_name: String,
    pub collected_at: DateTime<Utc>,
    pub publisher_last_updated: Option<DateTime<Utc>>,
    pub ttl: Option<i64>,
    pub http_status: u16,
    pub ok: bool,
    pub etag: Option<String>,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub last_modified: Option<String>,
    pub duration_ms: u64,
    pub raw_object_sha256: Option<String>,
    pub object_path: Option<String>,
    pub manifest_path: Option<String>,
    pub parse_schema_id: String,
    pub parser_fingerprint: String,
    pub loader_schema_version: String,
    pub gbfs_version: Option<String>,
    pub source_url: String,
}

/// Station identity attributes parsed from one station_information snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationInformationRow {
    pub station_id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub capacity: Option<i64>,
    pub region_id: Option<String>,
    pub rental_methods: Vec<String>,
}

/// Operational counts parsed from one station_status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationStatusRow {
    pub station_id: String,
    pub num_bikes_available: Option<i64>,
    pub num_docks_available: Option<i64>,
    pub num_bikes_disabled: Option<i64>,
    pub num_docks_disabled: Option<i64>,
    pub is_installed: Option<bool>,
    pub is_renting: Option<bool>,
    pub is_returning: Option<bool>,
    pub last_reported: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QualityFlag {
    NegativeInventory,
    MissingCounts,
    MonotonicityViolation,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityFlag::NegativeInventory => "NEGATIVE_INVENTORY",
            QualityFlag::MissingCounts => "MISSING_COUNTS",
            QualityFlag::MonotonicityViolation => "MONOTONICITY_VIOLATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BucketQuality {
    Ok,
    Degraded,
    Blocked,
}

impl BucketQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketQuality::Ok => "ok",
            BucketQuality::Degraded => "degraded",
            BucketQuality::Blocked => "blocked",
        }
    }
}

/// Per-observation trustworthiness grade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityGrade {
    pub bucket_quality: BucketQuality,
    pub is_serving_grade: bool,
    pub flags: Vec<QualityFlag>,
}

/// Grade one status observation.
///
/// `effective_ts` is the observation's effective timestamp (last_reported,
/// falling back to the snapshot's publisher timestamp). `watermark` is the
/// latest effective timestamp previously recorded for this station, if any;
/// an observation strictly older than it is blocked outright. Equal
/// timestamps pass, since publishers routinely re-report unchanged rows.
pub fn grade_status_row(
    row: &StationStatusRow,
    effective_ts: DateTime<Utc>,
    watermark: Option<DateTime<Utc>>,
) -> QualityGrade {
    let mut flags = Vec::new();

    if row.num_bikes_available.is_none() || row.num_docks_available.is_none() {
        flags.push(QualityFlag::MissingCounts);
    }
    let negative = [row.num_bikes_available, row.num_docks_available]
        .iter()
        .any(|c| matches!(c, Some(n) if *n < 0));
    if negative {
        flags.push(QualityFlag::NegativeInventory);
    }
    if matches!(watermark, Some(w) if effective_ts < w) {
        flags.push(QualityFlag::MonotonicityViolation);
    }

    let bucket_quality = if flags.contains(&QualityFlag::MonotonicityViolation) {
        BucketQuality::Blocked
    } else if flags.is_empty() {
        BucketQuality::Ok
    } else {
        BucketQuality::Degraded
    };

    QualityGrade {
        bucket_quality,
        is_serving_grade: flags.is_empty(),
        flags,
    }
}

/// The identity-attribute tuple tracked as a slowly-changing dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ScdAttributes {
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub capacity: Option<i64>,
}

impl From<&StationInformationRow> for ScdAttributes {
    fn from(row: &StationInformationRow) -> Self {
        Self {
            name: row.name.clone(),
            lat: row.lat,
            lon: row.lon,
            capacity: row.capacity,
        }
    }
}

/// Outcome of diffing an incoming attribute tuple against the active SCD row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScdTransition {
    /// Re-observed identical attributes; leave history untouched.
    Unchanged,
    /// Open a new version; `close_active` is false when no version exists yet.
    Open { close_active: bool },
}

/// Pure SCD2 diff, kept storage-free so it is unit-testable in isolation.
/// Attributes compare exactly; GBFS publishes coordinates as decimal
/// literals, so an epsilon would only hide genuine publisher moves.
pub fn scd_transition(incoming: &ScdAttributes, active: Option<&ScdAttributes>) -> ScdTransition {
    match active {
        Some(current) if current == incoming => ScdTransition::Unchanged,
        Some(_) => ScdTransition::Open { close_active: true },
        None => ScdTransition::Open {
            close_active: false,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBounds {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

/// One registered bike-share system and where to discover its feeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    pub system_id: String,
    pub name: String,
    pub discovery_url: String,
    pub timezone: String,
    pub bounds: Option<SystemBounds>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    systems: Vec<SystemConfig>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("reading registry file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing registry file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("unknown system id {0}")]
    UnknownSystem(String),
}

/// System registry: a base YAML file optionally merged with a local overlay.
/// Overlay entries replace base entries with the same system id.
#[derive(Debug, Clone, Default)]
pub struct SystemRegistry {
    systems: BTreeMap<String, SystemConfig>,
}

impl SystemRegistry {
    pub fn load(base: &Path, overlay: Option<&Path>) -> Result<Self, RegistryError> {
        let mut systems = BTreeMap::new();
        for system in read_registry_file(base)? {
            systems.insert(system.system_id.clone(), system);
        }
        if let Some(overlay) = overlay {
            if overlay.exists() {
                for system in read_registry_file(overlay)? {
                    systems.insert(system.system_id.clone(), system);
                }
            }
        }
        Ok(Self { systems })
    }

    pub fn get(&self, system_id: &str) -> Result<&SystemConfig, RegistryError> {
        self.systems
            .get(system_id)
            .ok_or_else(|| RegistryError::UnknownSystem(system_id.to_string()))
    }

    pub fn systems(&self) -> impl Iterator<Item = &SystemConfig> {
        self.systems.values()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

fn read_registry_file(path: &Path) -> Result<Vec<SystemConfig>, RegistryError> {
    let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let file: RegistryFile = serde_yaml::from_str(&text).map_err(|source| RegistryError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    Ok(file.systems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).single().unwrap()
    }

    fn status_row(bikes: Option<i64>, docks: Option<i64>) -> StationStatusRow {
        StationStatusRow {
            station_id: "s1".into(),
            num_bikes_available: bikes,
            num_docks_available: docks,
            num_bikes_disabled: None,
            num_docks_disabled: None,
            is_installed: Some(true),
            is_renting: Some(true),
            is_returning: Some(true),
            last_reported: None,
        }
    }

    #[test]
    fn fingerprint_changes_with_either_schema_id() {
        let base = parser_fingerprint("station_status/v1", "3");
        assert_eq!(base, parser_fingerprint("station_status/v1", "3"));
        assert_ne!(base, parser_fingerprint("station_status/v2", "3"));
        assert_ne!(base, parser_fingerprint("station_status/v1", "4"));
    }

    #[test]
    fn clean_row_is_serving_grade() {
        let grade = grade_status_row(&status_row(Some(4), Some(8)), ts(12, 0), None);
        assert_eq!(grade.bucket_quality, BucketQuality::Ok);
        assert!(grade.is_serving_grade);
        assert!(grade.flags.is_empty());
    }

    #[test]
    fn negative_inventory_degrades() {
        let grade = grade_status_row(&status_row(Some(-1), Some(8)), ts(12, 0), None);
        assert_eq!(grade.bucket_quality, BucketQuality::Degraded);
        assert!(!grade.is_serving_grade);
        assert_eq!(grade.flags, vec![QualityFlag::NegativeInventory]);
    }

    #[test]
    fn missing_counts_degrade() {
        let grade = grade_status_row(&status_row(None, Some(8)), ts(12, 0), None);
        assert!(grade.flags.contains(&QualityFlag::MissingCounts));
        assert_eq!(grade.bucket_quality, BucketQuality::Degraded);
        assert!(!grade.is_serving_grade);
    }

    #[test]
    fn stale_observation_is_blocked() {
        let grade = grade_status_row(&status_row(Some(4), Some(8)), ts(11, 0), Some(ts(12, 0)));
        assert_eq!(grade.bucket_quality, BucketQuality::Blocked);
        assert!(!grade.is_serving_grade);
        assert!(grade.flags.contains(&QualityFlag::MonotonicityViolation));
    }

    #[test]
    fn re_reported_watermark_passes() {
        let grade = grade_status_row(&status_row(Some(4), Some(8)), ts(12, 0), Some(ts(12, 0)));
        assert_eq!(grade.bucket_quality, BucketQuality::Ok);
        assert!(grade.is_serving_grade);
    }

    fn attrs(name: &str, capacity: Option<i64>) -> ScdAttributes {
        ScdAttributes {
            name: name.into(),
            lat: 45.5,
            lon: -73.6,
            capacity,
        }
    }

    #[test]
    fn identical_attributes_are_a_noop() {
        let incoming = attrs("Berri / de Maisonneuve", Some(31));
        let active = attrs("Berri / de Maisonneuve", Some(31));
        assert_eq!(
            scd_transition(&incoming, Some(&active)),
            ScdTransition::Unchanged
        );
    }

    #[test]
    fn changed_capacity_opens_and_closes() {
        let incoming = attrs("Berri / de Maisonneuve", Some(47));
        let active = attrs("Berri / de Maisonneuve", Some(31));
        assert_eq!(
            scd_transition(&incoming, Some(&active)),
            ScdTransition::Open { close_active: true }
        );
    }

    #[test]
    fn first_observation_opens_without_closing() {
        let incoming = attrs("Berri / de Maisonneuve", Some(31));
        assert_eq!(
            scd_transition(&incoming, None),
            ScdTransition::Open {
                close_active: false
            }
        );
    }

    #[test]
    fn registry_overlay_wins_by_system_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("systems.yaml");
        let overlay = dir.path().join("systems.local.yaml");
        std::fs::write(
            &base,
            r#"
systems:
  - system_id: bixi
    name: BIXI Montreal
    discovery_url: https://gbfs.velobixi.com/gbfs/gbfs.json
    timezone: America/Montreal
    bounds: null
  - system_id: citibike
    name: Citi Bike NYC
    discovery_url: https://gbfs.citibikenyc.com/gbfs/gbfs.json
    timezone: America/New_York
    bounds: null
"#,
        )
        .unwrap();
        std::fs::write(
            &overlay,
            r#"
systems:
  - system_id: bixi
    name: BIXI (staging mirror)
    discovery_url: http://localhost:9000/gbfs.json
    timezone: America/Montreal
    bounds: null
"#,
        )
        .unwrap();

        let registry = SystemRegistry::load(&base, Some(&overlay)).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("bixi").unwrap().discovery_url,
            "http://localhost:9000/gbfs.json"
        );
        assert_eq!(registry.get("citibike").unwrap().name, "Citi Bike NYC");
        assert!(matches!(
            registry.get("nope"),
            Err(RegistryError::UnknownSystem(_))
        ));
    }
}
