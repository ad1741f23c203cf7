//! GBFS document parsing: discovery index, station_information, station_status.
//!
//! Parsing is pure (bytes in, typed rows out) and lenient at the row level:
//! rows that fail identity validation are dropped and counted as skipped,
//! since partial feeds from upstream publishers are routine. Document-level
//! failures (not JSON, missing envelope) are errors.

use chrono::{DateTime, TimeZone, Utc};
use gsp_core::{StationInformationRow, StationStatusRow};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "gsp-feeds";

/// Language preferred when a discovery document keys its feed list by
/// language. Falls back to the lexicographically smallest key so resolution
/// is deterministic regardless of JSON map ordering.
pub const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("discovery document declares zero feeds")]
    NoFeeds,
}

/// One named feed URL resolved from a discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedFeed {
    pub name: String,
    pub url: String,
}

/// A resolved discovery document: the flat feed list plus the envelope's
/// own freshness metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDocument {
    pub feeds: Vec<NamedFeed>,
    pub ttl: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub version: Option<String>,
}

/// Rows parsed from one feed payload plus envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFeed<T> {
    pub rows: Vec<T>,
    pub skipped: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub ttl: Option<i64>,
    pub version: Option<String>,
}

/// GBFS 2.x declares `last_updated` as epoch seconds; 3.x moved to RFC 3339
/// strings. Both forms appear in the wild, so both are accepted.
pub fn gbfs_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}

/// Envelope freshness metadata, extracted without touching `data`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnvelopeMeta {
    pub last_updated: Option<DateTime<Utc>>,
    pub ttl: Option<i64>,
    pub version: Option<String>,
}

/// Lenient envelope peek used by the collector to stamp manifests. Never
/// fails; an unparseable payload simply yields empty metadata.
pub fn peek_envelope(bytes: &[u8]) -> EnvelopeMeta {
    let doc: Value = match serde_json::from_slice(bytes) {
        Ok(doc) => doc,
        Err(_) => return EnvelopeMeta::default(),
    };
    EnvelopeMeta {
        last_updated: doc.get("last_updated").and_then(gbfs_timestamp),
        ttl: doc.get("ttl").and_then(Value::as_i64),
        version: doc
            .get("version")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn envelope(bytes: &[u8]) -> Result<(Value, Option<DateTime<Utc>>, Option<i64>, Option<String>), FeedError> {
    let doc: Value = serde_json::from_slice(bytes)?;
    let last_updated = doc.get("last_updated").and_then(gbfs_timestamp);
    let ttl = doc.get("ttl").and_then(Value::as_i64);
    let version = doc
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string);
    let data = doc.get("data").cloned().ok_or(FeedError::MissingField("data"))?;
    Ok((data, last_updated, ttl, version))
}

/// Resolve a discovery index document to a flat list of named feed URLs.
///
/// GBFS 2.x keys the feed list by language (`data.<lang>.feeds`); 3.x drops
/// the language layer (`data.feeds`). The preferred language wins when
/// present, else the first available.
pub fn resolve_discovery(bytes: &[u8], preferred_lang: &str) -> Result<DiscoveryDocument, FeedError> {
    let (data, last_updated, ttl, version) = envelope(bytes)?;

    let feeds_value = if let Some(feeds) = data.get("feeds") {
        Some(feeds.clone())
    } else {
        data.as_object().and_then(|langs| {
            let lang = if langs.contains_key(preferred_lang) {
                Some(preferred_lang.to_string())
            } else {
                langs.keys().min().cloned()
            };
            lang.and_then(|l| langs.get(&l))
                .and_then(|entry| entry.get("feeds"))
                .cloned()
        })
    };

    let feeds: Vec<NamedFeed> = feeds_value
        .as_ref()
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name")?.as_str()?.to_string();
                    let url = entry.get("url")?.as_str()?.to_string();
                    Some(NamedFeed { name, url })
                })
                .collect()
        })
        .unwrap_or_default();

    if feeds.is_empty() {
        return Err(FeedError::NoFeeds);
    }

    Ok(DiscoveryDocument {
        feeds,
        ttl,
        last_updated,
        version,
    })
}

fn stations_array(data: &Value) -> Result<Vec<Value>, FeedError> {
    data.get("stations")
        .and_then(Value::as_array)
        .cloned()
        .ok_or(FeedError::MissingField("data.stations"))
}

fn opt_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

// GBFS 1.x used 0/1 integers where 2.x+ uses booleans.
fn opt_bool(value: Option<&Value>) -> Option<bool> {
    match value {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::Number(n)) => n.as_i64().map(|i| i != 0),
        _ => None,
    }
}

/// Parse a station_information payload. A row needs a non-empty station id
/// and finite coordinates to carry identity; anything else is skipped.
pub fn parse_station_information(bytes: &[u8]) -> Result<ParsedFeed<StationInformationRow>, FeedError> {
    let (data, last_updated, ttl, version) = envelope(bytes)?;
    let mut rows = Vec::new();
    let mut skipped = 0usize;

    for station in stations_array(&data)? {
        let station_id = opt_string(station.get("station_id")).unwrap_or_default();
        let lat = station.get("lat").and_then(Value::as_f64);
        let lon = station.get("lon").and_then(Value::as_f64);
        let (lat, lon) = match (lat, lon) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => (lat, lon),
            _ => {
                skipped += 1;
                continue;
            }
        };
        if station_id.is_empty() {
            skipped += 1;
            continue;
        }

        rows.push(StationInformationRow {
            station_id,
            name: opt_string(station.get("name")).unwrap_or_default(),
            lat,
            lon,
            capacity: station.get("capacity").and_then(Value::as_i64),
            region_id: opt_string(station.get("region_id")),
            rental_methods: station
                .get("rental_methods")
                .and_then(Value::as_array)
                .map(|methods| {
                    methods
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        });
    }

    Ok(ParsedFeed {
        rows,
        skipped,
        last_updated,
        ttl,
        version,
    })
}

/// Parse a station_status payload. A row needs a non-empty station id;
/// counts are carried through as-is (grading happens at load time).
pub fn parse_station_status(bytes: &[u8]) -> Result<ParsedFeed<StationStatusRow>, FeedError> {
    let (data, last_updated, ttl, version) = envelope(bytes)?;
    let mut rows = Vec::new();
    let mut skipped = 0usize;

    for station in stations_array(&data)? {
        let station_id = opt_string(station.get("station_id")).unwrap_or_default();
        if station_id.is_empty() {
            skipped += 1;
            continue;
        }

        rows.push(StationStatusRow {
            station_id,
            num_bikes_available: station.get("num_bikes_available").and_then(Value::as_i64),
            num_docks_available: station.get("num_docks_available").and_then(Value::as_i64),
            num_bikes_disabled: station.get("num_bikes_disabled").and_then(Value::as_i64),
            num_docks_disabled: station.get("num_docks_disabled").and_then(Value::as_i64),
            is_installed: opt_bool(station.get("is_installed")),
            is_renting: opt_bool(station.get("is_renting")),
            is_returning: opt_bool(station.get("is_returning")),
            last_reported: station.get("last_reported").and_then(gbfs_timestamp),
        });
    }

    Ok(ParsedFeed {
        rows,
        skipped,
        last_updated,
        ttl,
        version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DISCOVERY_V2: &str = r#"{
        "last_updated": 1767225600,
        "ttl": 60,
        "version": "2.3",
        "data": {
            "fr": {"feeds": [{"name": "station_information", "url": "https://x/fr/station_information.json"}]},
            "en": {"feeds": [
                {"name": "station_information", "url": "https://x/en/station_information.json"},
                {"name": "station_status", "url": "https://x/en/station_status.json"}
            ]}
        }
    }"#;

    #[test]
    fn discovery_prefers_default_language() {
        let doc = resolve_discovery(DISCOVERY_V2.as_bytes(), DEFAULT_LANGUAGE).expect("resolve");
        assert_eq!(doc.feeds.len(), 2);
        assert_eq!(doc.ttl, Some(60));
        assert_eq!(doc.version.as_deref(), Some("2.3"));
        assert!(doc.feeds[0].url.contains("/en/"));
    }

    #[test]
    fn discovery_falls_back_to_first_language() {
        let doc = resolve_discovery(DISCOVERY_V2.as_bytes(), "de").expect("resolve");
        assert!(doc.feeds[0].url.contains("/en/"), "en sorts before fr");
    }

    #[test]
    fn discovery_handles_v3_flat_feed_list() {
        let body = r#"{
            "last_updated": "2026-01-01T00:00:00Z",
            "ttl": 30,
            "version": "3.0",
            "data": {"feeds": [{"name": "station_status", "url": "https://x/station_status.json"}]}
        }"#;
        let doc = resolve_discovery(body.as_bytes(), DEFAULT_LANGUAGE).expect("resolve");
        assert_eq!(doc.feeds.len(), 1);
        assert!(doc.last_updated.is_some());
    }

    #[test]
    fn discovery_with_zero_feeds_fails() {
        let body = r#"{"last_updated": 1767225600, "ttl": 60, "data": {"en": {"feeds": []}}}"#;
        assert!(matches!(
            resolve_discovery(body.as_bytes(), DEFAULT_LANGUAGE),
            Err(FeedError::NoFeeds)
        ));
    }

    #[test]
    fn information_rows_require_identity() {
        let body = r#"{
            "last_updated": 1767225600,
            "ttl": 60,
            "data": {"stations": [
                {"station_id": "42", "name": "Berri", "lat": 45.51, "lon": -73.56, "capacity": 31},
                {"station_id": "", "name": "anon", "lat": 45.5, "lon": -73.5},
                {"station_id": "43", "name": "no coords"},
                {"station_id": 44, "name": "numeric id", "lat": 45.52, "lon": -73.57}
            ]}
        }"#;
        let parsed = parse_station_information(body.as_bytes()).expect("parse");
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.skipped, 2);
        assert_eq!(parsed.rows[0].station_id, "42");
        assert_eq!(parsed.rows[0].capacity, Some(31));
        assert_eq!(parsed.rows[1].station_id, "44");
    }

    #[test]
    fn status_rows_accept_epoch_and_rfc3339_last_reported() {
        let body = r#"{
            "last_updated": 1767225600,
            "ttl": 60,
            "data": {"stations": [
                {"station_id": "42", "num_bikes_available": 3, "num_docks_available": 9,
                 "is_renting": 1, "last_reported": 1767225500},
                {"station_id": "43", "num_bikes_available": 0, "num_docks_available": 12,
                 "is_renting": true, "last_reported": "2026-01-01T00:00:00Z"}
            ]}
        }"#;
        let parsed = parse_station_status(body.as_bytes()).expect("parse");
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].is_renting, Some(true));
        assert_eq!(
            parsed.rows[0].last_reported,
            Utc.timestamp_opt(1_767_225_500, 0).single()
        );
        assert_eq!(
            parsed.rows[1].last_reported,
            Utc.timestamp_opt(1_767_225_600, 0).single()
        );
    }

    #[test]
    fn missing_stations_array_is_a_document_error() {
        let body = r#"{"last_updated": 1767225600, "ttl": 60, "data": {}}"#;
        assert!(matches!(
            parse_station_status(body.as_bytes()),
            Err(FeedError::MissingField("data.stations"))
        ));
    }
}
