//! Pipeline orchestration and relational state for GSP: the collector, the
//! poller, the idempotent loader, and hot-window retention.

use std::path::PathBuf;
use std::time::Duration;

pub mod collector;
pub mod db;
pub mod loader;
pub mod poller;
pub mod retention;

pub use collector::{discover, run_collect, CollectSummary};
pub use loader::{load_all_manifests, load_manifest, LoadError, LoadOutcome, LoadRunSummary};
pub use poller::{run_poller, PollSummary, PollerConfig};
pub use retention::{prune_hot_window, PruneSummary};

pub const CRATE_NAME: &str = "gsp-sync";

/// Process-level configuration, resolved from the environment with
/// defaults suitable for a local single-binary deployment.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub archive_dir: PathBuf,
    pub registry_path: PathBuf,
    pub registry_overlay_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub min_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub jitter_secs: u64,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("GSP_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://gsp.db".to_string()),
            archive_dir: std::env::var("GSP_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./archive")),
            registry_path: std::env::var("GSP_SYSTEMS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("systems.yaml")),
            registry_overlay_path: std::env::var("GSP_SYSTEMS_OVERLAY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("systems.local.yaml")),
            user_agent: std::env::var("GSP_USER_AGENT")
                .unwrap_or_else(|_| "gsp-bot/0.1".to_string()),
            http_timeout_secs: env_u64("GSP_HTTP_TIMEOUT_SECS", 20),
            min_ttl_secs: env_u64("GSP_MIN_TTL_SECS", 30),
            max_ttl_secs: env_u64("GSP_MAX_TTL_SECS", 900),
            jitter_secs: env_u64("GSP_JITTER_SECS", 5),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn poller_config(&self) -> PollerConfig {
        PollerConfig {
            min_ttl: Duration::from_secs(self.min_ttl_secs),
            max_ttl: Duration::from_secs(self.max_ttl_secs),
            jitter: Duration::from_secs(self.jitter_secs),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
