//! TTL-driven polling loop around the collector.

use std::time::Duration;

use gsp_core::SystemConfig;
use gsp_storage::Archive;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::collector::run_collect;

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub jitter: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(900),
            jitter: Duration::from_secs(5),
        }
    }
}

/// `clamp(ttl ?? min_ttl, min_ttl, max_ttl) + jitter * fraction`. Pure, so
/// the schedule is testable without sleeping; the caller supplies the
/// random fraction in `[0, 1]`.
pub fn cycle_delay(config: &PollerConfig, feed_ttl: Option<i64>, jitter_fraction: f64) -> Duration {
    let ttl = feed_ttl
        .filter(|t| *t >= 0)
        .map(|t| Duration::from_secs(t as u64))
        .unwrap_or(config.min_ttl);
    let clamped = ttl.clamp(config.min_ttl, config.max_ttl);
    clamped + config.jitter.mul_f64(jitter_fraction.clamp(0.0, 1.0))
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PollSummary {
    pub cycles_run: u64,
    pub collected_ok: u64,
    pub collect_failures: u64,
}

/// Repeat the collector on a TTL-derived, jittered schedule.
///
/// A failed cycle is logged and backed off as if the feed declared no TTL;
/// the loop terminates only on the explicit cycle limit. Cycles never
/// overlap: each collect and its sleep complete before the next begins.
pub async fn run_poller(
    client: &reqwest::Client,
    archive: &Archive,
    system: &SystemConfig,
    requested: &[String],
    config: PollerConfig,
    cycles: Option<u64>,
) -> anyhow::Result<PollSummary> {
    let mut summary = PollSummary::default();
    let mut cycle: u64 = 0;

    loop {
        cycle += 1;
        summary.cycles_run = cycle;

        let ttl = match run_collect(client, archive, system, requested).await {
            Ok(collect) => {
                summary.collected_ok += 1;
                info!(
                    cycle,
                    run_id = %collect.run_id,
                    system_id = %system.system_id,
                    feeds_ok = collect.feeds_ok,
                    feeds_failed = collect.feeds_failed,
                    "poll cycle collected"
                );
                if collect.discovery_ttl.is_none() {
                    warn!(
                        cycle,
                        system_id = %system.system_id,
                        "feed declares no ttl; using minimum"
                    );
                }
                collect.discovery_ttl
            }
            Err(err) => {
                summary.collect_failures += 1;
                warn!(
                    cycle,
                    system_id = %system.system_id,
                    error = %err,
                    "poll cycle failed; backing off"
                );
                None
            }
        };

        if let Some(limit) = cycles {
            if cycle >= limit {
                break;
            }
        }

        let fraction = rand::thread_rng().gen_range(0.0..=1.0);
        tokio::time::sleep(cycle_delay(&config, ttl, fraction)).await;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PollerConfig {
        PollerConfig {
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(300),
            jitter: Duration::from_secs(10),
        }
    }

    #[test]
    fn missing_ttl_falls_back_to_minimum() {
        assert_eq!(cycle_delay(&config(), None, 0.0), Duration::from_secs(30));
    }

    #[test]
    fn ttl_is_clamped_to_bounds() {
        assert_eq!(
            cycle_delay(&config(), Some(5), 0.0),
            Duration::from_secs(30)
        );
        assert_eq!(
            cycle_delay(&config(), Some(3600), 0.0),
            Duration::from_secs(300)
        );
        assert_eq!(
            cycle_delay(&config(), Some(60), 0.0),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn jitter_adds_at_most_the_configured_window() {
        assert_eq!(
            cycle_delay(&config(), Some(60), 1.0),
            Duration::from_secs(70)
        );
        // Out-of-range fractions are clamped rather than trusted.
        assert_eq!(
            cycle_delay(&config(), Some(60), 7.5),
            Duration::from_secs(70)
        );
    }

    #[test]
    fn negative_ttl_is_treated_as_missing() {
        assert_eq!(
            cycle_delay(&config(), Some(-1), 0.0),
            Duration::from_secs(30)
        );
    }
}
