use crate::sensor::Sensor;
use crate::store::Stores;
use crate::types::{ChannelHealth, EventType, Timestamp};

/// Fixed classification thresholds. Kept as plain constants rather than
/// config — they describe what "healthy" means, not a tunable.
const WARNING_ERROR_RATE: f64 = 0.05;
const CRITICAL_ERROR_RATE: f64 = 0.2;
const WARNING_P95_LATENCY_MS: f64 = 100.0;
const CRITICAL_P95_LATENCY_MS: f64 = 500.0;
const INACTIVE_AFTER_MS: i64 = 5 * 60 * 1_000;

/// Per-channel health + performance snapshot.
#[derive(Clone, Debug)]
pub struct ChannelReport {
    pub id: String,
    pub health: ChannelHealth,
    pub calls: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub throttled: u64,
    pub debounced: u64,
    pub skipped: u64,
    pub blocked: u64,
    pub issues: Vec<String>,
}

/// Protection usage breakdown across the whole runtime.
#[derive(Clone, Debug, Default)]
pub struct ProtectionSummary {
    pub throttled: u64,
    pub debounced: u64,
    pub skipped: u64,
    pub blocked: u64,
}

/// On-demand diagnostics over the sensor ring and the channel store. Never
/// runs in the background — every method is a pure read triggered by the
/// caller, never mutating state.
pub struct Analyzer<'a> {
    stores: &'a Stores,
    sensor: &'a Sensor,
}

impl<'a> Analyzer<'a> {
    pub fn new(stores: &'a Stores, sensor: &'a Sensor) -> Self {
        Self { stores, sensor }
    }

    pub async fn channel_report(&self, id: &str, now_ms: Timestamp) -> Option<ChannelReport> {
        if !self.stores.channel_exists(id).await {
            return None;
        }
        Some(self.build_report(id, now_ms))
    }

    pub async fn all_reports(&self, now_ms: Timestamp) -> Vec<ChannelReport> {
        let mut out = Vec::new();
        for id in self.stores.all_channel_ids().await {
            out.push(self.build_report(&id, now_ms));
        }
        out
    }

    fn build_report(&self, id: &str, now_ms: Timestamp) -> ChannelReport {
        let metrics = self.sensor.channel_metrics(id);
        let events = self.sensor.query(crate::sensor::QueryFilter {
            action_id: Some(id.to_string()),
            ..Default::default()
        });

        let latencies = latency_samples(&events);
        let (p95, p99) = percentiles(&latencies);

        let last_seen = events.iter().map(|e| e.timestamp_ms).max();
        let mut issues = Vec::new();

        let health = if metrics.calls == 0 {
            ChannelHealth::Inactive
        } else if last_seen.is_some_and(|t| now_ms - t > INACTIVE_AFTER_MS) {
            issues.push(format!("no activity for over {}ms", INACTIVE_AFTER_MS));
            ChannelHealth::Inactive
        } else {
            let error_rate = 1.0 - metrics.success_rate;
            let error_health = if error_rate >= CRITICAL_ERROR_RATE {
                issues.push(format!("error rate {:.1}% exceeds critical threshold", error_rate * 100.0));
                ChannelHealth::Critical
            } else if error_rate >= WARNING_ERROR_RATE {
                issues.push(format!("error rate {:.1}% exceeds warning threshold", error_rate * 100.0));
                ChannelHealth::Warning
            } else {
                ChannelHealth::Healthy
            };

            let latency_health = if p95 > CRITICAL_P95_LATENCY_MS {
                issues.push(format!("p95 latency {:.1}ms exceeds critical threshold", p95));
                ChannelHealth::Critical
            } else if p95 > WARNING_P95_LATENCY_MS {
                issues.push(format!("p95 latency {:.1}ms exceeds warning threshold", p95));
                ChannelHealth::Warning
            } else {
                ChannelHealth::Healthy
            };

            worse_health(error_health, latency_health)
        };

        if metrics.throttled > 0 {
            issues.push(format!("{} calls throttled", metrics.throttled));
        }

        ChannelReport {
            id: id.to_string(),
            health,
            calls: metrics.calls,
            errors: metrics.errors,
            success_rate: metrics.success_rate,
            average_latency_ms: metrics.average_latency_ms,
            p95_latency_ms: p95,
            p99_latency_ms: p99,
            throttled: metrics.throttled,
            debounced: metrics.debounced,
            skipped: metrics.skipped,
            blocked: metrics.blocked,
            issues,
        }
    }

    /// Protection usage across every channel, for the runtime-wide
    /// dashboard view.
    pub async fn protection_summary(&self) -> ProtectionSummary {
        let mut summary = ProtectionSummary::default();
        for id in self.stores.all_channel_ids().await {
            let m = self.sensor.channel_metrics(&id);
            summary.throttled += m.throttled;
            summary.debounced += m.debounced;
            summary.skipped += m.skipped;
            summary.blocked += m.blocked;
        }
        summary
    }

    /// Plain-English suggestions derived from each channel's report — a
    /// supplemented feature (not load-bearing, advisory only).
    pub async fn recommendations(&self, now_ms: Timestamp) -> Vec<String> {
        let mut out = Vec::new();
        for report in self.all_reports(now_ms).await {
            for issue in &report.issues {
                out.push(format!("{}: {}", report.id, issue));
            }
        }
        out
    }
}

/// Critical outranks Warning outranks Healthy — a channel with a clean
/// error rate but a blown latency budget (or vice versa) still surfaces
/// as unhealthy overall.
fn worse_health(a: ChannelHealth, b: ChannelHealth) -> ChannelHealth {
    fn rank(h: ChannelHealth) -> u8 {
        match h {
            ChannelHealth::Healthy => 0,
            ChannelHealth::Warning => 1,
            ChannelHealth::Critical => 2,
            ChannelHealth::Inactive => 3,
        }
    }
    if rank(a) >= rank(b) { a } else { b }
}

fn latency_samples(events: &[crate::types::SensorEvent]) -> Vec<f64> {
    events
        .iter()
        .filter(|e| matches!(e.event_type, EventType::Execution))
        .filter_map(|e| e.metadata.get("duration").and_then(|v| v.as_f64()))
        .collect()
}

/// Nearest-rank percentile over a sorted copy of `samples` — simple and
/// exact for the bounded ring sizes involved; no sketch structure needed.
fn percentiles(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    (nearest_rank(&sorted, 0.95), nearest_rank(&sorted, 0.99))
}

fn nearest_rank(sorted: &[f64], fraction: f64) -> f64 {
    let rank = ((sorted.len() as f64) * fraction).ceil() as usize;
    let index = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::types::ChannelConfig;

    #[tokio::test]
    async fn test_unregistered_channel_report_is_none() {
        let stores = Stores::new();
        let sensor = Sensor::with_defaults(0);
        let analyzer = Analyzer::new(&stores, &sensor);
        assert!(analyzer.channel_report("nope", 0).await.is_none());
    }

    #[tokio::test]
    async fn test_quiet_channel_is_inactive() {
        let stores = Stores::new();
        stores.set_channel("a".into(), compile(ChannelConfig::new("a")).unwrap()).await;
        let sensor = Sensor::with_defaults(0);
        let analyzer = Analyzer::new(&stores, &sensor);
        let report = analyzer.channel_report("a", 0).await.unwrap();
        assert_eq!(report.health, ChannelHealth::Inactive);
    }

    #[test]
    fn test_percentiles_over_known_distribution() {
        let samples: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        let (p95, p99) = percentiles(&samples);
        assert_eq!(p95, 95.0);
        assert_eq!(p99, 99.0);
    }

    #[test]
    fn test_percentiles_of_empty_is_zero() {
        assert_eq!(percentiles(&[]), (0.0, 0.0));
    }
}
