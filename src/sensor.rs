use crate::types::{EventType, SensorEvent, Timestamp};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Default ring retention: up to 1,000 events, evicted past 1h age.
pub const DEFAULT_CAPACITY: usize = 1_000;
pub const DEFAULT_RETENTION_MS: i64 = 60 * 60 * 1_000;

#[derive(Clone, Copy, Debug, Default)]
struct ChannelCounters {
    calls: u64,
    executions: u64,
    /// Handler-phase errors only — protection skips never count here.
    errors: u64,
    throttled: u64,
    debounced: u64,
    skipped: u64,
    blocked: u64,
    /// Incremental mean of execution duration in ms, and the sample count
    /// backing it (Welford-free running mean, sufficient for a monotone
    /// non-negative series).
    avg_latency_ms: f64,
    latency_samples: u64,
}

/// Synchronous, non-blocking, never-throws event recorder. The ring itself
/// is a `Mutex<VecDeque<_>>` rather than the store's async `RwLock` —
/// recording happens on the hot call path and must not await.
pub struct Sensor {
    ring: Mutex<VecDeque<SensorEvent>>,
    capacity: usize,
    retention_ms: i64,
    sequence: AtomicU64,
    counters: Mutex<BTreeMap<String, ChannelCounters>>,
    total_calls: AtomicU64,
    total_executions: AtomicU64,
    total_errors: AtomicU64,
    started_at_ms: Timestamp,
}

/// Raw shape accepted by `record_raw` before sanitization: invalid input is
/// coerced into a best-effort event and a validation warning is emitted
/// alongside it, rather than being rejected.
pub enum RawEvent {
    Typed(SensorEvent),
    /// A bare number is coerced to an `execution` event carrying `duration`.
    Number(f64),
    /// An object is coerced to an `info`/`dispatch` event, contents merged
    /// into metadata.
    Object(BTreeMap<String, serde_json::Value>),
}

impl Sensor {
    pub fn new(capacity: usize, retention_ms: i64, now_ms: Timestamp) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            retention_ms,
            sequence: AtomicU64::new(0),
            counters: Mutex::new(BTreeMap::new()),
            total_calls: AtomicU64::new(0),
            total_executions: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            started_at_ms: now_ms,
        }
    }

    pub fn with_defaults(now_ms: Timestamp) -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_RETENTION_MS, now_ms)
    }

    /// Build and record a well-formed event — the path every protection and
    /// the dispatcher use.
    pub fn record(
        &self,
        action_id: &str,
        event_type: EventType,
        message: Option<String>,
        location: Option<&str>,
        metadata: BTreeMap<String, serde_json::Value>,
        now_ms: Timestamp,
    ) -> u64 {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let event = SensorEvent {
            sequence: seq,
            timestamp_ms: now_ms,
            action_id: action_id.to_string(),
            event_type,
            message,
            location: location.map(str::to_string),
            metadata,
        };
        self.update_counters(&event);
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.push_back(event);
        while ring.len() > self.capacity {
            ring.pop_front();
        }
        seq
    }

    /// Sanitizing entry point for untrusted/loosely-typed input. Always
    /// succeeds — invalid shapes are coerced, never rejected.
    pub fn record_raw(&self, action_id: &str, raw: RawEvent, now_ms: Timestamp) -> u64 {
        match raw {
            RawEvent::Typed(event) => self.record(
                action_id,
                event.event_type,
                event.message,
                event.location.as_deref(),
                event.metadata,
                now_ms,
            ),
            RawEvent::Number(duration) => {
                let mut metadata = BTreeMap::new();
                metadata.insert("duration".to_string(), serde_json::json!(duration));
                let seq = self.record(action_id, EventType::Execution, None, None, metadata, now_ms);
                self.record(
                    action_id,
                    EventType::Warning,
                    Some("sensor event coerced from bare number to execution".to_string()),
                    Some("sensor"),
                    BTreeMap::new(),
                    now_ms,
                );
                seq
            }
            RawEvent::Object(fields) => {
                let seq = self.record(action_id, EventType::Info, None, None, fields, now_ms);
                self.record(
                    action_id,
                    EventType::Warning,
                    Some("sensor event coerced from bare object to info/dispatch".to_string()),
                    Some("sensor"),
                    BTreeMap::new(),
                    now_ms,
                );
                seq
            }
        }
    }

    fn update_counters(&self, event: &SensorEvent) {
        match event.event_type {
            EventType::Call => {
                self.total_calls.fetch_add(1, Ordering::Relaxed);
            }
            EventType::Execution => {
                self.total_executions.fetch_add(1, Ordering::Relaxed);
            }
            EventType::Error => {
                self.total_errors.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let c = counters.entry(event.action_id.clone()).or_default();
        match event.event_type {
            EventType::Call => c.calls += 1,
            EventType::Execution => {
                c.executions += 1;
                if let Some(duration) = event
                    .metadata
                    .get("duration")
                    .and_then(|v| v.as_f64())
                    .filter(|d| *d > 0.0)
                {
                    c.latency_samples += 1;
                    c.avg_latency_ms += (duration - c.avg_latency_ms) / c.latency_samples as f64;
                }
            }
            EventType::Error if event.location.as_deref() == Some("handler") => c.errors += 1,
            EventType::Throttle => c.throttled += 1,
            EventType::Debounce => c.debounced += 1,
            EventType::Skip => c.skipped += 1,
            EventType::Blocked => c.blocked += 1,
            _ => {}
        }
    }

    /// Per-channel metrics derivation.
    pub fn channel_metrics(&self, action_id: &str) -> ChannelMetrics {
        let counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        let c = counters.get(action_id).copied().unwrap_or_default();
        let success_rate = if c.calls == 0 {
            1.0
        } else {
            1.0 - (c.errors as f64 / c.calls as f64)
        };
        ChannelMetrics {
            calls: c.calls,
            executions: c.executions,
            errors: c.errors,
            throttled: c.throttled,
            debounced: c.debounced,
            skipped: c.skipped,
            blocked: c.blocked,
            success_rate,
            average_latency_ms: c.avg_latency_ms,
        }
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn total_executions(&self) -> u64 {
        self.total_executions.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn uptime_ms(&self, now_ms: Timestamp) -> i64 {
        (now_ms - self.started_at_ms).max(0)
    }

    /// Events-per-second over the trailing second.
    pub fn call_rate(&self, now_ms: Timestamp) -> f64 {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let count = ring
            .iter()
            .rev()
            .take_while(|e| now_ms - e.timestamp_ms <= 1_000)
            .filter(|e| matches!(e.event_type, EventType::Call))
            .count();
        count as f64
    }

    /// Pure read over the ring: filter by action id / event type / since /
    /// limit. Never mutates counters or the ring itself.
    pub fn query(&self, filter: QueryFilter) -> Vec<SensorEvent> {
        let ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<SensorEvent> = ring
            .iter()
            .filter(|e| filter.action_id.as_deref().is_none_or(|id| e.action_id == id))
            .filter(|e| filter.event_type.is_none_or(|t| e.event_type == t))
            .filter(|e| filter.since.is_none_or(|since| e.timestamp_ms >= since))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        out
    }

    /// Snapshot the whole ring, newest-last, for the Analyzer.
    pub fn snapshot(&self) -> Vec<SensorEvent> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).iter().cloned().collect()
    }

    /// Evict events older than `retention_ms`. Run periodically by the
    /// engine's retention task.
    pub fn evict_expired(&self, now_ms: Timestamp) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let retention = self.retention_ms;
        ring.retain(|e| now_ms - e.timestamp_ms <= retention);
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelMetrics {
    pub calls: u64,
    pub executions: u64,
    pub errors: u64,
    pub throttled: u64,
    pub debounced: u64,
    pub skipped: u64,
    pub blocked: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

#[derive(Clone, Default)]
pub struct QueryFilter {
    pub action_id: Option<String>,
    pub event_type: Option<EventType>,
    pub since: Option<Timestamp>,
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_strictly_increase() {
        let sensor = Sensor::with_defaults(0);
        let s1 = sensor.record("a", EventType::Call, None, None, BTreeMap::new(), 0);
        let s2 = sensor.record("a", EventType::Call, None, None, BTreeMap::new(), 1);
        assert!(s2 > s1);
    }

    #[test]
    fn test_handler_error_raises_error_rate_but_skip_does_not() {
        let sensor = Sensor::with_defaults(0);
        sensor.record("a", EventType::Call, None, None, BTreeMap::new(), 0);
        sensor.record("a", EventType::Skip, None, None, BTreeMap::new(), 0);
        let m = sensor.channel_metrics("a");
        assert_eq!(m.errors, 0);
        assert_eq!(m.success_rate, 1.0);

        sensor.record("a", EventType::Call, None, None, BTreeMap::new(), 0);
        sensor.record("a", EventType::Error, None, Some("handler"), BTreeMap::new(), 0);
        let m = sensor.channel_metrics("a");
        assert_eq!(m.errors, 1);
        assert_eq!(m.calls, 2);
        assert!((m.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ring_evicts_past_capacity() {
        let sensor = Sensor::new(3, DEFAULT_RETENTION_MS, 0);
        for i in 0..5 {
            sensor.record("a", EventType::Call, None, None, BTreeMap::new(), i);
        }
        assert_eq!(sensor.snapshot().len(), 3);
    }

    #[test]
    fn test_evict_expired_by_age() {
        let sensor = Sensor::new(100, 1_000, 0);
        sensor.record("a", EventType::Call, None, None, BTreeMap::new(), 0);
        sensor.record("a", EventType::Call, None, None, BTreeMap::new(), 5_000);
        sensor.evict_expired(5_000);
        assert_eq!(sensor.snapshot().len(), 1);
    }

    #[test]
    fn test_raw_number_coerces_to_execution_plus_warning() {
        let sensor = Sensor::with_defaults(0);
        sensor.record_raw("a", RawEvent::Number(12.5), 0);
        let events = sensor.snapshot();
        assert!(events.iter().any(|e| matches!(e.event_type, EventType::Execution)));
        assert!(events.iter().any(|e| matches!(e.event_type, EventType::Warning)));
    }
}
