use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Epoch milliseconds (UTC), the timebase used by TimeKeeper and the sensor ring.
pub type Timestamp = i64;

/// Opaque call payload. The core never interprets the shape of a payload —
/// schema/condition/selector/transform contracts do that. `Json` covers the
/// common case of structured calls; the other variants let a handler carry a
/// scalar through the pipeline without a serialization round-trip.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Json(serde_json::Value),
}

impl Payload {
    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }

    pub fn from_json(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Payload::Null,
            serde_json::Value::Bool(b) => Payload::Bool(b),
            serde_json::Value::Number(n) => Payload::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Payload::Text(s),
            other => Payload::Json(other),
        }
    }

    /// Deterministic JSON rendering, used for hashing and logging.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Payload::Null => serde_json::Value::Null,
            Payload::Bool(b) => serde_json::Value::Bool(*b),
            Payload::Number(n) => serde_json::json!(n),
            Payload::Text(s) => serde_json::Value::String(s.clone()),
            Payload::Json(v) => v.clone(),
        }
    }
}

/// SHA-256 of the payload's canonical JSON rendering — used by change-detection
/// to compare snapshots without cloning arbitrarily large payloads.
pub fn hash_payload(payload: &Payload) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let canonical = payload.to_json().to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hasher.finalize().into()
}

/// Advisory scheduling priority. Affects analyzer grouping only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// `repeat` on a channel's schedule: a bounded count, or unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Repeat {
    Times(u64),
    Infinity,
}

impl Repeat {
    pub fn is_blocked_at_registration(&self) -> bool {
        matches!(self, Repeat::Times(0))
    }
}

impl Default for Repeat {
    fn default() -> Self {
        Repeat::Times(1)
    }
}

pub type Handler = Arc<dyn Fn(Payload) -> Result<Payload, String> + Send + Sync>;
pub type Validator = Arc<dyn Fn(&Payload) -> Result<(), String> + Send + Sync>;
pub type Condition = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;
pub type Selector = Arc<dyn Fn(&Payload) -> Payload + Send + Sync>;
pub type Transform = Arc<dyn Fn(Payload) -> Payload + Send + Sync>;
pub type Middleware = Arc<dyn Fn(Payload) -> Payload + Send + Sync>;

/// A channel registration request — the public, pre-compiled shape accepted
/// by `action()`.
#[derive(Clone, Default)]
pub struct ChannelConfig {
    pub id: String,
    pub payload: Option<Payload>,
    pub throttle_ms: u64,
    pub debounce_ms: u64,
    pub detect_changes: bool,
    pub schema: Option<Validator>,
    pub condition: Option<Condition>,
    pub selector: Option<Selector>,
    pub transform: Option<Transform>,
    pub middlewares: Vec<Middleware>,
    pub required: bool,
    pub interval_ms: u64,
    pub delay_ms: u64,
    pub repeat: Repeat,
    pub priority: Priority,
    pub block: bool,
    pub tags: Vec<String>,
    pub path: Option<String>,
    pub group: Option<String>,
}

impl std::fmt::Debug for ChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConfig")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("throttle_ms", &self.throttle_ms)
            .field("debounce_ms", &self.debounce_ms)
            .field("detect_changes", &self.detect_changes)
            .field("schema", &self.schema.as_ref().map(|_| "<fn>"))
            .field("condition", &self.condition.as_ref().map(|_| "<fn>"))
            .field("selector", &self.selector.as_ref().map(|_| "<fn>"))
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("middlewares_count", &self.middlewares.len())
            .field("required", &self.required)
            .field("interval_ms", &self.interval_ms)
            .field("delay_ms", &self.delay_ms)
            .field("repeat", &self.repeat)
            .field("priority", &self.priority)
            .field("block", &self.block)
            .field("tags", &self.tags)
            .field("path", &self.path)
            .field("group", &self.group)
            .finish()
    }
}

impl ChannelConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            repeat: Repeat::Times(1),
            ..Default::default()
        }
    }
}

/// One step of a compiled pipeline, assembled in a fixed order: Throttle,
/// Debounce, Schema, Required, Condition, Selector, Transform, Middleware
/// (one per registered middleware), ChangeDetect.
#[derive(Clone)]
pub enum ProtectionStep {
    BlockGate { reason: &'static str },
    Throttle { ms: u64 },
    Debounce { ms: u64 },
    Schema(Validator),
    Required,
    Condition(Condition),
    Selector(Selector),
    Transform(Transform),
    Middleware(Middleware),
    ChangeDetect,
}

impl std::fmt::Debug for ProtectionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtectionStep::BlockGate { reason } => {
                f.debug_struct("BlockGate").field("reason", reason).finish()
            }
            ProtectionStep::Throttle { ms } => f.debug_struct("Throttle").field("ms", ms).finish(),
            ProtectionStep::Debounce { ms } => f.debug_struct("Debounce").field("ms", ms).finish(),
            ProtectionStep::Schema(_) => f.write_str("Schema(<fn>)"),
            ProtectionStep::Required => f.write_str("Required"),
            ProtectionStep::Condition(_) => f.write_str("Condition(<fn>)"),
            ProtectionStep::Selector(_) => f.write_str("Selector(<fn>)"),
            ProtectionStep::Transform(_) => f.write_str("Transform(<fn>)"),
            ProtectionStep::Middleware(_) => f.write_str("Middleware(<fn>)"),
            ProtectionStep::ChangeDetect => f.write_str("ChangeDetect"),
        }
    }
}

/// The result of compiling a `ChannelConfig`: an ordered protection list plus
/// the fast-path classification.
#[derive(Clone)]
pub struct CompiledChannel {
    pub config: ChannelConfig,
    pub pipeline: Vec<ProtectionStep>,
    pub fast_path: bool,
    pub pre_blocked: Option<&'static str>,
}

impl std::fmt::Debug for CompiledChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledChannel")
            .field("config", &self.config)
            .field("pipeline", &self.pipeline)
            .field("fast_path", &self.fast_path)
            .field("pre_blocked", &self.pre_blocked)
            .finish()
    }
}

/// A registered channel: the compiled pipeline plus the runtime bookkeeping
/// the call path mutates (last call time, pending debounce generation).
pub struct Channel {
    pub compiled: CompiledChannel,
    /// Monotonic epoch ms of the last *accepted* call (post block/throttle gate).
    pub last_call_ms: Option<Timestamp>,
    /// Generation counter — incremented on every debounced call so a stale
    /// timer fire (superseded by a newer call) can recognize itself as stale.
    pub debounce_generation: u64,
}

impl Channel {
    pub fn new(compiled: CompiledChannel) -> Self {
        Self {
            compiled,
            last_call_ms: None,
            debounce_generation: 0,
        }
    }
}

/// Origin of a TimeKeeper formation — carried in its metadata for diagnostics
/// and for the analyzer's protection-summary breakdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormationKind {
    Interval,
    Debounce,
    Orchestration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormationStatus {
    Active,
    Paused,
    Completed,
    Error,
}

/// A TimeKeeper entry — one scheduled or repeating callback.
#[derive(Clone)]
pub struct TimerFormation {
    pub id: String,
    pub channel_id: String,
    pub next_execution_ms: Timestamp,
    pub interval_ms: u64,
    pub remaining_repeats: Option<u64>,
    pub is_active: bool,
    pub status: FormationStatus,
    pub execution_count: u64,
    pub kind: FormationKind,
    /// Generation the formation was created under — used by debounce
    /// formations to detect they've been superseded.
    pub generation: u64,
    /// Heap-push sequence this formation's current deadline was scheduled
    /// with. A popped `HeapEntry` whose sequence doesn't match is a stale
    /// duplicate left behind by an earlier reschedule of the same id, and
    /// is silently dropped rather than fired.
    pub push_sequence: u64,
}

/// The closed set of sensor event kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Call,
    Execution,
    Dispatch,
    Error,
    Success,
    Warning,
    Info,
    Debug,
    Critical,
    Throttle,
    Debounce,
    Blocked,
    Skip,
}

/// One entry in the sensor ring.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorEvent {
    pub sequence: u64,
    pub timestamp_ms: Timestamp,
    pub action_id: String,
    pub event_type: EventType,
    pub message: Option<String>,
    pub location: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Breathing/stress pattern the TimeKeeper's cadence follows under load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreathingPattern {
    Normal,
    Adaptive,
    Recuperating,
}

/// Observable snapshot of the breathing controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreathingState {
    pub call_rate: f64,
    pub error_rate: f64,
    pub current_stress: f64,
    pub pattern: BreathingPattern,
    pub current_rate_ms: u64,
    pub breath_count: u64,
}

/// Per-channel health classification used by the Analyzer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelHealth {
    Healthy,
    Warning,
    Critical,
    Inactive,
}
