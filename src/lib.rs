pub mod analyzer;
pub mod breathing;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod sensor;
pub mod store;
pub mod timekeeper;
pub mod types;

pub use engine::{CallOutcome, ChannelInfo, Cyre, PerformanceState};
pub use error::{CyreError, RegistrationError};
pub use types::{
    BreathingPattern, BreathingState, Channel, ChannelConfig, ChannelHealth, Condition,
    EventType, Handler, Middleware, Payload, Priority, Repeat, Selector, SensorEvent,
    Timestamp, Transform, Validator,
};

/// Runtime-wide tunables fixed at `init()`. There is no on-disk config
/// format — callers construct this programmatically, passing it straight
/// into the engine's constructor rather than loading it from a file.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Base TimeKeeper tick interval before breathing stretches it.
    pub tick_interval_ms: u64,
    /// Maximum events retained in the sensor ring.
    pub ring_capacity: usize,
    /// Maximum age of a sensor event before eviction.
    pub retention_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 16,
            ring_capacity: sensor::DEFAULT_CAPACITY,
            retention_ms: sensor::DEFAULT_RETENTION_MS,
        }
    }
}

/// Install a `tracing` subscriber reading `RUST_LOG` (or `info` by default).
/// Call once per process; safe to skip in tests, which typically rely on
/// `tracing-test` or no subscriber at all.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}
