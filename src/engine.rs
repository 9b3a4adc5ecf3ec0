use crate::breathing::BreathingController;
use crate::compiler::compile;
use crate::error::{CyreError, RegistrationError};
use crate::sensor::{QueryFilter, Sensor};
use crate::store::Stores;
use crate::timekeeper::TimeKeeper;
use crate::types::{
    BreathingState, ChannelConfig, ChannelHealth, CompiledChannel, EventType,
    FormationKind, Handler, Payload, ProtectionStep, Repeat, SensorEvent, Timestamp, hash_payload,
};
use crate::EngineConfig;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// Outcome of a `call()` — always returned, never an `Err`. The dispatcher
/// carries failure as data so callers branch on `ok`/`error` rather than
/// unwinding through a terminal state. `correlation_id` is a fresh
/// `Uuid::now_v7()` per call, ties the outcome back to its sensor events.
#[derive(Clone, Debug)]
pub struct CallOutcome {
    pub correlation_id: uuid::Uuid,
    pub ok: bool,
    pub payload: Option<Payload>,
    pub error: Option<CyreError>,
}

impl CallOutcome {
    fn success(correlation_id: uuid::Uuid, payload: Payload) -> Self {
        Self { correlation_id, ok: true, payload: Some(payload), error: None }
    }

    fn scheduled(correlation_id: uuid::Uuid) -> Self {
        Self { correlation_id, ok: true, payload: None, error: None }
    }

    fn failure(correlation_id: uuid::Uuid, error: CyreError) -> Self {
        Self { correlation_id, ok: false, payload: None, error: Some(error) }
    }
}

/// Read-only snapshot of a registered channel for `get`/`get_all`/`get_group`.
#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub id: String,
    pub group: Option<String>,
    pub tags: Vec<String>,
    pub fast_path: bool,
    pub pre_blocked: Option<&'static str>,
    pub health: ChannelHealth,
}

/// Aggregate performance snapshot across every channel.
#[derive(Clone, Debug)]
pub struct PerformanceState {
    pub total_calls: u64,
    pub total_executions: u64,
    pub total_errors: u64,
    pub uptime_ms: i64,
    pub call_rate: f64,
}

/// Cyre is the top-level facade that wires together the store, compiler,
/// sensor, breathing controller, and TimeKeeper. The public surface
/// (`init`/`action`/`on`/`call`/`forget`/`clear`/`get*`/`shutdown`) delegates
/// entirely to it.
pub struct Cyre {
    stores: Arc<Stores>,
    sensor: Arc<Sensor>,
    breathing: Arc<BreathingController>,
    timekeeper: Arc<TimeKeeper>,
    config: EngineConfig,
    start: tokio::time::Instant,
    scheduler_task: AsyncMutex<Option<JoinHandle<()>>>,
    pulse_cancel: tokio_util::sync::CancellationToken,
    pulse_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl Cyre {
    /// Build the runtime and start its TimeKeeper loop as a background task.
    /// The clock fed to the scheduler derives from `tokio::time::Instant`, so
    /// tests using `tokio::time::pause`/`advance` observe the same timeline
    /// the dispatcher does.
    pub fn init(config: EngineConfig) -> Arc<Self> {
        let start = tokio::time::Instant::now();
        let stores = Arc::new(Stores::new());
        let sensor = Arc::new(Sensor::new(config.ring_capacity, config.retention_ms, 0));
        let breathing = Arc::new(BreathingController::new(0));
        let timekeeper = Arc::new(TimeKeeper::new(stores.clone()));

        let engine = Arc::new(Self {
            stores,
            sensor,
            breathing,
            timekeeper,
            config,
            start,
            scheduler_task: AsyncMutex::new(None),
            pulse_cancel: tokio_util::sync::CancellationToken::new(),
            pulse_task: AsyncMutex::new(None),
        });

        let fire_engine = engine.clone();
        let fire_callback: crate::timekeeper::FireCallback = Arc::new(move |formation_id, channel_id, generation| {
            let engine = fire_engine.clone();
            Box::pin(async move {
                engine.on_formation_fired(formation_id, channel_id, generation).await;
            })
        });

        let tk = engine.timekeeper.clone();
        let breathing_for_rate = engine.breathing.clone();
        let engine_for_run = engine.clone();
        let handle = tokio::spawn(async move {
            tk.set_fire_callback(fire_callback).await;
            let rate = move || breathing_for_rate.current_rate_ms();
            let clock = move || engine_for_run.now_ms();
            tk.run(rate, clock).await;
        });

        // Stash the join handle synchronously is impossible (the mutex is
        // async) — a best-effort try_lock is fine since nothing else holds
        // it this early in construction.
        if let Ok(mut guard) = engine.scheduler_task.try_lock() {
            *guard = Some(handle);
        }

        // Breathing and retention both run off the same base cadence: every
        // tick, advance the breathing EMA/pattern from the window recorded
        // since the last tick, then sweep the sensor ring for expired
        // events. This is what actually drives the adaptive-cadence loop —
        // without it `current_rate_ms()` never moves off `BASE_RATE_MS`.
        let pulse_engine = engine.clone();
        let pulse_cancel = engine.pulse_cancel.clone();
        let pulse_handle = tokio::spawn(async move {
            loop {
                let interval = pulse_engine.config.tick_interval_ms.max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(interval)) => {
                        let now = pulse_engine.now_ms();
                        pulse_engine.breathing.tick(now);
                        pulse_engine.sensor.evict_expired(now);
                    }
                    _ = pulse_cancel.cancelled() => break,
                }
            }
        });
        if let Ok(mut guard) = engine.pulse_task.try_lock() {
            *guard = Some(pulse_handle);
        }

        engine
    }

    fn now_ms(&self) -> Timestamp {
        self.start.elapsed().as_millis() as Timestamp
    }

    fn record(&self, action_id: &str, event_type: EventType, message: Option<String>, location: Option<&str>) {
        self.sensor.record(action_id, event_type, message, location, BTreeMap::new(), self.now_ms());
    }

    // ── Registration ──

    #[tracing::instrument(skip_all, fields(id = %config.id))]
    pub async fn action(&self, config: ChannelConfig) -> Result<(), Vec<RegistrationError>> {
        let id = config.id.clone();
        let compiled = compile(config)?;
        let replaced = self.stores.set_channel(id.clone(), compiled).await;
        if replaced {
            tracing::warn!(channel = %id, "channel registration replaced");
            self.record(&id, EventType::Warning, Some("channel registration replaced".to_string()), Some("action"));
        } else {
            self.record(&id, EventType::Info, Some("channel registered".to_string()), Some("action"));
        }
        Ok(())
    }

    pub async fn action_many(&self, configs: Vec<ChannelConfig>) -> Vec<(String, Result<(), Vec<RegistrationError>>)> {
        let mut results = Vec::with_capacity(configs.len());
        for config in configs {
            let id = config.id.clone();
            results.push((id, self.action(config).await));
        }
        results
    }

    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn on(&self, id: &str, handler: Handler) -> bool {
        let replaced = self.stores.set_subscriber(id.to_string(), handler).await;
        if replaced {
            tracing::warn!(channel = id, "subscriber replaced for channel");
            self.record(id, EventType::Warning, Some("subscriber replaced".to_string()), Some("on"));
        }
        replaced
    }

    pub async fn on_many(&self, subs: Vec<(String, Handler)>) -> Vec<bool> {
        let mut out = Vec::with_capacity(subs.len());
        for (id, handler) in subs {
            out.push(self.on(&id, handler).await);
        }
        out
    }

    // ── Call dispatch ──

    #[tracing::instrument(skip_all, fields(id = %id))]
    pub async fn call(&self, id: &str, payload: Payload) -> CallOutcome {
        let now = self.now_ms();
        let correlation_id = uuid::Uuid::now_v7();

        let Some(compiled) = self.stores.get_channel_config(id).await else {
            return CallOutcome::failure(correlation_id, CyreError::UnknownChannel(id.to_string()));
        };
        self.record(id, EventType::Call, None, None);

        if let Some(reason) = compiled.pre_blocked {
            self.record(id, EventType::Blocked, Some(reason.to_string()), Some("call"));
            return CallOutcome::failure(correlation_id, CyreError::PreBlocked { reason: reason.to_string() });
        }

        // Interval/delayed channels hand off to the TimeKeeper instead of
        // executing inline.
        if compiled.config.interval_ms > 0 || compiled.config.delay_ms > 0 {
            return self.schedule_repeat(id, compiled, now, correlation_id).await;
        }

        self.run_pipeline(id, &compiled, payload, now, 0, correlation_id).await
    }

    async fn schedule_repeat(&self, id: &str, compiled: CompiledChannel, now: Timestamp, correlation_id: uuid::Uuid) -> CallOutcome {
        let remaining = match compiled.config.repeat {
            Repeat::Times(n) => Some(n),
            Repeat::Infinity => None,
        };
        let formation_id = format!("{id}:interval");
        self.timekeeper
            .schedule(
                formation_id,
                id.to_string(),
                now + compiled.config.delay_ms.max(compiled.config.interval_ms) as i64,
                compiled.config.interval_ms,
                remaining,
                FormationKind::Interval,
                0,
            )
            .await;
        self.record(id, EventType::Dispatch, Some("scheduled for repeated execution".to_string()), Some("call"));
        CallOutcome::scheduled(correlation_id)
    }

    /// Called back by the TimeKeeper when a formation fires. Interval
    /// formations re-run the full pipeline; debounce formations resume from
    /// the step after the debounce gate, and are dropped if superseded by a
    /// newer call (generation mismatch).
    async fn on_formation_fired(&self, formation_id: String, channel_id: String, generation: u64) {
        let Some(compiled) = self.stores.get_channel_config(&channel_id).await else {
            return;
        };
        let now = self.now_ms();

        if formation_id.ends_with(":debounce") {
            let current = self.stores.current_debounce_generation(&channel_id).await;
            if current != Some(generation) {
                self.record(&channel_id, EventType::Skip, Some("stale debounce fire".to_string()), Some("timekeeper"));
                return;
            }
            let start_index = compiled
                .pipeline
                .iter()
                .position(|s| matches!(s, ProtectionStep::Debounce { .. }))
                .map(|i| i + 1)
                .unwrap_or(0);
            let payload = compiled.config.payload.clone().unwrap_or(Payload::Null);
            let _ = self.run_pipeline(&channel_id, &compiled, payload, now, start_index, uuid::Uuid::now_v7()).await;
            return;
        }

        let payload = compiled.config.payload.clone().unwrap_or(Payload::Null);
        let _ = self.run_pipeline(&channel_id, &compiled, payload, now, 0, uuid::Uuid::now_v7()).await;
    }

    /// Walk the compiled pipeline from `start_index`, applying each
    /// protection step in the fixed order it was compiled, then dispatch to
    /// the subscriber.
    async fn run_pipeline(
        &self,
        id: &str,
        compiled: &CompiledChannel,
        mut payload: Payload,
        now: Timestamp,
        start_index: usize,
        correlation_id: uuid::Uuid,
    ) -> CallOutcome {
        for step in compiled.pipeline.iter().skip(start_index) {
            match step {
                ProtectionStep::BlockGate { .. } => unreachable!("pre_blocked handled before pipeline entry"),
                ProtectionStep::Throttle { ms } => {
                    if let Err(remaining_ms) = self.stores.try_accept_throttled_call(id, *ms, now).await {
                        self.record(id, EventType::Throttle, None, Some("call"));
                        return CallOutcome::failure(correlation_id, CyreError::Throttled { remaining_ms });
                    }
                }
                ProtectionStep::Debounce { ms } => {
                    let generation = self.stores.bump_debounce_generation(id).await;
                    self.timekeeper
                        .schedule(
                            format!("{id}:debounce"),
                            id.to_string(),
                            now + *ms as i64,
                            0,
                            Some(1),
                            FormationKind::Debounce,
                            generation,
                        )
                        .await;
                    let mut pending = compiled.clone();
                    pending.config.payload = Some(payload.clone());
                    self.stores.set_channel(id.to_string(), pending).await;
                    self.record(id, EventType::Debounce, None, Some("call"));
                    return CallOutcome::failure(correlation_id, CyreError::Debounced { fires_at_ms: now + *ms as i64 });
                }
                ProtectionStep::Schema(validator) => {
                    if let Err(message) = validator(&payload) {
                        self.record(id, EventType::Error, Some(message.clone()), Some("schema"));
                        return CallOutcome::failure(correlation_id, CyreError::SchemaInvalid { message });
                    }
                }
                ProtectionStep::Required => {
                    if payload.is_null() {
                        self.record(id, EventType::Skip, Some("required payload missing".to_string()), Some("call"));
                        return CallOutcome::failure(correlation_id, CyreError::RequiredMissing);
                    }
                }
                ProtectionStep::Condition(condition) => {
                    if !condition(&payload) {
                        self.record(id, EventType::Skip, Some("condition not met".to_string()), Some("call"));
                        return CallOutcome::failure(correlation_id, CyreError::ConditionNotMet);
                    }
                }
                ProtectionStep::Selector(selector) => {
                    payload = selector(&payload);
                }
                ProtectionStep::Transform(transform) => {
                    payload = transform(payload);
                }
                ProtectionStep::Middleware(middleware) => {
                    payload = middleware(payload);
                }
                ProtectionStep::ChangeDetect => {
                    let hash = hash_payload(&payload);
                    if self.stores.last_payload_hash(id).await == Some(hash) {
                        self.record(id, EventType::Skip, Some("payload unchanged".to_string()), Some("call"));
                        return CallOutcome::failure(correlation_id, CyreError::Unchanged);
                    }
                    self.stores.set_last_payload_hash(id.to_string(), hash).await;
                }
            }
        }

        self.dispatch_to_handler(id, payload, correlation_id).await
    }

    async fn dispatch_to_handler(&self, id: &str, payload: Payload, correlation_id: uuid::Uuid) -> CallOutcome {
        let Some(handler) = self.stores.get_subscriber(id).await else {
            self.record(id, EventType::Skip, Some("no subscriber registered".to_string()), Some("dispatch"));
            return CallOutcome::success(correlation_id, payload);
        };

        let started = self.now_ms();
        let result = handler(payload);
        let elapsed = (self.now_ms() - started).max(0) as f64;

        match result {
            Ok(output) => {
                self.breathing.record_call(false);
                let mut metadata = BTreeMap::new();
                metadata.insert("duration".to_string(), serde_json::json!(elapsed));
                self.sensor.record(id, EventType::Execution, None, None, metadata, self.now_ms());
                CallOutcome::success(correlation_id, output)
            }
            Err(message) => {
                self.breathing.record_call(true);
                self.sensor.record(id, EventType::Error, Some(message.clone()), Some("handler"), BTreeMap::new(), self.now_ms());
                CallOutcome::failure(correlation_id, CyreError::HandlerError { message })
            }
        }
    }

    // ── Lifecycle / introspection ──

    pub async fn forget(&self, id: &str) -> bool {
        let existed = self.stores.channel_exists(id).await;
        self.stores.forget_channel(id).await;
        self.stores.forget_subscriber(id).await;
        self.stores.forget_formations_for_channel(id).await;
        self.stores.forget_last_payload(id).await;
        existed
    }

    pub async fn clear(&self) {
        self.stores.clear_all().await;
    }

    pub async fn get(&self, id: &str) -> Option<ChannelInfo> {
        let compiled = self.stores.get_channel_config(id).await?;
        Some(self.to_info(id, &compiled))
    }

    pub async fn get_all(&self) -> Vec<ChannelInfo> {
        let mut out = Vec::new();
        for id in self.stores.all_channel_ids().await {
            if let Some(compiled) = self.stores.get_channel_config(&id).await {
                out.push(self.to_info(&id, &compiled));
            }
        }
        out
    }

    pub async fn get_group(&self, group: &str) -> Vec<ChannelInfo> {
        self.get_all().await.into_iter().filter(|c| c.group.as_deref() == Some(group)).collect()
    }

    fn to_info(&self, id: &str, compiled: &CompiledChannel) -> ChannelInfo {
        ChannelInfo {
            id: id.to_string(),
            group: compiled.config.group.clone(),
            tags: compiled.config.tags.clone(),
            fast_path: compiled.fast_path,
            pre_blocked: compiled.pre_blocked,
            health: ChannelHealth::Healthy,
        }
    }

    pub async fn get_performance_state(&self) -> PerformanceState {
        let now = self.now_ms();
        PerformanceState {
            total_calls: self.sensor.total_calls(),
            total_executions: self.sensor.total_executions(),
            total_errors: self.sensor.total_errors(),
            uptime_ms: self.sensor.uptime_ms(now),
            call_rate: self.sensor.call_rate(now),
        }
    }

    pub async fn get_breathing_state(&self) -> BreathingState {
        self.breathing.snapshot()
    }

    pub fn query_events(&self, filter: QueryFilter) -> Vec<SensorEvent> {
        self.sensor.query(filter)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Idempotent shutdown: cancels the TimeKeeper loop and the breathing/
    /// retention pulse, then waits for both to drain.
    pub async fn shutdown(&self) {
        self.timekeeper.shutdown();
        let mut guard = self.scheduler_task.lock().await;
        if let Some(handle) = guard.take() {
            let _ = handle.await;
        }

        self.pulse_cancel.cancel();
        let mut pulse_guard = self.pulse_task.lock().await;
        if let Some(handle) = pulse_guard.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    #[tokio::test]
    async fn test_call_unknown_channel_fails() {
        let engine = Cyre::init(config());
        let outcome = engine.call("missing", Payload::Null).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.unwrap().kind(), "unknown-channel");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_fast_path_call_without_subscriber_echoes_payload() {
        let engine = Cyre::init(config());
        engine.action(ChannelConfig::new("echo")).await.unwrap();
        let outcome = engine.call("echo", Payload::Text("hi".into())).await;
        assert!(outcome.ok);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_call_dispatches_to_subscriber() {
        let engine = Cyre::init(config());
        engine.action(ChannelConfig::new("double")).await.unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        engine
            .on("double", Arc::new(move |p| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                match p {
                    Payload::Number(n) => Ok(Payload::Number(n * 2.0)),
                    other => Ok(other),
                }
            }))
            .await;

        let outcome = engine.call("double", Payload::Number(21.0)).await;
        assert!(outcome.ok);
        assert!(matches!(outcome.payload, Some(Payload::Number(n)) if n == 42.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_forget_removes_channel_and_subscriber() {
        let engine = Cyre::init(config());
        engine.action(ChannelConfig::new("gone")).await.unwrap();
        assert!(engine.forget("gone").await);
        let outcome = engine.call("gone", Payload::Null).await;
        assert_eq!(outcome.error.unwrap().kind(), "unknown-channel");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_throttle_rejects_rapid_second_call() {
        let mut cfg = ChannelConfig::new("throttled");
        cfg.throttle_ms = 10_000;
        let engine = Cyre::init(config());
        engine.action(cfg).await.unwrap();

        let first = engine.call("throttled", Payload::Null).await;
        assert!(first.ok);
        let second = engine.call("throttled", Payload::Null).await;
        assert!(!second.ok);
        assert_eq!(second.error.unwrap().kind(), "throttled");
        engine.shutdown().await;
    }
}
