use crate::types::{BreathingPattern, BreathingState, Timestamp};
use std::sync::Mutex;

/// EMA smoothing factor applied on every `tick`. Lower values smooth harder.
const EMA_ALPHA: f64 = 0.2;

/// Stress thresholds, with hysteresis gaps so the pattern doesn't flap at
/// the boundary: entering a pattern and leaving it use different thresholds.
const STRESS_ADAPTIVE_ENTER: f64 = 0.7;
const STRESS_ADAPTIVE_EXIT: f64 = 0.6;
const STRESS_RECUPERATE_ENTER: f64 = 0.9;
const STRESS_RECUPERATE_EXIT: f64 = 0.75;

/// Base tick rate and the ceiling breathing can stretch it to under load.
const BASE_RATE_MS: u64 = 16;
const MAX_RATE_MS: u64 = 1_000;

struct Inner {
    call_rate: f64,
    error_rate: f64,
    current_stress: f64,
    pattern: BreathingPattern,
    breath_count: u64,
    last_tick_ms: Timestamp,
    window_calls: u64,
    window_errors: u64,
}

/// Tracks call-rate and error-rate via EMA and derives a stress value that
/// stretches the TimeKeeper's base tick interval under load.
pub struct BreathingController {
    inner: Mutex<Inner>,
}

impl BreathingController {
    pub fn new(now_ms: Timestamp) -> Self {
        Self {
            inner: Mutex::new(Inner {
                call_rate: 0.0,
                error_rate: 0.0,
                current_stress: 0.0,
                pattern: BreathingPattern::Normal,
                breath_count: 0,
                last_tick_ms: now_ms,
                window_calls: 0,
                window_errors: 0,
            }),
        }
    }

    /// Record a call outcome into the current window. Cheap and
    /// synchronous, called from the hot dispatch path.
    pub fn record_call(&self, was_error: bool) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.window_calls += 1;
        if was_error {
            inner.window_errors += 1;
        }
    }

    /// Advance the EMA and recompute stress/pattern. Called once per
    /// TimeKeeper base tick.
    pub fn tick(&self, now_ms: Timestamp) -> BreathingState {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed_ms = (now_ms - inner.last_tick_ms).max(1) as f64;
        inner.last_tick_ms = now_ms;

        let instantaneous_call_rate = inner.window_calls as f64 / (elapsed_ms / 1_000.0);
        let instantaneous_error_rate = if inner.window_calls == 0 {
            0.0
        } else {
            inner.window_errors as f64 / inner.window_calls as f64
        };
        inner.window_calls = 0;
        inner.window_errors = 0;

        inner.call_rate += EMA_ALPHA * (instantaneous_call_rate - inner.call_rate);
        inner.error_rate += EMA_ALPHA * (instantaneous_error_rate - inner.error_rate);

        // Stress blends a normalized call-rate pressure with the error rate;
        // call-rate is normalized against a soft ceiling of 100 calls/sec so
        // a single runaway burst can't saturate stress on its own.
        let call_pressure = (inner.call_rate / 100.0).min(1.0);
        inner.current_stress = (0.6 * call_pressure + 0.4 * inner.error_rate).clamp(0.0, 1.0);

        inner.pattern = next_pattern(inner.pattern, inner.current_stress);
        inner.breath_count += 1;

        BreathingState {
            call_rate: inner.call_rate,
            error_rate: inner.error_rate,
            current_stress: inner.current_stress,
            pattern: inner.pattern,
            current_rate_ms: rate_for(inner.pattern, inner.current_stress),
            breath_count: inner.breath_count,
        }
    }

    pub fn snapshot(&self) -> BreathingState {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        BreathingState {
            call_rate: inner.call_rate,
            error_rate: inner.error_rate,
            current_stress: inner.current_stress,
            pattern: inner.pattern,
            current_rate_ms: rate_for(inner.pattern, inner.current_stress),
            breath_count: inner.breath_count,
        }
    }

    /// The TimeKeeper's next base-interval duration, stretched by pattern —
    /// recuperating slows the tick loop itself down to `MAX_RATE_MS`.
    pub fn current_rate_ms(&self) -> u64 {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        rate_for(inner.pattern, inner.current_stress)
    }
}

fn next_pattern(current: BreathingPattern, stress: f64) -> BreathingPattern {
    match current {
        BreathingPattern::Normal if stress >= STRESS_ADAPTIVE_ENTER => BreathingPattern::Adaptive,
        BreathingPattern::Adaptive if stress >= STRESS_RECUPERATE_ENTER => BreathingPattern::Recuperating,
        BreathingPattern::Adaptive if stress < STRESS_ADAPTIVE_EXIT => BreathingPattern::Normal,
        BreathingPattern::Recuperating if stress < STRESS_RECUPERATE_EXIT => BreathingPattern::Adaptive,
        other => other,
    }
}

fn rate_for(pattern: BreathingPattern, stress: f64) -> u64 {
    match pattern {
        BreathingPattern::Normal => BASE_RATE_MS,
        BreathingPattern::Adaptive => {
            let scaled = BASE_RATE_MS as f64 + (MAX_RATE_MS - BASE_RATE_MS) as f64 * stress * 0.5;
            scaled as u64
        }
        BreathingPattern::Recuperating => MAX_RATE_MS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_stays_normal_with_base_rate() {
        let ctl = BreathingController::new(0);
        let state = ctl.tick(1_000);
        assert_eq!(state.pattern, BreathingPattern::Normal);
        assert_eq!(state.current_rate_ms, BASE_RATE_MS);
    }

    #[test]
    fn test_sustained_high_error_rate_escalates_pattern() {
        let ctl = BreathingController::new(0);
        let mut now = 0;
        for _ in 0..20 {
            for _ in 0..50 {
                ctl.record_call(true);
            }
            now += 1_000;
            ctl.tick(now);
        }
        let state = ctl.snapshot();
        assert_ne!(state.pattern, BreathingPattern::Normal);
    }

    #[test]
    fn test_pattern_has_hysteresis_not_single_threshold_flap() {
        // A stress value sitting between exit and enter thresholds should
        // not bounce the pattern back on the very next tick.
        assert_eq!(next_pattern(BreathingPattern::Adaptive, 0.65), BreathingPattern::Adaptive);
        assert_eq!(next_pattern(BreathingPattern::Normal, 0.65), BreathingPattern::Normal);
    }

    #[test]
    fn test_recuperating_uses_max_rate() {
        assert_eq!(rate_for(BreathingPattern::Recuperating, 1.0), MAX_RATE_MS);
    }
}
