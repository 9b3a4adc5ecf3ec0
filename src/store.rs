use crate::types::{Channel, CompiledChannel, Handler, TimerFormation};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Four independent keyed collections — channels, subscribers, middlewares'
/// dedicated registry is folded into the channel's compiled pipeline, and
/// timeline — each exposing get/set/forget/get_all/clear.
///
/// Deletions are eventually consistent: a just-forgotten channel whose timer
/// formation ticks once more must be a no-op, not an error (TimeKeeper
/// checks `is_active`/existence on every fire rather than assuming it).
pub struct Stores {
    channels: RwLock<HashMap<String, Channel>>,
    subscribers: RwLock<HashMap<String, Handler>>,
    timeline: RwLock<HashMap<String, TimerFormation>>,
    last_payload: RwLock<HashMap<String, [u8; 32]>>,
}

impl Stores {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            timeline: RwLock::new(HashMap::new()),
            last_payload: RwLock::new(HashMap::new()),
        }
    }

    // ── Channels ──

    /// Returns `true` if a channel already existed under `id` and was
    /// replaced — the caller emits a warning event for that case rather
    /// than rejecting the registration.
    pub async fn set_channel(&self, id: String, compiled: CompiledChannel) -> bool {
        let mut w = self.channels.write().await;
        match w.get_mut(&id) {
            Some(existing) => {
                existing.compiled = compiled;
                true
            }
            None => {
                w.insert(id, Channel::new(compiled));
                false
            }
        }
    }

    pub async fn get_channel_config(&self, id: &str) -> Option<CompiledChannel> {
        let r = self.channels.read().await;
        r.get(id).map(|c| c.compiled.clone())
    }

    pub async fn channel_exists(&self, id: &str) -> bool {
        self.channels.read().await.contains_key(id)
    }

    pub async fn all_channel_ids(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    pub async fn forget_channel(&self, id: &str) {
        self.channels.write().await.remove(id);
    }

    pub async fn clear_channels(&self) {
        self.channels.write().await.clear();
    }

    /// Read-then-throttle-gate under a single write lock, so the
    /// check-and-update of `last_call_ms` is atomic per channel — two
    /// concurrent calls to the same channel can never both pass the gate.
    pub async fn try_accept_throttled_call(&self, id: &str, throttle_ms: u64, now_ms: i64) -> Result<(), u64> {
        let mut w = self.channels.write().await;
        let Some(channel) = w.get_mut(id) else {
            return Ok(());
        };
        if throttle_ms == 0 {
            channel.last_call_ms = Some(now_ms);
            return Ok(());
        }
        match channel.last_call_ms {
            Some(last) if now_ms.saturating_sub(last) < throttle_ms as i64 => {
                let elapsed = now_ms.saturating_sub(last).max(0) as u64;
                Err(throttle_ms.saturating_sub(elapsed))
            }
            _ => {
                channel.last_call_ms = Some(now_ms);
                Ok(())
            }
        }
    }

    /// Bump and return the debounce generation for a channel, so the caller
    /// can register a TimeKeeper formation tagged with the new generation.
    pub async fn bump_debounce_generation(&self, id: &str) -> u64 {
        let mut w = self.channels.write().await;
        if let Some(channel) = w.get_mut(id) {
            channel.debounce_generation += 1;
            channel.debounce_generation
        } else {
            0
        }
    }

    pub async fn current_debounce_generation(&self, id: &str) -> Option<u64> {
        let r = self.channels.read().await;
        r.get(id).map(|c| c.debounce_generation)
    }

    // ── Subscribers ──

    /// Returns `true` if a prior subscriber was replaced — the caller emits
    /// a warning event for that case rather than rejecting the subscribe.
    pub async fn set_subscriber(&self, id: String, handler: Handler) -> bool {
        let mut w = self.subscribers.write().await;
        w.insert(id, handler).is_some()
    }

    pub async fn get_subscriber(&self, id: &str) -> Option<Handler> {
        self.subscribers.read().await.get(id).cloned()
    }

    pub async fn forget_subscriber(&self, id: &str) {
        self.subscribers.write().await.remove(id);
    }

    pub async fn clear_subscribers(&self) {
        self.subscribers.write().await.clear();
    }

    // ── Timeline (TimeKeeper formations) ──

    pub async fn set_formation(&self, formation: TimerFormation) {
        self.timeline
            .write()
            .await
            .insert(formation.id.clone(), formation);
    }

    pub async fn get_formation(&self, id: &str) -> Option<TimerFormation> {
        self.timeline.read().await.get(id).cloned()
    }

    pub async fn forget_formation(&self, id: &str) {
        self.timeline.write().await.remove(id);
    }

    pub async fn forget_formations_for_channel(&self, channel_id: &str) {
        self.timeline
            .write()
            .await
            .retain(|_, f| f.channel_id != channel_id);
    }

    pub async fn all_formations(&self) -> Vec<TimerFormation> {
        self.timeline.read().await.values().cloned().collect()
    }

    pub async fn clear_timeline(&self) {
        self.timeline.write().await.clear();
    }

    // ── Last-payload cache ──

    pub async fn last_payload_hash(&self, id: &str) -> Option<[u8; 32]> {
        self.last_payload.read().await.get(id).copied()
    }

    pub async fn set_last_payload_hash(&self, id: String, hash: [u8; 32]) {
        self.last_payload.write().await.insert(id, hash);
    }

    pub async fn forget_last_payload(&self, id: &str) {
        self.last_payload.write().await.remove(id);
    }

    pub async fn clear_last_payload(&self) {
        self.last_payload.write().await.clear();
    }

    // ── Global ──

    pub async fn clear_all(&self) {
        self.clear_channels().await;
        self.clear_subscribers().await;
        self.clear_timeline().await;
        self.clear_last_payload().await;
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::types::ChannelConfig;

    fn compiled(id: &str) -> CompiledChannel {
        compile(ChannelConfig::new(id)).unwrap()
    }

    #[tokio::test]
    async fn test_channel_round_trip() {
        let store = Stores::new();
        store.set_channel("a".into(), compiled("a")).await;
        assert!(store.channel_exists("a").await);
        store.forget_channel("a").await;
        assert!(!store.channel_exists("a").await);
    }

    #[tokio::test]
    async fn test_throttle_gate_serializes_per_channel() {
        let store = Stores::new();
        store.set_channel("b".into(), compiled("b")).await;

        assert!(store.try_accept_throttled_call("b", 500, 0).await.is_ok());
        let err = store.try_accept_throttled_call("b", 500, 100).await.unwrap_err();
        assert!(err <= 400 && err > 0);
        assert!(store.try_accept_throttled_call("b", 500, 600).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscriber_replace_reports_warning() {
        let store = Stores::new();
        let h1: Handler = std::sync::Arc::new(|p| Ok(p));
        let h2: Handler = std::sync::Arc::new(|p| Ok(p));
        assert!(!store.set_subscriber("c".into(), h1).await);
        assert!(store.set_subscriber("c".into(), h2).await);
    }

    #[tokio::test]
    async fn test_forget_is_idempotent() {
        let store = Stores::new();
        store.forget_channel("missing").await;
        store.forget_channel("missing").await;
    }
}
