use crate::store::Stores;
use crate::types::{FormationKind, FormationStatus, TimerFormation, Timestamp};
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Fired once per due formation. The formation's own reschedule/completion
/// bookkeeping advances regardless of how the fired future resolves.
pub type FireCallback = Arc<dyn Fn(String, String, u64) -> FireFuture + Send + Sync>;
pub type FireFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

#[derive(Eq, PartialEq)]
struct HeapEntry {
    next_execution_ms: Timestamp,
    sequence: u64,
    formation_id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse so `BinaryHeap` (a max-heap) pops the earliest deadline first.
        other
            .next_execution_ms
            .cmp(&self.next_execution_ms)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// The single shared scheduler. One min-heap ordered by next execution time
/// drives every interval, debounce, and delayed-repeat formation.
pub struct TimeKeeper {
    stores: Arc<Stores>,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    sequence: AtomicU64,
    cancel: CancellationToken,
    fire: AsyncMutex<Option<FireCallback>>,
}

impl TimeKeeper {
    pub fn new(stores: Arc<Stores>) -> Self {
        Self {
            stores,
            heap: Mutex::new(BinaryHeap::new()),
            sequence: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            fire: AsyncMutex::new(None),
        }
    }

    pub async fn set_fire_callback(&self, callback: FireCallback) {
        *self.fire.lock().await = Some(callback);
    }

    /// Schedule a new formation: writes it into the shared store and pushes
    /// its deadline onto the heap.
    pub async fn schedule(
        &self,
        id: String,
        channel_id: String,
        next_execution_ms: Timestamp,
        interval_ms: u64,
        remaining_repeats: Option<u64>,
        kind: FormationKind,
        generation: u64,
    ) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let formation = TimerFormation {
            id: id.clone(),
            channel_id,
            next_execution_ms,
            interval_ms,
            remaining_repeats,
            is_active: true,
            status: FormationStatus::Active,
            execution_count: 0,
            kind,
            generation,
            push_sequence: sequence,
        };
        self.stores.set_formation(formation).await;
        self.push(id, next_execution_ms, sequence);
    }

    fn push(&self, formation_id: String, next_execution_ms: Timestamp, sequence: u64) {
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(HeapEntry { next_execution_ms, sequence, formation_id });
    }

    pub async fn pause(&self, id: &str) {
        if let Some(mut formation) = self.stores.get_formation(id).await {
            formation.is_active = false;
            formation.status = FormationStatus::Paused;
            self.stores.set_formation(formation).await;
        }
    }

    pub async fn resume(&self, id: &str, now_ms: Timestamp) {
        if let Some(mut formation) = self.stores.get_formation(id).await {
            if formation.status != FormationStatus::Paused {
                return;
            }
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
            formation.is_active = true;
            formation.status = FormationStatus::Active;
            formation.next_execution_ms = now_ms + formation.interval_ms as i64;
            formation.push_sequence = sequence;
            self.stores.set_formation(formation.clone()).await;
            self.push(id.to_string(), formation.next_execution_ms, sequence);
        }
    }

    pub async fn cancel(&self, id: &str) {
        self.stores.forget_formation(id).await;
    }

    pub async fn status(&self, id: &str) -> Option<FormationStatus> {
        self.stores.get_formation(id).await.map(|f| f.status)
    }

    /// Drain and fire every due formation as of `now_ms`, rescheduling those
    /// with repeats remaining. Each fire runs as its own task in `join_set`
    /// so a slow handler can't stall another formation's deadline.
    async fn drain_due(&self, now_ms: Timestamp, join_set: &mut JoinSet<()>) {
        loop {
            let due = {
                let mut heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
                match heap.peek() {
                    Some(top) if top.next_execution_ms <= now_ms => heap.pop(),
                    _ => None,
                }
            };
            let Some(entry) = due else { break };

            let Some(mut formation) = self.stores.get_formation(&entry.formation_id).await else {
                continue;
            };
            // A formation rescheduled since this entry was pushed (e.g. a
            // debounce gate re-armed by a later call) leaves its old heap
            // entry behind; the sequence stamp tells them apart.
            if entry.sequence != formation.push_sequence {
                continue;
            }
            if !formation.is_active || formation.status != FormationStatus::Active {
                continue;
            }

            formation.execution_count += 1;
            let should_continue = match formation.remaining_repeats {
                Some(0) => false,
                Some(n) => {
                    formation.remaining_repeats = Some(n - 1);
                    n - 1 > 0
                }
                None => true,
            };

            let fire = self.fire.lock().await.clone();
            let channel_id = formation.channel_id.clone();
            let formation_id = formation.id.clone();
            let generation = formation.generation;
            if let Some(fire) = fire {
                join_set.spawn(fire(formation_id, channel_id, generation));
            }

            if should_continue {
                let next_ms = now_ms + formation.interval_ms.max(1) as i64;
                let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
                formation.next_execution_ms = next_ms;
                formation.push_sequence = sequence;
                self.stores.set_formation(formation).await;
                self.push(entry.formation_id, next_ms, sequence);
            } else {
                formation.status = FormationStatus::Completed;
                formation.is_active = false;
                self.stores.set_formation(formation).await;
            }
        }
    }

    /// Run the tick loop until `shutdown()` is called. `rate_ms` is polled
    /// fresh before every sleep rather than fixed once, so the breathing
    /// controller's pattern can stretch or relax the loop's own cadence
    /// without tearing the scheduler down.
    pub async fn run(
        self: Arc<Self>,
        rate_ms: impl Fn() -> u64 + Send + Sync + 'static,
        clock: impl Fn() -> Timestamp + Send + Sync + 'static,
    ) {
        let mut join_set = JoinSet::new();
        loop {
            let sleep = tokio::time::sleep(Duration::from_millis(rate_ms().max(1)));
            tokio::select! {
                _ = sleep => {
                    let now = clock();
                    self.drain_due(now, &mut join_set).await;
                    while join_set.try_join_next().is_some() {}
                }
                _ = self.cancel.cancelled() => {
                    let now = clock();
                    self.drain_due(now, &mut join_set).await;
                    while join_set.join_next().await.is_some() {}
                    break;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_schedule_and_drain_single_shot() {
        let stores = Arc::new(Stores::new());
        let tk = TimeKeeper::new(stores);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        tk.set_fire_callback(Arc::new(move |_fid, _cid, _gen| {
            let fired = fired_clone.clone();
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .await;

        tk.schedule("f1".into(), "c1".into(), 100, 0, Some(1), FormationKind::Orchestration, 0)
            .await;

        let mut join_set = JoinSet::new();
        tk.drain_due(50, &mut join_set).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tk.drain_due(100, &mut join_set).await;
        while join_set.join_next().await.is_some() {}
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        assert_eq!(tk.status("f1").await, Some(FormationStatus::Completed));
    }

    #[tokio::test]
    async fn test_interval_formation_reschedules_until_exhausted() {
        let stores = Arc::new(Stores::new());
        let tk = TimeKeeper::new(stores);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        tk.set_fire_callback(Arc::new(move |_fid, _cid, _gen| {
            let fired = fired_clone.clone();
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .await;

        tk.schedule("f2".into(), "c2".into(), 10, 10, Some(3), FormationKind::Interval, 0)
            .await;

        let mut join_set = JoinSet::new();
        for t in [10, 20, 30] {
            tk.drain_due(t, &mut join_set).await;
            while join_set.join_next().await.is_some() {}
        }
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        assert_eq!(tk.status("f2").await, Some(FormationStatus::Completed));
    }

    #[tokio::test]
    async fn test_pause_prevents_firing_until_resumed() {
        let stores = Arc::new(Stores::new());
        let tk = TimeKeeper::new(stores);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        tk.set_fire_callback(Arc::new(move |_fid, _cid, _gen| {
            let fired = fired_clone.clone();
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        }))
        .await;

        tk.schedule("f3".into(), "c3".into(), 10, 0, Some(1), FormationKind::Orchestration, 0)
            .await;
        tk.pause("f3").await;

        let mut join_set = JoinSet::new();
        tk.drain_due(10, &mut join_set).await;
        while join_set.join_next().await.is_some() {}
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_formation_from_store() {
        let stores = Arc::new(Stores::new());
        let tk = TimeKeeper::new(stores);
        tk.schedule("f4".into(), "c4".into(), 10, 0, Some(1), FormationKind::Orchestration, 0)
            .await;
        tk.cancel("f4").await;
        assert_eq!(tk.status("f4").await, None);
    }
}
