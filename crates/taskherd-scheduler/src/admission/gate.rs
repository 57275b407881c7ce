//! Keyed admission gate.
//!
//! The [`ConcurrencyGate`] caps how many tasks of one resource class (a
//! concurrency key such as `anthropic/claude-sonnet` or an agent name) may hold
//! a slot at once. Each bounded key is backed by its own fair
//! [`Semaphore`], so a released slot goes to the earliest waiter and admission
//! per key is strictly arrival-ordered.
//!
//! [`acquire`](ConcurrencyGate::acquire) hands out an [`AdmissionPermit`].
//! Dropping the permit gives the slot back; [`AdmissionPermit::forget`] moves
//! ownership to whoever will later call [`release`](ConcurrencyGate::release).

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use taskherd_core::SchedulerConfig;
use tokio::sync::Semaphore;
use tracing::{debug, info};

enum KeySlots {
    Bounded {
        semaphore: Arc<Semaphore>,
        capacity: usize,
    },
    Unbounded {
        held: usize,
    },
}

impl KeySlots {
    fn new(capacity: Option<usize>) -> Self {
        match capacity {
            Some(capacity) => Self::Bounded {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
            },
            None => Self::Unbounded { held: 0 },
        }
    }

    fn held(&self) -> usize {
        match self {
            Self::Bounded {
                semaphore,
                capacity,
            } => capacity.saturating_sub(semaphore.available_permits()),
            Self::Unbounded { held } => *held,
        }
    }

    /// Parked callers. Every in-flight `acquire` owns one semaphore clone.
    fn waiting(&self) -> usize {
        match self {
            Self::Bounded { semaphore, .. } => Arc::strong_count(semaphore) - 1,
            Self::Unbounded { .. } => 0,
        }
    }
}

/// Keyed semaphore with per-key capacity and FIFO waiters.
pub struct ConcurrencyGate {
    config: SchedulerConfig,
    keys: Mutex<HashMap<String, KeySlots>>,
}

impl ConcurrencyGate {
    /// Create a gate whose capacities come from `config`.
    pub fn new(config: SchedulerConfig) -> Self {
        info!(
            default_concurrency = config.default_concurrency,
            model_limits = config.model_concurrency.len(),
            provider_limits = config.provider_concurrency.len(),
            "ConcurrencyGate created"
        );
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Create a gate where every key shares the same capacity (0 = unlimited).
    pub fn with_default_capacity(capacity: usize) -> Self {
        Self::new(SchedulerConfig {
            default_concurrency: capacity,
            ..SchedulerConfig::default()
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, KeySlots>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Capacity for `key`, `None` when unlimited.
    pub fn capacity(&self, key: &str) -> Option<usize> {
        self.config.capacity_for(key)
    }

    /// Acquire a slot for `key`, waiting until one becomes available.
    ///
    /// Never fails. Cancel-safe: dropping the future while it waits leaves
    /// the queue, and dropping the returned permit gives the slot back.
    pub async fn acquire(&self, key: &str) -> AdmissionPermit<'_> {
        loop {
            let semaphore = {
                let mut keys = self.lock();
                match keys
                    .entry(key.to_string())
                    .or_insert_with(|| KeySlots::new(self.capacity(key)))
                {
                    KeySlots::Unbounded { held } => {
                        *held += 1;
                        debug!(key, held = *held, "Concurrency slot acquired");
                        return AdmissionPermit::new(self, key);
                    }
                    KeySlots::Bounded { semaphore, .. } => Arc::clone(semaphore),
                }
            };

            if semaphore.available_permits() == 0 {
                debug!(key, "Waiting for concurrency slot");
            }
            if let Ok(permit) = semaphore.acquire_owned().await {
                // The slot now lives in the semaphore's count until `release`.
                permit.forget();
                debug!(key, "Concurrency slot acquired");
                return AdmissionPermit::new(self, key);
            }
            // Closed by `clear()`: compete again for a fresh slot.
        }
    }

    /// Release one slot for `key`.
    ///
    /// The earliest waiter, if any, takes the slot over. A no-op when nothing
    /// is held.
    pub fn release(&self, key: &str) {
        let mut keys = self.lock();
        let Some(slots) = keys.get_mut(key) else {
            return;
        };
        if slots.held() == 0 {
            return;
        }

        match slots {
            KeySlots::Bounded { semaphore, .. } => semaphore.add_permits(1),
            KeySlots::Unbounded { held } => *held -= 1,
        }
        let held = slots.held();
        debug!(key, held, "Concurrency slot released");
        if held == 0 && slots.waiting() == 0 {
            keys.remove(key);
        }
    }

    /// Number of slots currently held for `key`.
    pub fn count(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, KeySlots::held)
    }

    /// Number of callers currently waiting on `key`.
    pub fn queue_len(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, KeySlots::waiting)
    }

    /// Forget every key. Parked callers wake up and compete for fresh slots.
    pub fn clear(&self) {
        let dropped = std::mem::take(&mut *self.lock());
        for slots in dropped.values() {
            if let KeySlots::Bounded { semaphore, .. } = slots {
                semaphore.close();
            }
        }
        debug!(keys = dropped.len(), "ConcurrencyGate cleared");
    }
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

/// A held slot for one key. Released on drop unless [`forget`](Self::forget)
/// was called.
#[must_use = "dropping the permit releases the slot immediately"]
pub struct AdmissionPermit<'a> {
    gate: &'a ConcurrencyGate,
    key: String,
    armed: bool,
}

impl<'a> AdmissionPermit<'a> {
    fn new(gate: &'a ConcurrencyGate, key: &str) -> Self {
        Self {
            gate,
            key: key.to_string(),
            armed: true,
        }
    }

    /// The key this permit holds a slot for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Keep the slot held after the permit is gone. The holder becomes
    /// responsible for calling [`ConcurrencyGate::release`] with the key.
    pub fn forget(mut self) {
        self.armed = false;
    }
}

impl Drop for AdmissionPermit<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(key = %self.key, "Admission permit dropped before hand-over");
            self.gate.release(&self.key);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    async fn wait_for_queue(gate: &ConcurrencyGate, key: &str, len: usize) {
        for _ in 0..1000 {
            if gate.queue_len(key) == len {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue for {key} never reached {len}");
    }

    #[tokio::test]
    async fn acquire_within_capacity_does_not_wait() {
        let gate = ConcurrencyGate::with_default_capacity(2);
        let _a = gate.acquire("k").await;
        let _b = gate.acquire("k").await;
        assert_eq!(gate.count("k"), 2);
    }

    #[tokio::test]
    async fn dropping_the_permit_gives_the_slot_back() {
        let gate = ConcurrencyGate::with_default_capacity(1);
        let permit = gate.acquire("k").await;
        assert_eq!(permit.key(), "k");
        assert_eq!(gate.count("k"), 1);
        drop(permit);
        assert_eq!(gate.count("k"), 0);
    }

    #[tokio::test]
    async fn forgotten_permit_holds_until_release() {
        let gate = ConcurrencyGate::with_default_capacity(1);
        gate.acquire("k").await.forget();
        assert_eq!(gate.count("k"), 1);
        gate.release("k");
        assert_eq!(gate.count("k"), 0);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let gate = ConcurrencyGate::with_default_capacity(1);
        let _a = gate.acquire("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), gate.acquire("b"))
            .await
            .expect("other key must not be blocked");
        assert_eq!(gate.count("a"), 1);
        assert_eq!(gate.count("b"), 1);
    }

    #[tokio::test]
    async fn over_capacity_waits_until_release() {
        let gate = Arc::new(ConcurrencyGate::with_default_capacity(1));
        gate.acquire("k").await.forget();

        let g = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            g.acquire("k").await.forget();
        });
        wait_for_queue(&gate, "k", 1).await;
        assert!(!handle.is_finished());

        gate.release("k");
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("waiter should resolve after release")
            .unwrap();
        assert_eq!(gate.count("k"), 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_arrival_order() {
        let gate = Arc::new(ConcurrencyGate::with_default_capacity(1));
        gate.acquire("k").await.forget();

        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..3 {
            let g = Arc::clone(&gate);
            let tx = tx.clone();
            tokio::spawn(async move {
                g.acquire("k").await.forget();
                tx.send(i).unwrap();
            });
            wait_for_queue(&gate, "k", i + 1).await;
        }

        for expected in 0..3 {
            gate.release("k");
            let got = tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn release_never_goes_negative() {
        let gate = ConcurrencyGate::with_default_capacity(2);
        gate.release("k");
        assert_eq!(gate.count("k"), 0);

        gate.acquire("k").await.forget();
        gate.release("k");
        gate.release("k");
        assert_eq!(gate.count("k"), 0);

        let _permit = gate.acquire("k").await;
        assert_eq!(gate.count("k"), 1);
    }

    #[tokio::test]
    async fn abandoned_waiter_leaves_the_queue() {
        let gate = Arc::new(ConcurrencyGate::with_default_capacity(1));
        gate.acquire("k").await.forget();

        let g = Arc::clone(&gate);
        let abandoned = tokio::spawn(async move {
            g.acquire("k").await.forget();
        });
        wait_for_queue(&gate, "k", 1).await;
        abandoned.abort();
        let _ = abandoned.await;
        assert_eq!(gate.queue_len("k"), 0);

        gate.release("k");
        assert_eq!(gate.count("k"), 0);
    }

    #[tokio::test]
    async fn timed_out_acquire_does_not_leak_a_slot() {
        let gate = ConcurrencyGate::with_default_capacity(1);
        let held = gate.acquire("k").await;

        let attempt = tokio::time::timeout(Duration::from_millis(20), gate.acquire("k")).await;
        assert!(attempt.is_err());
        assert_eq!(gate.count("k"), 1);

        drop(held);
        assert_eq!(gate.count("k"), 0);
        let _again = tokio::time::timeout(Duration::from_millis(100), gate.acquire("k"))
            .await
            .expect("slot must be free again");
    }

    #[tokio::test]
    async fn unlimited_key_never_blocks() {
        let gate = ConcurrencyGate::with_default_capacity(0);
        for _ in 0..50 {
            gate.acquire("k").await.forget();
        }
        assert_eq!(gate.count("k"), 50);
        assert_eq!(gate.capacity("k"), None);

        let permit = gate.acquire("k").await;
        drop(permit);
        assert_eq!(gate.count("k"), 50);
    }

    #[tokio::test]
    async fn clear_wakes_waiters_to_recompete() {
        let gate = Arc::new(ConcurrencyGate::with_default_capacity(1));
        gate.acquire("k").await.forget();

        let g = Arc::clone(&gate);
        let handle = tokio::spawn(async move {
            g.acquire("k").await.forget();
        });
        wait_for_queue(&gate, "k", 1).await;

        gate.clear();
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("waiter should take a fresh slot after clear")
            .unwrap();
        assert_eq!(gate.count("k"), 1);
    }
}
