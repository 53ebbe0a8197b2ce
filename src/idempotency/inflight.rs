//! In-flight request coordination.
//!
//! Each key is either absent or held by exactly one owner. The owner holds an
//! [`InFlightGuard`]; dropping it (normal completion, early return, panic, or
//! cancellation of the owning future) releases the key and wakes every waiter
//! through a per-slot `watch` channel. Waiters also re-check on a fixed
//! interval and give up on an owner whose lease deadline has passed, so a hung
//! owner delays duplicates by at most `lease` rather than forever.
//!
//! Slots carry a generation id. A guard only ever removes the slot it created;
//! once a lease has been force-released and re-granted, the stale guard's drop
//! is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::CacheKey;

struct Slot {
    id: u64,
    deadline: Instant,
    released: watch::Receiver<()>,
}

/// Tracks which keys currently have a request executing.
pub struct InFlightCoordinator {
    slots: Mutex<HashMap<CacheKey, Slot>>,
    lease: Duration,
    next_id: AtomicU64,
}

/// Result of [`InFlightCoordinator::try_acquire`].
pub enum Admission<'a> {
    /// The caller owns the key and must run the handler.
    Owner(InFlightGuard<'a>),
    /// Another request owns the key; wait, then re-evaluate.
    Busy(Waiter<'a>),
}

/// How a [`Waiter`] stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The owner released the key.
    Released,
    /// The owner's lease ran out and its slot was force-released.
    Expired,
}

impl InFlightCoordinator {
    pub fn new(lease: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            lease,
            next_id: AtomicU64::new(1),
        }
    }

    /// Claims `key`, or returns a [`Waiter`] on its current owner.
    ///
    /// A slot whose lease deadline has passed is treated as absent.
    pub fn try_acquire(&self, key: &CacheKey) -> Admission<'_> {
        let mut slots = self.slots.lock();
        let now = Instant::now();

        if let Some(slot) = slots.get(key) {
            if slot.deadline > now {
                return Admission::Busy(Waiter {
                    coordinator: self,
                    key: key.clone(),
                    id: slot.id,
                    deadline: slot.deadline,
                    released: slot.released.clone(),
                });
            }
            warn!(%key, stale_owner = slot.id, "in-flight lease expired; admitting a new owner");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (release, released) = watch::channel(());
        slots.insert(
            key.clone(),
            Slot {
                id,
                deadline: now + self.lease,
                released,
            },
        );

        Admission::Owner(InFlightGuard {
            coordinator: self,
            key: key.clone(),
            id,
            _release: release,
        })
    }

    /// Number of keys currently held, including any with an expired lease.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    /// Waits until no key is held, checking every `poll`. Returns `false` if
    /// `timeout` elapses first.
    pub async fn wait_idle(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
    }

    // Removes the slot for `key` only if it still belongs to generation `id`.
    fn remove_if_owned(&self, key: &CacheKey, id: u64) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(key) {
            Some(slot) if slot.id == id => {
                slots.remove(key);
                true
            }
            _ => false,
        }
    }

    fn is_held_by(&self, key: &CacheKey, id: u64) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|slot| slot.id == id)
    }
}

/// Ownership of an in-flight key. Dropping it releases the key.
pub struct InFlightGuard<'a> {
    coordinator: &'a InFlightCoordinator,
    key: CacheKey,
    id: u64,
    // Dropped after `Drop::drop` has removed the slot, which wakes waiters.
    _release: watch::Sender<()>,
}

impl InFlightGuard<'_> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// `false` once the lease has been force-released and the key handed to
    /// another owner.
    pub fn is_current(&self) -> bool {
        self.coordinator.is_held_by(&self.key, self.id)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.coordinator.remove_if_owned(&self.key, self.id) {
            debug!(key = %self.key, "in-flight key released");
        }
    }
}

/// A pending duplicate waiting on the current owner of a key.
///
/// Dropping a waiter (for example when its client disconnects) has no effect
/// on the owner or on other waiters.
pub struct Waiter<'a> {
    coordinator: &'a InFlightCoordinator,
    key: CacheKey,
    id: u64,
    deadline: Instant,
    released: watch::Receiver<()>,
}

impl Waiter<'_> {
    /// Suspends until the owner releases the key or its lease runs out.
    ///
    /// Wakes on the release signal, and in any case at least every
    /// `poll_interval` to re-check the slot.
    pub async fn wait(mut self, poll_interval: Duration) -> WaitOutcome {
        loop {
            let now = Instant::now();
            if now >= self.deadline {
                if self.coordinator.remove_if_owned(&self.key, self.id) {
                    warn!(key = %self.key, owner = self.id, "force-released in-flight key after lease expiry");
                }
                return WaitOutcome::Expired;
            }

            let tick = poll_interval.min(self.deadline - now);
            match tokio::time::timeout(tick, self.released.changed()).await {
                // `changed` errors once the owner's sender is gone, which is the release signal.
                Ok(_) => return WaitOutcome::Released,
                Err(_) if !self.coordinator.is_held_by(&self.key, self.id) => {
                    return WaitOutcome::Released;
                }
                Err(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::idempotency::{RequestIdentity, derive_key};

    const POLL: Duration = Duration::from_millis(100);

    fn key(token: &str) -> CacheKey {
        derive_key(&RequestIdentity::new("POST", "/orders"), token)
    }

    fn expect_owner(admission: Admission<'_>) -> InFlightGuard<'_> {
        match admission {
            Admission::Owner(guard) => guard,
            Admission::Busy(_) => panic!("expected to own the key"),
        }
    }

    fn expect_busy(admission: Admission<'_>) -> Waiter<'_> {
        match admission {
            Admission::Busy(waiter) => waiter,
            Admission::Owner(_) => panic!("expected the key to be busy"),
        }
    }

    #[tokio::test]
    async fn second_acquire_is_busy_until_release() {
        let coordinator = InFlightCoordinator::new(Duration::from_secs(60));
        let guard = expect_owner(coordinator.try_acquire(&key("a")));
        assert!(coordinator.contains(&key("a")));

        let waiter = expect_busy(coordinator.try_acquire(&key("a")));
        // other keys are independent
        let _other = expect_owner(coordinator.try_acquire(&key("b")));

        let (outcome, ()) = tokio::join!(waiter.wait(POLL), async move {
            tokio::task::yield_now().await;
            drop(guard);
        });
        assert_eq!(outcome, WaitOutcome::Released);
        assert!(!coordinator.contains(&key("a")));
        assert_eq!(coordinator.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_wakes_waiter_before_poll_interval() {
        let coordinator = InFlightCoordinator::new(Duration::from_secs(60));
        let guard = expect_owner(coordinator.try_acquire(&key("a")));
        let waiter = expect_busy(coordinator.try_acquire(&key("a")));

        let started = Instant::now();
        let (outcome, ()) = tokio::join!(waiter.wait(Duration::from_secs(30)), async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            drop(guard);
        });
        assert_eq!(outcome, WaitOutcome::Released);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_owner_is_force_released_at_deadline() {
        let coordinator = InFlightCoordinator::new(Duration::from_secs(2));
        let stale = expect_owner(coordinator.try_acquire(&key("a")));
        let waiter = expect_busy(coordinator.try_acquire(&key("a")));

        let started = Instant::now();
        assert_eq!(waiter.wait(POLL).await, WaitOutcome::Expired);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(!coordinator.contains(&key("a")));

        let fresh = expect_owner(coordinator.try_acquire(&key("a")));
        assert!(!stale.is_current());
        assert!(fresh.is_current());
        // the stale owner finishing late must not release its successor
        drop(stale);
        assert!(coordinator.contains(&key("a")));
        drop(fresh);
        assert!(coordinator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_slot_is_replaced_on_acquire() {
        let coordinator = InFlightCoordinator::new(Duration::from_secs(2));
        let _stale = expect_owner(coordinator.try_acquire(&key("a")));
        tokio::time::advance(Duration::from_secs(3)).await;
        let _fresh = expect_owner(coordinator.try_acquire(&key("a")));
        assert_eq!(coordinator.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_owner_untouched() {
        let coordinator = Arc::new(InFlightCoordinator::new(Duration::from_secs(60)));
        let guard = expect_owner(coordinator.try_acquire(&key("a")));

        let waiter = expect_busy(coordinator.try_acquire(&key("a")));
        let cancelled = tokio::time::timeout(Duration::from_millis(20), waiter.wait(POLL)).await;
        assert!(cancelled.is_err());

        assert!(coordinator.contains(&key("a")));
        drop(guard);
        assert!(coordinator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_reports_timeout() {
        let coordinator = InFlightCoordinator::new(Duration::from_secs(60));
        assert!(coordinator.wait_idle(Duration::from_secs(1), POLL).await);

        let _guard = expect_owner(coordinator.try_acquire(&key("a")));
        assert!(!coordinator.wait_idle(Duration::from_secs(1), POLL).await);
    }
}
