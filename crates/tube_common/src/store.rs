//! Learning state store - the single writable copy of a learner's state.
//!
//! `dispatch` runs the progression engine, stamps `last_updated`, swaps in the
//! new snapshot and notifies subscribers synchronously, in subscription order.
//! Snapshots are immutable `Arc`s; readers never see a half-applied change.
//!
//! Notifications go through an outbox so that a subscriber which dispatches
//! from inside its callback does not reorder delivery: the nested snapshot is
//! delivered to everyone after the current round finishes.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, error, warn};

use crate::config::ProgressionConfig;
use crate::error::Result;
use crate::progression;
use crate::types::{now_millis, CompletionEvent, LearningState};

/// Changes the store accepts
#[derive(Debug, Clone)]
pub enum StoreAction {
    /// A finished exercise set
    Complete(CompletionEvent),
    /// Explicit rotation move
    CycleSlot { from: u8, to: u8 },
    /// Rotate from the active slot to the next one
    Advance,
    /// Replace the whole state (reload from storage)
    Hydrate(LearningState),
    /// Zero the session points, keeping lifetime points
    ResetSession,
}

type Listener = Arc<dyn Fn(&Arc<LearningState>) + Send + Sync>;

struct Delivery {
    queue: VecDeque<Arc<LearningState>>,
    delivering: bool,
}

struct StoreInner {
    rules: ProgressionConfig,
    state: RwLock<Arc<LearningState>>,
    dispatch_lock: Mutex<()>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    delivery: Mutex<Delivery>,
}

/// Handle returned by [`LearningStateStore::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to stop receiving snapshots.
pub struct Subscription {
    id: u64,
    store: Weak<StoreInner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            lock(&inner.listeners).retain(|(id, _)| *id != self.id);
            debug!(subscription = self.id, "Unsubscribed");
        }
    }
}

/// Cheaply cloneable handle to one learner's store
#[derive(Clone)]
pub struct LearningStateStore {
    inner: Arc<StoreInner>,
}

impl LearningStateStore {
    /// Create a store holding `initial`, normalized
    pub fn new(initial: LearningState, rules: ProgressionConfig) -> Self {
        let (state, repairs) = progression::normalize_with_report(&initial, &rules);
        if !repairs.is_empty() {
            warn!(user_id = %state.user_id, ?repairs, "Repaired learning state on load");
        }
        Self {
            inner: Arc::new(StoreInner {
                rules,
                state: RwLock::new(Arc::new(state)),
                dispatch_lock: Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                delivery: Mutex::new(Delivery {
                    queue: VecDeque::new(),
                    delivering: false,
                }),
            }),
        }
    }

    /// Current snapshot. Repeated calls without a dispatch return the same `Arc`.
    pub fn get_state(&self) -> Arc<LearningState> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn rules(&self) -> &ProgressionConfig {
        &self.inner.rules
    }

    /// Apply an action and notify subscribers.
    ///
    /// On error the state is untouched and nobody is notified.
    pub fn dispatch(&self, action: StoreAction) -> Result<Arc<LearningState>> {
        let snapshot = {
            let _serial = lock(&self.inner.dispatch_lock);
            let current = self.get_state();
            let rules = &self.inner.rules;

            let mut next = match action {
                StoreAction::Complete(event) => progression::apply(&current, &event, rules)?,
                StoreAction::CycleSlot { from, to } => {
                    progression::cycle_slot(&current, from, to, rules)?
                }
                StoreAction::Advance => progression::advance(&current, rules)?,
                StoreAction::Hydrate(loaded) => {
                    let (state, repairs) = progression::normalize_with_report(&loaded, rules);
                    if !repairs.is_empty() {
                        warn!(user_id = %state.user_id, ?repairs, "Repaired learning state on hydrate");
                    }
                    state
                }
                StoreAction::ResetSession => {
                    let mut state = (*current).clone();
                    state.points.session = 0;
                    state
                }
            };

            next.last_updated = now_millis().max(current.last_updated);
            let next = Arc::new(next);
            *self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Arc::clone(&next);
            lock(&self.inner.delivery).queue.push_back(Arc::clone(&next));
            next
        };

        self.drain();
        Ok(snapshot)
    }

    /// Register a listener called with every new snapshot
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Arc<LearningState>) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        debug!(subscription = id, "Subscribed");
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    fn drain(&self) {
        {
            let mut delivery = lock(&self.inner.delivery);
            if delivery.delivering {
                // an outer dispatch is mid-round and will pick this up
                return;
            }
            delivery.delivering = true;
        }

        loop {
            let next = {
                let mut delivery = lock(&self.inner.delivery);
                match delivery.queue.pop_front() {
                    Some(snapshot) => snapshot,
                    None => {
                        delivery.delivering = false;
                        return;
                    }
                }
            };
            self.notify(&next);
        }
    }

    fn notify(&self, snapshot: &Arc<LearningState>) {
        let listeners: Vec<(u64, Listener)> = lock(&self.inner.listeners).clone();
        for (id, listener) in listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(snapshot)));
            if outcome.is_err() {
                error!(subscription = id, "Subscriber panicked; continuing delivery");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SlotNumber;

    fn store() -> LearningStateStore {
        let rules = ProgressionConfig::default();
        let state = LearningState::with_threads("u1", &rules.default_threads, 3, 3);
        LearningStateStore::new(state, rules)
    }

    #[test]
    fn test_get_state_is_stable_between_dispatches() {
        let store = store();
        let a = store.get_state();
        let b = store.get_state();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejected_action_does_not_notify() {
        let store = store();
        let calls = Arc::new(AtomicU64::new(0));
        let c = Arc::clone(&calls);
        let _sub = store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let before = store.get_state();
        assert!(store.dispatch(StoreAction::CycleSlot { from: 1, to: 7 }).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(Arc::ptr_eq(&before, &store.get_state()));
    }

    #[test]
    fn test_reset_session_keeps_lifetime() {
        let store = store();
        let state = store.get_state();
        let slot = state.slot(SlotNumber::FIRST).unwrap();
        store
            .dispatch(StoreAction::Complete(CompletionEvent {
                slot: 1,
                thread_id: slot.thread_id.clone(),
                unit_id: slot.current_unit_id.clone(),
                correct_count: 4,
                total_count: 10,
                timestamp: 0,
            }))
            .unwrap();
        let after = store.dispatch(StoreAction::ResetSession).unwrap();
        assert_eq!(after.points.session, 0);
        assert_eq!(after.points.lifetime, 12);
    }
}
