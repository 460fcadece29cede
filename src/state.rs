//! Tail-change notification for asynchronous dequeuers.
//!
//! The monitor publishes an immutable [`QueueState`] snapshot of the current
//! tail index. Each snapshot resolves exactly once to its successor, so the
//! states form a singly-linked chain: a dequeuer captures the current state,
//! awaits `next_update` until enough items are visible, and walks the chain
//! without ever taking the writer's lock. One update releases every waiter
//! parked on the old state.

use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio::sync::Notify;

/// Immutable snapshot of the queue tail, plus a slot for the next snapshot.
pub struct QueueState {
    tail_index: u64,
    next: OnceLock<Arc<QueueState>>,
    notify: Notify,
}

impl QueueState {
    fn new(tail_index: u64) -> Self {
        Self {
            tail_index,
            next: OnceLock::new(),
            notify: Notify::new(),
        }
    }

    /// Tail index at the time this snapshot was published.
    pub fn tail_index(&self) -> u64 {
        self.tail_index
    }

    /// Waits for the successor snapshot. Returns immediately if this state
    /// has already been superseded; otherwise suspends until it is.
    pub async fn next_update(&self) -> Arc<QueueState> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before checking, so a resolve between the check and
            // the await cannot be missed
            notified.as_mut().enable();
            if let Some(next) = self.next.get() {
                return Arc::clone(next);
            }
            notified.await;
        }
    }

    /// Publishes the successor. The first resolution wins; repeats are
    /// no-ops and never re-deliver.
    pub(crate) fn resolve(&self, next: Arc<QueueState>) {
        let _ = self.next.set(next);
        self.notify.notify_waiters();
    }
}

pub struct QueueStateMonitor {
    current: RwLock<Arc<QueueState>>,
}

impl QueueStateMonitor {
    pub fn new(tail_index: u64) -> Self {
        Self {
            current: RwLock::new(Arc::new(QueueState::new(tail_index))),
        }
    }

    /// The live snapshot; never blocks waiters.
    pub fn current(&self) -> Arc<QueueState> {
        Arc::clone(&self.current.read())
    }

    /// Swaps in a snapshot for `new_tail_index` and releases everyone
    /// waiting on the previous one.
    pub fn update(&self, new_tail_index: u64) {
        let new_state = Arc::new(QueueState::new(new_tail_index));
        let old_state = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, Arc::clone(&new_state))
        };
        old_state.resolve(new_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn current_reflects_initial_tail() {
        let monitor = QueueStateMonitor::new(5);
        assert_eq!(monitor.current().tail_index(), 5);
    }

    #[tokio::test]
    async fn update_resolves_waiter() {
        let monitor = Arc::new(QueueStateMonitor::new(0));
        let state = monitor.current();

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.next_update().await.tail_index() })
        };

        tokio::task::yield_now().await;
        monitor.update(1);

        assert_eq!(waiter.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn all_waiters_observe_the_same_successor() {
        let monitor = Arc::new(QueueStateMonitor::new(0));
        let state = monitor.current();

        let waiters: Vec<_> = (0..10)
            .map(|_| {
                let state = Arc::clone(&state);
                tokio::spawn(async move { state.next_update().await.tail_index() })
            })
            .collect();

        tokio::task::yield_now().await;
        monitor.update(3);

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), 3);
        }
    }

    #[tokio::test]
    async fn next_update_after_resolution_returns_immediately() {
        let monitor = QueueStateMonitor::new(0);
        let state = monitor.current();
        monitor.update(1);

        let next = tokio::time::timeout(Duration::from_millis(100), state.next_update())
            .await
            .expect("already resolved");
        assert_eq!(next.tail_index(), 1);
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let state = Arc::new(QueueState::new(0));
        state.resolve(Arc::new(QueueState::new(1)));
        state.resolve(Arc::new(QueueState::new(2)));

        assert_eq!(state.next_update().await.tail_index(), 1);
    }

    #[tokio::test]
    async fn waiter_can_walk_the_chain() {
        let monitor = Arc::new(QueueStateMonitor::new(0));
        let state = monitor.current();

        let walker = tokio::spawn(async move {
            let mut state = state;
            let mut seen = Vec::new();
            while state.tail_index() < 3 {
                state = state.next_update().await;
                seen.push(state.tail_index());
            }
            seen
        });

        for tail in 1..=3 {
            tokio::task::yield_now().await;
            monitor.update(tail);
        }

        assert_eq!(walker.await.unwrap(), vec![1, 2, 3]);
    }
}
