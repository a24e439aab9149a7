use shared::models::node::NodeStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

type Observer = Arc<dyn Fn(&NodeStatus) + Send + Sync>;

/// Owner of the live [`NodeStatus`]. Observers only ever see snapshots.
pub struct StatusBoard {
    status: Mutex<NodeStatus>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(NodeStatus::default()),
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> NodeStatus {
        lock(&self.status).clone()
    }

    /// Builds the next status from a copy of the current one, swaps it in and
    /// notifies every observer with the new snapshot.
    pub fn update(&self, change: impl FnOnce(&mut NodeStatus)) -> NodeStatus {
        let next = {
            let mut status = lock(&self.status);
            let mut next = status.clone();
            change(&mut next);
            *status = next.clone();
            next
        };
        self.notify(&next);
        next
    }

    fn notify(&self, status: &NodeStatus) {
        // Observers may subscribe or unsubscribe while being notified.
        let observers: Vec<Observer> = lock(&self.observers)
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer(status);
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        observer: impl Fn(&NodeStatus) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.observers).push((id, Arc::new(observer)));
        Subscription {
            id,
            board: Arc::downgrade(self),
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }

    fn remove(&self, id: u64) {
        lock(&self.observers).retain(|(observer_id, _)| *observer_id != id);
    }
}

/// Handle returned by [`StatusBoard::subscribe`]. Dropping it keeps the
/// observer registered.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: u64,
    board: Weak<StatusBoard>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(board) = self.board.upgrade() {
            board.remove(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::node::NodeState;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn observers_receive_snapshots() {
        let board = StatusBoard::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        board.subscribe(move |status| sink.lock().unwrap().push(status.status));

        board.update(|s| s.status = NodeState::Starting);
        board.update(|s| s.status = NodeState::Running);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![NodeState::Starting, NodeState::Running]
        );
        assert_eq!(board.snapshot().status, NodeState::Running);
    }

    #[test]
    fn unsubscribe_from_inside_callback() {
        let board = StatusBoard::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let counter = calls.clone();
        let own = slot.clone();
        let subscription = board.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(subscription) = own.lock().unwrap().take() {
                subscription.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(subscription);
        let other = board.subscribe(|_| {});

        board.update(|s| s.peer_count = 1);
        board.update(|s| s.peer_count = 2);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(board.observer_count(), 1);
        other.unsubscribe();
        assert_eq!(board.observer_count(), 0);
    }
}
