//! Bounded, keyed set of background tasks.
//!
//! Used where each discovered item (a pending contract, say) gets its own
//! task. Membership and completion live in the same map, so a key that is
//! running or already done is never spawned twice, and the semaphore caps
//! how many run at once. A key whose task failed may be submitted again.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, warn, Instrument, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned,
    /// The key is running or has completed.
    AlreadyTracked,
    /// Every slot is busy; try again later.
    AtCapacity,
}

pub struct KeyedTaskSet<K> {
    permits: Arc<Semaphore>,
    states: Arc<Mutex<HashMap<K, TaskState>>>,
    span: Span,
}

impl<K> KeyedTaskSet<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(max_concurrent: usize, span: Span) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            states: Arc::new(Mutex::new(HashMap::new())),
            span,
        }
    }

    /// Spawn `fut` under `key` unless the key is tracked or no slot is free.
    pub fn try_spawn<F, E>(&self, key: K, fut: F) -> SpawnOutcome
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let mut states = self.states.lock();
        if matches!(states.get(&key), Some(TaskState::Running) | Some(TaskState::Done)) {
            return SpawnOutcome::AlreadyTracked;
        }
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(p) => p,
            Err(_) => return SpawnOutcome::AtCapacity,
        };
        states.insert(key.clone(), TaskState::Running);
        drop(states);

        let states = Arc::clone(&self.states);
        tokio::spawn(
            async move {
                let outcome = match fut.await {
                    Ok(()) => {
                        debug!("task {:?} done", key);
                        TaskState::Done
                    }
                    Err(e) => {
                        warn!("task {:?} failed: {}", key, e);
                        TaskState::Failed
                    }
                };
                states.lock().insert(key, outcome);
                drop(permit);
            }
            .instrument(self.span.clone()),
        );
        SpawnOutcome::Spawned
    }

    pub fn state(&self, key: &K) -> Option<TaskState> {
        self.states.lock().get(key).copied()
    }

    pub fn running(&self) -> usize {
        self.states
            .lock()
            .values()
            .filter(|s| **s == TaskState::Running)
            .count()
    }

    /// Stop tracking `key` so it can be spawned again.
    pub fn forget(&self, key: &K) {
        self.states.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_key_spawned_once_while_running_and_after_done() {
        let set = KeyedTaskSet::<String>::new(4, Span::none());
        let (tx, rx) = oneshot::channel::<()>();

        let first = set.try_spawn("c1".to_string(), async move {
            let _ = rx.await;
            Ok::<(), String>(())
        });
        assert_eq!(first, SpawnOutcome::Spawned);
        assert_eq!(set.try_spawn("c1".to_string(), async { Ok::<(), String>(()) }), SpawnOutcome::AlreadyTracked);
        assert_eq!(set.running(), 1);

        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(set.state(&"c1".to_string()), Some(TaskState::Done));
        assert_eq!(set.try_spawn("c1".to_string(), async { Ok::<(), String>(()) }), SpawnOutcome::AlreadyTracked);
    }

    #[tokio::test]
    async fn test_failed_key_can_be_resubmitted() {
        let set = KeyedTaskSet::<u32>::new(1, Span::none());
        set.try_spawn(1, async { Err::<(), String>("boom".to_string()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(set.state(&1), Some(TaskState::Failed));
        assert_eq!(set.try_spawn(1, async { Ok::<(), String>(()) }), SpawnOutcome::Spawned);
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let set = KeyedTaskSet::<u32>::new(1, Span::none());
        let (_tx, rx) = oneshot::channel::<()>();
        set.try_spawn(1, async move {
            let _ = rx.await;
            Ok::<(), String>(())
        });
        assert_eq!(set.try_spawn(2, async { Ok::<(), String>(()) }), SpawnOutcome::AtCapacity);
        assert_eq!(set.state(&2), None);
    }
}
