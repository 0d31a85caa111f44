use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::core::lifecycle::Lifecycle;
use crate::core::queue::{Queue, QueueLimits};

/// [`QueueRegistry`] maps queue names to queues for one engine.
///
/// Uses DashMap internally so concurrent first references to the same name
/// resolve to a single queue, without a lock spanning unrelated queues.
#[derive(Debug)]
pub struct QueueRegistry {
    queues: DashMap<String, Arc<Queue>>,
    limits: QueueLimits,
    lifecycle: Arc<Lifecycle>,
}

impl QueueRegistry {
    pub fn new(limits: QueueLimits, lifecycle: Arc<Lifecycle>) -> Self {
        Self {
            queues: DashMap::new(),
            limits,
            lifecycle,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|entry| Arc::clone(&*entry))
    }

    /// Returns an existing queue or creates it if it doesn't exist.
    pub fn get_or_create(&self, name: &str) -> Arc<Queue> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        self.queues
            .entry(name.to_owned())
            .or_insert_with(|| {
                debug!(queue = name, "creating queue");
                Arc::new(Queue::new(
                    name,
                    self.limits,
                    Arc::clone(&self.lifecycle),
                ))
            })
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Releases every parked consumer in every queue with "no message".
    pub fn close_waiters(&self) -> usize {
        let queues: Vec<Arc<Queue>> = self.queues.iter().map(|e| Arc::clone(e.value())).collect();
        queues.iter().map(|q| q.close_waiters()).sum()
    }

    /// Drops every queue and everything they hold.
    pub fn clear(&self) {
        self.queues.clear();
    }
}
