use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::queue::{scheduling_order, DurableQueue, QueueError, QueueItem};

/// An in-memory durable queue for testing or local usage.
///
/// Stores items in a `HashMap` guarded by a single mutex, taken once per
/// operation, which gives every operation the atomicity the
/// [`DurableQueue`] contract requires.
#[derive(Clone, Default)]
pub struct InMemoryQueue {
    items: Arc<Mutex<HashMap<String, QueueItem>>>,
}

impl InMemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DurableQueue for InMemoryQueue {
    async fn save(&self, item: QueueItem) -> Result<(), QueueError> {
        self.items.lock().await.insert(item.id.clone(), item);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), QueueError> {
        self.items.lock().await.remove(id);
        Ok(())
    }

    async fn load_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let items = self.items.lock().await;
        let mut ready: Vec<QueueItem> = items
            .values()
            .filter(|item| item.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by(scheduling_order);
        ready.truncate(limit);
        Ok(ready)
    }

    async fn load_by_dedupe_key(&self, key: &str) -> Result<Vec<QueueItem>, QueueError> {
        let items = self.items.lock().await;
        let mut matched: Vec<QueueItem> = items
            .values()
            .filter(|item| item.envelope.dedupe_key() == Some(key))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id.cmp(&b.id)));
        Ok(matched)
    }

    async fn load_all(&self) -> Result<Vec<QueueItem>, QueueError> {
        let items = self.items.lock().await;
        let mut all: Vec<QueueItem> = items.values().cloned().collect();
        all.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn count_active(&self) -> Result<usize, QueueError> {
        let items = self.items.lock().await;
        Ok(items.values().filter(|item| item.state.is_active()).count())
    }
}
