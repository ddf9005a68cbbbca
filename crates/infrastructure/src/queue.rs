use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use taskhub_domain::{QueueEntry, QueueKey, TaskId, TaskPriority, TaskQueue};
use taskhub_errors::{HubError, HubResult};

type Slot = (DateTime<Utc>, TaskId);

#[derive(Default)]
struct Partitions {
    queues: HashMap<QueueKey, BTreeMap<Slot, QueueEntry>>,
    index: HashMap<TaskId, (QueueKey, Slot)>,
}

impl Partitions {
    fn insert(&mut self, entry: QueueEntry) {
        self.remove(entry.task_id);
        let key = entry.key();
        let slot = (entry.created_at, entry.task_id);
        self.index.insert(entry.task_id, (key.clone(), slot));
        self.queues.entry(key).or_default().insert(slot, entry);
    }

    fn remove(&mut self, task_id: TaskId) -> bool {
        let Some((key, slot)) = self.index.remove(&task_id) else {
            return false;
        };
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.remove(&slot);
        }
        true
    }

    fn depth(&self, key: &QueueKey) -> usize {
        self.queues.get(key).map(|q| q.len()).unwrap_or(0)
    }
}

/// 进程内派发队列
///
/// 每个 `(task_type, priority)` 分区按 `created_at` 排序；出队时先比较优先级，
/// 同一优先级内跨任务类型取最早创建且 `not_before` 已到的令牌。
pub struct InMemoryTaskQueue {
    partitions: Mutex<Partitions>,
    max_depth: usize,
}

impl InMemoryTaskQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            partitions: Mutex::new(Partitions::default()),
            max_depth,
        }
    }

    pub async fn total_depth(&self) -> usize {
        self.partitions.lock().await.index.len()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn push(&self, entry: QueueEntry) -> HubResult<()> {
        let mut partitions = self.partitions.lock().await;
        let key = entry.key();
        let depth = partitions.depth(&key);
        if depth >= self.max_depth && !partitions.index.contains_key(&entry.task_id) {
            warn!(queue = %key, depth, "队列已满，拒绝入队");
            return Err(HubError::Overloaded {
                queue: key.to_string(),
                depth,
            });
        }
        debug!(task.id = %entry.task_id, queue = %key, "任务入队");
        partitions.insert(entry);
        Ok(())
    }

    async fn requeue(&self, entry: QueueEntry) -> HubResult<()> {
        debug!(task.id = %entry.task_id, "任务重新入队");
        self.partitions.lock().await.insert(entry);
        Ok(())
    }

    async fn pop(&self, task_types: &[String], now: DateTime<Utc>) -> HubResult<Option<QueueEntry>> {
        let mut partitions = self.partitions.lock().await;

        for priority in TaskPriority::DESCENDING {
            let mut best: Option<(QueueKey, Slot)> = None;
            for (key, queue) in partitions.queues.iter() {
                if key.priority != priority {
                    continue;
                }
                if !task_types.is_empty() && !task_types.iter().any(|t| t == &key.task_type) {
                    continue;
                }
                let candidate = queue
                    .iter()
                    .find(|(_, entry)| entry.not_before <= now)
                    .map(|(slot, _)| *slot);
                if let Some(slot) = candidate {
                    if best.as_ref().map(|(_, b)| slot < *b).unwrap_or(true) {
                        best = Some((key.clone(), slot));
                    }
                }
            }

            if let Some((key, slot)) = best {
                let entry = partitions
                    .queues
                    .get_mut(&key)
                    .and_then(|queue| queue.remove(&slot));
                if let Some(entry) = entry {
                    partitions.index.remove(&entry.task_id);
                    return Ok(Some(entry));
                }
            }
        }

        Ok(None)
    }

    async fn depth(&self, key: &QueueKey) -> HubResult<usize> {
        Ok(self.partitions.lock().await.depth(key))
    }

    async fn remove(&self, task_id: TaskId) -> HubResult<bool> {
        Ok(self.partitions.lock().await.remove(task_id))
    }
}
