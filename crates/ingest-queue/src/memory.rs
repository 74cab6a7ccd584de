use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use ingest_core::{Error, Result};
use ingest_storage::OutboxTask;

use crate::queue::{EnqueueResult, TaskQueue};

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<OutboxTask>,
    seen_keys: HashSet<String>,
}

/// In-memory queue for tests and the CLI. Dedup keys are remembered for the
/// life of the queue, including after a task is taken.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("task queue lock poisoned")
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Result<Option<OutboxTask>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        Ok(state.queue.pop_front())
    }

    pub fn drain(&self) -> Result<Vec<OutboxTask>> {
        let mut state = self.state.lock().map_err(poison_err)?;
        Ok(state.queue.drain(..).collect())
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.state.lock().map_err(poison_err)?.queue.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn enqueue(&self, task: &OutboxTask) -> Result<EnqueueResult> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if !state.seen_keys.insert(task.dedup_key.clone()) {
            return Ok(EnqueueResult::Deduplicated);
        }
        state.queue.push_back(task.clone());
        Ok(EnqueueResult::Enqueued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ingest_core::{BuildResult, IngestionTask, TaskPayload};

    fn task(id: i64) -> OutboxTask {
        let build = BuildResult {
            host: "bb".into(),
            id,
            project: "chromium".into(),
            creation_time: Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
        };
        OutboxTask::new(
            TaskPayload::IngestTestResults(IngestionTask::for_entry(&build, None)),
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 5, 0).unwrap(),
        )
    }

    #[test]
    fn dedups_on_key_even_after_take() {
        let q = InMemoryTaskQueue::new();
        assert_eq!(q.enqueue(&task(1)).unwrap(), EnqueueResult::Enqueued);
        assert_eq!(q.enqueue(&task(1)).unwrap(), EnqueueResult::Deduplicated);
        assert!(q.take().unwrap().is_some());
        assert_eq!(q.enqueue(&task(1)).unwrap(), EnqueueResult::Deduplicated);
        assert!(q.is_empty().unwrap());
    }

    #[test]
    fn keeps_fifo_order() {
        let q = InMemoryTaskQueue::new();
        q.enqueue(&task(1)).unwrap();
        q.enqueue(&task(2)).unwrap();
        let keys: Vec<String> = q.drain().unwrap().into_iter().map(|t| t.dedup_key).collect();
        assert_eq!(keys, vec!["ingest-test-results/bb/1", "ingest-test-results/bb/2"]);
    }
}
