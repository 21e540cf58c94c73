//! Job queue implementations.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use regen_core::job::{JobMessage, JobQueue};
use regen_core::RegenResult;

use crate::client::{QueueError, RedisPool};

/// Redis list holding the pending jobs of a project.
pub fn jobs_key(prefix: &str, project_id: &str) -> String {
    format!("{}:{}:jobs", prefix, project_id)
}

/// Jobs as JSON on a Redis list: `LPUSH` to publish, `BRPOP` to receive.
#[derive(Clone)]
pub struct RedisJobQueue {
    pool: RedisPool,
    prefix: String,
}

impl RedisJobQueue {
    pub fn new(pool: RedisPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn publish(&self, job: &JobMessage) -> RegenResult<()> {
        let json = serde_json::to_string(job).map_err(QueueError::from)?;
        let key = jobs_key(&self.prefix, &job.project_id);
        let mut conn = self.pool.clone();
        conn.lpush::<_, _, ()>(&key, json)
            .await
            .map_err(QueueError::from)?;
        debug!(key = %key, run_id = %job.run_id, "Published job");
        Ok(())
    }

    async fn receive(&self, project_id: &str, wait: Duration) -> RegenResult<Option<JobMessage>> {
        let key = jobs_key(&self.prefix, project_id);
        let mut conn = self.pool.clone();
        let popped: Option<(String, String)> = conn
            .brpop(&key, wait.as_secs_f64())
            .await
            .map_err(QueueError::from)?;
        match popped {
            Some((_, json)) => {
                let job = serde_json::from_str(&json).map_err(QueueError::from)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn pending(&self, project_id: &str) -> RegenResult<usize> {
        let mut conn = self.pool.clone();
        let len: usize = conn
            .llen(jobs_key(&self.prefix, project_id))
            .await
            .map_err(QueueError::from)?;
        Ok(len)
    }
}

/// In-process queue with the same per-project FIFO semantics.
#[derive(Default)]
pub struct LocalJobQueue {
    queues: Mutex<HashMap<String, VecDeque<JobMessage>>>,
    published: Notify,
}

impl LocalJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pop(&self, project_id: &str) -> Option<JobMessage> {
        self.queues
            .lock()
            .await
            .get_mut(project_id)
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn publish(&self, job: &JobMessage) -> RegenResult<()> {
        self.queues
            .lock()
            .await
            .entry(job.project_id.clone())
            .or_default()
            .push_back(job.clone());
        self.published.notify_waiters();
        Ok(())
    }

    async fn receive(&self, project_id: &str, wait: Duration) -> RegenResult<Option<JobMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.pop(project_id).await {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.pop(project_id).await);
            }
        }
    }

    async fn pending(&self, project_id: &str) -> RegenResult<usize> {
        Ok(self
            .queues
            .lock()
            .await
            .get(project_id)
            .map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regen_core::job::JobMode;
    use regen_core::Phase;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn job(project: &str, run_id: &str) -> JobMessage {
        JobMessage::regenerate(
            project,
            "UserStory:US_001",
            Phase::Structural,
            BTreeMap::new(),
            JobMode::Dirty,
            run_id,
        )
    }

    #[test]
    fn test_jobs_key() {
        assert_eq!(jobs_key("regen", "shop"), "regen:shop:jobs");
    }

    #[tokio::test]
    async fn test_local_queue_is_fifo_per_project() {
        let queue = LocalJobQueue::new();
        queue.publish(&job("shop", "RUN_1")).await.unwrap();
        queue.publish(&job("shop", "RUN_2")).await.unwrap();
        queue.publish(&job("blog", "RUN_3")).await.unwrap();
        assert_eq!(queue.pending("shop").await.unwrap(), 2);

        let wait = Duration::from_millis(10);
        assert_eq!(queue.receive("shop", wait).await.unwrap().unwrap().run_id, "RUN_1");
        assert_eq!(queue.receive("shop", wait).await.unwrap().unwrap().run_id, "RUN_2");
        assert!(queue.receive("shop", wait).await.unwrap().is_none());
        assert_eq!(queue.pending("blog").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiting_receiver_wakes_on_publish() {
        let queue = Arc::new(LocalJobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive("shop", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(&job("shop", "RUN_9")).await.unwrap();

        let received = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(received.run_id, "RUN_9");
    }
}
