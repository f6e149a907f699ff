//! Redis-based task queue with reliable dequeue.
//!
//! A distributed queue backed by Redis that supports:
//!
//! - Atomic dequeue using BRPOPLPUSH
//! - Automatic retry with configurable attempts
//! - Dead letter queue for tasks that exhaust their attempts
//! - Idempotent enqueue via per-task dedup keys
//!
//! # Queue Structure
//!
//! The queue uses three Redis lists and one set:
//!
//! - `{queue_name}`: Main queue where tasks are enqueued
//! - `{queue_name}:processing`: Tasks being processed (for crash recovery)
//! - `{queue_name}:dead_letter`: Tasks that failed after max attempts
//! - `{queue_name}:keys`: Dedup keys of tasks currently in flight
//!
//! # Reliability
//!
//! Tasks are atomically moved from the main queue to the processing queue
//! when dequeued. If a worker crashes, tasks in the processing queue can be
//! recovered and requeued.

use std::marker::PhantomData;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default maximum number of delivery attempts for a task.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to Redis.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize task data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// A queued task: delivery bookkeeping wrapped around a payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<P> {
    /// Unique identifier for this delivery envelope.
    pub id: Uuid,
    /// Stable dedup key; two envelopes with the same key never coexist
    /// in flight when enqueued through `enqueue_unique`.
    #[serde(default)]
    pub task_key: Option<String>,
    /// The task payload.
    pub payload: P,
    /// When the envelope was created.
    pub created_at: DateTime<Utc>,
    /// Number of delivery attempts so far.
    pub attempts: u32,
    /// Maximum attempts before the dead letter queue.
    pub max_attempts: u32,
}

impl<P> Envelope<P> {
    /// Wraps a payload in a fresh envelope.
    pub fn new(payload: P) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_key: None,
            payload,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the dedup key.
    pub fn with_task_key(mut self, key: impl Into<String>) -> Self {
        self.task_key = Some(key.into());
        self
    }

    /// Sets the maximum number of delivery attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Increments the attempt counter.
    ///
    /// Called before each processing attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
    }

    /// Returns whether the task should be retried after a failure.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Redis-based task queue.
///
/// Uses BRPOPLPUSH for atomic dequeue, ensuring tasks are not lost if a
/// worker crashes during processing.
pub struct TaskQueue<P> {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Name of the main queue.
    queue_name: String,
    /// Name of the processing queue.
    processing_queue: String,
    /// Name of the dead letter queue.
    dead_letter_queue: String,
    /// Set of dedup keys currently in flight.
    keys_set: String,
    _payload: PhantomData<fn() -> P>,
}

impl<P> TaskQueue<P>
where
    P: Serialize + DeserializeOwned + Send + Sync,
{
    /// Connects to Redis and creates a new task queue.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `queue_name` - Name of the queue (used as prefix for Redis keys)
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, queue_name))
    }

    /// Creates a queue from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection across multiple queues.
    pub fn from_connection(redis: ConnectionManager, queue_name: &str) -> Self {
        Self {
            redis,
            queue_name: queue_name.to_string(),
            processing_queue: format!("{}:processing", queue_name),
            dead_letter_queue: format!("{}:dead_letter", queue_name),
            keys_set: format!("{}:keys", queue_name),
            _payload: PhantomData,
        }
    }

    /// Enqueues a task.
    ///
    /// Tasks are added to the left of the queue (LPUSH) so they can be
    /// dequeued from the right in FIFO order.
    pub async fn enqueue(&self, envelope: Envelope<P>) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    /// Enqueues a task only if its dedup key is not already in flight.
    ///
    /// # Returns
    ///
    /// `true` if the task was enqueued, `false` if an envelope with the
    /// same key is already queued or processing. Envelopes without a key
    /// are always enqueued.
    pub async fn enqueue_unique(&self, envelope: Envelope<P>) -> Result<bool, QueueError> {
        let Some(key) = envelope.task_key.clone() else {
            self.enqueue(envelope).await?;
            return Ok(true);
        };

        let mut conn = self.redis.clone();
        let added: i64 = conn.sadd(&self.keys_set, &key).await?;
        if added == 0 {
            return Ok(false);
        }

        self.enqueue(envelope).await?;
        Ok(true)
    }

    /// Dequeues the next task, blocking until one is available or timeout.
    ///
    /// Uses BRPOPLPUSH to atomically move the task from the main queue to
    /// the processing queue.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(envelope))` if a task was dequeued
    /// - `Ok(None)` if the timeout expired with no tasks available
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Envelope<P>>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(&self.queue_name)
            .arg(&self.processing_queue)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => {
                let envelope: Envelope<P> = serde_json::from_str(&data)?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    /// Marks a task as completed: removes it from the processing queue
    /// and releases its dedup key.
    pub async fn complete(&self, envelope: &Envelope<P>) -> Result<(), QueueError> {
        self.remove_from_processing(envelope.id).await?;
        self.release_key(envelope).await?;
        Ok(())
    }

    /// Returns a task to the main queue for retry.
    ///
    /// The envelope's attempt counter should be incremented before
    /// calling this.
    pub async fn requeue(&self, envelope: Envelope<P>) -> Result<(), QueueError> {
        self.remove_from_processing(envelope.id).await?;

        let serialized = serde_json::to_string(&envelope)?;
        let mut conn = self.redis.clone();
        conn.rpush::<_, _, ()>(&self.queue_name, serialized).await?;
        Ok(())
    }

    /// Moves a task to the dead letter queue after exhausting attempts.
    pub async fn dead_letter(&self, envelope: Envelope<P>, error: &str) -> Result<(), QueueError> {
        self.remove_from_processing(envelope.id).await?;
        self.release_key(&envelope).await?;

        let entry = serde_json::json!({
            "task": envelope,
            "error": error,
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });
        let serialized = serde_json::to_string(&entry)?;

        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(&self.dead_letter_queue, serialized)
            .await?;
        Ok(())
    }

    /// Returns the number of tasks in the main queue.
    pub async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.queue_name).await?;
        Ok(len)
    }

    /// Returns the number of tasks currently being processed.
    pub async fn processing_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.processing_queue).await?;
        Ok(len)
    }

    /// Returns the number of tasks in the dead letter queue.
    pub async fn dead_letter_len(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(&self.dead_letter_queue).await?;
        Ok(len)
    }

    /// Returns whether the main queue is empty.
    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }

    /// Recovers tasks stuck in the processing queue.
    ///
    /// Called on worker startup to recover tasks from workers that
    /// crashed. Tasks with remaining attempts move back to the main
    /// queue; the rest go to the dead letter queue.
    ///
    /// # Returns
    ///
    /// The number of tasks recovered.
    pub async fn recover_processing(&self) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let mut recovered = 0;

        let tasks: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for task_data in tasks {
            if let Ok(mut envelope) = serde_json::from_str::<Envelope<P>>(&task_data) {
                // A crash mid-processing counts as an attempt
                envelope.increment_attempts();

                if envelope.should_retry() {
                    let serialized = serde_json::to_string(&envelope)?;

                    let mut pipe = redis::pipe();
                    pipe.atomic()
                        .lrem(&self.processing_queue, 1, &task_data)
                        .rpush(&self.queue_name, &serialized);
                    pipe.query_async::<_, ()>(&mut conn).await?;

                    recovered += 1;
                } else {
                    self.dead_letter(envelope, "Recovered from processing queue after max attempts")
                        .await?;
                }
            }
        }

        Ok(recovered)
    }

    /// Clears all queues and the dedup key set.
    ///
    /// **Warning**: This permanently deletes all tasks. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.del(&self.queue_name)
            .del(&self.processing_queue)
            .del(&self.dead_letter_queue)
            .del(&self.keys_set);
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let (queue_len, processing_len, dead_letter_len) =
            tokio::try_join!(self.len(), self.processing_len(), self.dead_letter_len())?;

        Ok(QueueStats {
            queue_name: self.queue_name.clone(),
            pending_tasks: queue_len,
            processing_tasks: processing_len,
            dead_letter_tasks: dead_letter_len,
        })
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Releases the envelope's dedup key so the task can be enqueued again.
    async fn release_key(&self, envelope: &Envelope<P>) -> Result<(), QueueError> {
        if let Some(key) = &envelope.task_key {
            let mut conn = self.redis.clone();
            conn.srem::<_, _, ()>(&self.keys_set, key).await?;
        }
        Ok(())
    }

    /// Helper to remove a task from the processing queue by envelope ID.
    async fn remove_from_processing(&self, id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();

        let tasks: Vec<String> = conn.lrange(&self.processing_queue, 0, -1).await?;

        for task_data in tasks {
            if let Ok(envelope) = serde_json::from_str::<Envelope<P>>(&task_data) {
                if envelope.id == id {
                    conn.lrem::<_, _, ()>(&self.processing_queue, 1, &task_data)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Not found is not an error - it may have been removed already
        Ok(())
    }
}

/// Statistics about queue state.
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Number of tasks waiting to be processed.
    pub pending_tasks: usize,
    /// Number of tasks currently being processed.
    pub processing_tasks: usize,
    /// Number of tasks in the dead letter queue.
    pub dead_letter_tasks: usize,
}

impl QueueStats {
    /// Returns the total number of tasks across all queues.
    pub fn total_tasks(&self) -> usize {
        self.pending_tasks + self.processing_tasks + self.dead_letter_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::MovieTask;

    #[test]
    fn test_envelope_attempt_tracking() {
        let task = MovieTask {
            job_id: Uuid::new_v4(),
            label: "rg_27".to_string(),
        };
        let mut envelope = Envelope::new(task).with_max_attempts(2);

        assert!(envelope.should_retry());
        envelope.increment_attempts();
        assert!(envelope.should_retry());
        envelope.increment_attempts();
        assert!(!envelope.should_retry());
    }

    #[test]
    fn test_envelope_task_key() {
        let job_id = Uuid::new_v4();
        let task = MovieTask {
            job_id,
            label: "rg_27".to_string(),
        };
        let envelope = Envelope::new(task).with_task_key(format!("{}:movie:rg_27", job_id));

        assert_eq!(envelope.task_key, Some(format!("{}:movie:rg_27", job_id)));
    }

    #[test]
    fn test_envelope_serialization_roundtrip() {
        let task = MovieTask {
            job_id: Uuid::new_v4(),
            label: "rg_32".to_string(),
        };
        let envelope = Envelope::new(task.clone()).with_task_key("key");

        let json = serde_json::to_string(&envelope).expect("serialization should work");
        let parsed: Envelope<MovieTask> =
            serde_json::from_str(&json).expect("deserialization should work");

        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.payload.job_id, task.job_id);
        assert_eq!(parsed.payload.label, "rg_32");
    }

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats {
            queue_name: "test".to_string(),
            pending_tasks: 10,
            processing_tasks: 5,
            dead_letter_tasks: 2,
        };
        assert_eq!(stats.total_tasks(), 17);
    }

    #[test]
    fn test_dead_letter_entry_structure() {
        let task = MovieTask {
            job_id: Uuid::new_v4(),
            label: "rg_27".to_string(),
        };
        let envelope = Envelope::new(task);

        let entry = serde_json::json!({
            "task": envelope,
            "error": "pymol failed (exit code 1)",
            "moved_at": chrono::Utc::now().to_rfc3339(),
        });

        let serialized = serde_json::to_string(&entry).expect("entry should serialize");
        let parsed: serde_json::Value =
            serde_json::from_str(&serialized).expect("should parse back");

        assert!(parsed.get("task").is_some());
        assert!(parsed.get("error").is_some());
        assert!(parsed.get("moved_at").is_some());
    }
}
