//! Concurrency gate and task registry for in-flight replies.
//!
//! Admission is semaphore-based backpressure: past the cap, new work
//! waits instead of being rejected. The permit is held by the event
//! handler that admitted the message, never by the reply task itself,
//! so a reaped task cannot release a slot twice.

use crate::config::LimitsConfig;
use crate::{ChannelId, GuildId, MessageId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, watch};
use tokio::task::AbortHandle;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Processing,
    Completed,
    Failed,
    Cancelled,
}

struct DispatchTask {
    message_id: MessageId,
    channel_id: ChannelId,
    guild_id: Option<GuildId>,
    persona: String,
    started_at: Instant,
    status: TaskStatus,
    abort_handle: Option<AbortHandle>,
}

/// Counters for the status report. Response time averages successful
/// replies only; per-guild and per-channel counts cover everything
/// finished.
#[derive(Debug, Clone, Default)]
pub struct DispatchStats {
    pub total_processed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub peak_concurrent: usize,
    pub average_response_seconds: f64,
    pub per_guild: HashMap<String, u64>,
    pub per_channel: HashMap<String, u64>,
}

pub struct DispatchGate {
    semaphore: Arc<Semaphore>,
    tasks: RwLock<HashMap<MessageId, DispatchTask>>,
    stats: Mutex<DispatchStats>,
    capacity: usize,
    task_timeout: Duration,
    cleanup_interval: Duration,
    completed_samples: Mutex<u64>,
}

impl DispatchGate {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent_messages)),
            tasks: RwLock::new(HashMap::new()),
            stats: Mutex::new(DispatchStats::default()),
            capacity: limits.max_concurrent_messages,
            task_timeout: limits.message_timeout(),
            cleanup_interval: limits.cleanup_interval(),
            completed_samples: Mutex::new(0),
        }
    }

    /// Wait for a free slot and register the task. The returned permit
    /// must stay with the caller until the reply task has been joined.
    pub async fn admit(
        &self,
        message_id: MessageId,
        channel_id: ChannelId,
        guild_id: Option<GuildId>,
        persona: &str,
    ) -> crate::Result<OwnedSemaphorePermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("dispatch gate is closed"))?;

        let mut tasks = self.tasks.write().await;
        tasks.insert(
            message_id,
            DispatchTask {
                message_id,
                channel_id,
                guild_id,
                persona: persona.to_string(),
                started_at: Instant::now(),
                status: TaskStatus::Processing,
                abort_handle: None,
            },
        );
        let active = tasks
            .values()
            .filter(|task| task.status == TaskStatus::Processing)
            .count();
        drop(tasks);

        let mut stats = self.stats.lock().await;
        if active > stats.peak_concurrent {
            stats.peak_concurrent = active;
        }
        drop(stats);

        tracing::debug!(message_id, active, capacity = self.capacity, "task admitted");
        Ok(permit)
    }

    /// Register the spawned reply task so the reaper can cancel it.
    pub async fn attach_handle(&self, message_id: MessageId, handle: AbortHandle) {
        if let Some(task) = self.tasks.write().await.get_mut(&message_id) {
            task.abort_handle = Some(handle);
        }
    }

    pub async fn mark_completed(&self, message_id: MessageId) {
        let Some((elapsed, guild_key, channel_key)) =
            self.finish(message_id, TaskStatus::Completed).await
        else {
            return;
        };
        let mut samples = self.completed_samples.lock().await;
        *samples += 1;
        let count = *samples;
        drop(samples);

        let mut stats = self.stats.lock().await;
        stats.total_processed += 1;
        let seconds = elapsed.as_secs_f64();
        stats.average_response_seconds += (seconds - stats.average_response_seconds) / count as f64;
        *stats.per_guild.entry(guild_key).or_default() += 1;
        *stats.per_channel.entry(channel_key).or_default() += 1;
    }

    pub async fn mark_failed(&self, message_id: MessageId) {
        let Some((_, guild_key, channel_key)) = self.finish(message_id, TaskStatus::Failed).await
        else {
            return;
        };
        let mut stats = self.stats.lock().await;
        stats.total_processed += 1;
        stats.failed += 1;
        *stats.per_guild.entry(guild_key).or_default() += 1;
        *stats.per_channel.entry(channel_key).or_default() += 1;
    }

    async fn finish(
        &self,
        message_id: MessageId,
        status: TaskStatus,
    ) -> Option<(Duration, String, String)> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&message_id) else {
            tracing::debug!(message_id, "finished task was already purged");
            return None;
        };
        task.status = status;
        let guild_key = task
            .guild_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "dm".to_string());
        Some((task.started_at.elapsed(), guild_key, task.channel_id.to_string()))
    }

    /// Cancel tasks past the processing timeout and drop finished
    /// entries. The semaphore permit is untouched; its holder releases
    /// it when the join completes.
    pub async fn cleanup_stale(&self) {
        let mut cancelled = 0_u64;
        let mut tasks = self.tasks.write().await;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Processing
                && task.started_at.elapsed() >= self.task_timeout
            {
                if let Some(handle) = &task.abort_handle {
                    handle.abort();
                }
                task.status = TaskStatus::Cancelled;
                cancelled += 1;
                tracing::warn!(
                    message_id = task.message_id,
                    persona = %task.persona,
                    elapsed_secs = task.started_at.elapsed().as_secs(),
                    "cancelled task that exceeded the processing timeout"
                );
            }
        }
        let before = tasks.len();
        tasks.retain(|_, task| task.status == TaskStatus::Processing);
        let purged = before - tasks.len();
        drop(tasks);

        if cancelled > 0 {
            self.stats.lock().await.cancelled += cancelled;
        }
        if cancelled > 0 || purged > 0 {
            tracing::debug!(cancelled, purged, "dispatch cleanup pass finished");
        }
    }

    /// Periodic cleanup until the shutdown signal flips.
    pub async fn run_reaper(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.cleanup_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup_stale().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("dispatch reaper stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Abort everything still running. Used on shutdown after intake
    /// has stopped.
    pub async fn abort_all(&self) {
        let mut tasks = self.tasks.write().await;
        for task in tasks.values_mut() {
            if task.status == TaskStatus::Processing {
                if let Some(handle) = &task.abort_handle {
                    handle.abort();
                }
                task.status = TaskStatus::Cancelled;
            }
        }
    }

    pub async fn active_count(&self) -> usize {
        self.tasks
            .read()
            .await
            .values()
            .filter(|task| task.status == TaskStatus::Processing)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn stats(&self) -> DispatchStats {
        self.stats.lock().await.clone()
    }
}
