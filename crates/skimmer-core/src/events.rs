//! Per-job progress fan-out.
//!
//! Topics are created on first subscribe and dropped on the terminal event,
//! on [`EventBus::unsubscribe`], or when the last subscriber goes away.
//! Publishing to a job nobody listens to is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::job::JobResult;

const DEFAULT_TOPIC_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Progress { status: String, percentage: u8 },
    Completed { result: JobResult },
    Failed { error: String },
}

impl JobEvent {
    pub fn progress(status: impl Into<String>, percentage: u8) -> Self {
        JobEvent::Progress {
            status: status.into(),
            percentage: percentage.min(100),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobEvent::Progress { .. })
    }

    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Progress { .. } => "progress",
            JobEvent::Completed { .. } => "result",
            JobEvent::Failed { .. } => "error",
        }
    }
}

/// One job's channel. `generation` tells a topic apart from an older one
/// that was closed and recreated under the same job id.
#[derive(Debug)]
struct Topic {
    generation: u64,
    tx: broadcast::Sender<JobEvent>,
}

type Topics = Arc<Mutex<HashMap<Uuid, Topic>>>;

fn lock_topics(topics: &Topics) -> MutexGuard<'_, HashMap<Uuid, Topic>> {
    topics.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Recovered from poisoned event bus mutex");
        poisoned.into_inner()
    })
}

#[derive(Debug, Clone)]
pub struct EventBus {
    topics: Topics,
    capacity: usize,
    generations: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
            generations: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn subscribe(&self, job_id: Uuid) -> JobSubscription {
        let mut topics = lock_topics(&self.topics);
        let topic = topics.entry(job_id).or_insert_with(|| Topic {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            tx: broadcast::channel(self.capacity).0,
        });
        JobSubscription {
            job_id,
            generation: topic.generation,
            rx: topic.tx.subscribe(),
            topics: self.topics.clone(),
        }
    }

    /// Deliver `event` to current subscribers. Returns how many received it.
    pub fn publish(&self, job_id: Uuid, event: JobEvent) -> usize {
        let mut topics = lock_topics(&self.topics);
        let terminal = event.is_terminal();
        let delivered = match topics.get(&job_id) {
            Some(topic) => topic.tx.send(event).unwrap_or(0),
            None => 0,
        };
        if terminal {
            topics.remove(&job_id);
        }
        delivered
    }

    /// Drop the topic; current subscribers see the stream end.
    pub fn unsubscribe(&self, job_id: Uuid) {
        lock_topics(&self.topics).remove(&job_id);
    }

    pub fn topic_count(&self) -> usize {
        lock_topics(&self.topics).len()
    }
}

/// Receiving end for one job's events.
#[derive(Debug)]
pub struct JobSubscription {
    job_id: Uuid,
    generation: u64,
    rx: broadcast::Receiver<JobEvent>,
    topics: Topics,
}

impl JobSubscription {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Next event, or `None` once the topic is closed.
    ///
    /// A subscriber that falls behind skips the dropped progress events.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(job_id = %self.job_id, skipped, "Subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        let mut topics = lock_topics(&self.topics);
        // This receiver is still counted until the drop completes. A topic of
        // another generation belongs to newer subscribers and is left alone.
        let last = topics.get(&self.job_id).is_some_and(|topic| {
            topic.generation == self.generation && topic.tx.receiver_count() <= 1
        });
        if last {
            topics.remove(&self.job_id);
        }
    }
}
