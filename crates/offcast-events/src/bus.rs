//! State bus routing helpers.

use crate::payloads::{DEFAULT_CHANNEL_CAPACITY, Seq, TaskSnapshot, TaskTransition};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

/// Shared per-task state bus built on top of `tokio::broadcast`.
///
/// Each task id owns one channel. Subscribers receive the current snapshot
/// first and every later transition for that id in publication order.
#[derive(Clone)]
pub struct StateBus {
    channels: Arc<Mutex<HashMap<String, TaskChannel>>>,
    capacity: usize,
}

struct TaskChannel {
    seq: Seq,
    last: Option<TaskSnapshot>,
    sender: broadcast::Sender<TaskTransition>,
}

impl TaskChannel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            seq: 0,
            last: None,
            sender,
        }
    }
}

impl StateBus {
    /// Construct a bus with a custom per-task channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    /// Construct a bus with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Publish a transition for a task. `None` marks the task absent and
    /// releases the channel once the last watcher detaches.
    pub fn publish(&self, id: &str, task: Option<TaskSnapshot>) -> Seq {
        let mut channels = self.lock_channels();
        let channel = channels
            .entry(id.to_owned())
            .or_insert_with(|| TaskChannel::new(self.capacity));
        channel.seq = channel.seq.saturating_add(1);
        channel.last = task.clone();
        let seq = channel.seq;
        let _ = channel.sender.send(TaskTransition {
            seq,
            timestamp: Utc::now(),
            task,
        });
        if channel.last.is_none() && channel.sender.receiver_count() == 0 {
            channels.remove(id);
        }
        seq
    }

    /// Subscribe to one task. The watch yields the current snapshot first,
    /// then every later transition. Unknown ids yield an absent value.
    #[must_use]
    pub fn subscribe(&self, id: &str) -> TaskWatch {
        let mut channels = self.lock_channels();
        let channel = channels
            .entry(id.to_owned())
            .or_insert_with(|| TaskChannel::new(self.capacity));
        let initial = TaskTransition {
            seq: channel.seq,
            timestamp: Utc::now(),
            task: channel.last.clone(),
        };
        TaskWatch {
            id: id.to_owned(),
            channels: Arc::clone(&self.channels),
            initial: Some(initial),
            receiver: channel.sender.subscribe(),
        }
    }

    /// Current snapshot for a task, or `None` when it is absent.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.lock_channels()
            .get(id)
            .and_then(|channel| channel.last.clone())
    }

    /// Ids with a live channel, in no particular order.
    #[must_use]
    pub fn known_ids(&self) -> Vec<String> {
        self.lock_channels().keys().cloned().collect()
    }

    fn lock_channels(&self) -> MutexGuard<'_, HashMap<String, TaskChannel>> {
        self.channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription to one task's transitions.
///
/// A watch keeps its channel alive; dropping the last watch of an absent
/// task releases the channel, so watching a removal to the end leaves
/// nothing behind.
pub struct TaskWatch {
    id: String,
    channels: Arc<Mutex<HashMap<String, TaskChannel>>>,
    initial: Option<TaskTransition>,
    receiver: broadcast::Receiver<TaskTransition>,
}

impl Drop for TaskWatch {
    fn drop(&mut self) {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // This watch's receiver is still counted until after the drop body,
        // so a count of one means it is the last one attached.
        let release = channels
            .get(&self.id)
            .is_some_and(|channel| channel.last.is_none() && channel.sender.receiver_count() <= 1);
        if release {
            channels.remove(&self.id);
        }
    }
}

impl TaskWatch {
    /// Next transition, or `None` once the bus is gone. A watch that falls
    /// behind skips overwritten transitions and resumes at the newest one.
    pub async fn next(&mut self) -> Option<TaskTransition> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.receiver.recv().await {
                Ok(transition) => return Some(transition),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "task watch lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
