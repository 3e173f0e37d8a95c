//! Event payload types carried across the subsystem.

use chrono::{DateTime, Utc};

/// Per-task sequence number assigned to each published transition.
pub type Seq = u64;

/// Default per-task broadcast buffer size.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

/// Lifecycle states a download task moves through.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    /// Task is admitted and waiting for an executor slot.
    Queued,
    /// Task has a fetch in flight.
    Downloading,
    /// Task finished downloading its full payload.
    Completed,
    /// Task failed with a classified reason.
    Failed {
        /// Why the fetch failed.
        reason: FailureReason,
    },
    /// Task is paused, either globally or via its own stop reason.
    Stopped,
    /// Task removal is underway; storage cleanup has not finished yet.
    Removing,
}

impl TaskState {
    /// Machine-friendly discriminator for log and notification consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
            Self::Stopped => "stopped",
            Self::Removing => "removing",
        }
    }

    /// Whether the state ends a download attempt.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. } | Self::Stopped)
    }
}

/// Classified causes for a failed download attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Transfer-level failure; retryable.
    Network,
    /// Byte store could not accept more data; retryable after cleanup.
    StorageFull,
    /// Caller supplied a bad locator or request; not retryable.
    InvalidRequest,
    /// Fetch made no progress within the stall window; retryable.
    Timeout,
}

impl FailureReason {
    /// Whether a task failed for this reason may be resumed as-is.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::InvalidRequest)
    }
}

/// Full read-only view of one task, as published on the bus and persisted in
/// the task index.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TaskSnapshot {
    /// Opaque caller-supplied identifier.
    pub id: String,
    /// Opaque locator the fetcher resolves to bytes.
    pub source: String,
    /// Caller-attached blob that round-trips unchanged (e.g. a title).
    pub payload: Vec<u8>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Completion percentage in `[0, 100]`.
    pub percent_complete: f32,
    /// Caller-settable tag; non-zero keeps the task out of the executor.
    pub stop_reason: u32,
    /// When the task was first admitted, used for FIFO scheduling.
    pub enqueued_at: DateTime<Utc>,
    /// When this snapshot was produced.
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    /// Best-effort decode of the payload as a display title.
    #[must_use]
    pub fn title_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// One published transition for a task. `task == None` means the task is
/// absent: removed, or never known to the subsystem.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TaskTransition {
    /// Per-task sequence number; strictly increasing per id.
    pub seq: Seq,
    /// When the transition was published.
    pub timestamp: DateTime<Utc>,
    /// New snapshot, or `None` when the task is absent.
    pub task: Option<TaskSnapshot>,
}

/// Read-only projection handed to notification collaborators. Carries just
/// enough to render a progress notification and nothing mutable.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct NotificationView {
    /// Task identifier.
    pub id: String,
    /// Title decoded from the caller payload.
    pub title: String,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Completion percentage in `[0, 100]`.
    pub percent_complete: f32,
}

impl From<&TaskSnapshot> for NotificationView {
    fn from(snapshot: &TaskSnapshot) -> Self {
        Self {
            id: snapshot.id.clone(),
            title: snapshot.title_lossy(),
            state: snapshot.state.clone(),
            percent_complete: snapshot.percent_complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> TaskSnapshot {
        TaskSnapshot {
            id: "s1".into(),
            source: "https://cdn.example/s1.m4a".into(),
            payload: b"Song A".to_vec(),
            state: TaskState::Downloading,
            percent_complete: 40.0,
            stop_reason: 0,
            enqueued_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn state_kind_maps_all_variants() {
        assert_eq!(TaskState::Queued.kind(), "queued");
        assert_eq!(TaskState::Downloading.kind(), "downloading");
        assert_eq!(TaskState::Completed.kind(), "completed");
        assert_eq!(
            TaskState::Failed {
                reason: FailureReason::Network
            }
            .kind(),
            "failed"
        );
        assert_eq!(TaskState::Stopped.kind(), "stopped");
        assert_eq!(TaskState::Removing.kind(), "removing");
    }

    #[test]
    fn only_invalid_request_is_not_retryable() {
        assert!(FailureReason::Network.is_retryable());
        assert!(FailureReason::StorageFull.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
        assert!(!FailureReason::InvalidRequest.is_retryable());
    }

    #[test]
    fn notification_view_projects_title_from_payload() {
        let snapshot = sample_snapshot();
        let view = NotificationView::from(&snapshot);
        assert_eq!(view.id, "s1");
        assert_eq!(view.title, "Song A");
        assert_eq!(view.state, TaskState::Downloading);
        assert!((view.percent_complete - 40.0).abs() < f32::EPSILON);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let snapshot = sample_snapshot();
        let raw = serde_json::to_string(&snapshot).expect("serialize");
        let back: TaskSnapshot = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, snapshot);
    }
}
