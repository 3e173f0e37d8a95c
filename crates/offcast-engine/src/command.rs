//! Command definitions consumed by the engine control task.

use offcast_core::DownloadRequest;
use offcast_events::TaskSnapshot;
use tokio::sync::oneshot;

/// Messages accepted by the engine control task.
#[derive(Debug)]
pub enum EngineCommand {
    /// Admit a new task; a no-op when the id is already known.
    Add(DownloadRequest),
    /// Raise the global pause flag and cancel running fetches.
    PauseAll,
    /// Clear the global pause flag.
    ResumeAll,
    /// Tag one task with a caller-defined stop reason. Reason zero clears the
    /// tag, matching the resume command.
    Stop {
        /// Task identifier.
        id: String,
        /// Caller-defined tag; non-zero keeps the task stopped.
        reason: u32,
    },
    /// Clear one task's stop reason and re-queue it when eligible.
    Resume {
        /// Task identifier.
        id: String,
    },
    /// Remove one task and its stored bytes.
    Remove {
        /// Task identifier.
        id: String,
    },
    /// Flip the shared environmental gate.
    SetRequirementsMet {
        /// Whether downloads may run.
        met: bool,
    },
    /// Inspect one task.
    Query {
        /// Task identifier.
        id: String,
        /// Channel used to return the snapshot.
        respond_to: oneshot::Sender<Option<TaskSnapshot>>,
    },
    /// Inspect every known task.
    List {
        /// Channel used to return the snapshots.
        respond_to: oneshot::Sender<Vec<TaskSnapshot>>,
    },
}
