//! Per-task state bus for the offcast download subsystem.
//!
//! The bus multiplexes task lifecycle transitions by task id: any number of
//! subscribers may watch one task, each receives every transition for that id
//! in publication order, and dropping one watch never disturbs the others.
//! Subscribing to an unknown id yields an explicit absent value rather than an
//! error, so list screens can attach before a task exists. Internally each id
//! owns a `tokio::broadcast` channel; publication happens only from the engine
//! control task, which makes the per-id ordering total.

pub mod bus;
pub mod payloads;

pub use bus::{StateBus, TaskWatch};
pub use payloads::{
    FailureReason, NotificationView, Seq, TaskSnapshot, TaskState, TaskTransition,
};
