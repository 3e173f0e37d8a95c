//! Download engine: admission, scheduling, and lifecycle of offline tasks.
//!
//! The engine is opened with its collaborators injected ([`Fetcher`],
//! [`TaskIndex`], [`ByteStore`]) and owns a single control task that serializes
//! every state change. Callers drive it through the [`DownloadControl`] and
//! [`DownloadInspector`] traits on [`DownloadManager`] and observe it through
//! the [`StateBus`].

#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::module_name_repetitions, clippy::multiple_crate_versions)]

pub mod command;
mod worker;

use crate::command::EngineCommand;
use anyhow::anyhow;
use async_trait::async_trait;
use offcast_core::{DownloadControl, DownloadInspector, DownloadRequest, Fetcher};
use offcast_events::{StateBus, TaskSnapshot, TaskWatch};
use offcast_index::TaskIndex;
use offcast_store::ByteStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

/// Tuning knobs for the engine control task.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of concurrent fetches.
    pub max_parallel: usize,
    /// How long a fetch may go without progress before it is failed.
    pub stall_timeout: Duration,
    /// Minimum interval between persisted progress updates per task.
    pub progress_flush_interval: Duration,
    /// Percentage delta that forces a progress update ahead of the interval.
    pub progress_flush_percent: f32,
    /// Depth of the command channel between facade and control task.
    pub command_buffer: usize,
    /// Depth of the chunk channel between a fetcher and its executor.
    pub fetch_buffer: usize,
    /// Delay before a failed removal cleanup is retried.
    pub cleanup_retry_backoff: Duration,
    /// Initial value of the environmental requirements gate.
    pub requirements_met_at_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: 2,
            stall_timeout: Duration::from_secs(30),
            progress_flush_interval: Duration::from_millis(500),
            progress_flush_percent: 1.0,
            command_buffer: 128,
            fetch_buffer: 32,
            cleanup_retry_backoff: Duration::from_secs(5),
            requirements_met_at_open: true,
        }
    }
}

/// Facade over the engine control task.
///
/// Opening a manager spawns the control task; dropping or [closing] it stops
/// the task. There is no process-wide instance: callers own the lifecycle and
/// may run several managers against disjoint directories.
///
/// [closing]: DownloadManager::close
pub struct DownloadManager {
    commands: mpsc::Sender<EngineCommand>,
    bus: StateBus,
    worker: JoinHandle<()>,
}

impl DownloadManager {
    /// Open a manager over the given collaborators and start its control
    /// task. Previously persisted tasks are reloaded before the first command
    /// is served.
    #[must_use]
    pub fn open(
        config: EngineConfig,
        fetcher: Arc<dyn Fetcher>,
        index: TaskIndex,
        store: ByteStore,
    ) -> Self {
        let bus = StateBus::new();
        let (commands, receiver) = mpsc::channel(config.command_buffer);
        let worker = worker::spawn(config, fetcher, index, store, bus.clone(), receiver);
        Self {
            commands,
            bus,
            worker,
        }
    }

    /// Handle to the state bus this engine publishes on.
    #[must_use]
    pub fn bus(&self) -> StateBus {
        self.bus.clone()
    }

    /// Subscribe to one task's transitions.
    #[must_use]
    pub fn watch(&self, id: &str) -> TaskWatch {
        self.bus.subscribe(id)
    }

    /// Stop the control task, letting in-flight fetches unwind and final
    /// snapshots persist before returning.
    pub async fn close(self) {
        drop(self.commands);
        if let Err(err) = self.worker.await {
            warn!(error = %err, "engine control task ended abnormally");
        }
    }

    async fn send_command(&self, command: EngineCommand) -> anyhow::Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|err| anyhow!("engine command channel closed: {err}"))
    }
}

#[async_trait]
impl DownloadControl for DownloadManager {
    async fn add(&self, request: DownloadRequest) -> anyhow::Result<()> {
        self.send_command(EngineCommand::Add(request)).await
    }

    async fn pause_all(&self) -> anyhow::Result<()> {
        self.send_command(EngineCommand::PauseAll).await
    }

    async fn resume_all(&self) -> anyhow::Result<()> {
        self.send_command(EngineCommand::ResumeAll).await
    }

    async fn stop(&self, id: &str, reason: u32) -> anyhow::Result<()> {
        self.send_command(EngineCommand::Stop {
            id: id.to_owned(),
            reason,
        })
        .await
    }

    async fn resume(&self, id: &str) -> anyhow::Result<()> {
        self.send_command(EngineCommand::Resume { id: id.to_owned() })
            .await
    }

    async fn remove(&self, id: &str) -> anyhow::Result<()> {
        self.send_command(EngineCommand::Remove { id: id.to_owned() })
            .await
    }

    async fn set_requirements_met(&self, met: bool) -> anyhow::Result<()> {
        self.send_command(EngineCommand::SetRequirementsMet { met })
            .await
    }
}

#[async_trait]
impl DownloadInspector for DownloadManager {
    async fn list(&self) -> anyhow::Result<Vec<TaskSnapshot>> {
        let (respond_to, response) = oneshot::channel();
        self.send_command(EngineCommand::List { respond_to }).await?;
        response
            .await
            .map_err(|err| anyhow!("engine dropped list query: {err}"))
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<TaskSnapshot>> {
        let (respond_to, response) = oneshot::channel();
        self.send_command(EngineCommand::Query {
            id: id.to_owned(),
            respond_to,
        })
        .await?;
        response
            .await
            .map_err(|err| anyhow!("engine dropped task query: {err}"))
    }
}
