#![allow(
    clippy::redundant_pub_crate,
    clippy::option_if_let_else,
    clippy::needless_pass_by_value
)]

use crate::EngineConfig;
use crate::command::EngineCommand;
use chrono::Utc;
use offcast_core::{
    CacheKey, CancelHandle, CancelToken, DownloadRequest, FetchError, FetchEvent, FetchRequest,
    Fetcher, cancel_pair, percent_complete,
};
use offcast_events::{FailureReason, StateBus, TaskSnapshot, TaskState};
use offcast_index::TaskIndex;
use offcast_store::{ByteStore, StoreError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const WORKER_EVENT_BUFFER: usize = 256;
const TICK_INTERVAL: Duration = Duration::from_millis(250);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) fn spawn(
    config: EngineConfig,
    fetcher: Arc<dyn Fetcher>,
    index: TaskIndex,
    store: ByteStore,
    bus: StateBus,
    commands: mpsc::Receiver<EngineCommand>,
) -> JoinHandle<()> {
    tokio::spawn(run(config, fetcher, index, store, bus, commands))
}

async fn run(
    config: EngineConfig,
    fetcher: Arc<dyn Fetcher>,
    index: TaskIndex,
    store: ByteStore,
    bus: StateBus,
    mut commands: mpsc::Receiver<EngineCommand>,
) {
    let (worker_tx, mut worker_rx) = mpsc::channel(WORKER_EVENT_BUFFER);
    let tick = TICK_INTERVAL
        .min(config.stall_timeout / 4)
        .max(Duration::from_millis(10));
    let mut worker = Worker::new(config, fetcher, index, store, bus, worker_tx);
    worker.rehydrate();
    let mut poll = tokio::time::interval(tick);
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => worker.handle(command),
                    None => break,
                }
            }
            event = worker_rx.recv() => {
                if let Some(event) = event {
                    worker.on_event(event);
                }
            }
            _ = poll.tick() => worker.on_tick(),
        }
    }
    worker.shutdown(&mut worker_rx).await;
}

#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Progress {
        id: String,
        bytes_done: u64,
        total_bytes: Option<u64>,
    },
    Finished {
        id: String,
        result: Result<(), FetchError>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelIntent {
    /// No cancellation requested.
    None,
    /// A command path already settled the task's next state.
    Preempted,
    /// The stall scan gave up on the attempt.
    Timeout,
    /// The task is being removed; cleanup runs once the fetch unwinds.
    Remove,
    /// The engine is closing.
    Shutdown,
}

struct ActiveFetch {
    cancel: CancelHandle,
    join: JoinHandle<()>,
    intent: CancelIntent,
    last_progress: Instant,
    last_flush_at: Instant,
    last_flush_percent: f32,
}

struct Worker {
    config: EngineConfig,
    fetcher: Arc<dyn Fetcher>,
    index: TaskIndex,
    store: ByteStore,
    bus: StateBus,
    worker_tx: mpsc::Sender<WorkerEvent>,
    tasks: HashMap<String, TaskSnapshot>,
    active: HashMap<String, ActiveFetch>,
    pending_cleanups: HashMap<String, Instant>,
    paused: bool,
    requirements_met: bool,
    health: BTreeSet<String>,
}

impl Worker {
    fn new(
        config: EngineConfig,
        fetcher: Arc<dyn Fetcher>,
        index: TaskIndex,
        store: ByteStore,
        bus: StateBus,
        worker_tx: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        let requirements_met = config.requirements_met_at_open;
        Self {
            config,
            fetcher,
            index,
            store,
            bus,
            worker_tx,
            tasks: HashMap::new(),
            active: HashMap::new(),
            pending_cleanups: HashMap::new(),
            paused: false,
            requirements_met,
            health: BTreeSet::new(),
        }
    }

    /// Load persisted rows, republish them, and re-enter interrupted
    /// removals. Queued and downloading rows come back stopped-in-place from
    /// the index, so everything restarts deliberately.
    fn rehydrate(&mut self) {
        let rows = match self.index.load_all() {
            Ok(rows) => rows,
            Err(err) => {
                self.mark_degraded("index", &err.to_string());
                return;
            }
        };
        let count = rows.len();
        for row in rows {
            let id = row.id.clone();
            let removing = matches!(row.state, TaskState::Removing);
            self.bus.publish(&id, Some(row.clone()));
            self.tasks.insert(id.clone(), row);
            if removing {
                self.run_cleanup(&id);
            }
        }
        info!(tasks = count, "download worker rehydrated");
        self.schedule();
    }

    fn handle(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Add(request) => self.handle_add(request),
            EngineCommand::PauseAll => self.handle_pause_all(),
            EngineCommand::ResumeAll => self.handle_resume_all(),
            EngineCommand::Stop { id, reason } => self.handle_stop(&id, reason),
            EngineCommand::Resume { id } => self.handle_resume(&id),
            EngineCommand::Remove { id } => self.handle_remove(&id),
            EngineCommand::SetRequirementsMet { met } => self.handle_requirements(met),
            EngineCommand::Query { id, respond_to } => {
                let _ = respond_to.send(self.tasks.get(&id).cloned());
            }
            EngineCommand::List { respond_to } => {
                let mut rows: Vec<TaskSnapshot> = self.tasks.values().cloned().collect();
                rows.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
                let _ = respond_to.send(rows);
            }
        }
    }

    fn handle_add(&mut self, request: DownloadRequest) {
        if self.tasks.contains_key(&request.id) {
            debug!(task_id = %request.id, "ignoring add for known task");
            return;
        }
        let now = Utc::now();
        let snapshot = TaskSnapshot {
            id: request.id.clone(),
            source: request.source,
            payload: request.payload,
            state: TaskState::Queued,
            percent_complete: 0.0,
            stop_reason: 0,
            enqueued_at: now,
            updated_at: now,
        };
        self.tasks.insert(request.id.clone(), snapshot.clone());
        self.persist(&snapshot);
        self.bus.publish(&request.id, Some(snapshot));
        info!(task_id = %request.id, "download admitted");
        self.schedule();
    }

    fn handle_pause_all(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        self.halt_running();
        info!("downloads paused");
    }

    fn handle_resume_all(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.requeue_halted();
        info!("downloads resumed");
        self.schedule();
    }

    fn handle_requirements(&mut self, met: bool) {
        if self.requirements_met == met {
            return;
        }
        self.requirements_met = met;
        info!(met, "download requirements changed");
        if met {
            self.requeue_halted();
            self.schedule();
        } else {
            self.halt_running();
        }
    }

    /// Stop reason zero clears the tag, so stop and resume share one path.
    fn handle_stop(&mut self, id: &str, reason: u32) {
        if reason == 0 {
            self.handle_resume(id);
            return;
        }
        let Some(task) = self.tasks.get(id) else {
            debug!(task_id = %id, "ignoring stop for unknown task");
            return;
        };
        if matches!(task.state, TaskState::Removing) {
            return;
        }
        if let Some(active) = self.active.get_mut(id)
            && matches!(active.intent, CancelIntent::None | CancelIntent::Timeout)
        {
            active.intent = CancelIntent::Preempted;
            active.cancel.cancel();
        }
        self.apply(id, |task| {
            task.stop_reason = reason;
            if matches!(task.state, TaskState::Queued | TaskState::Downloading) {
                task.state = TaskState::Stopped;
            }
        });
        info!(task_id = %id, reason, "download stopped");
    }

    fn handle_resume(&mut self, id: &str) {
        let Some(task) = self.tasks.get(id) else {
            debug!(task_id = %id, "ignoring resume for unknown task");
            return;
        };
        if matches!(task.state, TaskState::Removing) {
            return;
        }
        self.apply(id, |task| {
            task.stop_reason = 0;
            match &task.state {
                TaskState::Stopped => task.state = TaskState::Queued,
                TaskState::Failed { reason } if reason.is_retryable() => {
                    task.state = TaskState::Queued;
                }
                _ => {}
            }
        });
        self.schedule();
    }

    fn handle_remove(&mut self, id: &str) {
        let Some(task) = self.tasks.get(id) else {
            debug!(task_id = %id, "ignoring remove for unknown task");
            return;
        };
        if matches!(task.state, TaskState::Removing) {
            return;
        }
        self.apply(id, |task| task.state = TaskState::Removing);
        if let Some(active) = self.active.get_mut(id) {
            active.intent = CancelIntent::Remove;
            active.cancel.cancel();
        } else {
            self.run_cleanup(id);
        }
    }

    /// Cancel every running fetch and stop its task in place, keeping the
    /// percentage and a zero stop reason. Used by the global pause flag and
    /// the requirements gate; per-task stop reasons go through
    /// [`Worker::handle_stop`] instead.
    fn halt_running(&mut self) {
        let ids: Vec<String> = self.active.keys().cloned().collect();
        for id in ids {
            if let Some(active) = self.active.get_mut(&id)
                && matches!(active.intent, CancelIntent::None | CancelIntent::Timeout)
            {
                active.intent = CancelIntent::Preempted;
                active.cancel.cancel();
                self.apply(&id, |task| {
                    if matches!(task.state, TaskState::Downloading) {
                        task.state = TaskState::Stopped;
                    }
                });
            }
        }
    }

    /// Put tasks stopped without a per-task reason back in the queue, so a
    /// global resume restores what the global pause halted.
    fn requeue_halted(&mut self) {
        let ids: Vec<String> = self
            .tasks
            .values()
            .filter(|task| matches!(task.state, TaskState::Stopped) && task.stop_reason == 0)
            .map(|task| task.id.clone())
            .collect();
        for id in ids {
            self.apply(&id, |task| task.state = TaskState::Queued);
        }
    }

    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Progress {
                id,
                bytes_done,
                total_bytes,
            } => self.on_progress(&id, bytes_done, total_bytes),
            WorkerEvent::Finished { id, result } => self.on_finished(&id, result),
        }
    }

    fn on_progress(&mut self, id: &str, bytes_done: u64, total_bytes: Option<u64>) {
        let now = Instant::now();
        let Some(active) = self.active.get_mut(id) else {
            return;
        };
        active.last_progress = now;
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        if !matches!(task.state, TaskState::Downloading) {
            return;
        }

        // Progress never goes backwards: the stored prefix is retained across
        // attempts, so the previous percentage stays honest.
        let percent = percent_complete(bytes_done, total_bytes).max(task.percent_complete);
        let due = now.duration_since(active.last_flush_at) >= self.config.progress_flush_interval
            || percent - active.last_flush_percent >= self.config.progress_flush_percent;
        if !due {
            return;
        }
        active.last_flush_at = now;
        active.last_flush_percent = percent;
        self.apply(id, |task| task.percent_complete = percent);
    }

    fn on_finished(&mut self, id: &str, result: Result<(), FetchError>) {
        let Some(active) = self.active.remove(id) else {
            return;
        };
        match active.intent {
            CancelIntent::Remove => self.run_cleanup(id),
            // The pause/stop path already published the next state; whatever
            // the raced fetch reports must not override it.
            CancelIntent::Shutdown | CancelIntent::Preempted => {}
            CancelIntent::Timeout => match result {
                Ok(()) => self.complete(id),
                Err(FetchError::Cancelled) => self.fail(id, FailureReason::Timeout),
                Err(err) => self.fail_classified(id, &err),
            },
            CancelIntent::None => match result {
                Ok(()) => self.complete(id),
                Err(FetchError::Cancelled) => {
                    warn!(task_id = %id, "fetch cancelled itself without a request");
                    self.fail(id, FailureReason::Network);
                }
                Err(err) => self.fail_classified(id, &err),
            },
        }
        self.schedule();
    }

    fn complete(&mut self, id: &str) {
        self.apply(id, |task| {
            task.state = TaskState::Completed;
            task.percent_complete = 100.0;
        });
        info!(task_id = %id, "download completed");
    }

    fn fail_classified(&mut self, id: &str, err: &FetchError) {
        let reason = err.failure_reason().unwrap_or(FailureReason::Network);
        warn!(task_id = %id, error = %err, "download attempt failed");
        self.fail(id, reason);
    }

    fn fail(&mut self, id: &str, reason: FailureReason) {
        self.apply(id, |task| task.state = TaskState::Failed { reason });
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let stalled: Vec<String> = self
            .active
            .iter()
            .filter(|(id, active)| {
                active.intent == CancelIntent::None
                    && now.duration_since(active.last_progress) >= self.config.stall_timeout
                    && self
                        .tasks
                        .get(*id)
                        .is_some_and(|task| matches!(task.state, TaskState::Downloading))
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            warn!(task_id = %id, "download stalled; cancelling attempt");
            if let Some(active) = self.active.get_mut(&id) {
                active.intent = CancelIntent::Timeout;
                active.cancel.cancel();
            }
        }

        let due: Vec<String> = self
            .pending_cleanups
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in due {
            self.run_cleanup(&id);
        }
    }

    /// Second phase of removal: drop the cached bytes, delete the index row,
    /// then publish the task as absent. Failures back off and retry so a
    /// removal never silently half-finishes.
    fn run_cleanup(&mut self, id: &str) {
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        let key = CacheKey::for_source(&task.source);
        if let Err(err) = self.store.evict(&key) {
            self.mark_degraded("cleanup", &err.to_string());
            self.pending_cleanups
                .insert(id.to_owned(), Instant::now() + self.config.cleanup_retry_backoff);
            return;
        }
        if let Err(err) = self.index.remove(id) {
            self.mark_degraded("cleanup", &err.to_string());
            self.pending_cleanups
                .insert(id.to_owned(), Instant::now() + self.config.cleanup_retry_backoff);
            return;
        }
        self.pending_cleanups.remove(id);
        self.tasks.remove(id);
        self.bus.publish(id, None);
        self.mark_recovered("cleanup");
        info!(task_id = %id, "download removed");
    }

    fn schedule(&mut self) {
        if self.paused || !self.requirements_met {
            return;
        }
        let mut eligible: Vec<(chrono::DateTime<Utc>, String)> = self
            .tasks
            .values()
            .filter(|task| {
                matches!(task.state, TaskState::Queued)
                    && task.stop_reason == 0
                    && !self.active.contains_key(&task.id)
            })
            .map(|task| (task.enqueued_at, task.id.clone()))
            .collect();
        eligible.sort();
        for (_, id) in eligible {
            if self.active.len() >= self.config.max_parallel {
                break;
            }
            self.start_fetch(&id);
        }
    }

    fn start_fetch(&mut self, id: &str) {
        let Some(task) = self.tasks.get(id) else {
            return;
        };
        let source = task.source.clone();
        let percent = task.percent_complete;
        self.apply(id, |task| task.state = TaskState::Downloading);

        let (handle, token) = cancel_pair();
        let join = tokio::spawn(run_fetch(
            Arc::clone(&self.fetcher),
            self.store.clone(),
            id.to_owned(),
            source,
            self.config.fetch_buffer,
            self.worker_tx.clone(),
            token,
        ));
        let now = Instant::now();
        self.active.insert(
            id.to_owned(),
            ActiveFetch {
                cancel: handle,
                join,
                intent: CancelIntent::None,
                last_progress: now,
                last_flush_at: now,
                last_flush_percent: percent,
            },
        );
        info!(task_id = %id, "download started");
    }

    async fn shutdown(&mut self, worker_rx: &mut mpsc::Receiver<WorkerEvent>) {
        for active in self.active.values_mut() {
            active.intent = CancelIntent::Shutdown;
            active.cancel.cancel();
        }
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while !self.active.is_empty() {
                match worker_rx.recv().await {
                    Some(WorkerEvent::Finished { id, .. }) => {
                        self.active.remove(&id);
                    }
                    Some(WorkerEvent::Progress { .. }) => {}
                    None => break,
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("timed out waiting for fetches to unwind during shutdown");
            for active in self.active.drain().map(|(_, active)| active) {
                active.join.abort();
            }
        }
        info!("download worker stopped");
    }

    fn apply<F>(&mut self, id: &str, mutate: F)
    where
        F: FnOnce(&mut TaskSnapshot),
    {
        let Some(task) = self.tasks.get_mut(id) else {
            return;
        };
        mutate(task);
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.persist(&snapshot);
        self.bus.publish(id, Some(snapshot));
    }

    // The in-memory table stays authoritative if the disk misbehaves; the
    // degradation is logged and cleared once writes succeed again.
    fn persist(&mut self, snapshot: &TaskSnapshot) {
        match self.index.put(snapshot) {
            Ok(()) => self.mark_recovered("index"),
            Err(err) => {
                warn!(task_id = %snapshot.id, error = %err, "failed to persist task row");
                self.mark_degraded("index", &err.to_string());
            }
        }
    }

    fn mark_degraded(&mut self, component: &str, detail: &str) {
        if self.health.insert(component.to_string()) {
            warn!(component, detail = %detail, "engine component degraded");
        } else {
            warn!(component, detail = %detail, "engine component still degraded");
        }
    }

    fn mark_recovered(&mut self, component: &str) {
        if self.health.remove(component) {
            info!(component, "engine component recovered");
        }
    }
}

pub(crate) async fn run_fetch(
    fetcher: Arc<dyn Fetcher>,
    store: ByteStore,
    id: String,
    source: String,
    fetch_buffer: usize,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancelToken,
) {
    let result =
        fetch_into_store(fetcher, &store, &id, source, fetch_buffer, &events, cancel).await;
    let _ = events.send(WorkerEvent::Finished { id, result }).await;
}

/// Drive one fetch attempt, streaming chunks straight into the byte store.
/// The store is the only writer-side consumer, so a failed attempt always
/// leaves a clean resumable prefix behind.
async fn fetch_into_store(
    fetcher: Arc<dyn Fetcher>,
    store: &ByteStore,
    id: &str,
    source: String,
    fetch_buffer: usize,
    events: &mpsc::Sender<WorkerEvent>,
    cancel: CancelToken,
) -> Result<(), FetchError> {
    let key = CacheKey::for_source(&source);
    let mut writer = store.open_append(&key).map_err(store_fetch_error)?;
    let request = FetchRequest {
        task_id: id.to_owned(),
        source,
        resume_offset: writer.offset(),
    };
    let (tx, mut rx) = mpsc::channel(fetch_buffer);
    let fetch = fetcher.fetch(request, tx, cancel);
    tokio::pin!(fetch);

    let mut total_bytes: Option<u64> = None;
    let mut outcome: Option<Result<(), FetchError>> = None;
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(FetchEvent::Size { total_bytes: total }) => {
                    total_bytes = total;
                    let _ = events
                        .send(WorkerEvent::Progress {
                            id: id.to_owned(),
                            bytes_done: writer.offset(),
                            total_bytes,
                        })
                        .await;
                }
                Some(FetchEvent::Chunk { bytes }) => {
                    writer.write(&bytes).map_err(store_fetch_error)?;
                    let _ = events
                        .send(WorkerEvent::Progress {
                            id: id.to_owned(),
                            bytes_done: writer.offset(),
                            total_bytes,
                        })
                        .await;
                }
                None => break,
            },
            result = &mut fetch, if outcome.is_none() => outcome = Some(result),
        }
    }

    let result = match outcome {
        Some(result) => result,
        None => fetch.await,
    };
    if result.is_ok() {
        writer.sync().map_err(store_fetch_error)?;
        if let Some(total) = total_bytes
            && writer.offset() < total
        {
            return Err(FetchError::network(std::io::Error::other(
                "transfer ended before the advertised size",
            )));
        }
    }
    result
}

fn store_fetch_error(err: StoreError) -> FetchError {
    if err.is_storage_full() {
        FetchError::StorageFull
    } else {
        FetchError::network(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offcast_test_support::ScriptedFetcher;
    use tempfile::TempDir;

    fn worker_fixture(temp: &TempDir, fetcher: ScriptedFetcher) -> Worker {
        let index = TaskIndex::open(temp.path().join("index")).expect("index");
        let store = ByteStore::open(
            temp.path().join("cache"),
            offcast_store::EvictionPolicy::RetainAll,
        )
        .expect("store");
        let (worker_tx, _worker_rx) = mpsc::channel(WORKER_EVENT_BUFFER);
        let mut worker = Worker::new(
            EngineConfig::default(),
            Arc::new(fetcher),
            index,
            store,
            StateBus::new(),
            worker_tx,
        );
        worker.rehydrate();
        worker
    }

    fn add(worker: &mut Worker, id: &str) {
        worker.handle(EngineCommand::Add(DownloadRequest {
            id: id.into(),
            source: format!("https://cdn.example/{id}"),
            payload: Vec::new(),
        }));
    }

    fn state_of(worker: &Worker, id: &str) -> TaskState {
        worker.tasks.get(id).expect("task present").state.clone()
    }

    #[tokio::test]
    async fn add_starts_up_to_the_parallel_limit() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        for id in ["a", "b", "c"] {
            add(&mut worker, id);
        }
        assert_eq!(state_of(&worker, "a"), TaskState::Downloading);
        assert_eq!(state_of(&worker, "b"), TaskState::Downloading);
        assert_eq!(state_of(&worker, "c"), TaskState::Queued);
        assert_eq!(worker.active.len(), 2);
    }

    #[tokio::test]
    async fn re_adding_a_known_id_is_a_no_op() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        add(&mut worker, "a");
        let before = worker.tasks.get("a").expect("task").enqueued_at;
        add(&mut worker, "a");
        assert_eq!(worker.tasks.len(), 1);
        assert_eq!(worker.tasks.get("a").expect("task").enqueued_at, before);
    }

    #[tokio::test]
    async fn global_pause_stops_running_tasks_in_place() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        add(&mut worker, "a");
        assert_eq!(state_of(&worker, "a"), TaskState::Downloading);

        worker.handle(EngineCommand::PauseAll);
        assert_eq!(state_of(&worker, "a"), TaskState::Stopped);
        assert_eq!(worker.tasks.get("a").expect("task").stop_reason, 0);
        assert_eq!(
            worker.active.get("a").expect("still unwinding").intent,
            CancelIntent::Preempted
        );

        // Nothing restarts while the flag is up, even as slots free.
        worker.on_finished("a", Err(FetchError::Cancelled));
        assert_eq!(state_of(&worker, "a"), TaskState::Stopped);
        assert!(worker.active.is_empty());

        worker.handle(EngineCommand::ResumeAll);
        assert_eq!(state_of(&worker, "a"), TaskState::Downloading);
    }

    #[tokio::test]
    async fn global_resume_leaves_individually_stopped_tasks_alone() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        add(&mut worker, "a");
        worker.handle(EngineCommand::Stop {
            id: "a".into(),
            reason: 4,
        });
        worker.on_finished("a", Err(FetchError::Cancelled));

        worker.handle(EngineCommand::PauseAll);
        worker.handle(EngineCommand::ResumeAll);
        assert_eq!(state_of(&worker, "a"), TaskState::Stopped);
        assert_eq!(worker.tasks.get("a").expect("task").stop_reason, 4);
    }

    #[tokio::test]
    async fn requirements_gate_blocks_scheduling() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        worker.handle(EngineCommand::SetRequirementsMet { met: false });
        add(&mut worker, "a");
        assert_eq!(state_of(&worker, "a"), TaskState::Queued);
        assert!(worker.active.is_empty());

        worker.handle(EngineCommand::SetRequirementsMet { met: true });
        assert_eq!(state_of(&worker, "a"), TaskState::Downloading);
    }

    #[tokio::test]
    async fn stop_reason_survives_and_zero_clears_it() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        add(&mut worker, "a");
        worker.handle(EngineCommand::Stop {
            id: "a".into(),
            reason: 7,
        });
        assert_eq!(state_of(&worker, "a"), TaskState::Stopped);
        assert_eq!(worker.tasks.get("a").expect("task").stop_reason, 7);
        worker.on_finished("a", Err(FetchError::Cancelled));
        assert_eq!(state_of(&worker, "a"), TaskState::Stopped);

        worker.handle(EngineCommand::Stop {
            id: "a".into(),
            reason: 0,
        });
        assert_eq!(worker.tasks.get("a").expect("task").stop_reason, 0);
        assert_eq!(state_of(&worker, "a"), TaskState::Downloading);
    }

    #[tokio::test]
    async fn resume_retries_retryable_failures_only() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        add(&mut worker, "a");
        worker.on_finished(
            "a",
            Err(FetchError::network(std::io::Error::other("reset"))),
        );
        assert_eq!(
            state_of(&worker, "a"),
            TaskState::Failed {
                reason: FailureReason::Network
            }
        );
        worker.handle(EngineCommand::Resume { id: "a".into() });
        assert_eq!(state_of(&worker, "a"), TaskState::Downloading);

        worker.on_finished(
            "a",
            Err(FetchError::InvalidRequest {
                detail: "bad scheme".into(),
            }),
        );
        worker.handle(EngineCommand::Resume { id: "a".into() });
        assert_eq!(
            state_of(&worker, "a"),
            TaskState::Failed {
                reason: FailureReason::InvalidRequest
            }
        );
    }

    #[tokio::test]
    async fn remove_of_idle_task_cleans_up_immediately() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        add(&mut worker, "a");
        worker.handle(EngineCommand::Stop {
            id: "a".into(),
            reason: 1,
        });
        worker.on_finished("a", Err(FetchError::Cancelled));

        worker.handle(EngineCommand::Remove { id: "a".into() });
        assert!(!worker.tasks.contains_key("a"));
        assert_eq!(worker.index.get("a").expect("index read"), None);
        assert!(worker.bus.snapshot("a").is_none());
    }

    #[tokio::test]
    async fn remove_of_running_task_waits_for_the_fetch_to_unwind() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        add(&mut worker, "a");
        worker.handle(EngineCommand::Remove { id: "a".into() });
        assert_eq!(state_of(&worker, "a"), TaskState::Removing);
        assert_eq!(
            worker.active.get("a").expect("still unwinding").intent,
            CancelIntent::Remove
        );

        worker.on_finished("a", Err(FetchError::Cancelled));
        assert!(!worker.tasks.contains_key("a"));
    }

    #[tokio::test]
    async fn timeout_intent_converts_cancellation_into_failure() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());

        add(&mut worker, "a");
        worker.config.stall_timeout = Duration::ZERO;
        worker.on_tick();
        assert_eq!(
            worker.active.get("a").expect("active fetch").intent,
            CancelIntent::Timeout
        );

        worker.on_finished("a", Err(FetchError::Cancelled));
        assert_eq!(
            state_of(&worker, "a"),
            TaskState::Failed {
                reason: FailureReason::Timeout
            }
        );
    }

    #[tokio::test]
    async fn fifo_order_breaks_ties_by_id() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());
        worker.config.max_parallel = 1;

        for id in ["z", "m", "a"] {
            add(&mut worker, id);
        }
        assert_eq!(state_of(&worker, "z"), TaskState::Downloading);

        // Finishing the head admits the earliest-enqueued waiter next.
        worker.on_finished("z", Ok(()));
        assert_eq!(state_of(&worker, "z"), TaskState::Completed);
        assert_eq!(state_of(&worker, "m"), TaskState::Downloading);
        assert_eq!(state_of(&worker, "a"), TaskState::Queued);
    }

    fn assert_percent(worker: &Worker, id: &str, expected: f32) {
        let actual = worker.tasks.get(id).expect("task present").percent_complete;
        assert!(
            (actual - expected).abs() < f32::EPSILON,
            "percent {actual} != {expected}"
        );
    }

    #[tokio::test]
    async fn progress_flushes_are_throttled_and_never_go_backwards() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());
        worker.config.progress_flush_interval = Duration::from_secs(3600);
        worker.config.progress_flush_percent = 10.0;

        add(&mut worker, "a");
        worker.on_progress("a", 5, Some(100));
        assert_percent(&worker, "a", 0.0);

        worker.on_progress("a", 25, Some(100));
        assert_percent(&worker, "a", 25.0);

        // Small increments ride the throttle until the delta gate opens.
        worker.on_progress("a", 30, Some(100));
        assert_percent(&worker, "a", 25.0);

        // With the interval gate wide open, a shrunken report (an attempt
        // restarting against an unknown total) still cannot drag the stored
        // figure down.
        worker.config.progress_flush_interval = Duration::ZERO;
        worker.on_progress("a", 0, None);
        assert_percent(&worker, "a", 25.0);
        worker.on_progress("a", 10, Some(100));
        assert_percent(&worker, "a", 25.0);

        worker.on_progress("a", 40, Some(100));
        assert_percent(&worker, "a", 40.0);
        let row = worker.index.get("a").expect("index read").expect("row");
        assert!((row.percent_complete - 40.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn failed_cleanup_backs_off_and_retries_on_a_later_tick() {
        let temp = TempDir::new().expect("tempdir");
        let mut worker = worker_fixture(&temp, ScriptedFetcher::parked());
        worker.config.cleanup_retry_backoff = Duration::ZERO;

        add(&mut worker, "a");
        worker.handle(EngineCommand::Stop {
            id: "a".into(),
            reason: 1,
        });
        worker.on_finished("a", Err(FetchError::Cancelled));

        // Wedge the index row (a non-empty directory in its place) so the
        // first cleanup attempt cannot delete it.
        let row_path = worker.index.dir().join(format!("{:02x}.json", b'a'));
        std::fs::remove_file(&row_path).expect("row removed");
        std::fs::create_dir(&row_path).expect("wedge dir");
        std::fs::write(row_path.join("pin"), b"x").expect("pin file");

        worker.handle(EngineCommand::Remove { id: "a".into() });
        assert_eq!(state_of(&worker, "a"), TaskState::Removing);
        assert!(worker.pending_cleanups.contains_key("a"));
        assert!(worker.health.contains("cleanup"));

        // Unwedged, the next tick retries the deferred cleanup to the end.
        std::fs::remove_file(row_path.join("pin")).expect("unpin");
        std::fs::remove_dir(&row_path).expect("unwedge");
        worker.on_tick();
        assert!(!worker.tasks.contains_key("a"));
        assert!(worker.pending_cleanups.is_empty());
        assert!(!worker.health.contains("cleanup"));
        assert!(worker.bus.snapshot("a").is_none());
    }
}
