//! Helpers for asserting on state bus traffic.

use offcast_events::{TaskSnapshot, TaskTransition, TaskWatch};
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

const WAIT_BUDGET: Duration = Duration::from_secs(5);

/// Install a fmt subscriber writing through the test harness. Only the first
/// call in a process installs; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Next transition from a watch, bounded by the suite-wide wait budget.
///
/// # Panics
///
/// Panics when the bus closes or the budget elapses first.
pub async fn next_transition(watch: &mut TaskWatch) -> TaskTransition {
    timeout(WAIT_BUDGET, watch.next())
        .await
        .expect("transition before timeout")
        .expect("state bus alive")
}

/// Consume transitions until one carries a snapshot matching the predicate.
/// Absent transitions (including the seed value of a fresh watch) are skipped.
///
/// # Panics
///
/// Panics when the bus closes or the budget elapses before a match arrives.
pub async fn wait_for_task<F>(watch: &mut TaskWatch, mut matches: F) -> TaskSnapshot
where
    F: FnMut(&TaskSnapshot) -> bool,
{
    loop {
        if let Some(task) = next_transition(watch).await.task
            && matches(&task)
        {
            return task;
        }
    }
}

/// Consume transitions until the task is reported absent.
///
/// # Panics
///
/// Panics when the bus closes or the budget elapses first.
pub async fn wait_for_absent(watch: &mut TaskWatch) {
    loop {
        if next_transition(watch).await.task.is_none() {
            return;
        }
    }
}
