//! Bounded worker pool shared by the scanner and the discoverer.
use std::future::Future;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Runs tasks with at most `concurrency` of them in flight.
///
/// Every task is spawned onto the runtime, so tasks run in parallel on a
/// multi-thread runtime. [`WorkerPool::run`] only returns once every task it
/// dispatched has finished; nothing it started outlives the call.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    concurrency: usize,
}

/// What a [`WorkerPool::run`] call produced.
#[derive(Debug)]
pub struct Completed<T> {
    /// Outputs of the tasks that ran, in completion order.
    pub outputs: Vec<T>,
    /// True when cancellation stopped dispatch before every item was handed
    /// out, or a dispatched task was torn down by the runtime. Either way
    /// `outputs` may be missing items.
    pub cancelled: bool,
}

impl WorkerPool {
    /// A cap of zero is treated as one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Dispatches `task(item)` for every item, respecting the cap.
    ///
    /// `cancel` is checked before each dispatch. Once it fires, no further
    /// task is started, but those already running are awaited rather than
    /// aborted. Outputs reach the caller through the join set, which is the
    /// only place they are collected.
    ///
    /// # Panics
    ///
    /// A panic inside a task is resumed on the caller once it is joined.
    pub async fn run<I, F, Fut>(
        &self,
        items: I,
        cancel: &CancellationToken,
        task: F,
    ) -> Completed<Fut::Output>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let mut in_flight = JoinSet::new();
        let mut outputs = Vec::new();
        let mut cancelled = false;

        for item in items {
            while in_flight.len() >= self.concurrency {
                if let Some(joined) = in_flight.join_next().await {
                    cancelled |= !collect(joined, &mut outputs);
                }
            }

            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            in_flight.spawn(task(item));
        }

        while let Some(joined) = in_flight.join_next().await {
            cancelled |= !collect(joined, &mut outputs);
        }

        Completed { outputs, cancelled }
    }
}

/// False when the task never produced an output.
fn collect<T>(joined: Result<T, JoinError>, outputs: &mut Vec<T>) -> bool {
    match joined {
        Ok(output) => {
            outputs.push(output);
            true
        }
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => false,
    }
}
