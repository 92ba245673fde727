use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::trace;

pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs deferred work (retransmissions, re-registrations, deduplicator sweeps) after a delay.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle;
}

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const CANCELED: u8 = 2;

/// Handle to a scheduled task.
///
/// Cancellation is cooperative: [TaskHandle::cancel] prevents a task from starting, but a task
///  that already started runs to completion. This allows a running task to replace its own
///  handle (e.g. a retransmission scheduling the next retransmission) without being aborted
///  half way. Running tasks re-check the state they operate on.
pub struct TaskHandle {
    state: Arc<AtomicU8>,
    join_handle: JoinHandle<()>,
}

impl Debug for TaskHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

impl TaskHandle {
    pub fn cancel(&self) {
        if self.state.compare_exchange(PENDING, CANCELED, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            self.join_handle.abort();
        }
    }

    /// aborts the task even if it is running. This is for periodic tasks that never finish on
    ///  their own.
    pub fn abort(&self) {
        self.state.store(CANCELED, Ordering::Release);
        self.join_handle.abort();
    }

    pub fn is_canceled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELED
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

/// [Scheduler] spawning tasks on a tokio runtime
pub struct TokioScheduler {
    runtime: Handle,
}

impl TokioScheduler {
    pub fn new(runtime: Handle) -> TokioScheduler {
        TokioScheduler { runtime }
    }

    /// scheduler for the runtime this is called from
    pub fn current() -> anyhow::Result<TokioScheduler> {
        Ok(TokioScheduler {
            runtime: Handle::try_current()?,
        })
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TaskHandle {
        let state = Arc::new(AtomicU8::new(PENDING));
        let task_state = state.clone();

        let join_handle = self.runtime.spawn(async move {
            time::sleep(delay).await;
            if task_state.compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire).is_err() {
                trace!("scheduled task was canceled");
                return;
            }
            task.await;
        });

        TaskHandle {
            state,
            join_handle,
        }
    }
}
