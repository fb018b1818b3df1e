//! Timer used to schedule reconnect attempts

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{oneshot, Notify};

/// Source of reconnect delays
pub trait Timer: Send + Sync + 'static {
    /// Resolve after `delay`. Dropping the future cancels the timer.
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

/// Wall-clock timer on the Tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

impl Timer for TokioTimer {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(delay))
    }
}

#[derive(Default)]
struct ManualState {
    pending: VecDeque<(Duration, oneshot::Sender<()>)>,
    history: Vec<Duration>,
}

#[derive(Default)]
struct ManualInner {
    state: Mutex<ManualState>,
    scheduled: Notify,
}

/// Timer that only fires when told to.
///
/// Every requested delay is recorded, so backoff schedules can be asserted
/// without waiting for them.
#[derive(Clone, Default)]
pub struct ManualTimer {
    inner: Arc<ManualInner>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every delay requested so far, in request order
    pub fn history(&self) -> Vec<Duration> {
        self.state().history.clone()
    }

    /// Timers that are still waiting (not fired, not cancelled)
    pub fn pending(&self) -> usize {
        self.state()
            .pending
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count()
    }

    /// Fire the oldest live timer and return its delay. Cancelled timers are
    /// skipped.
    pub fn fire_next(&self) -> Option<Duration> {
        let mut state = self.state();
        while let Some((delay, tx)) = state.pending.pop_front() {
            if tx.send(()).is_ok() {
                return Some(delay);
            }
        }
        None
    }

    /// Wait until at least `count` delays have been requested
    pub async fn wait_for_scheduled(&self, count: usize) {
        loop {
            let notified = self.inner.scheduled.notified();
            let scheduled = self.state().history.len();
            if scheduled >= count {
                return;
            }
            notified.await;
        }
    }
}

impl Timer for ManualTimer {
    fn sleep(&self, delay: Duration) -> BoxFuture<'static, ()> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            state.pending.push_back((delay, tx));
            state.history.push(delay);
        }
        self.inner.scheduled.notify_waiters();

        Box::pin(async move {
            if rx.await.is_err() {
                // timer dropped without firing
                std::future::pending::<()>().await;
            }
        })
    }
}
