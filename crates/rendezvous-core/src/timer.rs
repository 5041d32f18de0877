//! Bounded groups of repeating timer tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

/// A named pool of timer workers with a fixed maximum
///
/// Callers consult [`TimerGroup::spare`] to degrade gracefully when the pool is
/// saturated instead of queueing work behind it.
#[derive(Debug, Clone)]
pub struct TimerGroup {
    name: &'static str,
    max: usize,
    permits: Arc<Semaphore>,
}

impl TimerGroup {
    /// Create a group allowing `max` concurrent workers
    #[must_use]
    pub fn new(name: &'static str, max: usize) -> Self {
        Self {
            name,
            max,
            permits: Arc::new(Semaphore::new(max)),
        }
    }

    /// Group name
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Maximum concurrent workers
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    /// Workers currently running
    #[must_use]
    pub fn active(&self) -> usize {
        self.max - self.spare()
    }

    /// Workers still available
    #[must_use]
    pub fn spare(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `tick` every `period`, at most `runs` times
    ///
    /// The task stops early once `tick` resolves to `true`. Returns `None` if
    /// every worker is busy.
    pub fn spawn_repeating<F, Fut>(&self, period: Duration, runs: u32, mut tick: F) -> Option<TimerHandle>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let permit = self.permits.clone().try_acquire_owned().ok()?;

        let handle = tokio::spawn(async move {
            let _permit = permit;
            for _ in 0..runs {
                tokio::time::sleep(period).await;
                if tick().await {
                    break;
                }
            }
        });

        Some(TimerHandle { handle })
    }
}

/// Handle to a repeating timer task
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Stop the timer
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Check whether the timer has finished
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
