//! The scheduled executor abstraction.
//!
//! Every listener registration names the executor its callback is
//! delivered on, and all internal scheduling (transition ticks, timer
//! fires) goes through an injected executor so tests can control
//! time. The only process wide state in the engine is the default
//! executor.
use futures::future::BoxFuture;
use std::{fmt, sync::Arc, sync::LazyLock, time::Duration};
use tokio::{task, time};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Abortable: Send + Sync {
    fn abort(&self);
}

impl Abortable for task::AbortHandle {
    fn abort(&self) {
        task::AbortHandle::abort(self)
    }
}

/// A handle to scheduled work. Dropping it cancels the work if it has
/// not yet run.
pub struct Scheduled(Option<Box<dyn Abortable>>);

impl fmt::Debug for Scheduled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scheduled")
    }
}

impl Scheduled {
    pub fn new(h: Box<dyn Abortable>) -> Self {
        Scheduled(Some(h))
    }

    pub fn cancel(mut self) {
        if let Some(h) = self.0.take() {
            h.abort()
        }
    }
}

impl Drop for Scheduled {
    fn drop(&mut self) {
        if let Some(h) = self.0.take() {
            h.abort()
        }
    }
}

/// A scheduled executor: immediate execution, one shot delayed
/// execution, and fixed rate repetition. The core never assumes its
/// own executor.
pub trait Executor: Send + Sync + fmt::Debug + 'static {
    fn execute(&self, task: Task);

    fn spawn_boxed(&self, fut: BoxFuture<'static, ()>);

    fn schedule(&self, delay: Duration, task: Task) -> Scheduled;

    fn schedule_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        tick: Box<dyn FnMut() + Send + 'static>,
    ) -> Scheduled;
}

pub type Exec = Arc<dyn Executor>;

/// The default executor, backed by the ambient tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioExecutor;

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        task::spawn(async move { task() });
    }

    fn spawn_boxed(&self, fut: BoxFuture<'static, ()>) {
        task::spawn(fut);
    }

    fn schedule(&self, delay: Duration, task: Task) -> Scheduled {
        let h = task::spawn(async move {
            time::sleep(delay).await;
            task()
        });
        Scheduled::new(Box::new(h.abort_handle()))
    }

    fn schedule_fixed_rate(
        &self,
        initial: Duration,
        period: Duration,
        mut tick: Box<dyn FnMut() + Send + 'static>,
    ) -> Scheduled {
        let h = task::spawn(async move {
            let start = time::Instant::now() + initial;
            let mut interval = time::interval_at(start, period);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tick()
            }
        });
        Scheduled::new(Box::new(h.abort_handle()))
    }
}

static DEFAULT: LazyLock<Exec> = LazyLock::new(|| Arc::new(TokioExecutor));

pub fn default_executor() -> Exec {
    Arc::clone(&DEFAULT)
}
