//! Per-connection task scheduler.
//!
//! Every task runs on the tokio runtime and is tracked by the scheduler of
//! the connection it belongs to. Dropping or cancelling the scheduler aborts
//! all of them. A tick that fails or panics is logged and the task carries
//! on with its next tick; other tasks are unaffected.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// One tick of a scheduled task.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

pub struct Scheduler {
    label: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cancelled: AtomicBool,
}

impl Scheduler {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tasks: Mutex::new(Vec::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, name: &'static str, delay: Duration, task: F)
    where
        F: FnOnce() -> TaskFuture + Send + 'static,
    {
        let label = self.label.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            run_tick(&label, name, task()).await;
        });
    }

    /// Run `task` every `period`, first after `initial`. Ticks are started
    /// on a fixed cadence regardless of how long each one takes.
    pub fn schedule_at_fixed_rate<F>(&self, name: &'static str, initial: Duration, period: Duration, task: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let label = self.label.clone();
        self.spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + initial, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                run_tick(&label, name, task()).await;
            }
        });
    }

    /// Run `task` repeatedly, waiting `delay` between the end of one tick and
    /// the start of the next.
    pub fn schedule_with_fixed_delay<F>(&self, name: &'static str, initial: Duration, delay: Duration, task: F)
    where
        F: Fn() -> TaskFuture + Send + Sync + 'static,
    {
        let label = self.label.clone();
        self.spawn(async move {
            tokio::time::sleep(initial).await;
            loop {
                run_tick(&label, name, task()).await;
                tokio::time::sleep(delay).await;
            }
        });
    }

    /// Tasks that have not yet finished.
    pub fn active_tasks(&self) -> usize {
        match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.retain(|t| !t.is_finished());
                tasks.len()
            }
            Err(_) => 0,
        }
    }

    /// Abort every task. Later calls to `schedule*` are ignored.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }

    fn spawn(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let handle = tokio::spawn(fut);
        match self.tasks.lock() {
            Ok(mut tasks) => {
                tasks.retain(|t| !t.is_finished());
                tasks.push(handle);
            }
            Err(_) => handle.abort(),
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

async fn run_tick(label: &str, name: &'static str, tick: TaskFuture) {
    match AssertUnwindSafe(tick).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(connection = label, task = name, error = %e, "scheduled task failed"),
        Err(_) => tracing::warn!(connection = label, task = name, "scheduled task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counter_task(counter: &Arc<AtomicUsize>) -> impl Fn() -> TaskFuture + Send + Sync + 'static {
        let counter = counter.clone();
        move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_rate_task_ticks_on_period() {
        let scheduler = Scheduler::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_at_fixed_rate("count", Duration::from_secs(5), Duration::from_secs(5), counter_task(&ticks));

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(10_200)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn one_shot_runs_once() {
        let scheduler = Scheduler::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        let task = counter_task(&ticks);
        scheduler.schedule("once", Duration::from_secs(2), move || task());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.active_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_panicking_ticks_do_not_stop_other_tasks() {
        let scheduler = Scheduler::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_at_fixed_rate("fails", Duration::ZERO, Duration::from_secs(1), || {
            async { Err(anyhow::anyhow!("always fails")) }.boxed()
        });
        scheduler.schedule_at_fixed_rate("panics", Duration::ZERO, Duration::from_secs(1), || {
            async {
                if true {
                    panic!("boom");
                }
                Ok(())
            }
            .boxed()
        });
        scheduler.schedule_with_fixed_delay("count", Duration::ZERO, Duration::from_secs(1), counter_task(&ticks));

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.active_tasks(), 3, "failing tasks keep their schedule");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_ticks() {
        let scheduler = Scheduler::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.schedule_at_fixed_rate("count", Duration::ZERO, Duration::from_secs(1), counter_task(&ticks));

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        scheduler.cancel_all();
        let seen = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);

        scheduler.schedule_at_fixed_rate("late", Duration::ZERO, Duration::from_secs(1), counter_task(&ticks));
        assert_eq!(scheduler.active_tasks(), 0);
    }
}
