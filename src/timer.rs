//! Timer resources used by timed states.
//!
//! Timed behaviors never create timers themselves; they ask a
//! [`TimerProvider`]. The default [`TokioTimerProvider`] runs each timer as
//! its own Tokio task. [`ManualTimerProvider`] only records timers and fires
//! them when a test calls [`ManualTimerProvider::fire_all`], which makes
//! timer-driven transitions deterministic.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, Instrument};

use crate::util::lock;

/// When a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Once, after the delay
    Once(Duration),
    /// Every period, the first time one period after scheduling
    Every(Duration),
}

/// What a periodic timer does after its task ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Keep firing
    Continue,
    /// Stop the timer
    Stop,
}

/// The work a timer performs when it fires.
pub type TimerTask = Arc<dyn Fn() -> Tick + Send + Sync>;

/// A scheduled timer. Cancelling is idempotent, and a cancelled timer never
/// runs its task again.
pub trait TimerHandle: Send + Sync + Debug {
    /// Cancels the timer.
    fn cancel(&self);

    /// True once cancelled or exhausted.
    fn is_cancelled(&self) -> bool;
}

/// Factory for timers, replaceable per machine.
pub trait TimerProvider: Send + Sync + Debug {
    /// Schedules `task`. `label` names the timer in logs.
    fn schedule(&self, label: &str, schedule: Schedule, task: TimerTask) -> Box<dyn TimerHandle>;
}

/// Wall-clock timers backed by Tokio tasks.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimerProvider;

#[derive(Debug)]
struct TokioTimer {
    cancelled: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl TimerHandle for TokioTimer {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl TimerProvider for TokioTimerProvider {
    fn schedule(&self, label: &str, schedule: Schedule, task: TimerTask) -> Box<dyn TimerHandle> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(timer = label, "No Tokio runtime, timer not started");
            cancelled.store(true, Ordering::Release);
            return Box::new(TokioTimer {
                cancelled,
                task: None,
            });
        };

        let flag = Arc::clone(&cancelled);
        let timer = async move {
            match schedule {
                Schedule::Once(delay) => {
                    tokio::time::sleep(delay).await;
                    if !flag.load(Ordering::Acquire) {
                        task();
                    }
                }
                Schedule::Every(period) => {
                    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
                    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticks.tick().await;
                        if flag.load(Ordering::Acquire) || task() == Tick::Stop {
                            break;
                        }
                    }
                }
            }
            flag.store(true, Ordering::Release);
        };

        let span = tracing::debug_span!("timer", name = label);
        let handle = runtime.spawn(timer.instrument(span));
        Box::new(TokioTimer {
            cancelled,
            task: Some(handle.abort_handle()),
        })
    }
}

struct ManualTimer {
    label: String,
    schedule: Schedule,
    task: TimerTask,
    done: AtomicBool,
}

impl Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimer")
            .field("label", &self.label)
            .field("schedule", &self.schedule)
            .field("done", &self.done.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct ManualHandle(Arc<ManualTimer>);

impl TimerHandle for ManualHandle {
    fn cancel(&self) {
        self.0.done.store(true, Ordering::Release);
    }

    fn is_cancelled(&self) -> bool {
        self.0.done.load(Ordering::Acquire)
    }
}

/// Timers that only fire when told to.
///
/// Clones share the same timer list, so a test keeps one clone and hands
/// another to the machine.
#[derive(Debug, Default, Clone)]
pub struct ManualTimerProvider {
    timers: Arc<Mutex<Vec<Arc<ManualTimer>>>>,
    scheduled: Arc<AtomicUsize>,
}

impl ManualTimerProvider {
    /// An empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires every live timer once, on the calling thread.
    ///
    /// One-shot timers are exhausted afterwards, periodic timers stay live
    /// unless their task asked to stop. Returns how many timers fired.
    pub fn fire_all(&self) -> usize {
        let live: Vec<Arc<ManualTimer>> = {
            let mut timers = lock(&self.timers);
            timers.retain(|timer| !timer.done.load(Ordering::Acquire));
            timers.clone()
        };

        let mut fired = 0;
        for timer in live {
            if timer.done.load(Ordering::Acquire) {
                continue;
            }
            fired += 1;
            let tick = (timer.task)();
            if tick == Tick::Stop || matches!(timer.schedule, Schedule::Once(_)) {
                timer.done.store(true, Ordering::Release);
            }
        }
        fired
    }

    /// Number of timers that are neither cancelled nor exhausted.
    pub fn live(&self) -> usize {
        lock(&self.timers)
            .iter()
            .filter(|timer| !timer.done.load(Ordering::Acquire))
            .count()
    }

    /// Number of timers ever scheduled through this provider.
    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Labels of the live timers, in scheduling order.
    pub fn labels(&self) -> Vec<String> {
        lock(&self.timers)
            .iter()
            .filter(|timer| !timer.done.load(Ordering::Acquire))
            .map(|timer| timer.label.clone())
            .collect()
    }
}

impl TimerProvider for ManualTimerProvider {
    fn schedule(&self, label: &str, schedule: Schedule, task: TimerTask) -> Box<dyn TimerHandle> {
        let timer = Arc::new(ManualTimer {
            label: label.to_string(),
            schedule,
            task,
            done: AtomicBool::new(false),
        });
        lock(&self.timers).push(Arc::clone(&timer));
        self.scheduled.fetch_add(1, Ordering::AcqRel);
        Box::new(ManualHandle(timer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting(stop_after: usize) -> (TimerTask, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task: TimerTask = Arc::new(move || {
            if seen.fetch_add(1, Ordering::SeqCst) + 1 >= stop_after {
                Tick::Stop
            } else {
                Tick::Continue
            }
        });
        (task, count)
    }

    #[tokio::test]
    async fn test_tokio_one_shot_fires_once() {
        let (task, count) = counting(usize::MAX);
        let handle =
            TokioTimerProvider.schedule("once", Schedule::Once(Duration::from_millis(20)), task);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_tokio_periodic_stops_on_request() {
        let (task, count) = counting(3);
        let handle =
            TokioTimerProvider.schedule("every", Schedule::Every(Duration::from_millis(10)), task);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_tokio_cancel_prevents_firing() {
        let (task, count) = counting(usize::MAX);
        let handle =
            TokioTimerProvider.schedule("cancel", Schedule::Every(Duration::from_millis(30)), task);
        handle.cancel();
        handle.cancel();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(handle.is_cancelled());
    }

    #[test]
    fn test_tokio_without_runtime_is_inert() {
        let (task, count) = counting(usize::MAX);
        let handle =
            TokioTimerProvider.schedule("orphan", Schedule::Once(Duration::from_millis(1)), task);
        assert!(handle.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_provider_fires_on_demand() {
        let provider = ManualTimerProvider::new();
        let (once, once_count) = counting(usize::MAX);
        let (every, every_count) = counting(2);

        let _a = provider.schedule("once", Schedule::Once(Duration::from_secs(60)), once);
        let _b = provider.schedule("every", Schedule::Every(Duration::from_secs(60)), every);
        assert_eq!(provider.live(), 2);
        assert_eq!(provider.labels(), vec!["once", "every"]);

        assert_eq!(provider.fire_all(), 2);
        assert_eq!(provider.live(), 1);
        assert_eq!(provider.fire_all(), 1);
        assert_eq!(provider.live(), 0);
        assert_eq!(provider.fire_all(), 0);

        assert_eq!(once_count.load(Ordering::SeqCst), 1);
        assert_eq!(every_count.load(Ordering::SeqCst), 2);
        assert_eq!(provider.scheduled(), 2);
    }

    #[test]
    fn test_manual_cancel() {
        let provider = ManualTimerProvider::new();
        let (task, count) = counting(usize::MAX);
        let handle = provider.schedule("every", Schedule::Every(Duration::from_secs(1)), task);

        handle.cancel();
        assert!(handle.is_cancelled());
        assert_eq!(provider.fire_all(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
