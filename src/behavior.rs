//! Timed behaviors that turn a plain state into an active one.
//!
//! A [`Behavior`] owns one timer slot. Entering the state arms it, exiting
//! or shutting the machine down cancels it. When the timer fires the
//! behavior does not touch the machine; it posts a [`Signal`] into the
//! [`InternalEventSink`] it was attached to, and the machine processes that
//! signal on its worker like any other event.
//!
//! Three policies exist:
//!
//! - [`Timeout`]: one-shot, leaves the state for a target.
//! - [`Heartbeat`]: periodic, runs an action without leaving the state.
//! - [`Monitor`]: periodic poll of a condition, leaves the state for a target
//!   the first time the condition holds. Covers both the guarded heartbeat
//!   ([`Monitor::heartbeat_error`]) and the exit-condition monitor
//!   ([`Monitor::exit_condition`]).

use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::state::{Callback, EventId, StateId};
use crate::timer::{Schedule, Tick, TimerHandle, TimerProvider, TimerTask, TokioTimerProvider};
use crate::transition::{InternalEvent, Transition, Trigger};
use crate::util::{guarded, lock, read, write};
use crate::{Error, Result};

/// Boolean callback polled by a [`Monitor`].
pub type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A timer firing, addressed to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal<S> {
    /// Which internal event to raise
    pub kind: InternalEvent,
    /// The state whose timer fired
    pub origin: S,
    /// Entry count of `origin` when the timer was armed
    pub epoch: u64,
}

/// Where behaviors deliver their timer signals.
///
/// Implementations must only enqueue; they are called from timer tasks.
pub trait InternalEventSink<S>: Send + Sync {
    /// Delivers a signal.
    fn post(&self, signal: Signal<S>);
}

/// Lifecycle of a behavior's timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// No timer was ever armed
    Idle,
    /// Armed on entry, not fired yet
    Armed,
    /// Fired at least once
    Fired,
    /// Cancelled on exit or shutdown
    Cancelled,
}

/// Leave the state for `target` once `delay` elapsed.
pub struct Timeout<S> {
    delay: Duration,
    target: S,
    action: Option<Callback>,
}

impl<S> Timeout<S> {
    /// Fires once, `delay` after entry.
    pub fn after(delay: Duration, target: S) -> Self {
        Self {
            delay,
            target,
            action: None,
        }
    }

    /// Action run by the timeout transition.
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }
}

/// Run `action` every `period` while the state is current.
pub struct Heartbeat {
    period: Duration,
    action: Option<Callback>,
}

impl Heartbeat {
    /// Fires every `period`, first one period after entry.
    pub fn every(period: Duration) -> Self {
        Self {
            period,
            action: None,
        }
    }

    /// Action run on each beat.
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }
}

/// Poll `condition` every `period`; leave for `target` once it holds.
pub struct Monitor<S> {
    period: Duration,
    target: S,
    condition: Predicate,
    action: Option<Callback>,
    signal: InternalEvent,
}

impl<S> Monitor<S> {
    /// Guarded heartbeat: `error` reporting true forces the exit, raising
    /// [`InternalEvent::HeartbeatError`].
    pub fn heartbeat_error<F>(period: Duration, target: S, error: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            period,
            target,
            condition: Arc::new(error),
            action: None,
            signal: InternalEvent::HeartbeatError,
        }
    }

    /// Exit-condition monitor: `condition` becoming true forces the exit,
    /// raising [`InternalEvent::ExitCondition`].
    pub fn exit_condition<F>(period: Duration, target: S, condition: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            signal: InternalEvent::ExitCondition,
            ..Self::heartbeat_error(period, target, condition)
        }
    }

    /// Action run by the exit transition.
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.action = Some(Arc::new(action));
        self
    }
}

enum Policy<S> {
    Timeout(Timeout<S>),
    Heartbeat(Heartbeat),
    Monitor(Monitor<S>),
}

struct TimerSlot {
    phase: TimerPhase,
    handle: Option<Box<dyn TimerHandle>>,
}

impl TimerSlot {
    fn mark_fired(&mut self) {
        if self.phase == TimerPhase::Armed {
            self.phase = TimerPhase::Fired;
        }
    }
}

/// A timed behavior attached to a [`State`](crate::State).
pub struct Behavior<S> {
    policy: Policy<S>,
    provider: RwLock<Arc<dyn TimerProvider>>,
    sink: OnceLock<Arc<dyn InternalEventSink<S>>>,
    slot: Arc<Mutex<TimerSlot>>,
}

impl<S: StateId> Behavior<S> {
    fn with_policy(policy: Policy<S>) -> Self {
        Self {
            policy,
            provider: RwLock::new(Arc::new(TokioTimerProvider)),
            sink: OnceLock::new(),
            slot: Arc::new(Mutex::new(TimerSlot {
                phase: TimerPhase::Idle,
                handle: None,
            })),
        }
    }

    /// A one-shot timeout behavior.
    pub fn timeout(timeout: Timeout<S>) -> Self {
        Self::with_policy(Policy::Timeout(timeout))
    }

    /// An unconditional heartbeat behavior.
    pub fn heartbeat(heartbeat: Heartbeat) -> Self {
        Self::with_policy(Policy::Heartbeat(heartbeat))
    }

    /// A polled exit condition or guarded heartbeat.
    pub fn monitor(monitor: Monitor<S>) -> Self {
        Self::with_policy(Policy::Monitor(monitor))
    }

    /// The internal event this behavior raises.
    pub fn signal(&self) -> InternalEvent {
        match &self.policy {
            Policy::Timeout(_) => InternalEvent::Timeout,
            Policy::Heartbeat(_) => InternalEvent::Heartbeat,
            Policy::Monitor(monitor) => monitor.signal,
        }
    }

    /// The state this behavior leaves for, if any.
    pub fn target(&self) -> Option<&S> {
        match &self.policy {
            Policy::Timeout(timeout) => Some(&timeout.target),
            Policy::Heartbeat(_) => None,
            Policy::Monitor(monitor) => Some(&monitor.target),
        }
    }

    /// Current timer phase.
    pub fn phase(&self) -> TimerPhase {
        lock(&self.slot).phase
    }

    fn schedule(&self) -> Schedule {
        match &self.policy {
            Policy::Timeout(timeout) => Schedule::Once(timeout.delay),
            Policy::Heartbeat(heartbeat) => Schedule::Every(heartbeat.period),
            Policy::Monitor(monitor) => Schedule::Every(monitor.period),
        }
    }

    pub(crate) fn validate(&self, state: &S) -> Result<()> {
        let duration = match self.schedule() {
            Schedule::Once(delay) | Schedule::Every(delay) => delay,
        };
        if duration.is_zero() {
            return Err(Error::InvalidConfig(format!(
                "{:?} of state {state:?} needs a non-zero duration",
                self.signal()
            )));
        }
        Ok(())
    }

    /// The transition the machine registers for this behavior's signal.
    pub(crate) fn internal_transition<E: EventId>(&self, from: &S) -> Transition<S, E> {
        let (target, action) = match &self.policy {
            Policy::Timeout(timeout) => (Some(&timeout.target), &timeout.action),
            Policy::Heartbeat(heartbeat) => (None, &heartbeat.action),
            Policy::Monitor(monitor) => (Some(&monitor.target), &monitor.action),
        };
        let transition = Transition::on_trigger(from.clone(), Trigger::Internal(self.signal()))
            .with_callback(action.clone());
        match target {
            Some(target) => transition.to(target.clone()),
            None => transition,
        }
    }

    pub(crate) fn attach(&self, sink: Arc<dyn InternalEventSink<S>>) {
        if self.sink.set(sink).is_err() {
            warn!(signal = ?self.signal(), "Behavior already attached to a machine");
        }
    }

    pub(crate) fn set_provider(&self, provider: Arc<dyn TimerProvider>) {
        *write(&self.provider) = provider;
    }

    /// Arms a fresh timer for this entry of `state`.
    pub(crate) fn arm(&self, state: &S, epoch: u64) {
        let Some(sink) = self.sink.get() else {
            warn!(state = ?state, signal = ?self.signal(), "Behavior not attached, timer not armed");
            return;
        };

        let task = self.task(Arc::clone(sink), state.clone(), epoch);
        let label = match self.policy {
            Policy::Timeout(_) => format!("Timer [{state:?}]"),
            _ => format!("Monitor [{state:?}]"),
        };
        let provider = Arc::clone(&read(&self.provider));

        let mut slot = lock(&self.slot);
        if let Some(previous) = slot.handle.take() {
            warn!(state = ?state, "Timer still armed on entry, cancelling it");
            previous.cancel();
        }
        slot.phase = TimerPhase::Armed;
        slot.handle = Some(provider.schedule(&label, self.schedule(), task));
        debug!(timer = %label, schedule = ?self.schedule(), "Timer armed");
    }

    /// Cancels the current timer, if any. Idempotent.
    pub(crate) fn cancel(&self) {
        let mut slot = lock(&self.slot);
        if let Some(handle) = slot.handle.take() {
            handle.cancel();
        }
        if matches!(slot.phase, TimerPhase::Armed | TimerPhase::Fired) {
            slot.phase = TimerPhase::Cancelled;
        }
    }

    fn task(&self, sink: Arc<dyn InternalEventSink<S>>, origin: S, epoch: u64) -> TimerTask {
        let slot = Arc::clone(&self.slot);
        let kind = self.signal();
        let condition = match &self.policy {
            Policy::Monitor(monitor) => Some(Arc::clone(&monitor.condition)),
            Policy::Timeout(_) | Policy::Heartbeat(_) => None,
        };
        let once = matches!(self.policy, Policy::Timeout(_));

        Arc::new(move || {
            if let Some(condition) = &condition {
                let holds = guarded(&format_args!("exit condition of [{origin:?}]"), || {
                    condition()
                });
                if !holds.unwrap_or(false) {
                    return Tick::Continue;
                }
            }
            lock(&slot).mark_fired();
            sink.post(Signal {
                kind,
                origin: origin.clone(),
                epoch,
            });
            // A monitor fires its exit once, then stops polling.
            if once || condition.is_some() {
                Tick::Stop
            } else {
                Tick::Continue
            }
        })
    }
}

impl<S: Debug> Debug for Behavior<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (kind, schedule, target) = match &self.policy {
            Policy::Timeout(t) => ("timeout", t.delay, Some(&t.target)),
            Policy::Heartbeat(h) => ("heartbeat", h.period, None),
            Policy::Monitor(m) => ("monitor", m.period, Some(&m.target)),
        };
        f.debug_struct("Behavior")
            .field("kind", &kind)
            .field("duration", &schedule)
            .field("target", &target)
            .field("phase", &lock(&self.slot).phase)
            .finish_non_exhaustive()
    }
}
