//! Transitions: `(state, trigger) -> [guard] action, target`

use std::any::{type_name, Any};
use std::fmt::{self, Debug};
use std::sync::Arc;
use tracing::error;

use crate::state::Callback;
use crate::util::guarded;
use crate::{Error, Result};

/// Events the engine raises itself when a timed behavior fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalEvent {
    /// A [`Timeout`](crate::Timeout) elapsed
    Timeout,
    /// An unconditional [`Heartbeat`](crate::Heartbeat) beat
    Heartbeat,
    /// A guarded heartbeat reported an error
    HeartbeatError,
    /// A monitored exit condition became true
    ExitCondition,
}

/// What a transition reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Trigger<E> {
    /// An application event
    Event(E),
    /// An event raised by a timed behavior
    Internal(InternalEvent),
}

/// Opaque value carried by an event.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Boolean callback deciding whether a transition may run.
pub type Guard = Arc<dyn Fn() -> bool + Send + Sync>;

type PayloadAction = Arc<dyn Fn(Option<&Payload>) -> Result<()> + Send + Sync>;

#[derive(Clone)]
enum Action {
    Run(Callback),
    WithPayload(PayloadAction),
}

/// An immutable transition record.
///
/// Without a target the transition is internal: only the action runs and
/// the state does not change. With a target, even the current state, the
/// machine runs exit, action and entry in that order.
#[derive(Clone)]
pub struct Transition<S, E> {
    from: S,
    trigger: Trigger<E>,
    to: Option<S>,
    action: Option<Action>,
    guard: Option<Guard>,
}

impl<S, E> Transition<S, E>
where
    S: Debug,
    E: Debug,
{
    /// A transition out of `from` on the application event `event`.
    pub fn on(from: S, event: E) -> Self {
        Self::on_trigger(from, Trigger::Event(event))
    }

    /// A transition out of `from` on any trigger, internal ones included.
    ///
    /// Registering one on an [`InternalEvent`] overrides the transition the
    /// state's behavior would declare.
    pub fn on_trigger(from: S, trigger: Trigger<E>) -> Self {
        Self {
            from,
            trigger,
            to: None,
            action: None,
            guard: None,
        }
    }

    /// Makes the transition external, targeting `target`.
    pub fn to(mut self, target: S) -> Self {
        self.to = Some(target);
        self
    }

    /// Action that ignores the event payload.
    pub fn action<F>(mut self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.action = Some(Action::Run(Arc::new(action)));
        self
    }

    /// Action consuming the event payload as a `T`.
    ///
    /// A missing payload, or one of another type, is logged as
    /// [`Error::PayloadMismatch`] and the action is skipped.
    pub fn action_with<T, F>(mut self, action: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let run = move |payload: Option<&Payload>| -> Result<()> {
            let Some(payload) = payload else {
                return Err(Error::PayloadMismatch {
                    expected: type_name::<T>(),
                    found: "no payload",
                });
            };
            match (**payload).downcast_ref::<T>() {
                Some(value) => {
                    action(value);
                    Ok(())
                }
                None => Err(Error::PayloadMismatch {
                    expected: type_name::<T>(),
                    found: "a payload of another type",
                }),
            }
        };
        self.action = Some(Action::WithPayload(Arc::new(run)));
        self
    }

    /// Guard evaluated on the worker just before the transition runs.
    pub fn guard<F>(mut self, guard: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    pub(crate) fn with_callback(mut self, callback: Option<Callback>) -> Self {
        self.action = callback.map(Action::Run);
        self
    }

    /// The source state.
    pub fn source(&self) -> &S {
        &self.from
    }

    /// The trigger.
    pub fn trigger(&self) -> &Trigger<E> {
        &self.trigger
    }

    /// The target state, `None` for an internal transition.
    pub fn target(&self) -> Option<&S> {
        self.to.as_ref()
    }

    /// True when no target is set.
    pub fn is_internal(&self) -> bool {
        self.to.is_none()
    }

    /// True when an action is set.
    pub fn has_action(&self) -> bool {
        self.action.is_some()
    }

    /// True when a guard is set.
    pub fn has_guard(&self) -> bool {
        self.guard.is_some()
    }

    /// Evaluates the guard. A panicking guard blocks the transition.
    pub(crate) fn allows(&self) -> bool {
        match &self.guard {
            None => true,
            Some(guard) => guarded(&format_args!("guard of {self}"), || guard()).unwrap_or(false),
        }
    }

    /// Runs the action, logging rather than propagating any failure.
    pub(crate) fn run(&self, payload: Option<&Payload>) {
        match &self.action {
            None => {}
            Some(Action::Run(action)) => {
                guarded(&format_args!("transition {self}"), || action());
            }
            Some(Action::WithPayload(action)) => {
                if let Some(Err(err)) = guarded(&format_args!("transition {self}"), || action(payload))
                {
                    error!(transition = %self, %err, "Exception on transition");
                }
            }
        }
    }
}

impl<S: Debug, E: Debug> fmt::Display for Transition<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transition [{:?}, [{:?}]]", self.trigger, self.from)
    }
}

impl<S: Debug, E: Debug> Debug for Transition<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transition")
            .field("from", &self.from)
            .field("trigger", &self.trigger)
            .field("to", &self.to)
            .field("action", &self.action.is_some())
            .field("guard", &self.guard.is_some())
            .finish()
    }
}
