//! States and the identifiers that name them

use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::Arc;

use tracing::debug;

use crate::behavior::{Behavior, Heartbeat, InternalEventSink, Monitor, Timeout};
use crate::timer::TimerProvider;
use crate::util::guarded;

/// Identifier of a state. Blanket-implemented, use any small enum.
pub trait StateId: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> StateId for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Identifier of an application event. Blanket-implemented like [`StateId`].
pub trait EventId: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> EventId for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Zero-argument callback used for entry/exit hooks and plain actions.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// A state: an id, optional entry/exit hooks and an ordered list of timed
/// behaviors.
///
/// Hooks run on the machine worker. A panicking hook is logged and the
/// transition carries on.
pub struct State<S> {
    id: S,
    on_entry: Option<Callback>,
    on_exit: Option<Callback>,
    behaviors: Vec<Behavior<S>>,
}

impl<S: StateId> State<S> {
    /// A passive state with no hooks.
    pub fn new(id: S) -> Self {
        Self {
            id,
            on_entry: None,
            on_exit: None,
            behaviors: Vec::new(),
        }
    }

    /// Sets the hook run when the state is entered.
    pub fn on_entry<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_entry = Some(Arc::new(hook));
        self
    }

    /// Sets the hook run when the state is exited.
    pub fn on_exit<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_exit = Some(Arc::new(hook));
        self
    }

    /// Leaves the state for `timeout.target` once `timeout.delay` elapses.
    pub fn with_timeout(self, timeout: Timeout<S>) -> Self {
        self.with_behavior(Behavior::timeout(timeout))
    }

    /// Runs `heartbeat.action` every period while the state is current.
    pub fn with_heartbeat(self, heartbeat: Heartbeat) -> Self {
        self.with_behavior(Behavior::heartbeat(heartbeat))
    }

    /// Polls `monitor.condition` and leaves the state once it holds.
    pub fn with_monitor(self, monitor: Monitor<S>) -> Self {
        self.with_behavior(Behavior::monitor(monitor))
    }

    /// Attaches a behavior. Behaviors are armed in attach order on entry and
    /// cancelled in reverse order on exit.
    pub fn with_behavior(mut self, behavior: Behavior<S>) -> Self {
        self.behaviors.push(behavior);
        self
    }

    /// The state id.
    pub fn id(&self) -> &S {
        &self.id
    }

    /// True when at least one timed behavior is attached.
    pub fn is_active(&self) -> bool {
        !self.behaviors.is_empty()
    }

    /// The attached behaviors, in attach order.
    pub fn behaviors(&self) -> &[Behavior<S>] {
        &self.behaviors
    }

    pub(crate) fn attach(&self, sink: &Arc<dyn InternalEventSink<S>>) {
        for behavior in &self.behaviors {
            behavior.attach(Arc::clone(sink));
        }
    }

    pub(crate) fn set_provider(&self, provider: &Arc<dyn TimerProvider>) {
        for behavior in &self.behaviors {
            behavior.set_provider(Arc::clone(provider));
        }
    }

    /// Runs the entry hook, then arms every behavior for this entry.
    pub(crate) fn enter(&self, epoch: u64) {
        self.run_entry_hook();
        for behavior in &self.behaviors {
            behavior.arm(&self.id, epoch);
        }
    }

    /// Entry without timers, used while the machine is closing.
    pub(crate) fn run_entry_hook(&self) {
        if let Some(hook) = &self.on_entry {
            guarded(&format_args!("entry {self}"), || hook());
        }
    }

    /// Cancels behaviors outermost first, then runs the exit hook.
    pub(crate) fn exit(&self) {
        for behavior in self.behaviors.iter().rev() {
            behavior.cancel();
        }
        if let Some(hook) = &self.on_exit {
            guarded(&format_args!("exit {self}"), || hook());
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.is_active() {
            debug!(state = ?self.id, "Cancelling state timers");
        }
        for behavior in self.behaviors.iter().rev() {
            behavior.cancel();
        }
    }
}

impl<S: Debug> fmt::Display for State<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}]", self.id)
    }
}

impl<S: Debug> Debug for State<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("id", &self.id)
            .field("on_entry", &self.on_entry.is_some())
            .field("on_exit", &self.on_exit.is_some())
            .field("behaviors", &self.behaviors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Door {
        Opened,
    }

    #[test]
    fn hooks_run_on_enter_and_exit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let entry_log = Arc::clone(&log);
        let exit_log = Arc::clone(&log);
        let state = State::new(Door::Opened)
            .on_entry(move || entry_log.lock().unwrap().push("entry"))
            .on_exit(move || exit_log.lock().unwrap().push("exit"));

        state.enter(1);
        state.exit();

        assert_eq!(*log.lock().unwrap(), vec!["entry", "exit"]);
        assert!(!state.is_active());
    }

    #[test]
    fn panicking_hook_is_contained() {
        let state = State::new(Door::Opened).on_entry(|| panic!("hook failed"));
        state.enter(1);
        state.exit();
    }

    #[test]
    fn display_wraps_id() {
        let state = State::new(Door::Opened);
        assert_eq!(state.to_string(), "[Opened]");
        assert_eq!(state.id(), &Door::Opened);
    }
}
