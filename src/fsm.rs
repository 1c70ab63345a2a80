//! A finite state machine engine that serializes every transition onto one
//! worker and drives timed states from independent timers.
//!
//! # Type Parameters
//! - `S`: State identifier type, see [`StateId`].
//! - `E`: Application event type, see [`EventId`].
//!
//! # Semantics
//! When event `E` arrives in state `S`, the transition registered for
//! `(S, E)` is looked up. No transition, or a guard returning false, means
//! the event is ignored and the machine stays where it is. A transition with
//! a target runs, in order: listeners' `on_state_exited`, the current state's
//! exit (timers cancelled, then the exit hook), the action, the state change,
//! listeners' `on_state_entered`, and the target's entry (hook, then timers
//! armed). This holds for self transitions too. A transition without a target
//! only runs its action.
//!
//! # Threading
//! [`StateMachine::fire_event`] never blocks; the event is queued into the
//! machine's [`EventLoop`] and handled on its worker task. Hooks, guards and
//! actions all run on that worker, so a slow action delays every event queued
//! behind it, timer events included. Timers never preempt a running action.
//!
//! # Timed states
//! A state with [`Behavior`]s arms one timer per behavior on each entry. When
//! a timer fires it posts an [`InternalEvent`] into the mailbox, tagged with
//! the state and the entry it was armed for. If the machine has left that
//! entry by the time the event is handled, the event is discarded.
//!
//! # See Also
//! - [`StateMachineBuilder`](crate::StateMachineBuilder): assembling a machine.
//! - [`Transition`]: transition records.
//! - [`Error`]: construction and strict-fire errors.
use async_trait::async_trait;
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::behavior::{Behavior, InternalEventSink, Signal};
use crate::event_loop::{EventLoop, EventLoopConfig, Handler, MailboxSender};
use crate::listener::StateMachineListener;
use crate::state::{EventId, State, StateId};
use crate::timer::TimerProvider;
use crate::transition::{InternalEvent, Payload, Transition, Trigger};
use crate::util::{guarded, lock, read, write};
use crate::{Error, Result};

pub(crate) struct Envelope<S, E> {
    trigger: Trigger<E>,
    payload: Option<Payload>,
    origin: Option<(S, u64)>,
}

impl<S: Debug, E: Debug> Debug for Envelope<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.trigger {
            Trigger::Event(event) => write!(f, "[{event:?}]")?,
            Trigger::Internal(event) => write!(f, "[{event:?}]")?,
        }
        if let Some((state, epoch)) = &self.origin {
            write!(f, " from {state:?}#{epoch}")?;
        }
        Ok(())
    }
}

struct Cursor<S> {
    state: S,
    // Bumped on every entry, used to recognise timer events of a past entry.
    epoch: u64,
}

type TransitionTable<S, E> = HashMap<S, HashMap<Trigger<E>, Transition<S, E>>>;

struct Core<S, E> {
    name: String,
    states: HashMap<S, State<S>>,
    transitions: TransitionTable<S, E>,
    cursor: Mutex<Cursor<S>>,
    listeners: RwLock<Vec<Arc<dyn StateMachineListener<S>>>>,
    // Set once shutdown starts; entries drained after that arm no timers.
    closing: AtomicBool,
}

impl<S: StateId, E: EventId> Core<S, E> {
    fn current(&self) -> (S, u64) {
        let cursor = lock(&self.cursor);
        (cursor.state.clone(), cursor.epoch)
    }

    fn lookup(&self, state: &S, trigger: &Trigger<E>) -> Option<&Transition<S, E>> {
        self.transitions.get(state)?.get(trigger)
    }

    fn dispatch(&self, envelope: &Envelope<S, E>) {
        debug!(machine = %self.name, event = ?envelope, "Event is received");
        let (current, epoch) = self.current();

        if let Some((origin, armed)) = &envelope.origin {
            if *origin != current || *armed != epoch {
                debug!(
                    machine = %self.name,
                    event = ?envelope,
                    state = ?current,
                    "Timer event of a previous entry is discarded"
                );
                return;
            }
        }

        if envelope.trigger == Trigger::Internal(InternalEvent::Timeout) {
            warn!(machine = %self.name, state = ?current, "State has timed out.");
        }

        let Some(transition) = self.lookup(&current, &envelope.trigger) else {
            info!(machine = %self.name, event = ?envelope, state = ?current, "Event is ignored");
            return;
        };

        if !transition.allows() {
            info!(
                machine = %self.name,
                event = ?envelope,
                state = ?current,
                "Guard refused transition, event is ignored"
            );
            return;
        }

        self.execute(transition, envelope.payload.as_ref(), current);
    }

    fn execute(&self, transition: &Transition<S, E>, payload: Option<&Payload>, current: S) {
        let Some(target) = transition.target() else {
            transition.run(payload);
            return;
        };

        debug!(machine = %self.name, state = ?current, "Leaving state");
        self.notify(|listener| listener.on_state_exited(&current));
        if let Some(state) = self.states.get(&current) {
            state.exit();
        }

        transition.run(payload);

        let epoch = {
            let mut cursor = lock(&self.cursor);
            cursor.state = target.clone();
            cursor.epoch += 1;
            cursor.epoch
        };

        debug!(machine = %self.name, state = ?target, "Entering state");
        self.notify(|listener| listener.on_state_entered(target));
        let Some(state) = self.states.get(target) else {
            return;
        };
        if self.closing.load(Ordering::Acquire) {
            debug!(machine = %self.name, state = ?target, "Machine closing, timers not armed");
            state.run_entry_hook();
        } else {
            state.enter(epoch);
        }
    }

    fn notify(&self, call: impl Fn(&dyn StateMachineListener<S>)) {
        let listeners = read(&self.listeners).clone();
        for listener in listeners {
            guarded(&"state machine listener", || call(listener.as_ref()));
        }
    }
}

#[async_trait]
impl<S: StateId, E: EventId> Handler<Envelope<S, E>> for Core<S, E> {
    async fn on_message(&self, envelope: &Envelope<S, E>) -> Result<()> {
        self.dispatch(envelope);
        Ok(())
    }
}

/// Turns behavior signals into mailbox envelopes.
struct MachineSink<S, E> {
    mailbox: MailboxSender<Envelope<S, E>>,
}

impl<S: StateId, E: EventId> InternalEventSink<S> for MachineSink<S, E> {
    fn post(&self, signal: Signal<S>) {
        let envelope = Envelope {
            trigger: Trigger::Internal(signal.kind),
            payload: None,
            origin: Some((signal.origin, signal.epoch)),
        };
        if let Err(err) = self.mailbox.send(envelope) {
            debug!(%err, "Timer event dropped");
        }
    }
}

/// The state machine.
pub struct StateMachine<S, E>
where
    S: StateId,
    E: EventId,
{
    core: Arc<Core<S, E>>,
    event_loop: EventLoop<Envelope<S, E>>,
}

impl<S, E> StateMachine<S, E>
where
    S: StateId,
    E: EventId,
{
    /// Builds a machine with the default mailbox settings.
    ///
    /// `initial` becomes current without its entry hook running and without
    /// arming its timers; entry only happens through a transition.
    pub fn new(
        states: impl IntoIterator<Item = State<S>>,
        transitions: impl IntoIterator<Item = Transition<S, E>>,
        name: impl Into<String>,
        initial: S,
    ) -> Result<Self> {
        Self::with_config(states, transitions, name, initial, EventLoopConfig::default())
    }

    /// Builds a machine, failing fast on any dangling state reference.
    ///
    /// Transitions declared by timed behaviors are registered first, then the
    /// application transitions. Each registration replaces whatever was
    /// registered before for the same `(state, trigger)`, so application
    /// transitions win over behavior ones, and among behaviors of one state
    /// the last attached wins.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(
        states: impl IntoIterator<Item = State<S>>,
        transitions: impl IntoIterator<Item = Transition<S, E>>,
        name: impl Into<String>,
        initial: S,
        config: EventLoopConfig,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;

        let mut index: HashMap<S, State<S>> = HashMap::new();
        for state in states {
            let id = state.id().clone();
            if index.contains_key(&id) {
                return Err(Error::DuplicateState(format!("{id:?}")));
            }
            for behavior in state.behaviors() {
                behavior.validate(&id)?;
            }
            index.insert(id, state);
        }
        if !index.contains_key(&initial) {
            return Err(Error::unknown_state(&initial, "initial state"));
        }

        let internal: Vec<Transition<S, E>> = index
            .values()
            .flat_map(|state| {
                state
                    .behaviors()
                    .iter()
                    .map(move |behavior: &Behavior<S>| behavior.internal_transition(state.id()))
            })
            .collect();

        let mut table: TransitionTable<S, E> = index
            .keys()
            .map(|id| (id.clone(), HashMap::new()))
            .collect();
        for transition in internal.into_iter().chain(transitions) {
            let Some(row) = table.get_mut(transition.source()) else {
                return Err(Error::unknown_state(
                    transition.source(),
                    format!("source of {transition}"),
                ));
            };
            if let Some(target) = transition.target() {
                if !index.contains_key(target) {
                    return Err(Error::unknown_state(target, format!("target of {transition}")));
                }
            }
            if let Some(previous) = row.insert(transition.trigger().clone(), transition) {
                debug!(machine = %name, replaced = %previous, "Transition overridden");
            }
        }

        let core = Arc::new(Core {
            name: name.clone(),
            states: index,
            transitions: table,
            cursor: Mutex::new(Cursor {
                state: initial,
                epoch: 0,
            }),
            listeners: RwLock::new(Vec::new()),
            closing: AtomicBool::new(false),
        });

        let handler: Arc<dyn Handler<Envelope<S, E>>> = core.clone();
        let event_loop = EventLoop::new(format!("fsm {name}"), config, handler)?;

        let sink: Arc<dyn InternalEventSink<S>> = Arc::new(MachineSink {
            mailbox: event_loop.sender(),
        });
        for state in core.states.values() {
            state.attach(&sink);
        }

        debug!(machine = %name, states = core.states.len(), "State machine created");
        Ok(Self { core, event_loop })
    }

    /// The machine name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The current state.
    ///
    /// Only the worker changes it, so the value may be stale as soon as it is
    /// returned if events are in flight.
    pub fn current_state(&self) -> S {
        self.core.current().0
    }

    /// The registered state with this id.
    pub fn state(&self, id: &S) -> Option<&State<S>> {
        self.core.states.get(id)
    }

    /// The transition registered for `(state, trigger)` after merging.
    pub fn transition(&self, state: &S, trigger: &Trigger<E>) -> Option<&Transition<S, E>> {
        self.core.lookup(state, trigger)
    }

    /// Registers a listener for external transitions.
    pub fn add_listener<L>(&self, listener: L)
    where
        L: StateMachineListener<S> + 'static,
    {
        write(&self.core.listeners).push(Arc::new(listener));
    }

    /// Queues an event. Does nothing once the machine is shut down.
    pub fn fire_event(&self, event: E) {
        self.post(Envelope {
            trigger: Trigger::Event(event),
            payload: None,
            origin: None,
        });
    }

    /// Queues an event carrying `payload` for payload-consuming actions.
    pub fn fire_event_with<P>(&self, event: E, payload: P)
    where
        P: Any + Send + Sync,
    {
        self.post(Envelope {
            trigger: Trigger::Event(event),
            payload: Some(Arc::new(payload)),
            origin: None,
        });
    }

    fn post(&self, envelope: Envelope<S, E>) {
        if self.core.closing.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self.event_loop.send(envelope) {
            debug!(machine = %self.core.name, %err, "Event refused");
        }
    }

    /// Handles an event on the calling task instead of the worker.
    ///
    /// Unlike [`StateMachine::fire_event`], a missing transition is an error.
    /// Meant for tests; do not mix with concurrent asynchronous traffic.
    pub async fn fire_event_sync(&self, event: E) -> Result<()> {
        self.fire_sync(Envelope {
            trigger: Trigger::Event(event),
            payload: None,
            origin: None,
        })
        .await
    }

    /// [`StateMachine::fire_event_sync`] with a payload.
    pub async fn fire_event_sync_with<P>(&self, event: E, payload: P) -> Result<()>
    where
        P: Any + Send + Sync,
    {
        self.fire_sync(Envelope {
            trigger: Trigger::Event(event),
            payload: Some(Arc::new(payload)),
            origin: None,
        })
        .await
    }

    /// Raises an internal event on the calling task, as if the current
    /// state's timer had fired.
    pub async fn fire_internal_sync(&self, event: InternalEvent) -> Result<()> {
        self.fire_sync(Envelope {
            trigger: Trigger::Internal(event),
            payload: None,
            origin: None,
        })
        .await
    }

    async fn fire_sync(&self, envelope: Envelope<S, E>) -> Result<()> {
        if self.core.closing.load(Ordering::Acquire) {
            return Err(Error::Closed(self.core.name.clone()));
        }
        let (current, _) = self.core.current();
        if self.core.lookup(&current, &envelope.trigger).is_none() {
            return Err(Error::NoTransition {
                state: format!("{current:?}"),
                event: format!("{envelope:?}"),
            });
        }
        self.event_loop.process_now(envelope).await
    }

    /// Replaces the timer provider of every timed behavior.
    ///
    /// Timers already armed keep running; the provider is used from the next
    /// entry on.
    pub fn replace_timers(&self, provider: Arc<dyn TimerProvider>) {
        for state in self.core.states.values() {
            state.set_provider(&provider);
        }
    }

    /// Cancels every timer, then stops the event loop and drops listeners.
    ///
    /// Events still queued are drained, but states they enter arm no timers.
    /// Afterwards both firing paths refuse events.
    pub async fn shutdown(&self) {
        info!(machine = %self.core.name, "Shutting down state machine");
        self.core.closing.store(true, Ordering::Release);
        self.cancel_timers();
        self.event_loop.shutdown().await;
        // A transition already running when the flag was set may have armed.
        self.cancel_timers();
        write(&self.core.listeners).clear();
    }

    fn cancel_timers(&self) {
        for state in self.core.states.values() {
            state.shutdown();
        }
    }

    /// True once [`StateMachine::shutdown`] completed.
    pub fn is_shutdown(&self) -> bool {
        self.event_loop.is_shutdown()
    }
}

impl<S, E> Drop for StateMachine<S, E>
where
    S: StateId,
    E: EventId,
{
    fn drop(&mut self) {
        // The worker exits on its own once the mailbox is gone; timers do not.
        self.core.closing.store(true, Ordering::Release);
        self.cancel_timers();
    }
}

impl<S, E> Debug for StateMachine<S, E>
where
    S: StateId,
    E: EventId,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("name", &self.core.name)
            .field("current", &self.current_state())
            .field("states", &self.core.states.len())
            .field("event_loop", &self.event_loop)
            .finish()
    }
}
