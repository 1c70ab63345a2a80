//! Builder pattern implementation for state machines

use std::sync::Arc;
use std::time::Duration;

use crate::event_loop::EventLoopConfig;
use crate::state::{EventId, State, StateId};
use crate::timer::TimerProvider;
use crate::transition::Transition;
use crate::{Error, Result, StateMachine};

/// Builder for constructing state machines
pub struct StateMachineBuilder<S, E>
where
    S: StateId,
    E: EventId,
{
    name: String,
    states: Vec<State<S>>,
    transitions: Vec<Transition<S, E>>,
    initial: Option<S>,
    config: EventLoopConfig,
    timers: Option<Arc<dyn TimerProvider>>,
}

impl<S, E> StateMachineBuilder<S, E>
where
    S: StateId,
    E: EventId,
{
    /// Create a new builder for a machine called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            transitions: Vec::new(),
            initial: None,
            config: EventLoopConfig::default(),
            timers: None,
        }
    }

    /// Rename the machine
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a state to the state machine
    pub fn state(mut self, state: State<S>) -> Self {
        self.states.push(state);
        self
    }

    /// Add several states
    pub fn states(mut self, states: impl IntoIterator<Item = State<S>>) -> Self {
        self.states.extend(states);
        self
    }

    /// Add a transition
    pub fn transition(mut self, transition: Transition<S, E>) -> Self {
        self.transitions.push(transition);
        self
    }

    /// Add several transitions
    pub fn transitions(mut self, transitions: impl IntoIterator<Item = Transition<S, E>>) -> Self {
        self.transitions.extend(transitions);
        self
    }

    /// Set the state the machine starts in. Its entry hook does not run.
    pub fn initial(mut self, state: S) -> Self {
        self.initial = Some(state);
        self
    }

    /// Bound of the event mailbox; events beyond it are dropped
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = capacity;
        self
    }

    /// How long shutdown waits for queued events before aborting the worker
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace = grace;
        self
    }

    /// Use `provider` for every timed behavior instead of Tokio timers
    pub fn timer_provider(mut self, provider: Arc<dyn TimerProvider>) -> Self {
        self.timers = Some(provider);
        self
    }

    /// Build the state machine
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<StateMachine<S, E>> {
        let initial = self
            .initial
            .ok_or_else(|| Error::MissingInitialState(self.name.clone()))?;
        let machine = StateMachine::with_config(
            self.states,
            self.transitions,
            self.name,
            initial,
            self.config,
        )?;
        if let Some(provider) = self.timers {
            machine.replace_timers(provider);
        }
        Ok(machine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Timeout;
    use crate::timer::ManualTimerProvider;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Lamp {
        Off,
        On,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum Switch {
        Toggle,
    }

    #[tokio::test]
    async fn test_build_requires_initial_state() {
        let result = StateMachineBuilder::<Lamp, Switch>::new("lamp")
            .state(State::new(Lamp::Off))
            .build();
        assert_eq!(result.unwrap_err(), Error::MissingInitialState("lamp".into()));
    }

    #[tokio::test]
    async fn test_build_rejects_zero_capacity() {
        let result = StateMachineBuilder::<Lamp, Switch>::new("lamp")
            .state(State::new(Lamp::Off))
            .initial(Lamp::Off)
            .mailbox_capacity(0)
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_build_applies_timer_provider() {
        let timers = ManualTimerProvider::new();
        let machine = StateMachineBuilder::new("lamp")
            .states([
                State::new(Lamp::Off),
                State::new(Lamp::On)
                    .with_timeout(Timeout::after(Duration::from_secs(60), Lamp::Off)),
            ])
            .transitions([
                Transition::on(Lamp::Off, Switch::Toggle).to(Lamp::On),
                Transition::on(Lamp::On, Switch::Toggle).to(Lamp::Off),
            ])
            .initial(Lamp::Off)
            .name("hall lamp")
            .shutdown_grace(Duration::from_millis(100))
            .timer_provider(Arc::new(timers.clone()))
            .build()
            .unwrap();

        assert_eq!(machine.name(), "hall lamp");
        machine.fire_event_sync(Switch::Toggle).await.unwrap();
        assert_eq!(timers.labels(), vec!["Timer [On]"]);

        assert_eq!(timers.fire_all(), 1);
        machine.shutdown().await;
        assert_eq!(machine.current_state(), Lamp::Off);
    }
}
