//! Observing state changes

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Notified on the machine worker around every external transition.
///
/// Internal transitions never notify. Both methods default to doing nothing.
pub trait StateMachineListener<S>: Send + Sync {
    /// `state` became current.
    fn on_state_entered(&self, state: &S) {
        let _ = state;
    }

    /// `state` is being left.
    fn on_state_exited(&self, state: &S) {
        let _ = state;
    }
}

/// A state change as seen by a [`ChannelListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange<S> {
    /// The state was entered
    Entered(S),
    /// The state was exited
    Exited(S),
}

/// Forwards every notification into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener<S> {
    sender: UnboundedSender<StateChange<S>>,
}

/// Creates a [`ChannelListener`] and the receiver its notifications go to.
pub fn channel_listener<S>() -> (ChannelListener<S>, UnboundedReceiver<StateChange<S>>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelListener { sender }, receiver)
}

impl<S> StateMachineListener<S> for ChannelListener<S>
where
    S: Clone + Send + Sync,
{
    fn on_state_entered(&self, state: &S) {
        // The receiver may be gone; the machine does not care.
        let _ = self.sender.send(StateChange::Entered(state.clone()));
    }

    fn on_state_exited(&self, state: &S) {
        let _ = self.sender.send(StateChange::Exited(state.clone()));
    }
}
