//! Error types for the state machine

use thiserror::Error;

/// Result type alias for state machine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or driving a state machine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A transition or timed behavior references a state the machine does not know
    #[error("No state with id {state} ({context})")]
    UnknownState {
        /// Debug rendering of the missing state id
        state: String,
        /// Where the reference was found
        context: String,
    },

    /// The same state id was registered twice
    #[error("State {0} registered more than once")]
    DuplicateState(String),

    /// The machine was built without an initial state
    #[error("State machine {0} has no initial state")]
    MissingInitialState(String),

    /// A configuration value is out of range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The event loop was created outside of a Tokio runtime
    #[error("Event loop {0} must be created inside a Tokio runtime")]
    NoRuntime(String),

    /// The event loop no longer accepts messages
    #[error("Event loop {0} is shut down")]
    Closed(String),

    /// No transition is registered for the current state and event
    #[error("No transition found for event {event} in state {state}")]
    NoTransition {
        /// Debug rendering of the current state
        state: String,
        /// Debug rendering of the event
        event: String,
    },

    /// A payload-consuming action got no payload, or one of another type
    #[error("Action expected a payload of type {expected}, got {found}")]
    PayloadMismatch {
        /// Type name the action consumes
        expected: &'static str,
        /// What was actually delivered
        found: &'static str,
    },
}

impl Error {
    pub(crate) fn unknown_state(state: &impl std::fmt::Debug, context: impl Into<String>) -> Self {
        Self::UnknownState {
            state: format!("{state:?}"),
            context: context.into(),
        }
    }
}
