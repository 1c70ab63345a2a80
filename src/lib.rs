//! # Timed Finite State Machine
//!
//! An embeddable finite state machine engine for Tokio applications, with
//! states that time out, beat periodically, or leave when a condition holds.
//!
//! ## Features
//!
//! - **Serialized processing**: every event is handled on one worker task,
//!   in submission order, so callbacks never race each other
//! - **Non-blocking submission**: `fire_event` only enqueues into a bounded
//!   mailbox
//! - **Timed states**: timeouts, heartbeats, guarded heartbeats and exit
//!   conditions, stackable on one state
//! - **Stale timer filtering**: a timer event from a past visit of a state
//!   never triggers a transition
//! - **Deterministic tests**: swap the timer source for a
//!   [`ManualTimerProvider`] and fire timers by hand
//!
//! ## Quick Start
//!
//! ```rust
//! use timed_fsm::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! enum Door { Closed, Opened }
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! enum Cmd { Open, Close }
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let fsm = StateMachineBuilder::new("lift door")
//!     .state(State::new(Door::Closed))
//!     .state(
//!         State::new(Door::Opened)
//!             .with_timeout(Timeout::after(Duration::from_millis(500), Door::Closed)),
//!     )
//!     .transition(Transition::on(Door::Closed, Cmd::Open).to(Door::Opened))
//!     .transition(Transition::on(Door::Opened, Cmd::Close).to(Door::Closed))
//!     .initial(Door::Closed)
//!     .build()?;
//!
//! fsm.fire_event(Cmd::Open);
//! // Closes by itself half a second later.
//! fsm.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

mod behavior;
mod builder;
mod error;
mod event_loop;
mod fsm;
mod listener;
mod state;
mod timer;
mod transition;
mod util;

pub use behavior::{
    Behavior, Heartbeat, InternalEventSink, Monitor, Predicate, Signal, Timeout, TimerPhase,
};
pub use builder::StateMachineBuilder;
pub use error::{Error, Result};
pub use event_loop::{
    EventLoop, EventLoopConfig, Handler, MailboxSender, DEFAULT_CAPACITY, DEFAULT_SHUTDOWN_GRACE,
};
pub use fsm::StateMachine;
pub use listener::{channel_listener, ChannelListener, StateChange, StateMachineListener};
pub use state::{Callback, EventId, State, StateId};
pub use timer::{
    ManualTimerProvider, Schedule, Tick, TimerHandle, TimerProvider, TimerTask,
    TokioTimerProvider,
};
pub use transition::{Guard, InternalEvent, Payload, Transition, Trigger};

pub use std::time::Duration;

pub mod prelude {
    //! Prelude module for convenient imports
    pub use crate::{
        Error, Heartbeat, InternalEvent, Monitor, Result, State, StateMachine,
        StateMachineBuilder, StateMachineListener, Timeout, Transition, Trigger,
    };
    pub use std::time::Duration;
}
