//! A bounded mailbox drained by one dedicated worker task.
//!
//! [`EventLoop`] serializes messages of type `M` onto a single Tokio task.
//! Senders never block: [`EventLoop::send`] either enqueues, drops the
//! message with an error log when the mailbox is full, or fails with
//! [`Error::Closed`] once the loop is shut down.

use async_trait::async_trait;
use futures::FutureExt;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn, Instrument};

use crate::util::{lock, panic_message};
use crate::{Error, Result};

/// Default mailbox capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default time granted to the worker to drain its mailbox on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Sizing and shutdown settings of an [`EventLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// Number of messages the mailbox holds before new ones are dropped
    pub capacity: usize,
    /// How long `shutdown` waits for the worker before aborting it, and then
    /// again after aborting it
    pub shutdown_grace: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl EventLoopConfig {
    /// Checks that capacity and grace period are non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity can't be 0".into()));
        }
        if self.shutdown_grace.is_zero() {
            return Err(Error::InvalidConfig("shutdown delay can't be 0".into()));
        }
        Ok(())
    }
}

/// Processes the messages of an [`EventLoop`].
///
/// `on_message` is only ever called by one task at a time, except when a
/// caller deliberately uses [`EventLoop::process_now`].
#[async_trait]
pub trait Handler<M>: Send + Sync + 'static {
    /// Handles one message. An `Err` is logged with the message and the
    /// worker moves on to the next one.
    async fn on_message(&self, message: &M) -> Result<()>;
}

struct Mailbox<M> {
    name: String,
    sender: Mutex<Option<mpsc::Sender<M>>>,
}

impl<M: Debug> Mailbox<M> {
    fn post(&self, message: M) -> Result<()> {
        let sender = lock(&self.sender);
        let Some(sender) = sender.as_ref() else {
            return Err(Error::Closed(self.name.clone()));
        };

        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                error!(event_loop = %self.name, "Task is rejected, actor queue may be full");
                error!(event_loop = %self.name, ?message, "Rejected message");
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(Error::Closed(self.name.clone())),
        }
    }
}

/// A cloneable, non-owning handle for posting into an [`EventLoop`].
///
/// Holding a sender does not keep the loop alive; once the loop is shut down
/// or dropped, [`MailboxSender::send`] returns [`Error::Closed`].
pub struct MailboxSender<M> {
    name: String,
    mailbox: Weak<Mailbox<M>>,
}

impl<M> Clone for MailboxSender<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            mailbox: Weak::clone(&self.mailbox),
        }
    }
}

impl<M> Debug for MailboxSender<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxSender")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<M: Debug> MailboxSender<M> {
    /// Same contract as [`EventLoop::send`].
    pub fn send(&self, message: M) -> Result<()> {
        match self.mailbox.upgrade() {
            Some(mailbox) => mailbox.post(message),
            None => Err(Error::Closed(self.name.clone())),
        }
    }
}

/// Single worker execution context with a bounded mailbox.
pub struct EventLoop<M> {
    mailbox: Arc<Mailbox<M>>,
    handler: Arc<dyn Handler<M>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    terminated: AtomicBool,
    config: EventLoopConfig,
}

impl<M> Debug for EventLoop<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("name", &self.mailbox.name)
            .field("config", &self.config)
            .field("terminated", &self.terminated.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<M> EventLoop<M>
where
    M: Debug + Send + Sync + 'static,
{
    /// Starts a loop whose worker hands every message to `handler`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        name: impl Into<String>,
        config: EventLoopConfig,
        handler: Arc<dyn Handler<M>>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime(name.clone()))?;

        let (sender, inbox) = mpsc::channel(config.capacity);
        let span = tracing::info_span!("event_loop", name = %name);
        let worker = runtime.spawn(run(Arc::clone(&handler), inbox).instrument(span));

        Ok(Self {
            mailbox: Arc::new(Mailbox {
                name,
                sender: Mutex::new(Some(sender)),
            }),
            handler,
            worker: Mutex::new(Some(worker)),
            terminated: AtomicBool::new(false),
            config,
        })
    }

    /// The loop name, used in logs and errors.
    pub fn name(&self) -> &str {
        &self.mailbox.name
    }

    /// Enqueues a message without blocking.
    ///
    /// A full mailbox drops the message and logs it; the caller is not told.
    /// After [`EventLoop::shutdown`] this fails with [`Error::Closed`].
    pub fn send(&self, message: M) -> Result<()> {
        self.mailbox.post(message)
    }

    /// Returns a weak handle other tasks can post through.
    pub fn sender(&self) -> MailboxSender<M> {
        MailboxSender {
            name: self.mailbox.name.clone(),
            mailbox: Arc::downgrade(&self.mailbox),
        }
    }

    /// Runs the handler on the calling task, bypassing the mailbox.
    ///
    /// This skips the serialization the worker provides. Only use it when no
    /// message can be in flight concurrently, typically in tests.
    pub async fn process_now(&self, message: M) -> Result<()> {
        self.handler.on_message(&message).await
    }

    /// Stops accepting messages, lets the worker drain the mailbox for the
    /// grace period, then aborts it.
    pub async fn shutdown(&self) {
        drop(lock(&self.mailbox.sender).take());

        let Some(mut worker) = lock(&self.worker).take() else {
            return;
        };

        let grace = self.config.shutdown_grace;
        match tokio::time::timeout(grace, &mut worker).await {
            Ok(joined) => self.report(joined),
            Err(_) => {
                warn!(event_loop = %self.name(), ?grace, "Worker did not drain in time, aborting");
                worker.abort();
                match tokio::time::timeout(grace, &mut worker).await {
                    Ok(joined) => self.report(joined),
                    Err(_) => error!(event_loop = %self.name(), "Actor failed to shutdown"),
                }
            }
        }
        self.terminated.store(true, Ordering::Release);
    }

    /// True once [`EventLoop::shutdown`] has completed.
    pub fn is_shutdown(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn report(&self, joined: std::result::Result<(), JoinError>) {
        match joined {
            Ok(()) => debug!(event_loop = %self.name(), "Worker stopped"),
            Err(err) if err.is_cancelled() => {
                debug!(event_loop = %self.name(), "Worker cancelled")
            }
            Err(err) => error!(event_loop = %self.name(), %err, "Task failed with exception"),
        }
    }
}

async fn run<M>(handler: Arc<dyn Handler<M>>, mut inbox: mpsc::Receiver<M>)
where
    M: Debug + Send + Sync + 'static,
{
    debug!("Worker started");
    while let Some(message) = inbox.recv().await {
        match AssertUnwindSafe(handler.on_message(&message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(?message, %err, "Message handler failed"),
            Err(panic) => error!(
                ?message,
                panic = panic_message(panic.as_ref()),
                "Message handler panicked"
            ),
        }
    }
    debug!("Mailbox closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio_test::{assert_err, assert_ok};

    fn quick() -> EventLoopConfig {
        EventLoopConfig {
            capacity: DEFAULT_CAPACITY,
            shutdown_grace: Duration::from_millis(200),
        }
    }

    struct Recorder(UnboundedSender<String>);

    #[async_trait]
    impl Handler<String> for Recorder {
        async fn on_message(&self, message: &String) -> Result<()> {
            let _ = self.0.send(message.clone());
            Ok(())
        }
    }

    struct Broken {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<String> for Broken {
        async fn on_message(&self, message: &String) -> Result<()> {
            let n = self.seen.fetch_add(1, Ordering::SeqCst);
            if n % 2 == 0 {
                panic!("I broke folks... {message}");
            }
            Err(Error::InvalidConfig("handler refused".into()))
        }
    }

    struct Sleeping;

    #[async_trait]
    impl Handler<String> for Sleeping {
        async fn on_message(&self, _message: &String) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn recorder() -> (Arc<dyn Handler<String>>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    #[tokio::test]
    async fn test_start_stop() {
        let (handler, _rx) = recorder();
        let event_loop = EventLoop::new("start-stop", quick(), handler).unwrap();
        assert!(!event_loop.is_shutdown());

        event_loop.shutdown().await;
        assert!(event_loop.is_shutdown());
    }

    #[tokio::test]
    async fn test_messages_are_processed_in_order() {
        let (handler, mut rx) = recorder();
        let event_loop = EventLoop::new("fifo", quick(), handler).unwrap();

        for i in 0..100 {
            assert_ok!(event_loop.send(format!("Msg #{i}")));
        }
        event_loop.shutdown().await;

        let mut received = Vec::new();
        while let Ok(message) = rx.try_recv() {
            received.push(message);
        }
        let expected: Vec<String> = (0..100).map(|i| format!("Msg #{i}")).collect();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_worker() {
        let seen = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(Broken {
            seen: Arc::clone(&seen),
        });
        let event_loop = EventLoop::new("broken", quick(), handler).unwrap();

        for i in 0..4 {
            assert_ok!(event_loop.send(format!("Msg #{i}")));
        }
        event_loop.shutdown().await;

        assert!(event_loop.is_shutdown());
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_sleeping_handler_is_aborted_on_shutdown() {
        let event_loop = EventLoop::new("sleeping", quick(), Arc::new(Sleeping)).unwrap();
        assert_ok!(event_loop.send("Msg #1".to_string()));
        assert_ok!(event_loop.send("Msg #2".to_string()));

        event_loop.shutdown().await;
        assert!(event_loop.is_shutdown());
    }

    #[tokio::test]
    async fn test_overflow_drops_without_failing_sender() {
        let config = EventLoopConfig {
            capacity: 2,
            shutdown_grace: Duration::from_millis(100),
        };
        let event_loop = EventLoop::new("overflow", config, Arc::new(Sleeping)).unwrap();

        for i in 0..10 {
            assert_ok!(event_loop.send(format!("Msg #{i}")));
        }

        event_loop.shutdown().await;
        assert!(event_loop.is_shutdown());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (handler, _rx) = recorder();
        let zero_capacity = EventLoopConfig {
            capacity: 0,
            ..EventLoopConfig::default()
        };
        let result = EventLoop::new("zero", zero_capacity, Arc::clone(&handler));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));

        let zero_grace = EventLoopConfig {
            shutdown_grace: Duration::ZERO,
            ..EventLoopConfig::default()
        };
        let result = EventLoop::new("zero", zero_grace, handler);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_requires_runtime() {
        let (handler, _rx) = recorder();
        let result = EventLoop::new("no-runtime", EventLoopConfig::default(), handler);
        assert!(matches!(result, Err(Error::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (handler, _rx) = recorder();
        let event_loop = EventLoop::new("closed", quick(), handler).unwrap();
        let sender = event_loop.sender();
        event_loop.shutdown().await;

        let result = event_loop.send("Msg #1".to_string());
        assert_eq!(result, Err(Error::Closed("closed".into())));
        assert_err!(sender.send("Msg #2".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (handler, _rx) = recorder();
        let event_loop = EventLoop::new("twice", quick(), handler).unwrap();
        event_loop.shutdown().await;
        event_loop.shutdown().await;
        assert!(event_loop.is_shutdown());
    }

    #[tokio::test]
    async fn test_sender_reaches_worker() {
        let (handler, mut rx) = recorder();
        let event_loop = EventLoop::new("sender", quick(), handler).unwrap();
        let sender = event_loop.sender();

        tokio::spawn(async move { sender.send("from task".to_string()) })
            .await
            .unwrap()
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(received.unwrap().as_deref(), Some("from task"));
        event_loop.shutdown().await;
    }

    #[tokio::test]
    async fn test_sender_outliving_loop_reports_closed() {
        let (handler, _rx) = recorder();
        let event_loop = EventLoop::new("dropped", quick(), handler).unwrap();
        let sender = event_loop.sender();
        drop(event_loop);

        assert_eq!(
            sender.send("late".to_string()),
            Err(Error::Closed("dropped".into()))
        );
    }

    #[tokio::test]
    async fn test_process_now_runs_on_caller() {
        let (handler, mut rx) = recorder();
        let event_loop = EventLoop::new("direct", quick(), handler).unwrap();

        assert_ok!(event_loop.process_now("inline".to_string()).await);
        assert_eq!(rx.try_recv().as_deref(), Ok("inline"));
        event_loop.shutdown().await;
    }
}
