//! Consumer callbacks and the default consumer.
//!
//! A consumer is registered with [`crate::Channel::basic_consume`] and its callbacks are invoked
//! one by one by the dispatcher task of the channel, never by the task reading the socket. Errors
//! and panics of the callbacks are contained, they are reported through the
//! `callback_exception` event of the channel.
use crate::event::EventList;
use crate::lock;
use crate::message::Delivery;
use crate::shutdown::ShutdownReason;
use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Callbacks of a consumer. Every method does nothing by default.
///
/// The token passed to the callbacks is cancelled when the channel closes, so long running
/// handlers can stop early.
pub trait Consumer: Send + Sync + 'static {
    fn handle_delivery(&self, _delivery: Delivery, _token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// The broker cancelled the consumer, for example because the queue was deleted.
    fn handle_cancel(&self, _consumer_tag: String, _token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn handle_cancel_ok(&self, _consumer_tag: String, _token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn handle_consume_ok(&self, _consumer_tag: String, _token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Called exactly once per consumer tag when the channel of the consumer closes.
    fn handle_channel_shutdown(
        &self,
        _consumer_tag: String,
        _reason: Arc<ShutdownReason>,
        _token: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// A registered consumer: its tag and its callbacks.
#[derive(Clone)]
pub struct ConsumerHandle {
    pub(crate) tag: String,
    pub(crate) handler: Arc<dyn Consumer>,
    running: Arc<AtomicBool>,
}

impl ConsumerHandle {
    pub(crate) fn new(tag: &str, handler: Arc<dyn Consumer>) -> Self {
        Self {
            tag: tag.to_string(),
            handler,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn handler(&self) -> Arc<dyn Consumer> {
        self.handler.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("tag", &self.tag)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Consumer tags which stopped, either by the broker or by a channel shutdown.
#[derive(Clone, Debug, PartialEq)]
pub struct ConsumerCancelled {
    pub consumer_tags: Vec<String>,
}

type DeliveryFn = Box<dyn Fn(Delivery, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Consumer keeping track of its tags, running state and the reason of the last shutdown.
pub struct DefaultConsumer {
    tags: Mutex<Vec<String>>,
    running: AtomicBool,
    shutdown_reason: Mutex<Option<Arc<ShutdownReason>>>,
    pub consumer_cancelled: EventList<ConsumerCancelled>,
    on_delivery: Option<DeliveryFn>,
}

impl Default for DefaultConsumer {
    fn default() -> Self {
        Self {
            tags: Mutex::new(vec![]),
            running: AtomicBool::new(false),
            shutdown_reason: Mutex::new(None),
            consumer_cancelled: EventList::new("consumer_cancelled"),
            on_delivery: None,
        }
    }
}

impl DefaultConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default consumer which passes the deliveries to `f`.
    pub fn with_delivery<F>(f: F) -> Self
    where
        F: Fn(Delivery, CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            on_delivery: Some(Box::new(f)),
            ..Default::default()
        }
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        lock(&self.tags).clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn shutdown_reason(&self) -> Option<Arc<ShutdownReason>> {
        lock(&self.shutdown_reason).clone()
    }

    fn remove_tag(&self, consumer_tag: &str) {
        let mut tags = lock(&self.tags);

        tags.retain(|t| t != consumer_tag);

        self.running.store(!tags.is_empty(), Ordering::Release);
    }

    fn cancelled(&self, consumer_tag: String) {
        self.remove_tag(&consumer_tag);

        self.consumer_cancelled.emit(&ConsumerCancelled {
            consumer_tags: vec![consumer_tag],
        });
    }
}

impl Consumer for DefaultConsumer {
    fn handle_delivery(&self, delivery: Delivery, token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        match &self.on_delivery {
            Some(f) => f(delivery, token),
            None => Box::pin(async { Ok(()) }),
        }
    }

    fn handle_cancel(&self, consumer_tag: String, _token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        self.cancelled(consumer_tag);

        Box::pin(async { Ok(()) })
    }

    fn handle_cancel_ok(&self, consumer_tag: String, _token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        self.cancelled(consumer_tag);

        Box::pin(async { Ok(()) })
    }

    fn handle_consume_ok(&self, consumer_tag: String, _token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        let mut tags = lock(&self.tags);

        if !tags.contains(&consumer_tag) {
            tags.push(consumer_tag);
        }

        self.running.store(true, Ordering::Release);

        Box::pin(async { Ok(()) })
    }

    fn handle_channel_shutdown(
        &self,
        consumer_tag: String,
        reason: Arc<ShutdownReason>,
        _token: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        *lock(&self.shutdown_reason) = Some(reason);

        self.cancelled(consumer_tag);

        Box::pin(async { Ok(()) })
    }
}
