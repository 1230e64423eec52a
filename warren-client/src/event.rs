//! Ordered multi-subscriber notifications.
//!
//! Handlers are called one after the other in subscription order. A failing or panicking handler
//! is logged and doesn't stop the rest of the handlers.
use crate::lock;
use anyhow::{anyhow, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Handler<E> = Arc<dyn Fn(&E) -> Result<()> + Send + Sync>;

/// Identifies a subscription, it can be used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

pub struct EventList<E> {
    name: &'static str,
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Handler<E>)>>,
}

impl<E> EventList<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(vec![]),
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        lock(&self.handlers).push((id, Arc::new(handler)));

        Subscription(id)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut handlers = lock(&self.handlers);
        let before = handlers.len();

        handlers.retain(|(id, _)| *id != subscription.0);

        handlers.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every handler with the event. Returns the errors of the failed handlers.
    pub fn emit(&self, event: &E) -> Vec<anyhow::Error> {
        // Handlers may subscribe or emit, so they run outside of the lock.
        let handlers: Vec<Handler<E>> = lock(&self.handlers).iter().map(|(_, h)| h.clone()).collect();
        let mut errors = vec![];

        for handler in handlers {
            let result = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(result) => result,
                Err(panic) => Err(anyhow!("event handler panicked: {}", panic_message(&*panic))),
            };

            if let Err(e) = result {
                log::warn!("Handler of {} event failed: {e:?}", self.name);

                errors.push(e);
            }
        }

        errors
    }
}

impl<E> std::fmt::Debug for EventList<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventList")
            .field("name", &self.name)
            .field("handlers", &self.len())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
