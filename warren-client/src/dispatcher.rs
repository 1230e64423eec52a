//! Serial dispatch of consumer callbacks and channel events.
//!
//! The reader task only enqueues invocations, the queue is unbounded so a slow consumer never
//! blocks the reading of the socket. A worker task per channel runs the invocations in order.
use crate::channel::{CallbackException, ChannelEvents, ChannelShutdown};
use crate::consumer::ConsumerHandle;
use crate::error::{ClientError, ErrorKind};
use crate::event::panic_message;
use crate::lock;
use crate::message::{Confirm, Delivery, ReturnedMessage};
use crate::model::ChannelNumber;
use crate::shutdown::ShutdownReason;
use anyhow::{anyhow, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub(crate) enum Invocation {
    Deliver(ConsumerHandle, Delivery),
    /// Broker initiated cancel.
    Cancel(ConsumerHandle),
    CancelOk(ConsumerHandle),
    ConsumeOk(ConsumerHandle),
    Returned(ReturnedMessage),
    Confirm(Confirm),
    Shutdown(Arc<ShutdownReason>, Vec<ConsumerHandle>),
}

pub(crate) struct Dispatcher {
    sink: Mutex<Option<mpsc::UnboundedSender<Invocation>>>,
    shutdown: Arc<AtomicBool>,
}

impl Dispatcher {
    pub(crate) fn start(channel: ChannelNumber, events: Arc<ChannelEvents>, token: CancellationToken) -> Self {
        let (sink, stream) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));

        tokio::spawn(run(channel, stream, events, token, shutdown.clone()));

        Self {
            sink: Mutex::new(Some(sink)),
            shutdown,
        }
    }

    /// Enqueue an invocation, it returns false if the dispatcher doesn't accept more work.
    pub(crate) fn enqueue(&self, invocation: Invocation) -> bool {
        match lock(&self.sink).as_ref() {
            Some(sink) => sink.send(invocation).is_ok(),
            None => {
                log::debug!("Dispatcher is shut down, invocation is dropped");

                false
            }
        }
    }

    /// Enqueue the last invocation, every consumer gets exactly one shutdown call.
    pub(crate) fn shutdown(&self, reason: Arc<ShutdownReason>, consumers: Vec<ConsumerHandle>) {
        if let Some(sink) = lock(&self.sink).take() {
            let _ = sink.send(Invocation::Shutdown(reason, consumers));
        }
    }

    /// True after every consumer got its shutdown call.
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

async fn run(
    channel: ChannelNumber,
    mut stream: mpsc::UnboundedReceiver<Invocation>,
    events: Arc<ChannelEvents>,
    token: CancellationToken,
    shutdown: Arc<AtomicBool>,
) {
    while let Some(invocation) = stream.recv().await {
        match invocation {
            Invocation::Deliver(consumer, delivery) => {
                let handler = consumer.handler.clone();
                let token = token.clone();

                invoke(&events, channel, "handle_delivery", &consumer.tag, async move {
                    handler.handle_delivery(delivery, token).await
                })
                .await;
            }
            Invocation::Cancel(consumer) => {
                consumer.stop();

                let handler = consumer.handler.clone();
                let tag = consumer.tag.clone();
                let token = token.clone();

                invoke(&events, channel, "handle_cancel", &consumer.tag, async move {
                    handler.handle_cancel(tag, token).await
                })
                .await;
            }
            Invocation::CancelOk(consumer) => {
                consumer.stop();

                let handler = consumer.handler.clone();
                let tag = consumer.tag.clone();
                let token = token.clone();

                invoke(&events, channel, "handle_cancel_ok", &consumer.tag, async move {
                    handler.handle_cancel_ok(tag, token).await
                })
                .await;
            }
            Invocation::ConsumeOk(consumer) => {
                let handler = consumer.handler.clone();
                let tag = consumer.tag.clone();
                let token = token.clone();

                invoke(&events, channel, "handle_consume_ok", &consumer.tag, async move {
                    handler.handle_consume_ok(tag, token).await
                })
                .await;
            }
            Invocation::Returned(message) => {
                events.basic_returns.emit(&message);
            }
            Invocation::Confirm(confirm) => {
                events.basic_acks.emit(&confirm);
            }
            Invocation::Shutdown(reason, consumers) => {
                for consumer in consumers {
                    consumer.stop();

                    let handler = consumer.handler.clone();
                    let tag = consumer.tag.clone();
                    let reason = reason.clone();

                    // The channel token is already cancelled here.
                    invoke(&events, channel, "handle_channel_shutdown", &consumer.tag, async move {
                        handler
                            .handle_channel_shutdown(tag, reason, CancellationToken::new())
                            .await
                    })
                    .await;
                }

                shutdown.store(true, Ordering::Release);

                events.channel_shutdown.emit(&ChannelShutdown { channel, reason });

                break;
            }
        }
    }

    log::debug!("Dispatcher of channel {channel} stopped");
}

/// Run a consumer callback, a returned error or a panic is reported exactly once.
async fn invoke<F>(events: &ChannelEvents, channel: ChannelNumber, method: &'static str, consumer_tag: &str, f: F)
where
    F: Future<Output = Result<()>>,
{
    let result = match AssertUnwindSafe(f).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("consumer panicked: {}", panic_message(&*panic))),
    };

    if let Err(err) = result {
        log::warn!("Consumer {consumer_tag} failed in {method} on channel {channel}: {err:?}");

        let error = err.context(ClientError {
            kind: ErrorKind::CallbackException,
            channel: Some(channel),
            code: 0,
            message: format!("{method} of consumer {consumer_tag} failed"),
            class_method: 0,
        });

        events.callback_exception.emit(&CallbackException {
            channel,
            method,
            consumer_tag: consumer_tag.to_string(),
            error: Arc::new(error),
        });
    }
}
