//! Channels multiplexed over a connection.
//!
//! A channel goes through `Opening -> Open -> Closing -> Closed`. Synchronous methods are
//! serialized per channel, the single pending request is completed by the reader task when the
//! matching reply arrives, or failed when the channel closes.
use crate::client_error;
use crate::connection::ConnectionInner;
use crate::consumer::{Consumer, ConsumerHandle};
use crate::dispatcher::{Dispatcher, Invocation};
use crate::error::ErrorKind;
use crate::event::EventList;
use crate::lock;
use crate::message::{Assembled, Confirm, ContentStart, IncomingContent, ReturnedMessage};
use crate::model::{ChannelNumber, ClassMethod, ConnectionError, REPLY_SUCCESS};
use crate::shutdown::ShutdownReason;
use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use warren_codec::codec::{Frame, FRAME_OVERHEAD};
use warren_codec::frame::{self, AMQPFrame, MethodFrameArgs};
use warren_codec::method::oversized_short_string;
use warren_codec::wire::SHORT_STRING_MAX;

/// The channel was closed, the reason is the same object the connection or the broker gave.
#[derive(Clone, Debug)]
pub struct ChannelShutdown {
    pub channel: ChannelNumber,
    pub reason: Arc<ShutdownReason>,
}

/// A consumer callback returned an error or panicked.
#[derive(Clone, Debug)]
pub struct CallbackException {
    pub channel: ChannelNumber,
    /// Name of the consumer callback, like `handle_delivery`.
    pub method: &'static str,
    pub consumer_tag: String,
    pub error: Arc<anyhow::Error>,
}

pub struct ChannelEvents {
    pub channel_shutdown: EventList<ChannelShutdown>,
    pub callback_exception: EventList<CallbackException>,
    /// Publisher confirms, only in confirm mode.
    pub basic_acks: EventList<Confirm>,
    pub basic_returns: EventList<ReturnedMessage>,
}

impl Default for ChannelEvents {
    fn default() -> Self {
        Self {
            channel_shutdown: EventList::new("channel_shutdown"),
            callback_exception: EventList::new("callback_exception"),
            basic_acks: EventList::new("basic_acks"),
            basic_returns: EventList::new("basic_returns"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// Timeouts and limits a channel inherits from its connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChannelSettings {
    pub(crate) continuation_timeout: Duration,
    pub(crate) close_timeout: Duration,
    pub(crate) abort_timeout: Duration,
    pub(crate) frame_max: usize,
}

struct PendingRpc {
    expects: &'static [ClassMethod],
    reply: oneshot::Sender<Result<MethodFrameArgs>>,
}

struct ChannelData {
    state: ChannelState,
    rpc: Option<PendingRpc>,
    /// Consumer of the `Basic.Consume` in flight, registered when `Basic.ConsumeOk` arrives.
    pending_consumer: Option<Arc<dyn Consumer>>,
    consumers: HashMap<String, ConsumerHandle>,
    content: Option<IncomingContent>,
    close_ok: Option<oneshot::Sender<()>>,
    /// Close is sent but close-ok hasn't arrived, the channel number stays reserved.
    awaiting_close_ok: bool,
    confirm_mode: bool,
    next_publish_seq_no: u64,
    flow_active: bool,
}

pub(crate) struct ChannelInner {
    pub(crate) number: ChannelNumber,
    connection: Weak<ConnectionInner>,
    data: Mutex<ChannelData>,
    rpc_lock: tokio::sync::Mutex<()>,
    reason: OnceLock<Arc<ShutdownReason>>,
    finished: AtomicBool,
    dispatcher: Dispatcher,
    events: Arc<ChannelEvents>,
    token: CancellationToken,
    closed: watch::Sender<bool>,
    settings: ChannelSettings,
}

/// Handle of a channel, it can be cloned and shared between tasks.
#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.inner.number)
            .field("state", &self.state())
            .finish()
    }
}

impl ChannelInner {
    pub(crate) fn new(
        number: ChannelNumber,
        connection: Weak<ConnectionInner>,
        events: Arc<ChannelEvents>,
        settings: ChannelSettings,
    ) -> Arc<Self> {
        let token = CancellationToken::new();
        let (closed, _) = watch::channel(false);

        Arc::new(Self {
            number,
            connection,
            data: Mutex::new(ChannelData {
                state: ChannelState::Opening,
                rpc: None,
                pending_consumer: None,
                consumers: HashMap::new(),
                content: None,
                close_ok: None,
                awaiting_close_ok: false,
                confirm_mode: false,
                next_publish_seq_no: 0,
                flow_active: true,
            }),
            rpc_lock: tokio::sync::Mutex::new(()),
            reason: OnceLock::new(),
            finished: AtomicBool::new(false),
            dispatcher: Dispatcher::start(number, events.clone(), token.clone()),
            events,
            token,
            closed,
            settings,
        })
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        match self.connection.upgrade() {
            Some(connection) => connection.send(frame).await,
            None => client_error!(
                ErrorKind::ClosedState,
                Some(self.number),
                0,
                "Connection is already dropped",
                0
            ),
        }
    }

    /// Error of a request against a closing or closed channel, carrying the close reason.
    fn closed_error<T>(&self, class_method: ClassMethod) -> Result<T> {
        match self.reason.get() {
            Some(reason) => client_error!(
                ErrorKind::ClosedState,
                Some(self.number),
                reason.reply_code,
                reason.reply_text.as_str(),
                class_method
            ),
            None => client_error!(
                ErrorKind::ClosedState,
                Some(self.number),
                0,
                "Channel is closed",
                class_method
            ),
        }
    }

    fn ensure_encodable(&self, args: &MethodFrameArgs) -> Result<()> {
        match oversized_short_string(args) {
            Some(value) => client_error!(
                ErrorKind::InvalidArgument,
                Some(self.number),
                ConnectionError::SyntaxError as u16,
                format!("Value of {} bytes is longer than {SHORT_STRING_MAX} bytes", value.len()),
                args.class_method()
            ),
            None => Ok(()),
        }
    }

    fn ensure_open(&self, data: &ChannelData, class_method: ClassMethod) -> Result<()> {
        match data.state {
            ChannelState::Opening | ChannelState::Open => Ok(()),
            ChannelState::Closing | ChannelState::Closed => self.closed_error(class_method),
        }
    }

    fn abandon_rpc(&self) {
        let mut data = lock(&self.data);

        data.rpc = None;
        data.pending_consumer = None;
    }

    fn complete_rpc(&self, class_method: ClassMethod, args: MethodFrameArgs) {
        let pending = {
            let mut data = lock(&self.data);

            let expected = data
                .rpc
                .as_ref()
                .is_some_and(|rpc| rpc.expects.contains(&class_method));

            if expected {
                data.rpc.take()
            } else {
                None
            }
        };

        match pending {
            Some(rpc) => {
                let _ = rpc.reply.send(Ok(args));
            }
            None => log::warn!(
                "Unexpected method {:08X} on channel {}, no request waits for it",
                class_method,
                self.number
            ),
        }
    }

    /// Set the reason if it is not set yet and close the channel.
    pub(crate) fn shutdown(self: &Arc<Self>, reason: Arc<ShutdownReason>) {
        let _ = self.reason.set(reason);

        self.finish();
    }

    /// Transition to Closed, it runs once no matter how many paths try to close the channel.
    fn finish(self: &Arc<Self>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let reason = self
            .reason
            .get_or_init(|| Arc::new(ShutdownReason::library(REPLY_SUCCESS, "Channel closed")))
            .clone();

        let (pending, consumers, release) = {
            let mut data = lock(&self.data);

            data.state = ChannelState::Closed;
            data.content = None;
            data.pending_consumer = None;
            data.close_ok = None;

            let consumers: Vec<ConsumerHandle> = data.consumers.drain().map(|(_, h)| h).collect();

            (data.rpc.take(), consumers, !data.awaiting_close_ok)
        };

        log::debug!("Channel {} is closed, {}", self.number, reason);

        if let Some(rpc) = pending {
            let _ = rpc.reply.send(self.closed_error(0));
        }

        self.token.cancel();
        self.dispatcher.shutdown(reason, consumers);

        if release {
            self.release();
        }

        self.closed.send_replace(true);
    }

    fn release(self: &Arc<Self>) {
        if let Some(connection) = self.connection.upgrade() {
            connection.release_channel(self.number, self);
        }
    }

    /// Handle a frame routed to this channel by the reader task. An error means the broker
    /// violated the protocol and the connection has to be closed.
    pub(crate) async fn handle_frame(self: &Arc<Self>, frame: AMQPFrame) -> Result<()> {
        match frame {
            AMQPFrame::Method(_, cm, args) => self.handle_method(cm, args).await,
            AMQPFrame::ContentHeader(header) => self.handle_content_header(header.body_size, header.properties),
            AMQPFrame::ContentBody(body) => self.handle_content_body(body.body),
            other => self.unexpected_frame(&format!("Unexpected frame {other:?}")),
        }
    }

    fn unexpected_frame(&self, message: &str) -> Result<()> {
        client_error!(
            ErrorKind::ProtocolDecode,
            Some(self.number),
            ConnectionError::UnexpectedFrame as u16,
            message,
            0
        )
    }

    async fn handle_method(self: &Arc<Self>, cm: ClassMethod, args: MethodFrameArgs) -> Result<()> {
        match args {
            MethodFrameArgs::ChannelClose(close) => {
                log::info!(
                    "Broker closed channel {} code={} text={}",
                    self.number,
                    close.code,
                    close.text
                );

                // Close-ok is sent by the library, the broker doesn't wait for the application.
                if let Err(e) = self.send(frame::channel_close_ok(self.number).into()).await {
                    log::error!("Cannot send close-ok on channel {}: {e:?}", self.number);
                }

                let reason = ShutdownReason::peer(close.code, &close.text, close.class_method());

                lock(&self.data).awaiting_close_ok = false;
                self.shutdown(Arc::new(reason));
            }
            MethodFrameArgs::ChannelCloseOk => {
                let (waiter, finished) = {
                    let mut data = lock(&self.data);

                    data.awaiting_close_ok = false;

                    (data.close_ok.take(), self.finished.load(Ordering::Acquire))
                };

                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(());
                    }
                    // The close timed out or was cancelled before, the number can be reused now.
                    None if finished => self.release(),
                    None => log::warn!("Unexpected close-ok on channel {}", self.number),
                }
            }
            MethodFrameArgs::ChannelFlow(flow) => {
                lock(&self.data).flow_active = flow.active;

                log::info!("Broker set flow of channel {} to {}", self.number, flow.active);

                self.send(frame::channel_flow_ok(self.number, flow.active).into()).await?;
            }
            MethodFrameArgs::BasicDeliver(args) => self.start_content(ContentStart::Deliver(args))?,
            MethodFrameArgs::BasicReturn(args) => self.start_content(ContentStart::Return(args))?,
            MethodFrameArgs::BasicConsumeOk(ok) => {
                let registered = {
                    let mut data = lock(&self.data);

                    data.pending_consumer.take().map(|consumer| {
                        let handle = ConsumerHandle::new(&ok.consumer_tag, consumer);

                        data.consumers.insert(ok.consumer_tag.clone(), handle.clone());

                        handle
                    })
                };

                if let Some(handle) = registered {
                    self.dispatcher.enqueue(Invocation::ConsumeOk(handle));
                }

                self.complete_rpc(cm, MethodFrameArgs::BasicConsumeOk(ok));
            }
            MethodFrameArgs::BasicCancelOk(ok) => {
                let removed = lock(&self.data).consumers.remove(&ok.consumer_tag);

                if let Some(handle) = removed {
                    self.dispatcher.enqueue(Invocation::CancelOk(handle));
                }

                self.complete_rpc(cm, MethodFrameArgs::BasicCancelOk(ok));
            }
            MethodFrameArgs::BasicCancel(cancel) => {
                log::info!("Broker cancelled consumer {} on channel {}", cancel.consumer_tag, self.number);

                let removed = lock(&self.data).consumers.remove(&cancel.consumer_tag);

                if let Some(handle) = removed {
                    self.dispatcher.enqueue(Invocation::Cancel(handle));
                }

                if !cancel.no_wait {
                    self.send(
                        frame::BasicCancelOkArgs::new(&cancel.consumer_tag)
                            .frame(self.number)
                            .into(),
                    )
                    .await?;
                }
            }
            MethodFrameArgs::BasicAck(ack) => {
                self.dispatcher.enqueue(Invocation::Confirm(Confirm::Ack {
                    delivery_tag: ack.delivery_tag,
                    multiple: ack.multiple,
                }));
            }
            MethodFrameArgs::BasicNack(nack) => {
                self.dispatcher.enqueue(Invocation::Confirm(Confirm::Nack {
                    delivery_tag: nack.delivery_tag,
                    multiple: nack.is_multiple(),
                    requeue: nack.flags.contains(frame::BasicNackFlags::REQUEUE),
                }));
            }
            other => self.complete_rpc(cm, other),
        }

        Ok(())
    }

    fn start_content(&self, start: ContentStart) -> Result<()> {
        let mut data = lock(&self.data);

        if data.content.is_some() {
            return self.unexpected_frame("Content method arrived before the previous content completed");
        }

        data.content = Some(IncomingContent::new(start));

        Ok(())
    }

    fn handle_content_header(&self, body_size: u64, properties: frame::BasicProperties) -> Result<()> {
        let completed = {
            let mut data = lock(&self.data);

            match data.content.as_mut() {
                Some(content) if content.header.is_none() => content.header = Some((body_size, properties)),
                _ => return self.unexpected_frame("Content header without a content method"),
            }

            take_completed(&mut data.content)
        };

        if let Some(content) = completed {
            self.content_completed(content);
        }

        Ok(())
    }

    fn handle_content_body(&self, body: Bytes) -> Result<()> {
        let completed = {
            let mut data = lock(&self.data);

            match data.content.as_mut() {
                Some(content) if content.header.is_some() => content.body.extend_from_slice(&body),
                _ => return self.unexpected_frame("Content body without a content header"),
            }

            if data.content.as_ref().is_some_and(|c| c.is_overrun()) {
                data.content = None;

                return self.unexpected_frame("Content body is longer than the declared body size");
            }

            take_completed(&mut data.content)
        };

        if let Some(content) = completed {
            self.content_completed(content);
        }

        Ok(())
    }

    fn content_completed(&self, content: IncomingContent) {
        match content.into_message(self.number) {
            Assembled::Delivery(delivery) => {
                let consumer = lock(&self.data).consumers.get(&delivery.consumer_tag).cloned();

                match consumer {
                    Some(handle) => {
                        self.dispatcher.enqueue(Invocation::Deliver(handle, delivery));
                    }
                    None => log::warn!(
                        "Delivery for unknown consumer {} on channel {} is dropped",
                        delivery.consumer_tag,
                        self.number
                    ),
                }
            }
            Assembled::Returned(message) => {
                self.dispatcher.enqueue(Invocation::Returned(message));
            }
        }
    }
}

fn take_completed(content: &mut Option<IncomingContent>) -> Option<IncomingContent> {
    if content.as_ref().is_some_and(|c| c.is_complete()) {
        content.take()
    } else {
        None
    }
}

impl Channel {
    pub(crate) fn from_inner(inner: Arc<ChannelInner>) -> Self {
        Self { inner }
    }

    pub fn number(&self) -> ChannelNumber {
        self.inner.number
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner.data).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn events(&self) -> &ChannelEvents {
        &self.inner.events
    }

    /// The reason of the close, `None` while the channel is open.
    pub fn shutdown_reason(&self) -> Option<Arc<ShutdownReason>> {
        self.inner.reason.get().cloned()
    }

    /// True when every consumer got its shutdown notification.
    pub fn is_shutdown(&self) -> bool {
        self.inner.dispatcher.is_shutdown()
    }

    /// Token which is cancelled when the channel closes.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn consumer_tags(&self) -> Vec<String> {
        lock(&self.inner.data).consumers.keys().cloned().collect()
    }

    /// Whether the broker allows publishing, it is changed by `Channel.Flow`.
    pub fn is_flow_active(&self) -> bool {
        lock(&self.inner.data).flow_active
    }

    /// Sequence number of the next publish in confirm mode, 0 if confirm mode is off.
    pub fn next_publish_seq_no(&self) -> u64 {
        lock(&self.inner.data).next_publish_seq_no
    }

    /// Wait until the channel is closed and get the reason.
    pub async fn closed(&self) -> Arc<ShutdownReason> {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;

        self.inner
            .reason
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(ShutdownReason::library(REPLY_SUCCESS, "Channel closed")))
    }

    async fn call(
        &self,
        args: MethodFrameArgs,
        expects: &'static [ClassMethod],
        token: &CancellationToken,
    ) -> Result<MethodFrameArgs> {
        self.call_with_consumer(args, expects, None, token).await
    }

    async fn call_with_consumer(
        &self,
        args: MethodFrameArgs,
        expects: &'static [ClassMethod],
        consumer: Option<Arc<dyn Consumer>>,
        token: &CancellationToken,
    ) -> Result<MethodFrameArgs> {
        let inner = &self.inner;
        let cm = args.class_method();

        inner.ensure_encodable(&args)?;

        let _serial = tokio::select! {
            guard = inner.rpc_lock.lock() => guard,
            _ = token.cancelled() => {
                return client_error!(ErrorKind::Cancelled, Some(inner.number), 0, "Request is cancelled", cm);
            }
        };

        let (tx, rx) = oneshot::channel();

        {
            let mut data = lock(&inner.data);

            inner.ensure_open(&data, cm)?;

            data.rpc = Some(PendingRpc { expects, reply: tx });
            data.pending_consumer = consumer;
        }

        if let Err(e) = inner.send(args.frame(inner.number).into()).await {
            inner.abandon_rpc();

            return Err(e);
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(result) => result,
                Err(_) => inner.closed_error(cm),
            },
            _ = tokio::time::sleep(inner.settings.continuation_timeout) => {
                inner.abandon_rpc();

                client_error!(ErrorKind::Rpc, Some(inner.number), 0, "Timeout waiting for the reply", cm)
            }
            _ = token.cancelled() => {
                inner.abandon_rpc();

                client_error!(ErrorKind::Cancelled, Some(inner.number), 0, "Request is cancelled", cm)
            }
        }
    }

    /// Send an asynchronous method, no reply is expected.
    async fn cast(&self, args: MethodFrameArgs) -> Result<()> {
        let cm = args.class_method();

        self.inner.ensure_encodable(&args)?;
        self.inner.ensure_open(&lock(&self.inner.data), cm)?;
        self.inner.send(args.frame(self.inner.number).into()).await
    }

    pub(crate) async fn open(&self, token: &CancellationToken) -> Result<()> {
        self.call(MethodFrameArgs::ChannelOpen, &[frame::CHANNEL_OPEN_OK], token)
            .await?;

        let mut data = lock(&self.inner.data);

        if data.state == ChannelState::Opening {
            data.state = ChannelState::Open;
        }

        log::debug!("Channel {} is open", self.inner.number);

        Ok(())
    }

    pub async fn exchange_declare(&self, args: frame::ExchangeDeclareArgs, token: &CancellationToken) -> Result<()> {
        self.call(
            MethodFrameArgs::ExchangeDeclare(args),
            &[frame::EXCHANGE_DECLARE_OK],
            token,
        )
        .await?;

        Ok(())
    }

    pub async fn exchange_delete(&self, args: frame::ExchangeDeleteArgs, token: &CancellationToken) -> Result<()> {
        self.call(MethodFrameArgs::ExchangeDelete(args), &[frame::EXCHANGE_DELETE_OK], token)
            .await?;

        Ok(())
    }

    /// Declare a queue, with an empty name the broker generates one and it comes back in the
    /// reply.
    pub async fn queue_declare(
        &self,
        args: frame::QueueDeclareArgs,
        token: &CancellationToken,
    ) -> Result<frame::QueueDeclareOkArgs> {
        match self
            .call(MethodFrameArgs::QueueDeclare(args), &[frame::QUEUE_DECLARE_OK], token)
            .await?
        {
            MethodFrameArgs::QueueDeclareOk(ok) => Ok(ok),
            other => self.unexpected_reply(other),
        }
    }

    pub async fn queue_bind(&self, args: frame::QueueBindArgs, token: &CancellationToken) -> Result<()> {
        self.call(MethodFrameArgs::QueueBind(args), &[frame::QUEUE_BIND_OK], token)
            .await?;

        Ok(())
    }

    pub async fn queue_unbind(&self, args: frame::QueueUnbindArgs, token: &CancellationToken) -> Result<()> {
        self.call(MethodFrameArgs::QueueUnbind(args), &[frame::QUEUE_UNBIND_OK], token)
            .await?;

        Ok(())
    }

    /// Purge the queue, returns the number of purged messages.
    pub async fn queue_purge(&self, queue_name: &str, token: &CancellationToken) -> Result<u32> {
        let args = frame::QueuePurgeArgs::default().queue_name(queue_name);

        match self
            .call(MethodFrameArgs::QueuePurge(args), &[frame::QUEUE_PURGE_OK], token)
            .await?
        {
            MethodFrameArgs::QueuePurgeOk(ok) => Ok(ok.message_count),
            other => self.unexpected_reply(other),
        }
    }

    /// Delete the queue, returns the number of messages deleted with it.
    pub async fn queue_delete(&self, args: frame::QueueDeleteArgs, token: &CancellationToken) -> Result<u32> {
        match self
            .call(MethodFrameArgs::QueueDelete(args), &[frame::QUEUE_DELETE_OK], token)
            .await?
        {
            MethodFrameArgs::QueueDeleteOk(ok) => Ok(ok.message_count),
            other => self.unexpected_reply(other),
        }
    }

    pub async fn basic_qos(&self, args: frame::BasicQosArgs, token: &CancellationToken) -> Result<()> {
        self.call(MethodFrameArgs::BasicQos(args), &[frame::BASIC_QOS_OK], token)
            .await?;

        Ok(())
    }

    /// Start a consumer, it returns the consumer tag. With an empty tag in `args` the broker
    /// generates one. The consumer is registered before any delivery can arrive.
    pub async fn basic_consume(
        &self,
        args: frame::BasicConsumeArgs,
        consumer: Arc<dyn Consumer>,
        token: &CancellationToken,
    ) -> Result<String> {
        match self
            .call_with_consumer(
                MethodFrameArgs::BasicConsume(args),
                &[frame::BASIC_CONSUME_OK],
                Some(consumer),
                token,
            )
            .await?
        {
            MethodFrameArgs::BasicConsumeOk(ok) => Ok(ok.consumer_tag),
            other => self.unexpected_reply(other),
        }
    }

    /// Cancel a consumer. The consumer gets `handle_cancel_ok` when the broker confirmed it.
    pub async fn basic_cancel(&self, consumer_tag: &str, token: &CancellationToken) -> Result<()> {
        self.call(
            MethodFrameArgs::BasicCancel(frame::BasicCancelArgs::new(consumer_tag)),
            &[frame::BASIC_CANCEL_OK],
            token,
        )
        .await?;

        Ok(())
    }

    /// Publish a message. The body is split into frames fitting in the negotiated frame max,
    /// the frames of a message are written out together.
    pub async fn basic_publish(
        &self,
        args: frame::BasicPublishArgs,
        properties: frame::BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        let body = body.into();
        let number = self.inner.number;
        let method = MethodFrameArgs::BasicPublish(args);

        self.inner.ensure_encodable(&method)?;

        {
            let mut data = lock(&self.inner.data);

            self.inner.ensure_open(&data, frame::BASIC_PUBLISH)?;

            if data.confirm_mode {
                data.next_publish_seq_no += 1;
            }
        }

        let chunk_size = match self.inner.settings.frame_max {
            0 => body.len().max(1),
            frame_max => frame_max.saturating_sub(FRAME_OVERHEAD).max(1),
        };

        let mut frames = Vec::with_capacity(2 + body.len() / chunk_size + 1);

        frames.push(method.frame(number));
        frames.push(frame::ContentHeaderFrame::new(number, body.len() as u64, properties).frame());

        let mut offset = 0;

        while offset < body.len() {
            let end = std::cmp::min(offset + chunk_size, body.len());

            frames.push(
                frame::ContentBodyFrame {
                    channel: number,
                    body: body.slice(offset..end),
                }
                .frame(),
            );

            offset = end;
        }

        self.inner.send(Frame::Frames(frames)).await
    }

    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let args = frame::BasicAckArgs::default()
            .delivery_tag(delivery_tag)
            .multiple(multiple);

        self.cast(MethodFrameArgs::BasicAck(args)).await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let args = frame::BasicNackArgs::default()
            .delivery_tag(delivery_tag)
            .multiple(multiple)
            .requeue(requeue);

        self.cast(MethodFrameArgs::BasicNack(args)).await
    }

    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let args = frame::BasicRejectArgs::default()
            .delivery_tag(delivery_tag)
            .requeue(requeue);

        self.cast(MethodFrameArgs::BasicReject(args)).await
    }

    /// Switch the channel to confirm mode, the broker confirms publishes through the
    /// `basic_acks` event.
    pub async fn confirm_select(&self, token: &CancellationToken) -> Result<()> {
        self.call(
            MethodFrameArgs::ConfirmSelect(frame::ConfirmSelectArgs::default()),
            &[frame::CONFIRM_SELECT_OK],
            token,
        )
        .await?;

        let mut data = lock(&self.inner.data);

        data.confirm_mode = true;
        data.next_publish_seq_no = data.next_publish_seq_no.max(1);

        Ok(())
    }

    /// Tell a consumer that its tag is gone, used when a recovered consumer gets a new tag.
    pub(crate) fn notify_cancel_ok(&self, consumer_tag: &str, consumer: Arc<dyn Consumer>) {
        let handle = ConsumerHandle::new(consumer_tag, consumer);

        self.inner.dispatcher.enqueue(Invocation::CancelOk(handle));
    }

    fn unexpected_reply<T>(&self, args: MethodFrameArgs) -> Result<T> {
        client_error!(
            ErrorKind::Rpc,
            Some(self.inner.number),
            ConnectionError::CommandInvalid as u16,
            format!("Unexpected reply {args:?}"),
            args.class_method()
        )
    }

    /// Close the channel with a normal reply code, waiting for the broker at most the
    /// configured close timeout.
    pub async fn close(&self) -> Result<()> {
        self.close_with(
            REPLY_SUCCESS,
            "Goodbye",
            self.inner.settings.close_timeout,
            false,
            &CancellationToken::new(),
        )
        .await
    }

    /// Close without waiting for the broker's close-ok.
    pub async fn abort(&self) -> Result<()> {
        self.close_with(
            REPLY_SUCCESS,
            "Goodbye",
            self.inner.settings.abort_timeout,
            true,
            &CancellationToken::new(),
        )
        .await
    }

    /// Close the channel. Closing a closed channel succeeds immediately. If the broker doesn't
    /// answer in `timeout` the channel is closed anyway, and `CloseTimeout` is returned unless
    /// `force` is set. With `force` the close-ok is not waited for.
    pub async fn close_with(
        &self,
        code: u16,
        text: &str,
        timeout: Duration,
        force: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        let inner = &self.inner;
        let (tx, rx) = oneshot::channel();

        let state = {
            let mut data = lock(&inner.data);
            let state = data.state;

            if let ChannelState::Opening | ChannelState::Open = state {
                let _ = inner.reason.set(Arc::new(ShutdownReason::application(code, text)));

                data.state = ChannelState::Closing;
                data.awaiting_close_ok = true;
                data.close_ok = Some(tx);
            }

            state
        };

        match state {
            ChannelState::Closed => return Ok(()),
            ChannelState::Closing => {
                tokio::select! {
                    _ = self.closed() => {}
                    _ = tokio::time::sleep(timeout) => {}
                    _ = token.cancelled() => {}
                }

                return Ok(());
            }
            ChannelState::Opening | ChannelState::Open => {}
        }

        log::debug!("Closing channel {} code={} text={}", inner.number, code, text);

        let close = frame::channel_close(inner.number, code, text, 0);

        if let Err(e) = tokio::time::timeout(timeout, inner.send(close.into()))
            .await
            .unwrap_or_else(|_| client_error!(ErrorKind::CloseTimeout, Some(inner.number), 0, "Cannot send close", 0))
        {
            lock(&inner.data).awaiting_close_ok = false;
            inner.finish();

            return if force { Ok(()) } else { Err(e) };
        }

        if force {
            inner.finish();

            return Ok(());
        }

        let result = tokio::select! {
            _ = rx => Ok(()),
            _ = tokio::time::sleep(timeout) => {
                log::warn!("Close-ok didn't arrive in time on channel {}", inner.number);

                client_error!(ErrorKind::CloseTimeout, Some(inner.number), 0, "Timeout waiting for close-ok", frame::CHANNEL_CLOSE)
            }
            _ = token.cancelled() => {
                client_error!(ErrorKind::Cancelled, Some(inner.number), 0, "Close is cancelled", frame::CHANNEL_CLOSE)
            }
        };

        inner.finish();

        result
    }
}
