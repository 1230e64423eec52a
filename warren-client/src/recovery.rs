//! Connection recovery.
//!
//! A [`RecoveringConnection`] records the topology declared through its channels: exchanges,
//! queues, bindings and consumers. When the connection is lost by anything but the application,
//! a supervisor task reconnects with exponential backoff, reopens the channels and replays the
//! record in the order it was declared. Server named queues get new names from the broker, the
//! bindings and consumers declared on them follow the new name.
use crate::channel::{Channel, ChannelEvents};
use crate::config::{ConnectionConfig, TagRecovery};
use crate::connection::{Connection, ConnectionEvents, Connector, TcpConnector};
use crate::consumer::Consumer;
use crate::event::EventList;
use crate::lock;
use crate::message::Delivery;
use crate::model::REPLY_SUCCESS;
use crate::shutdown::{Initiator, ShutdownReason};
use anyhow::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use warren_codec::frame;

#[derive(Clone, Debug)]
pub enum RecoveryState {
    Connected,
    Recovering,
    /// Closed by the application, or recovery is disabled or gave up. The reason is the one of
    /// the last connection shutdown.
    PermanentlyClosed(Arc<ShutdownReason>),
}

impl RecoveryState {
    pub fn is_connected(&self) -> bool {
        matches!(self, RecoveryState::Connected)
    }

    pub fn is_permanently_closed(&self) -> bool {
        matches!(self, RecoveryState::PermanentlyClosed(_))
    }
}

#[derive(Clone, Debug)]
pub struct RecoverySucceeded {
    pub connection_id: String,
    pub attempts: u32,
}

/// A recovery attempt failed, or an entity couldn't be replayed.
#[derive(Clone, Debug)]
pub struct RecoveryError {
    pub attempt: u32,
    pub error: Arc<anyhow::Error>,
}

pub struct RecoveryEvents {
    pub recovery_succeeded: EventList<RecoverySucceeded>,
    pub recovery_error: EventList<RecoveryError>,
}

impl Default for RecoveryEvents {
    fn default() -> Self {
        Self {
            recovery_succeeded: EventList::new("recovery_succeeded"),
            recovery_error: EventList::new("recovery_error"),
        }
    }
}

/// A declaration replayed after reconnecting.
#[derive(Clone)]
pub enum RecordedEntity {
    Exchange(frame::ExchangeDeclareArgs),
    /// `name` is the actual name, it differs from `args.name` for server named queues.
    Queue {
        args: frame::QueueDeclareArgs,
        name: String,
    },
    Binding(frame::QueueBindArgs),
    Consumer {
        channel: u64,
        args: frame::BasicConsumeArgs,
        consumer: Arc<dyn Consumer>,
    },
}

impl RecordedEntity {
    fn key(&self) -> String {
        match self {
            RecordedEntity::Exchange(args) => exchange_key(&args.exchange_name),
            RecordedEntity::Queue { name, .. } => queue_key(name),
            RecordedEntity::Binding(args) => binding_key(&args.queue_name, &args.exchange_name, &args.routing_key),
            RecordedEntity::Consumer { channel, args, .. } => consumer_key(*channel, &args.consumer_tag),
        }
    }
}

impl std::fmt::Debug for RecordedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordedEntity::Exchange(args) => f.debug_tuple("Exchange").field(args).finish(),
            RecordedEntity::Queue { args, name } => f
                .debug_struct("Queue")
                .field("args", args)
                .field("name", name)
                .finish(),
            RecordedEntity::Binding(args) => f.debug_tuple("Binding").field(args).finish(),
            RecordedEntity::Consumer { channel, args, .. } => f
                .debug_struct("Consumer")
                .field("channel", channel)
                .field("args", args)
                .finish(),
        }
    }
}

fn exchange_key(name: &str) -> String {
    format!("exchange:{name}")
}

fn queue_key(name: &str) -> String {
    format!("queue:{name}")
}

fn binding_key(queue: &str, exchange: &str, routing_key: &str) -> String {
    format!("binding:{queue}\u{0}{exchange}\u{0}{routing_key}")
}

/// Consumer tags are unique per channel only.
fn consumer_key(channel: u64, tag: &str) -> String {
    format!("consumer:{channel}:{tag}")
}

/// Ordered, keyed log of the declarations. Declaring the same entity again replaces it in place.
#[derive(Default)]
struct RecoveryRecord {
    entries: Vec<RecordedEntity>,
}

impl RecoveryRecord {
    fn record(&mut self, entity: RecordedEntity) {
        let key = entity.key();

        match self.entries.iter().position(|e| e.key() == key) {
            Some(i) => self.entries[i] = entity,
            None => self.entries.push(entity),
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.retain(|e| e.key() != key);
    }

    fn remove_exchange(&mut self, name: &str) {
        self.entries.retain(|e| match e {
            RecordedEntity::Exchange(args) => args.exchange_name != name,
            RecordedEntity::Binding(args) => args.exchange_name != name,
            _ => true,
        });
    }

    fn remove_queue(&mut self, name: &str) {
        self.entries.retain(|e| match e {
            RecordedEntity::Queue { name: n, .. } => n != name,
            RecordedEntity::Binding(args) => args.queue_name != name,
            RecordedEntity::Consumer { args, .. } => args.queue != name,
            _ => true,
        });
    }

    fn remove_channel(&mut self, channel_id: u64) {
        self.entries
            .retain(|e| !matches!(e, RecordedEntity::Consumer { channel, .. } if *channel == channel_id));
    }

    fn rename_queue(&mut self, old: &str, new: &str) {
        for entity in self.entries.iter_mut() {
            match entity {
                RecordedEntity::Queue { name, .. } if name == old => *name = new.to_string(),
                RecordedEntity::Binding(args) if args.queue_name == old => args.queue_name = new.to_string(),
                RecordedEntity::Consumer { args, .. } if args.queue == old => args.queue = new.to_string(),
                _ => {}
            }
        }
    }

    fn retag(&mut self, channel_id: u64, old: &str, new: &str) {
        for entity in self.entries.iter_mut() {
            if let RecordedEntity::Consumer { channel, args, .. } = entity {
                if *channel == channel_id && args.consumer_tag == old {
                    args.consumer_tag = new.to_string();
                }
            }
        }
    }
}

/// Removes the consumer from the record when the broker cancels it.
struct RecordedConsumer {
    channel: u64,
    consumer: Arc<dyn Consumer>,
    owner: Weak<RecoveryInner>,
}

impl Consumer for RecordedConsumer {
    fn handle_delivery(&self, delivery: Delivery, token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        self.consumer.handle_delivery(delivery, token)
    }

    fn handle_cancel(&self, consumer_tag: String, token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        if let Some(owner) = self.owner.upgrade() {
            lock(&owner.record).remove(&consumer_key(self.channel, &consumer_tag));
        }

        self.consumer.handle_cancel(consumer_tag, token)
    }

    fn handle_cancel_ok(&self, consumer_tag: String, token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        self.consumer.handle_cancel_ok(consumer_tag, token)
    }

    fn handle_consume_ok(&self, consumer_tag: String, token: CancellationToken) -> BoxFuture<'_, Result<()>> {
        self.consumer.handle_consume_ok(consumer_tag, token)
    }

    fn handle_channel_shutdown(
        &self,
        consumer_tag: String,
        reason: Arc<ShutdownReason>,
        token: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        self.consumer.handle_channel_shutdown(consumer_tag, reason, token)
    }
}

/// Consumers replayed in one recovery attempt per channel slot, with their current tags.
type Replayed = HashMap<u64, Vec<(frame::BasicConsumeArgs, Arc<dyn Consumer>)>>;

struct RecoveryInner {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    current: Mutex<Connection>,
    channels: Mutex<Vec<Arc<ChannelSlot>>>,
    record: Mutex<RecoveryRecord>,
    state: watch::Sender<RecoveryState>,
    events: RecoveryEvents,
    connection_events: Arc<ConnectionEvents>,
    /// Cancelled when the application closes the connection, recovery stops.
    closing: CancellationToken,
    next_channel_id: AtomicU64,
}

/// The channel behind a recovering channel, it is replaced on every recovery.
struct ChannelSlot {
    id: u64,
    current: Mutex<Channel>,
    events: Arc<ChannelEvents>,
    qos: Mutex<Option<frame::BasicQosArgs>>,
    confirm: AtomicBool,
    closed_by_app: AtomicBool,
}

impl ChannelSlot {
    fn channel(&self) -> Channel {
        lock(&self.current).clone()
    }

    async fn reopen(&self, connection: &Connection, token: &CancellationToken) -> Result<()> {
        let channel = connection
            .open_channel_with_events(self.events.clone(), token)
            .await?;

        let qos = lock(&self.qos).clone();

        if let Some(qos) = qos {
            channel.basic_qos(qos, token).await?;
        }

        if self.confirm.load(Ordering::Acquire) {
            channel.confirm_select(token).await?;
        }

        log::debug!("Channel slot {} is reopened as channel {}", self.id, channel.number());

        *lock(&self.current) = channel;

        Ok(())
    }
}

impl RecoveryInner {
    fn connection(&self) -> Connection {
        lock(&self.current).clone()
    }

    fn set_state(&self, state: RecoveryState) {
        log::debug!("Recovery state is {state:?}");

        self.state.send_replace(state);
    }

    /// Channels to reopen: the ones closed together with the lost connection. Channels closed on
    /// their own are forgotten with their consumers.
    fn live_channels(&self, lost: &Arc<ShutdownReason>) -> Vec<Arc<ChannelSlot>> {
        let mut channels = lock(&self.channels);
        let mut record = lock(&self.record);

        channels.retain(|slot| {
            let lost_with_connection = !slot.closed_by_app.load(Ordering::Acquire)
                && slot
                    .channel()
                    .shutdown_reason()
                    .map_or(true, |reason| Arc::ptr_eq(&reason, lost));

            if !lost_with_connection {
                record.remove_channel(slot.id);
            }

            lost_with_connection
        });

        channels.clone()
    }

    async fn try_recover(self: &Arc<Self>, live: &[Arc<ChannelSlot>], attempt: u32) -> Result<Connection> {
        let stream = self.connector.connect(&self.config).await?;
        let connection =
            Connection::open_with_events(stream, self.config.clone(), self.connection_events.clone()).await?;

        match self.restore(&connection, live, attempt).await {
            Ok(()) => Ok(connection),
            Err(e) => {
                let _ = connection.abort().await;

                Err(e)
            }
        }
    }

    async fn restore(self: &Arc<Self>, connection: &Connection, live: &[Arc<ChannelSlot>], attempt: u32) -> Result<()> {
        let token = CancellationToken::new();

        for slot in live {
            slot.reopen(connection, &token).await?;
        }

        let entries = lock(&self.record).entries.clone();
        let mut renames: HashMap<String, String> = HashMap::new();
        let mut replayed = Replayed::new();
        let mut topology: Option<Channel> = None;

        for entity in entries {
            let key = entity.key();

            let result = match entity {
                RecordedEntity::Exchange(args) => match topology_channel(&mut topology, connection, &token).await {
                    Ok(channel) => channel.exchange_declare(args, &token).await,
                    Err(e) => Err(e),
                },
                RecordedEntity::Queue { args, name } => match topology_channel(&mut topology, connection, &token).await {
                    Ok(channel) => match channel.queue_declare(args.clone(), &token).await {
                        Ok(ok) => {
                            if ok.name != name {
                                log::info!("Server named queue {name} is recovered as {}", ok.name);

                                lock(&self.record).rename_queue(&name, &ok.name);
                                renames.insert(name, ok.name);
                            }

                            Ok(())
                        }
                        Err(e) => Err(e),
                    },
                    Err(e) => Err(e),
                },
                RecordedEntity::Binding(mut args) => {
                    if let Some(renamed) = renames.get(&args.queue_name) {
                        args.queue_name = renamed.clone();
                    }

                    match topology_channel(&mut topology, connection, &token).await {
                        Ok(channel) => channel.queue_bind(args, &token).await,
                        Err(e) => Err(e),
                    }
                }
                RecordedEntity::Consumer {
                    channel,
                    mut args,
                    consumer,
                } => {
                    if let Some(renamed) = renames.get(&args.queue) {
                        args.queue = renamed.clone();
                    }

                    match live.iter().find(|slot| slot.id == channel) {
                        Some(slot) => {
                            self.recover_consumer(slot, connection, args, consumer, &mut replayed, &token)
                                .await
                        }
                        None => {
                            lock(&self.record).remove(&key);

                            Ok(())
                        }
                    }
                }
            };

            if let Err(e) = result {
                if !connection.is_open() {
                    return Err(e);
                }

                log::warn!("Cannot recover {key}: {e:?}");

                self.events.recovery_error.emit(&RecoveryError {
                    attempt,
                    error: Arc::new(e),
                });

                // A failed declaration closes the channel it was sent on.
                if topology.as_ref().is_some_and(|ch| !ch.is_open()) {
                    topology = None;
                }

                for slot in live {
                    if !slot.channel().is_open() {
                        self.reopen_slot(slot, connection, &mut replayed, &token).await?;
                    }
                }
            }
        }

        if let Some(channel) = topology {
            if let Err(e) = channel.close().await {
                log::debug!("Closing the recovery channel failed: {e:?}");
            }
        }

        Ok(())
    }

    async fn recover_consumer(
        &self,
        slot: &ChannelSlot,
        connection: &Connection,
        args: frame::BasicConsumeArgs,
        consumer: Arc<dyn Consumer>,
        replayed: &mut Replayed,
        token: &CancellationToken,
    ) -> Result<()> {
        let tag = match self.config.recovery.consumer_tags {
            TagRecovery::Preserve => match slot.channel().basic_consume(args.clone(), consumer.clone(), token).await {
                Ok(tag) => {
                    self.retag(slot, &args.consumer_tag, &tag);

                    tag
                }
                Err(e) if connection.is_open() => {
                    log::warn!("Consumer tag {} is refused ({e:?}), consuming with a new tag", args.consumer_tag);

                    if !slot.channel().is_open() {
                        self.reopen_slot(slot, connection, replayed, token).await?;
                    }

                    self.consume_with_new_tag(slot, &args, consumer.clone(), token).await?
                }
                Err(e) => return Err(e),
            },
            TagRecovery::Regenerate => self.consume_with_new_tag(slot, &args, consumer.clone(), token).await?,
        };

        replayed.entry(slot.id).or_default().push((
            frame::BasicConsumeArgs {
                consumer_tag: tag,
                ..args
            },
            consumer,
        ));

        Ok(())
    }

    /// Consume with a broker generated tag. The consumer is told that its old tag is gone.
    async fn consume_with_new_tag(
        &self,
        slot: &ChannelSlot,
        args: &frame::BasicConsumeArgs,
        consumer: Arc<dyn Consumer>,
        token: &CancellationToken,
    ) -> Result<String> {
        let channel = slot.channel();
        let fresh = frame::BasicConsumeArgs {
            consumer_tag: String::new(),
            ..args.clone()
        };

        channel.notify_cancel_ok(&args.consumer_tag, consumer.clone());

        let tag = channel.basic_consume(fresh, consumer, token).await?;

        self.retag(slot, &args.consumer_tag, &tag);

        Ok(tag)
    }

    /// Reopen the channel of a slot closed during the replay. The consumers already replayed on
    /// the slot died with the old channel, they are consumed again with new tags.
    async fn reopen_slot(
        &self,
        slot: &ChannelSlot,
        connection: &Connection,
        replayed: &mut Replayed,
        token: &CancellationToken,
    ) -> Result<()> {
        slot.reopen(connection, token).await?;

        let consumers = replayed.remove(&slot.id).unwrap_or_default();
        let mut again = Vec::with_capacity(consumers.len());

        for (args, consumer) in consumers {
            let tag = self.consume_with_new_tag(slot, &args, consumer.clone(), token).await?;

            again.push((
                frame::BasicConsumeArgs {
                    consumer_tag: tag,
                    ..args
                },
                consumer,
            ));
        }

        replayed.insert(slot.id, again);

        Ok(())
    }

    fn retag(&self, slot: &ChannelSlot, old: &str, new: &str) {
        if old != new {
            log::info!("Consumer {old} of channel slot {} is recovered as {new}", slot.id);

            lock(&self.record).retag(slot.id, old, new);
        }
    }
}

async fn topology_channel<'a>(
    slot: &'a mut Option<Channel>,
    connection: &Connection,
    token: &CancellationToken,
) -> Result<&'a Channel> {
    if slot.is_none() {
        *slot = Some(connection.open_channel(token).await?);
    }

    match slot.as_ref() {
        Some(channel) => Ok(channel),
        None => crate::client_error!(crate::ErrorKind::ClosedState, None, 0, "No channel for recovery", 0),
    }
}

async fn supervise(inner: Arc<RecoveryInner>) {
    loop {
        let connection = inner.connection();
        let reason = connection.closed().await;

        if inner.closing.is_cancelled() || reason.initiator == Initiator::Application || !inner.config.recovery.enabled
        {
            inner.set_state(RecoveryState::PermanentlyClosed(reason));

            break;
        }

        log::warn!("Connection {} is lost: {reason}", connection.id());

        inner.set_state(RecoveryState::Recovering);

        let live = inner.live_channels(&reason);

        match recover(&inner, &live).await {
            Some((connection, attempts)) => {
                log::info!("Connection is recovered as {} after {attempts} attempt(s)", connection.id());

                let connection_id = connection.id().to_string();

                *lock(&inner.current) = connection;

                inner.set_state(RecoveryState::Connected);
                inner.events.recovery_succeeded.emit(&RecoverySucceeded {
                    connection_id,
                    attempts,
                });
            }
            None => {
                inner.set_state(RecoveryState::PermanentlyClosed(reason));

                break;
            }
        }
    }

    log::debug!("Recovery supervisor stopped");
}

async fn recover(inner: &Arc<RecoveryInner>, live: &[Arc<ChannelSlot>]) -> Option<(Connection, u32)> {
    let recovery = &inner.config.recovery;
    let mut delay = recovery.initial_interval;
    let mut attempt = 0u32;

    loop {
        if recovery.max_attempts.is_some_and(|max| attempt >= max) {
            log::error!("Recovery gave up after {attempt} attempt(s)");

            return None;
        }

        attempt += 1;

        let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);

        tokio::select! {
            _ = tokio::time::sleep(delay + Duration::from_millis(jitter)) => {}
            _ = inner.closing.cancelled() => return None,
        }

        log::info!("Recovery attempt {attempt}");

        match inner.try_recover(live, attempt).await {
            Ok(connection) if inner.closing.is_cancelled() => {
                let _ = connection.abort().await;

                return None;
            }
            Ok(connection) => return Some((connection, attempt)),
            Err(e) => {
                log::warn!("Recovery attempt {attempt} failed: {e:?}");

                inner.events.recovery_error.emit(&RecoveryError {
                    attempt,
                    error: Arc::new(e),
                });

                delay = recovery.next_interval(delay);
            }
        }
    }
}

/// A connection which reconnects and restores its channels, topology and consumers when it is
/// lost.
#[derive(Clone)]
pub struct RecoveringConnection {
    inner: Arc<RecoveryInner>,
}

impl RecoveringConnection {
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        Self::connect_with(config, Arc::new(TcpConnector)).await
    }

    /// Connect with a custom connector, it is used for the reconnections too.
    pub async fn connect_with(config: ConnectionConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let connection_events = Arc::new(ConnectionEvents::default());
        let stream = connector.connect(&config).await?;
        let connection = Connection::open_with_events(stream, config.clone(), connection_events.clone()).await?;
        let (state, _) = watch::channel(RecoveryState::Connected);

        let inner = Arc::new(RecoveryInner {
            config,
            connector,
            current: Mutex::new(connection),
            channels: Mutex::new(vec![]),
            record: Mutex::new(RecoveryRecord::default()),
            state,
            events: RecoveryEvents::default(),
            connection_events,
            closing: CancellationToken::new(),
            next_channel_id: AtomicU64::new(1),
        });

        tokio::spawn(supervise(inner.clone()));

        Ok(Self { inner })
    }

    /// The current underlying connection.
    pub fn connection(&self) -> Connection {
        self.inner.connection()
    }

    pub fn state(&self) -> RecoveryState {
        self.inner.state.borrow().clone()
    }

    pub fn state_changes(&self) -> watch::Receiver<RecoveryState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> &RecoveryEvents {
        &self.inner.events
    }

    /// Events of the underlying connections, subscriptions survive the recoveries.
    pub fn connection_events(&self) -> &ConnectionEvents {
        &self.inner.connection_events
    }

    /// The recorded topology in replay order.
    pub fn recorded_entities(&self) -> Vec<RecordedEntity> {
        lock(&self.inner.record).entries.clone()
    }

    pub async fn open_channel(&self, token: &CancellationToken) -> Result<RecoveringChannel> {
        let events = Arc::new(ChannelEvents::default());
        let channel = self
            .connection()
            .open_channel_with_events(events.clone(), token)
            .await?;

        let slot = Arc::new(ChannelSlot {
            id: self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed),
            current: Mutex::new(channel),
            events,
            qos: Mutex::new(None),
            confirm: AtomicBool::new(false),
            closed_by_app: AtomicBool::new(false),
        });

        lock(&self.inner.channels).push(slot.clone());

        Ok(RecoveringChannel {
            slot,
            owner: Arc::downgrade(&self.inner),
        })
    }

    /// Wait until the connection is permanently closed.
    pub async fn closed(&self) -> Arc<ShutdownReason> {
        let mut states = self.state_changes();

        loop {
            if let RecoveryState::PermanentlyClosed(reason) = &*states.borrow_and_update() {
                return reason.clone();
            }

            if states.changed().await.is_err() {
                return Arc::new(ShutdownReason::library(REPLY_SUCCESS, "Connection closed"));
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.closing.cancel();

        self.connection().close().await
    }

    pub async fn close_code(&self, code: u16, text: &str) -> Result<()> {
        self.inner.closing.cancel();

        self.connection().close_code(code, text).await
    }

    pub async fn close_with(
        &self,
        code: u16,
        text: &str,
        timeout: Duration,
        force: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        self.inner.closing.cancel();

        self.connection()
            .close_with(code, text, timeout, force, token)
            .await
    }

    pub async fn abort(&self) -> Result<()> {
        self.inner.closing.cancel();

        self.connection().abort().await
    }
}

/// A channel of a recovering connection. Declarations are recorded after the broker confirmed
/// them, deletions remove them from the record.
#[derive(Clone)]
pub struct RecoveringChannel {
    slot: Arc<ChannelSlot>,
    owner: Weak<RecoveryInner>,
}

impl RecoveringChannel {
    fn record<F: FnOnce(&mut RecoveryRecord)>(&self, f: F) {
        if let Some(owner) = self.owner.upgrade() {
            f(&mut lock(&owner.record));
        }
    }

    /// The current underlying channel, it changes on every recovery.
    pub fn channel(&self) -> Channel {
        self.slot.channel()
    }

    pub fn number(&self) -> u16 {
        self.channel().number()
    }

    pub fn is_open(&self) -> bool {
        self.channel().is_open()
    }

    /// Events of the underlying channels, subscriptions survive the recoveries.
    pub fn events(&self) -> &ChannelEvents {
        &self.slot.events
    }

    pub fn next_publish_seq_no(&self) -> u64 {
        self.channel().next_publish_seq_no()
    }

    pub async fn exchange_declare(&self, args: frame::ExchangeDeclareArgs, token: &CancellationToken) -> Result<()> {
        self.channel().exchange_declare(args.clone(), token).await?;

        if !args.is_passive() {
            self.record(|r| r.record(RecordedEntity::Exchange(args)));
        }

        Ok(())
    }

    pub async fn exchange_delete(&self, args: frame::ExchangeDeleteArgs, token: &CancellationToken) -> Result<()> {
        let name = args.exchange_name.clone();

        self.channel().exchange_delete(args, token).await?;
        self.record(|r| r.remove_exchange(&name));

        Ok(())
    }

    pub async fn queue_declare(
        &self,
        args: frame::QueueDeclareArgs,
        token: &CancellationToken,
    ) -> Result<frame::QueueDeclareOkArgs> {
        let ok = self.channel().queue_declare(args.clone(), token).await?;

        if !args.is_passive() {
            let name = ok.name.clone();

            self.record(|r| r.record(RecordedEntity::Queue { args, name }));
        }

        Ok(ok)
    }

    pub async fn queue_delete(&self, args: frame::QueueDeleteArgs, token: &CancellationToken) -> Result<u32> {
        let name = args.queue_name.clone();
        let count = self.channel().queue_delete(args, token).await?;

        self.record(|r| r.remove_queue(&name));

        Ok(count)
    }

    pub async fn queue_bind(&self, args: frame::QueueBindArgs, token: &CancellationToken) -> Result<()> {
        self.channel().queue_bind(args.clone(), token).await?;
        self.record(|r| r.record(RecordedEntity::Binding(args)));

        Ok(())
    }

    pub async fn queue_unbind(&self, args: frame::QueueUnbindArgs, token: &CancellationToken) -> Result<()> {
        let key = binding_key(&args.queue_name, &args.exchange_name, &args.routing_key);

        self.channel().queue_unbind(args, token).await?;
        self.record(|r| r.remove(&key));

        Ok(())
    }

    pub async fn queue_purge(&self, queue_name: &str, token: &CancellationToken) -> Result<u32> {
        self.channel().queue_purge(queue_name, token).await
    }

    pub async fn basic_qos(&self, args: frame::BasicQosArgs, token: &CancellationToken) -> Result<()> {
        self.channel().basic_qos(args.clone(), token).await?;

        *lock(&self.slot.qos) = Some(args);

        Ok(())
    }

    pub async fn basic_consume(
        &self,
        args: frame::BasicConsumeArgs,
        consumer: Arc<dyn Consumer>,
        token: &CancellationToken,
    ) -> Result<String> {
        let consumer: Arc<dyn Consumer> = Arc::new(RecordedConsumer {
            channel: self.slot.id,
            consumer,
            owner: self.owner.clone(),
        });

        let tag = self
            .channel()
            .basic_consume(args.clone(), consumer.clone(), token)
            .await?;

        let args = frame::BasicConsumeArgs {
            consumer_tag: tag.clone(),
            ..args
        };

        self.record(|r| {
            r.record(RecordedEntity::Consumer {
                channel: self.slot.id,
                args,
                consumer,
            })
        });

        Ok(tag)
    }

    pub async fn basic_cancel(&self, consumer_tag: &str, token: &CancellationToken) -> Result<()> {
        self.channel().basic_cancel(consumer_tag, token).await?;
        self.record(|r| r.remove(&consumer_key(self.slot.id, consumer_tag)));

        Ok(())
    }

    pub async fn basic_publish(
        &self,
        args: frame::BasicPublishArgs,
        properties: frame::BasicProperties,
        body: impl Into<Bytes>,
    ) -> Result<()> {
        self.channel().basic_publish(args, properties, body).await
    }

    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel().basic_ack(delivery_tag, multiple).await
    }

    pub async fn basic_nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.channel().basic_nack(delivery_tag, multiple, requeue).await
    }

    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel().basic_reject(delivery_tag, requeue).await
    }

    pub async fn confirm_select(&self, token: &CancellationToken) -> Result<()> {
        self.channel().confirm_select(token).await?;
        self.slot.confirm.store(true, Ordering::Release);

        Ok(())
    }

    /// The channel is not recovered any more, its consumers are forgotten.
    fn forget(&self) {
        self.slot.closed_by_app.store(true, Ordering::Release);

        if let Some(owner) = self.owner.upgrade() {
            lock(&owner.channels).retain(|s| !Arc::ptr_eq(s, &self.slot));
            lock(&owner.record).remove_channel(self.slot.id);
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.forget();

        self.channel().close().await
    }

    pub async fn close_with(
        &self,
        code: u16,
        text: &str,
        timeout: Duration,
        force: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        self.forget();

        self.channel()
            .close_with(code, text, timeout, force, token)
            .await
    }

    pub async fn abort(&self) -> Result<()> {
        self.forget();

        self.channel().abort().await
    }
}
