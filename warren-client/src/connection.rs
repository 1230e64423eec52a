//! Connection lifecycle: handshake, the reader and writer tasks, channel routing and shutdown.
//!
//! Whatever closes a connection (the application, the broker, an I/O or protocol error) the same
//! shutdown routine runs exactly once. It stores the reason, closes every channel with that very
//! reason, stops the I/O tasks and notifies the `connection_shutdown` subscribers.
use crate::channel::{Channel, ChannelEvents, ChannelInner, ChannelSettings};
use crate::client_error;
use crate::config::ConnectionConfig;
use crate::error::{client_error, error_kind, ErrorKind};
use crate::event::EventList;
use crate::lock;
use crate::model::{ChannelNumber, ConnectionError, REPLY_SUCCESS};
use crate::shutdown::ShutdownReason;
use crate::transport::{io_error, FrameReader, FrameTransport, FrameWriter};
use anyhow::Result;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use warren_codec::codec::Frame;
use warren_codec::frame::{self, AMQPFieldValue, AMQPFrame, FieldTable, MethodFrameArgs};

/// Byte streams a connection can run on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens the byte stream to the broker. The recovering connection uses it for every reconnect.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(&'a self, config: &'a ConnectionConfig) -> BoxFuture<'a, Result<BoxedStream>>;
}

/// Plain TCP connection to `host:port` of the config.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, config: &'a ConnectionConfig) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            let stream = TcpStream::connect(config.address()).await.map_err(io_error)?;

            stream.set_nodelay(true).map_err(io_error)?;

            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Connect to the broker over TCP.
pub async fn connect(config: ConnectionConfig) -> Result<Connection> {
    let stream = TcpConnector.connect(&config).await?;

    Connection::open(stream, config).await
}

/// The connection was closed.
#[derive(Clone, Debug)]
pub struct ConnectionShutdown {
    pub connection_id: String,
    pub reason: Arc<ShutdownReason>,
}

/// The broker stopped or resumed reading from the connection because of resource alarms.
#[derive(Clone, Debug, PartialEq)]
pub enum Blocked {
    Blocked { reason: String },
    Unblocked,
}

pub struct ConnectionEvents {
    pub connection_shutdown: EventList<ConnectionShutdown>,
    pub blocked: EventList<Blocked>,
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self {
            connection_shutdown: EventList::new("connection_shutdown"),
            blocked: EventList::new("blocked"),
        }
    }
}

/// Limits agreed with the broker during the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tuning {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds, 0 means no heartbeat.
    pub heartbeat: u16,
}

/// 0 on either side means no preference, otherwise the smaller value wins.
fn negotiate<T: Ord + Default + Copy>(client: T, server: T) -> T {
    if client == T::default() || server == T::default() {
        client.max(server)
    } else {
        client.min(server)
    }
}

struct ChannelTable {
    channels: HashMap<ChannelNumber, Arc<ChannelInner>>,
    next: ChannelNumber,
}

pub(crate) struct ConnectionInner {
    id: String,
    config: ConnectionConfig,
    tuning: Tuning,
    server_properties: Option<FieldTable>,
    outgoing: mpsc::Sender<Frame>,
    table: Mutex<ChannelTable>,
    reason: OnceLock<Arc<ShutdownReason>>,
    finished: AtomicBool,
    close_ok: Mutex<Option<oneshot::Sender<()>>>,
    /// Cancelled by the shutdown, it stops the reader and the writer task.
    io: CancellationToken,
    events: Arc<ConnectionEvents>,
    closed: watch::Sender<bool>,
}

/// Handle of an AMQP connection, it can be cloned and shared between tasks.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("tuning", &self.inner.tuning)
            .field("open", &self.is_open())
            .finish()
    }
}

impl ConnectionInner {
    fn closed_error<T>(&self) -> Result<T> {
        match self.reason.get() {
            Some(reason) => client_error!(
                ErrorKind::ClosedState,
                None,
                reason.reply_code,
                reason.reply_text.as_str(),
                0
            ),
            None => client_error!(ErrorKind::ClosedState, None, 0, "Connection is closed", 0),
        }
    }

    /// Queue a frame to the writer task. Fails once the connection started to close.
    pub(crate) async fn send(&self, frame: Frame) -> Result<()> {
        if self.reason.get().is_some() {
            return self.closed_error();
        }

        self.send_unchecked(frame).await
    }

    async fn send_unchecked(&self, frame: Frame) -> Result<()> {
        match self.outgoing.send(frame).await {
            Ok(()) => Ok(()),
            Err(_) => self.closed_error(),
        }
    }

    fn settings(&self) -> ChannelSettings {
        ChannelSettings {
            continuation_timeout: self.config.continuation_timeout,
            close_timeout: self.config.default_close_timeout,
            abort_timeout: self.config.default_abort_timeout,
            frame_max: self.tuning.frame_max as usize,
        }
    }

    fn allocate_channel(self: &Arc<Self>, events: Arc<ChannelEvents>) -> Result<Arc<ChannelInner>> {
        let max = match self.tuning.channel_max {
            0 => ChannelNumber::MAX,
            n => n,
        };

        let mut table = lock(&self.table);

        for _ in 0..max {
            let number = table.next;

            table.next = if number >= max { 1 } else { number + 1 };

            if !table.channels.contains_key(&number) {
                let channel = ChannelInner::new(number, Arc::downgrade(self), events, self.settings());

                table.channels.insert(number, channel.clone());

                return Ok(channel);
            }
        }

        client_error!(
            ErrorKind::ChannelLimit,
            None,
            ConnectionError::ResourceError as u16,
            format!("All {max} channels are in use"),
            frame::CHANNEL_OPEN
        )
    }

    /// Remove a closed channel from the table, the number can be reused after it.
    pub(crate) fn release_channel(&self, number: ChannelNumber, channel: &Arc<ChannelInner>) {
        let mut table = lock(&self.table);

        if table.channels.get(&number).is_some_and(|c| Arc::ptr_eq(c, channel)) {
            table.channels.remove(&number);
        }
    }

    /// Set the reason unless it is already set, then run the shutdown routine.
    fn shutdown(self: &Arc<Self>, reason: ShutdownReason) {
        let _ = self.reason.set(Arc::new(reason));

        self.finish();
    }

    fn finish(self: &Arc<Self>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let reason = self
            .reason
            .get_or_init(|| Arc::new(ShutdownReason::library(REPLY_SUCCESS, "Connection closed")))
            .clone();

        log::info!("Connection {} is closed, {}", self.id, reason);

        let channels: Vec<Arc<ChannelInner>> = lock(&self.table).channels.drain().map(|(_, c)| c).collect();

        for channel in channels {
            channel.shutdown(reason.clone());
        }

        lock(&self.close_ok).take();

        self.io.cancel();

        self.events.connection_shutdown.emit(&ConnectionShutdown {
            connection_id: self.id.clone(),
            reason,
        });
    }

    /// The connection failed because of an I/O or protocol error.
    async fn fail(self: &Arc<Self>, err: anyhow::Error) {
        if self.reason.get().is_some() {
            log::debug!("Connection {} error after shutdown: {err:?}", self.id);

            self.finish();

            return;
        }

        log::error!("Connection {} failed: {err:?}", self.id);

        let code = client_error(&err)
            .map(|e| e.code)
            .filter(|code| *code != 0)
            .unwrap_or(ConnectionError::InternalError as u16);

        if error_kind(&err) == Some(ErrorKind::ProtocolDecode) {
            let close = frame::connection_close(code, &err.to_string(), 0);

            let _ = tokio::time::timeout(self.config.default_abort_timeout, self.send_unchecked(close.into())).await;
        }

        self.shutdown(ShutdownReason::library_error(code, err));
    }

    async fn handle_frame(self: &Arc<Self>, frame: AMQPFrame) -> Result<()> {
        let number = frame.channel();

        if number == 0 {
            return self.handle_connection_frame(frame).await;
        }

        let channel = lock(&self.table).channels.get(&number).cloned();

        match channel {
            Some(channel) => channel.handle_frame(frame).await,
            None => client_error!(
                ErrorKind::ProtocolDecode,
                Some(number),
                ConnectionError::ChannelError as u16,
                format!("Frame arrived for unknown channel {number}"),
                0
            ),
        }
    }

    async fn handle_connection_frame(self: &Arc<Self>, frame: AMQPFrame) -> Result<()> {
        match frame {
            AMQPFrame::Method(_, _, MethodFrameArgs::ConnectionClose(close)) => {
                log::info!(
                    "Broker closed connection {} code={} text={}",
                    self.id,
                    close.code,
                    close.text
                );

                if let Err(e) = self.send_unchecked(frame::connection_close_ok().into()).await {
                    log::warn!("Cannot send close-ok: {e:?}");
                }

                self.shutdown(ShutdownReason::peer(close.code, &close.text, close.class_method()));
            }
            AMQPFrame::Method(_, _, MethodFrameArgs::ConnectionCloseOk) => {
                if let Some(waiter) = lock(&self.close_ok).take() {
                    let _ = waiter.send(());
                }
            }
            AMQPFrame::Method(_, _, MethodFrameArgs::ConnectionBlocked(args)) => {
                log::warn!("Connection {} is blocked: {}", self.id, args.reason);

                self.events.blocked.emit(&Blocked::Blocked { reason: args.reason });
            }
            AMQPFrame::Method(_, _, MethodFrameArgs::ConnectionUnblocked) => {
                log::info!("Connection {} is unblocked", self.id);

                self.events.blocked.emit(&Blocked::Unblocked);
            }
            other => {
                return client_error!(
                    ErrorKind::ProtocolDecode,
                    None,
                    ConnectionError::UnexpectedFrame as u16,
                    format!("Unexpected frame on channel 0 {other:?}"),
                    0
                );
            }
        }

        Ok(())
    }
}

async fn read_loop<S>(inner: Arc<ConnectionInner>, mut reader: FrameReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = inner.io.cancelled() => break,
            frame = reader.read_frame() => frame,
        };

        let result = match frame {
            Ok(frame) => inner.handle_frame(frame).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            inner.fail(e).await;

            break;
        }
    }

    log::debug!("Reader of connection {} stopped", inner.id);
}

async fn write_loop<S>(
    inner: Arc<ConnectionInner>,
    mut writer: FrameWriter<S>,
    mut outgoing: mpsc::Receiver<Frame>,
    heartbeat: Option<Duration>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = heartbeat.map(|hb| {
        let period = hb / 2;

        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    });

    loop {
        let result = tokio::select! {
            _ = inner.io.cancelled() => break,
            frame = outgoing.recv() => match frame {
                Some(frame) => writer.write_frame(frame).await,
                None => break,
            },
            _ = tick(&mut ticker) => {
                log::trace!("Sending heartbeat");

                writer.write_frame(frame::heartbeat()).await
            }
        };

        if let Err(e) = result {
            inner.fail(e).await;

            break;
        }
    }

    // Frames queued before the shutdown, like a close or a close-ok, still go out.
    let flush = async {
        while let Ok(frame) = outgoing.try_recv() {
            if writer.write_frame(frame).await.is_err() {
                break;
            }
        }

        let _ = writer.close().await;
    };

    if tokio::time::timeout(inner.config.default_abort_timeout, flush).await.is_err() {
        log::warn!("Connection {} couldn't flush before closing the socket", inner.id);
    }

    log::debug!("Writer of connection {} stopped", inner.id);

    inner.closed.send_replace(true);
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn expect_method<S>(transport: &mut FrameTransport<S>, expected: u32) -> Result<MethodFrameArgs>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match transport.read_frame().await? {
        AMQPFrame::Method(0, cm, args) if cm == expected => Ok(args),
        AMQPFrame::Method(0, _, MethodFrameArgs::ConnectionClose(close)) => {
            let _ = transport.write_frame(frame::connection_close_ok()).await;

            client_error!(
                ErrorKind::ClosedState,
                None,
                close.code,
                close.text.as_str(),
                close.class_method()
            )
        }
        other => client_error!(
            ErrorKind::ProtocolDecode,
            None,
            ConnectionError::UnexpectedFrame as u16,
            format!("Unexpected frame during handshake {other:?}"),
            expected
        ),
    }
}

fn unexpected_method<T>(args: MethodFrameArgs) -> Result<T> {
    client_error!(
        ErrorKind::ProtocolDecode,
        None,
        ConnectionError::CommandInvalid as u16,
        format!("Unexpected method during handshake {args:?}"),
        args.class_method()
    )
}

async fn handshake<S>(transport: &mut FrameTransport<S>, config: &ConnectionConfig) -> Result<(Tuning, Option<FieldTable>)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    transport.write_frame(AMQPFrame::Header).await?;

    let start = match expect_method(transport, frame::CONNECTION_START).await? {
        MethodFrameArgs::ConnectionStart(start) => start,
        other => return unexpected_method(other),
    };

    if !start.mechanisms.split_whitespace().any(|m| m == "PLAIN") {
        return client_error!(
            ErrorKind::ClosedState,
            None,
            ConnectionError::AccessRefused as u16,
            format!("Broker doesn't support PLAIN authentication, only {}", start.mechanisms),
            frame::CONNECTION_START
        );
    }

    let mut start_ok = frame::ConnectionStartOkArgs::new(&config.username, &config.password);

    if let Some(name) = &config.connection_name {
        start_ok = start_ok.property("connection_name", AMQPFieldValue::LongString(name.clone()));
    }

    transport.write_frame(start_ok.frame()).await?;

    let tune = match expect_method(transport, frame::CONNECTION_TUNE).await? {
        MethodFrameArgs::ConnectionTune(tune) => tune,
        other => return unexpected_method(other),
    };

    let tuning = Tuning {
        channel_max: negotiate(config.channel_max, tune.channel_max),
        frame_max: negotiate(config.frame_max, tune.frame_max),
        heartbeat: negotiate(config.heartbeat, tune.heartbeat),
    };

    log::debug!("Connection tuned {tuning:?}");

    transport
        .write_frame(
            frame::ConnectionTuneOkArgs {
                channel_max: tuning.channel_max,
                frame_max: tuning.frame_max,
                heartbeat: tuning.heartbeat,
            }
            .frame(),
        )
        .await?;

    if tuning.frame_max > 0 {
        transport.set_frame_max(tuning.frame_max as usize);
    }

    transport
        .write_frame(
            frame::ConnectionOpenArgs::default()
                .virtual_host(&config.virtual_host)
                .frame(),
        )
        .await?;

    expect_method(transport, frame::CONNECTION_OPEN_OK).await?;

    Ok((tuning, start.properties))
}

impl Connection {
    /// Open an AMQP connection over an already connected byte stream.
    pub async fn open<S>(stream: S, config: ConnectionConfig) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::open_with_events(stream, config, Arc::new(ConnectionEvents::default())).await
    }

    pub(crate) async fn open_with_events<S>(
        stream: S,
        config: ConnectionConfig,
        events: Arc<ConnectionEvents>,
    ) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut transport = FrameTransport::new(stream);

        let (tuning, server_properties) =
            match tokio::time::timeout(config.handshake_timeout, handshake(&mut transport, &config)).await {
                Ok(result) => result?,
                Err(_) => {
                    return client_error!(
                        ErrorKind::Transport,
                        None,
                        ConnectionError::InternalError as u16,
                        "Handshake timeout",
                        0
                    )
                }
            };

        let heartbeat = match tuning.heartbeat {
            0 => None,
            secs => Some(Duration::from_secs(secs.into())),
        };

        let (reader, writer) = transport.split(heartbeat);
        let (outgoing, outgoing_rx) = mpsc::channel(64);
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(ConnectionInner {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            tuning,
            server_properties,
            outgoing,
            table: Mutex::new(ChannelTable {
                channels: HashMap::new(),
                next: 1,
            }),
            reason: OnceLock::new(),
            finished: AtomicBool::new(false),
            close_ok: Mutex::new(None),
            io: CancellationToken::new(),
            events,
            closed,
        });

        tokio::spawn(read_loop(inner.clone(), reader));
        tokio::spawn(write_loop(inner.clone(), writer, outgoing_rx, heartbeat));

        log::info!("Connection {} is open to {}", inner.id, inner.config.address());

        Ok(Connection { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn tuning(&self) -> Tuning {
        self.inner.tuning
    }

    pub fn server_properties(&self) -> Option<&FieldTable> {
        self.inner.server_properties.as_ref()
    }

    pub fn events(&self) -> &ConnectionEvents {
        &self.inner.events
    }

    pub fn is_open(&self) -> bool {
        self.inner.reason.get().is_none()
    }

    /// The reason of the close, `None` while the connection is open.
    pub fn shutdown_reason(&self) -> Option<Arc<ShutdownReason>> {
        self.inner.reason.get().cloned()
    }

    /// Wait until the connection is closed and its socket is released, and get the reason.
    pub async fn closed(&self) -> Arc<ShutdownReason> {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;

        self.inner
            .reason
            .get()
            .cloned()
            .unwrap_or_else(|| Arc::new(ShutdownReason::library(REPLY_SUCCESS, "Connection closed")))
    }

    pub async fn open_channel(&self, token: &CancellationToken) -> Result<Channel> {
        self.open_channel_with_events(Arc::new(ChannelEvents::default()), token)
            .await
    }

    pub(crate) async fn open_channel_with_events(
        &self,
        events: Arc<ChannelEvents>,
        token: &CancellationToken,
    ) -> Result<Channel> {
        if self.inner.reason.get().is_some() {
            return self.inner.closed_error();
        }

        let channel = Channel::from_inner(self.inner.allocate_channel(events)?);

        if let Err(e) = channel.open(token).await {
            channel
                .inner
                .shutdown(Arc::new(ShutdownReason::library(REPLY_SUCCESS, "Channel open failed")));

            return Err(e);
        }

        Ok(channel)
    }

    /// Close the connection with a normal reply code and the configured close timeout.
    pub async fn close(&self) -> Result<()> {
        self.close_code(REPLY_SUCCESS, "Goodbye").await
    }

    pub async fn close_code(&self, code: u16, text: &str) -> Result<()> {
        self.close_with(
            code,
            text,
            self.inner.config.default_close_timeout,
            false,
            &CancellationToken::new(),
        )
        .await
    }

    /// Close the connection without waiting for the broker, transport errors are not reported.
    pub async fn abort(&self) -> Result<()> {
        self.close_with(
            REPLY_SUCCESS,
            "Goodbye",
            self.inner.config.default_abort_timeout,
            true,
            &CancellationToken::new(),
        )
        .await
    }

    /// Close the connection. Every channel is closed with the same reason.
    ///
    /// The broker has `timeout` to answer with close-ok, after that the socket is closed and
    /// `CloseTimeout` is returned unless `force` is set. With `force` the close-ok is not waited
    /// for and errors are not reported. Closing a closed connection succeeds immediately.
    pub async fn close_with(
        &self,
        code: u16,
        text: &str,
        timeout: Duration,
        force: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        let inner = &self.inner;

        if inner
            .reason
            .set(Arc::new(ShutdownReason::application(code, text)))
            .is_err()
        {
            if !inner.finished.load(Ordering::Acquire) {
                tokio::select! {
                    _ = self.closed() => {}
                    _ = tokio::time::sleep(timeout) => {}
                    _ = token.cancelled() => {}
                }
            }

            return Ok(());
        }

        log::info!("Closing connection {} code={} text={}", inner.id, code, text);

        let (tx, rx) = oneshot::channel();

        *lock(&inner.close_ok) = Some(tx);

        let close = frame::connection_close(code, text, 0);

        let sent = match tokio::time::timeout(timeout, inner.send_unchecked(close.into())).await {
            Ok(result) => result,
            Err(_) => client_error!(ErrorKind::CloseTimeout, None, 0, "Cannot send close", frame::CONNECTION_CLOSE),
        };

        let result = match sent {
            Err(e) => Err(e),
            Ok(()) if force => Ok(()),
            Ok(()) => tokio::select! {
                _ = rx => Ok(()),
                _ = tokio::time::sleep(timeout) => {
                    log::warn!("Close-ok didn't arrive in time on connection {}", inner.id);

                    client_error!(ErrorKind::CloseTimeout, None, 0, "Timeout waiting for close-ok", frame::CONNECTION_CLOSE)
                }
                _ = token.cancelled() => {
                    client_error!(ErrorKind::Cancelled, None, 0, "Close is cancelled", frame::CONNECTION_CLOSE)
                }
            },
        };

        inner.finish();

        if force {
            Ok(())
        } else {
            result
        }
    }
}
