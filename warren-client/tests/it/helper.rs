//! In-process broker speaking enough AMQP to drive the client over a `tokio::io::duplex` pipe.
use anyhow::Result;
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use warren_client::frame::{self, AMQPFrame, MethodFrameArgs};
use warren_client::{BoxedStream, Connection, ConnectionConfig, Connector, RecoveryConfig};
use warren_codec::codec::{AMQPCodec, Frame};

/// Shared by every broker so a redeclared server named queue gets a new name.
static SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Default)]
pub struct Behaviour {
    pub heartbeat: u16,
    /// Methods which are received but never answered.
    pub silent: HashSet<u32>,
    /// Consumes with a client chosen tag are answered with a channel close.
    pub refuse_consumer_tags: bool,
}

enum Command {
    Send(Vec<AMQPFrame>),
    Drop,
}

/// Test side of a fake broker connection.
#[derive(Clone)]
pub struct BrokerHandle {
    received: Arc<Mutex<Vec<AMQPFrame>>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl BrokerHandle {
    pub fn start(stream: DuplexStream, behaviour: Behaviour) -> Self {
        let received = Arc::new(Mutex::new(vec![]));
        let (commands, commands_rx) = mpsc::unbounded_channel();

        tokio::spawn(serve(stream, behaviour, received.clone(), commands_rx));

        Self { received, commands }
    }

    pub fn send(&self, frame: AMQPFrame) {
        let _ = self.commands.send(Command::Send(vec![frame]));
    }

    pub fn send_all(&self, frames: Vec<AMQPFrame>) {
        let _ = self.commands.send(Command::Send(frames));
    }

    /// Close the socket without any closing handshake.
    pub fn drop_connection(&self) {
        let _ = self.commands.send(Command::Drop);
    }

    /// The method frames the client sent, in order.
    pub fn methods(&self) -> Vec<(u16, MethodFrameArgs)> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter_map(|f| match f {
                AMQPFrame::Method(ch, _, args) => Some((*ch, args.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn frames(&self) -> Vec<AMQPFrame> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self, class_method: u32) -> usize {
        self.methods()
            .iter()
            .filter(|(_, args)| args.class_method() == class_method)
            .count()
    }

    /// Wait until the client sent `n` methods of the kind.
    pub async fn wait_for(&self, class_method: u32, n: usize) -> Vec<(u16, MethodFrameArgs)> {
        wait_until(|| self.count(class_method) >= n).await;

        self.methods()
            .into_iter()
            .filter(|(_, args)| args.class_method() == class_method)
            .collect()
    }
}

/// Poll a condition, the test fails after a while.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("Condition is not met in time");
}

async fn serve(
    stream: DuplexStream,
    behaviour: Behaviour,
    received: Arc<Mutex<Vec<AMQPFrame>>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut framed = Framed::new(stream, AMQPCodec::with_frame_max(131_072));

    loop {
        tokio::select! {
            incoming = framed.next() => {
                let frames = match incoming {
                    Some(Ok(Frame::Frame(f))) => vec![f],
                    Some(Ok(Frame::Frames(fs))) => fs,
                    _ => break,
                };

                for f in frames {
                    if let AMQPFrame::Heartbeat(_) = f {
                        continue;
                    }

                    received.lock().unwrap().push(f.clone());

                    let (replies, stop) = reply(&behaviour, f);

                    for r in replies {
                        if framed.send(Frame::Frame(r)).await.is_err() {
                            return;
                        }
                    }

                    if stop {
                        return;
                    }
                }
            }
            command = commands.recv() => match command {
                Some(Command::Send(frames)) => {
                    if framed.send(Frame::Frames(frames)).await.is_err() {
                        return;
                    }
                }
                Some(Command::Drop) | None => return,
            }
        }
    }
}

/// The answers of the broker to a client frame, and whether the connection ends.
fn reply(behaviour: &Behaviour, f: AMQPFrame) -> (Vec<AMQPFrame>, bool) {
    let (ch, args) = match f {
        AMQPFrame::Header => return (vec![frame::ConnectionStartArgs::new("fake broker").frame()], false),
        AMQPFrame::Method(ch, _, args) => (ch, args),
        _ => return (vec![], false),
    };

    if behaviour.silent.contains(&args.class_method()) {
        return (vec![], false);
    }

    let answer = match args {
        MethodFrameArgs::ConnectionStartOk(_) => frame::ConnectionTuneArgs {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: behaviour.heartbeat,
        }
        .frame(),
        MethodFrameArgs::ConnectionOpen(_) => frame::connection_open_ok(),
        MethodFrameArgs::ConnectionClose(_) => return (vec![frame::connection_close_ok()], true),
        MethodFrameArgs::ConnectionCloseOk => return (vec![], true),
        MethodFrameArgs::ChannelOpen => frame::channel_open_ok(ch),
        MethodFrameArgs::ChannelClose(_) => frame::channel_close_ok(ch),
        MethodFrameArgs::ExchangeDeclare(_) => frame::exchange_declare_ok(ch),
        MethodFrameArgs::ExchangeDelete(_) => frame::exchange_delete_ok(ch),
        MethodFrameArgs::QueueDeclare(args) => {
            let name = match args.name.as_str() {
                "" => format!("amq.gen-{}", next_id()),
                name => name.to_string(),
            };

            frame::QueueDeclareOkArgs::default().name(&name).frame(ch)
        }
        MethodFrameArgs::QueueBind(_) => frame::queue_bind_ok(ch),
        MethodFrameArgs::QueueUnbind(_) => frame::queue_unbind_ok(ch),
        MethodFrameArgs::QueuePurge(_) => frame::QueuePurgeOkArgs::default().message_count(3).frame(ch),
        MethodFrameArgs::QueueDelete(_) => frame::QueueDeleteOkArgs::default().message_count(2).frame(ch),
        MethodFrameArgs::BasicQos(_) => MethodFrameArgs::BasicQosOk.frame(ch),
        MethodFrameArgs::BasicConsume(args) if behaviour.refuse_consumer_tags && !args.consumer_tag.is_empty() => {
            frame::channel_close(ch, 530, "NOT_ALLOWED - attempt to reuse consumer tag", frame::BASIC_CONSUME)
        }
        MethodFrameArgs::BasicConsume(args) => {
            let tag = match args.consumer_tag.as_str() {
                "" => format!("amq.ctag-{}", next_id()),
                tag => tag.to_string(),
            };

            frame::BasicConsumeOkArgs::new(&tag).frame(ch)
        }
        MethodFrameArgs::BasicCancel(args) => frame::BasicCancelOkArgs::new(&args.consumer_tag).frame(ch),
        MethodFrameArgs::ConfirmSelect(_) => frame::confirm_select_ok(ch),
        _ => return (vec![], false),
    };

    (vec![answer], false)
}

/// Config with short timeouts and fast recovery.
pub fn config() -> ConnectionConfig {
    ConnectionConfig {
        heartbeat: 0,
        continuation_timeout: Duration::from_secs(2),
        default_close_timeout: Duration::from_secs(2),
        default_abort_timeout: Duration::from_millis(500),
        recovery: RecoveryConfig {
            initial_interval: Duration::from_millis(10),
            max_interval: Duration::from_millis(100),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub async fn connect_with(config: ConnectionConfig, behaviour: Behaviour) -> Result<(Connection, BrokerHandle)> {
    let (client, server) = tokio::io::duplex(1 << 16);
    let broker = BrokerHandle::start(server, behaviour);
    let connection = Connection::open(client, config).await?;

    Ok((connection, broker))
}

pub async fn connect() -> Result<(Connection, BrokerHandle)> {
    connect_with(config(), Behaviour::default()).await
}

/// Connector handing out fake brokers, the test gets the broker side of every connection.
pub struct FakeConnector {
    behaviour: Behaviour,
    brokers: mpsc::UnboundedSender<BrokerHandle>,
    failures: AtomicU32,
}

impl FakeConnector {
    pub fn new(behaviour: Behaviour) -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerHandle>) {
        let (brokers, rx) = mpsc::unbounded_channel();

        let connector = Arc::new(Self {
            behaviour,
            brokers,
            failures: AtomicU32::new(0),
        });

        (connector, rx)
    }

    /// The next `n` connects are refused.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(&'a self, _config: &'a ConnectionConfig) -> BoxFuture<'a, Result<BoxedStream>> {
        Box::pin(async move {
            let refused = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();

            if refused {
                anyhow::bail!("Connection refused");
            }

            let (client, server) = tokio::io::duplex(1 << 16);

            let _ = self.brokers.send(BrokerHandle::start(server, self.behaviour.clone()));

            Ok(Box::new(client) as BoxedStream)
        })
    }
}

/// Consumer recording its callbacks as strings.
#[derive(Default)]
pub struct Recorder {
    pub calls: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl warren_client::Consumer for Recorder {
    fn handle_delivery(
        &self,
        delivery: warren_client::Delivery,
        _token: tokio_util::sync::CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        self.push(format!("deliver {} {}", delivery.delivery_tag, String::from_utf8_lossy(&delivery.body)));

        Box::pin(async { Ok(()) })
    }

    fn handle_cancel(&self, consumer_tag: String, _token: tokio_util::sync::CancellationToken) -> BoxFuture<'_, Result<()>> {
        self.push(format!("cancel {consumer_tag}"));

        Box::pin(async { Ok(()) })
    }

    fn handle_cancel_ok(
        &self,
        consumer_tag: String,
        _token: tokio_util::sync::CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        self.push(format!("cancel-ok {consumer_tag}"));

        Box::pin(async { Ok(()) })
    }

    fn handle_consume_ok(
        &self,
        consumer_tag: String,
        _token: tokio_util::sync::CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        self.push(format!("consume-ok {consumer_tag}"));

        Box::pin(async { Ok(()) })
    }

    fn handle_channel_shutdown(
        &self,
        consumer_tag: String,
        reason: Arc<warren_client::ShutdownReason>,
        _token: tokio_util::sync::CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        self.push(format!("shutdown {consumer_tag} {}", reason.reply_code));

        Box::pin(async { Ok(()) })
    }
}
