//! AMQP 0-9-1 client with non-blocking consumer dispatch and automatic connection recovery.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use warren_client::frame::{BasicConsumeArgs, BasicProperties, BasicPublishArgs, QueueDeclareArgs};
//! use warren_client::{ConnectionConfig, DefaultConsumer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let conn = warren_client::connect(ConnectionConfig::default()).await?;
//! let token = CancellationToken::new();
//! let ch = conn.open_channel(&token).await?;
//!
//! ch.queue_declare(QueueDeclareArgs::default().name("tasks"), &token).await?;
//! ch.basic_publish(BasicPublishArgs::new("").routing_key("tasks"), BasicProperties::default(), "hello")
//!     .await?;
//!
//! let consumer = DefaultConsumer::with_delivery(|delivery, _| {
//!     Box::pin(async move {
//!         println!("{:?}", delivery.body);
//!         Ok(())
//!     })
//! });
//! ch.basic_consume(BasicConsumeArgs::default().queue("tasks").no_ack(true), Arc::new(consumer), &token)
//!     .await?;
//!
//! conn.close().await?;
//! # Ok(())
//! # }
//! ```
mod channel;
pub use channel::{CallbackException, Channel, ChannelEvents, ChannelShutdown, ChannelState};

mod config;
pub use config::{ConnectionConfig, RecoveryConfig, TagRecovery};

mod connection;
pub use connection::{
    connect, AsyncStream, Blocked, BoxedStream, Connection, ConnectionEvents, ConnectionShutdown, Connector,
    TcpConnector, Tuning,
};

mod consumer;
pub use consumer::{Consumer, ConsumerCancelled, ConsumerHandle, DefaultConsumer};

mod dev;
pub use dev::setup_logger;

mod dispatcher;

pub mod error;
pub use error::{ClientError, ErrorKind};

mod event;
pub use event::{EventList, Subscription};

mod message;
pub use message::{Confirm, Delivery, ReturnedMessage};

pub mod model;
pub use model::ChannelNumber;

mod recovery;
pub use recovery::{
    RecordedEntity, RecoveringChannel, RecoveringConnection, RecoveryError, RecoveryEvents, RecoveryState,
    RecoverySucceeded,
};

mod shutdown;
pub use shutdown::{Initiator, ShutdownReason};

pub mod transport;

/// The frame types and method arguments of the codec.
pub use warren_codec::frame;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, a panic in another holder doesn't make the data unusable for us.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
