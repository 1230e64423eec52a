use anyhow::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use warren_client::frame::{
    BasicConsumeArgs, BasicProperties, BasicPublishArgs, ExchangeDeclareArgs, QueueBindArgs, QueueDeclareArgs,
};
use warren_client::{Channel, ConnectionConfig, DefaultConsumer};

const MESSAGE_COUNT: u32 = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    let exchange = "x_pubsub";
    let queue = "q_pubsub";

    warren_client::setup_logger();

    let conn = warren_client::connect(ConnectionConfig::default()).await?;
    let token = CancellationToken::new();
    let channel = conn.open_channel(&token).await?;

    channel
        .exchange_declare(ExchangeDeclareArgs::new(exchange, "direct"), &token)
        .await?;
    channel
        .queue_declare(QueueDeclareArgs::default().name(queue), &token)
        .await?;
    channel
        .queue_bind(QueueBindArgs::new(queue, exchange), &token)
        .await?;

    let received = Arc::new(AtomicU32::new(0));
    let done = Arc::new(Notify::new());

    let consumer = {
        let channel = channel.clone();
        let received = received.clone();
        let done = done.clone();

        DefaultConsumer::with_delivery(move |delivery, _| {
            let channel: Channel = channel.clone();
            let received = received.clone();
            let done = done.clone();

            Box::pin(async move {
                channel.basic_ack(delivery.delivery_tag, false).await?;

                if received.fetch_add(1, Ordering::SeqCst) + 1 == MESSAGE_COUNT {
                    done.notify_one();
                }

                Ok(())
            })
        })
    };

    let tag = channel
        .basic_consume(BasicConsumeArgs::default().queue(queue), Arc::new(consumer), &token)
        .await?;

    let message = "This will be the test message what we send over multiple times";
    let start = Instant::now();

    for _ in 0..MESSAGE_COUNT {
        channel
            .basic_publish(BasicPublishArgs::new(exchange), BasicProperties::default(), message)
            .await?;
    }

    done.notified().await;

    println!("Send and receive {} messages: {:?}", MESSAGE_COUNT, start.elapsed());

    channel.basic_cancel(&tag, &token).await?;
    channel.close().await?;
    conn.close().await?;

    Ok(())
}
