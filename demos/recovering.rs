//! Consumes until Ctrl-C, restart the broker meanwhile to see the recovery.
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use warren_client::frame::{BasicConsumeArgs, QueueDeclareArgs};
use warren_client::{ConnectionConfig, DefaultConsumer, RecoveringConnection};

#[tokio::main]
async fn main() -> Result<()> {
    warren_client::setup_logger();

    let config = match std::env::args().nth(1) {
        Some(path) => ConnectionConfig::from_file(&path)?,
        None => ConnectionConfig::default(),
    };

    let conn = RecoveringConnection::connect(config).await?;

    conn.events().recovery_succeeded.subscribe(|e| {
        log::info!("Recovered as {} after {} attempt(s)", e.connection_id, e.attempts);
        Ok(())
    });
    conn.events().recovery_error.subscribe(|e| {
        log::warn!("Recovery attempt {} failed: {}", e.attempt, e.error);
        Ok(())
    });

    let token = CancellationToken::new();
    let channel = conn.open_channel(&token).await?;
    let queue = channel
        .queue_declare(QueueDeclareArgs::default().exclusive(true), &token)
        .await?
        .name;

    let consumer = DefaultConsumer::with_delivery(|delivery, _| {
        Box::pin(async move {
            log::info!("{} {:?}", delivery.delivery_tag, delivery.body);
            Ok(())
        })
    });

    channel
        .basic_consume(BasicConsumeArgs::default().queue(&queue).no_ack(true), Arc::new(consumer), &token)
        .await?;

    log::info!("Consuming from {queue}");

    tokio::signal::ctrl_c().await?;

    conn.close().await?;

    Ok(())
}
