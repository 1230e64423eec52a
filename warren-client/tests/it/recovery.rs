use super::helper::{self, Behaviour, BrokerHandle, FakeConnector, Recorder};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use warren_client::frame::{self, MethodFrameArgs};
use warren_client::model::ChannelError;
use warren_client::{
    ConnectionConfig, Initiator, RecordedEntity, RecoveringConnection, RecoveryState, TagRecovery,
};

async fn next_broker(brokers: &mut mpsc::UnboundedReceiver<BrokerHandle>) -> BrokerHandle {
    tokio::time::timeout(Duration::from_secs(5), brokers.recv())
        .await
        .expect("No connection in time")
        .expect("Connector is gone")
}

async fn start(
    config: ConnectionConfig,
    behaviour: Behaviour,
) -> Result<(RecoveringConnection, Arc<FakeConnector>, mpsc::UnboundedReceiver<BrokerHandle>, BrokerHandle)> {
    let (connector, mut brokers) = FakeConnector::new(behaviour);
    let conn = RecoveringConnection::connect_with(config, connector.clone()).await?;
    let broker = next_broker(&mut brokers).await;

    Ok((conn, connector, brokers, broker))
}

fn count_successes(conn: &RecoveringConnection) -> Arc<Mutex<Vec<u32>>> {
    let successes = Arc::new(Mutex::new(vec![]));
    let s = successes.clone();

    conn.events().recovery_succeeded.subscribe(move |e| {
        s.lock().unwrap().push(e.attempts);
        Ok(())
    });

    successes
}

async fn final_state(conn: &RecoveringConnection) -> RecoveryState {
    let mut states = conn.state_changes();

    let state = tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| s.is_permanently_closed()))
        .await
        .expect("Not closed in time")
        .expect("Supervisor is gone")
        .clone();

    state
}

#[tokio::test]
async fn topology_and_consumers_are_replayed() -> Result<()> {
    let (conn, _connector, mut brokers, broker) = start(helper::config(), Behaviour::default()).await?;
    let successes = count_successes(&conn);
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let recorder = Arc::new(Recorder::default());

    ch.basic_qos(frame::BasicQosArgs::default().prefetch_count(5), &token).await?;
    ch.exchange_declare(frame::ExchangeDeclareArgs::new("logs", "fanout"), &token)
        .await?;

    let queue = ch
        .queue_declare(frame::QueueDeclareArgs::default().exclusive(true), &token)
        .await?
        .name;

    ch.queue_bind(frame::QueueBindArgs::new(&queue, "logs"), &token).await?;

    let tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue(&queue), recorder.clone(), &token)
        .await?;

    broker.drop_connection();

    let broker = next_broker(&mut brokers).await;

    helper::wait_until(|| successes.lock().unwrap().len() == 1).await;

    assert!(conn.state().is_connected());
    assert!(ch.is_open());

    let methods = broker.methods();
    let replayed: Vec<&MethodFrameArgs> = methods
        .iter()
        .map(|(_, args)| args)
        .filter(|args| {
            !matches!(
                args,
                MethodFrameArgs::ConnectionStartOk(_)
                    | MethodFrameArgs::ConnectionTuneOk(_)
                    | MethodFrameArgs::ConnectionOpen(_)
            )
        })
        .collect();

    assert_eq!(replayed[0], &MethodFrameArgs::ChannelOpen);
    assert_eq!(
        replayed[1],
        &MethodFrameArgs::BasicQos(frame::BasicQosArgs::default().prefetch_count(5))
    );
    assert_eq!(replayed[2], &MethodFrameArgs::ChannelOpen);
    assert_eq!(
        replayed[3],
        &MethodFrameArgs::ExchangeDeclare(frame::ExchangeDeclareArgs::new("logs", "fanout"))
    );

    let new_queue = match replayed[4] {
        MethodFrameArgs::QueueDeclare(args) => {
            assert_eq!(args.name, "");
            conn.recorded_entities()
                .iter()
                .find_map(|e| match e {
                    RecordedEntity::Queue { name, .. } => Some(name.clone()),
                    _ => None,
                })
                .unwrap()
        }
        other => panic!("Unexpected {other:?}"),
    };

    assert_ne!(new_queue, queue);
    assert_eq!(
        replayed[5],
        &MethodFrameArgs::QueueBind(frame::QueueBindArgs::new(&new_queue, "logs"))
    );

    match replayed[6] {
        MethodFrameArgs::BasicConsume(args) => {
            assert_eq!(args.queue, new_queue);
            assert_eq!(args.consumer_tag, tag);
        }
        other => panic!("Unexpected {other:?}"),
    }

    // The consumer gets the deliveries of the new connection.
    broker.send_all(vec![
        frame::BasicDeliverArgs::new(&tag, 1, "logs").frame(ch.number()),
        frame::ContentHeaderFrame::new(ch.number(), 2, frame::BasicProperties::default()).frame(),
        frame::ContentBodyFrame {
            channel: ch.number(),
            body: "hi".into(),
        }
        .frame(),
    ]);

    helper::wait_until(|| recorder.calls().contains(&"deliver 1 hi".to_string())).await;

    let calls = recorder.calls();

    assert_eq!(calls[0], format!("consume-ok {tag}"));
    assert!(calls[1].starts_with(&format!("shutdown {tag}")));
    assert_eq!(calls[2], format!("consume-ok {tag}"));

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn regenerated_tags_are_announced() -> Result<()> {
    let mut config = helper::config();
    config.recovery.consumer_tags = TagRecovery::Regenerate;

    let (conn, _connector, mut brokers, broker) = start(config, Behaviour::default()).await?;
    let successes = count_successes(&conn);
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let recorder = Arc::new(Recorder::default());

    ch.basic_consume(
        frame::BasicConsumeArgs::default().queue("jobs").consumer_tag("worker-1"),
        recorder.clone(),
        &token,
    )
    .await?;

    broker.drop_connection();

    let broker = next_broker(&mut brokers).await;

    helper::wait_until(|| successes.lock().unwrap().len() == 1).await;

    let consumes = broker.wait_for(frame::BASIC_CONSUME, 1).await;

    match &consumes[0].1 {
        MethodFrameArgs::BasicConsume(args) => assert_eq!(args.consumer_tag, ""),
        other => panic!("Unexpected {other:?}"),
    }

    let new_tag = match &conn.recorded_entities()[0] {
        RecordedEntity::Consumer { args, .. } => args.consumer_tag.clone(),
        other => panic!("Unexpected {other:?}"),
    };

    assert!(new_tag.starts_with("amq.ctag-"));

    helper::wait_until(|| recorder.calls().len() == 4).await;

    assert_eq!(
        recorder.calls(),
        vec![
            "consume-ok worker-1".to_string(),
            "shutdown worker-1 541".to_string(),
            "cancel-ok worker-1".to_string(),
            format!("consume-ok {new_tag}"),
        ]
    );

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn refused_tag_falls_back_to_a_new_one() -> Result<()> {
    let behaviour = Behaviour {
        refuse_consumer_tags: true,
        ..Default::default()
    };

    let (conn, _connector, mut brokers, broker) = start(helper::config(), behaviour).await?;
    let successes = count_successes(&conn);
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let recorder = Arc::new(Recorder::default());

    let old_tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue("jobs"), recorder.clone(), &token)
        .await?;

    broker.drop_connection();

    let broker = next_broker(&mut brokers).await;

    helper::wait_until(|| successes.lock().unwrap().len() == 1).await;

    // Refused consume, close-ok, reopened channel, consume with an empty tag.
    assert_eq!(broker.count(frame::BASIC_CONSUME), 2);
    assert_eq!(broker.count(frame::CHANNEL_CLOSE_OK), 1);
    assert_eq!(broker.count(frame::CHANNEL_OPEN), 2);
    assert!(ch.is_open());

    let new_tag = match &conn.recorded_entities()[0] {
        RecordedEntity::Consumer { args, .. } => args.consumer_tag.clone(),
        other => panic!("Unexpected {other:?}"),
    };

    assert_ne!(new_tag, old_tag);

    helper::wait_until(|| recorder.calls().contains(&format!("consume-ok {new_tag}"))).await;

    assert!(recorder.calls().contains(&format!("cancel-ok {old_tag}")));

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn failed_attempts_are_reported() -> Result<()> {
    let (conn, connector, mut brokers, broker) = start(helper::config(), Behaviour::default()).await?;
    let successes = count_successes(&conn);
    let errors = Arc::new(Mutex::new(vec![]));

    let e = errors.clone();
    conn.events().recovery_error.subscribe(move |err| {
        e.lock().unwrap().push(err.attempt);
        Ok(())
    });

    let lost = Arc::new(Mutex::new(vec![]));
    let l = lost.clone();
    conn.connection_events().connection_shutdown.subscribe(move |s| {
        l.lock().unwrap().push(s.reason.initiator);
        Ok(())
    });

    connector.fail_next(2);
    broker.drop_connection();

    let _broker = next_broker(&mut brokers).await;

    helper::wait_until(|| successes.lock().unwrap().len() == 1).await;

    assert_eq!(*errors.lock().unwrap(), vec![1, 2]);
    assert_eq!(*successes.lock().unwrap(), vec![3]);
    assert_eq!(*lost.lock().unwrap(), vec![Initiator::Library]);

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn application_close_is_permanent() -> Result<()> {
    let (conn, _connector, mut brokers, _broker) = start(helper::config(), Behaviour::default()).await?;

    conn.close().await?;

    match final_state(&conn).await {
        RecoveryState::PermanentlyClosed(reason) => {
            assert_eq!(reason.initiator, Initiator::Application);
            assert_eq!(reason.reply_code, 200);
        }
        other => panic!("Unexpected {other:?}"),
    }

    assert_eq!(conn.closed().await.initiator, Initiator::Application);

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(brokers.try_recv().is_err());

    // Closing again is fine.
    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn disabled_recovery_closes_permanently() -> Result<()> {
    let mut config = helper::config();
    config.recovery.enabled = false;

    let (conn, _connector, _brokers, broker) = start(config, Behaviour::default()).await?;

    broker.drop_connection();

    match final_state(&conn).await {
        RecoveryState::PermanentlyClosed(reason) => assert_eq!(reason.initiator, Initiator::Library),
        other => panic!("Unexpected {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn recovery_gives_up_after_max_attempts() -> Result<()> {
    let mut config = helper::config();
    config.recovery.max_attempts = Some(2);

    let (conn, connector, _brokers, broker) = start(config, Behaviour::default()).await?;
    let errors = Arc::new(Mutex::new(vec![]));

    let e = errors.clone();
    conn.events().recovery_error.subscribe(move |err| {
        e.lock().unwrap().push(err.attempt);
        Ok(())
    });

    connector.fail_next(10);
    broker.drop_connection();

    match final_state(&conn).await {
        RecoveryState::PermanentlyClosed(reason) => assert_eq!(reason.initiator, Initiator::Library),
        other => panic!("Unexpected {other:?}"),
    }

    assert_eq!(*errors.lock().unwrap(), vec![1, 2]);

    Ok(())
}

#[tokio::test]
async fn channels_closed_by_broker_are_not_recovered() -> Result<()> {
    let (conn, _connector, mut brokers, broker) = start(helper::config(), Behaviour::default()).await?;
    let successes = count_successes(&conn);
    let token = CancellationToken::new();
    let closed_by_broker = conn.open_channel(&token).await?;
    let closed_by_app = conn.open_channel(&token).await?;
    let survivor = conn.open_channel(&token).await?;

    broker.send(frame::channel_close(
        closed_by_broker.number(),
        ChannelError::PreconditionFailed.into(),
        "PRECONDITION_FAILED - unknown delivery tag 1",
        frame::BASIC_ACK,
    ));

    closed_by_broker.channel().closed().await;
    closed_by_app.close().await?;

    broker.drop_connection();

    let broker = next_broker(&mut brokers).await;

    helper::wait_until(|| successes.lock().unwrap().len() == 1).await;

    assert_eq!(broker.count(frame::CHANNEL_OPEN), 1);
    assert!(survivor.is_open());
    assert!(!closed_by_broker.is_open());
    assert!(!closed_by_app.is_open());

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn deleted_entities_are_forgotten() -> Result<()> {
    let (conn, _connector, _brokers, _broker) = start(helper::config(), Behaviour::default()).await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    ch.exchange_declare(frame::ExchangeDeclareArgs::new("events", "topic"), &token)
        .await?;
    ch.exchange_declare(frame::ExchangeDeclareArgs::new("amq.topic", "topic").passive(true), &token)
        .await?;
    ch.queue_declare(frame::QueueDeclareArgs::default().name("audit"), &token)
        .await?;
    ch.queue_bind(frame::QueueBindArgs::new("audit", "events").routing_key("#"), &token)
        .await?;
    ch.basic_consume(
        frame::BasicConsumeArgs::default().queue("audit"),
        Arc::new(Recorder::default()),
        &token,
    )
    .await?;

    assert_eq!(conn.recorded_entities().len(), 4);

    ch.queue_delete(frame::QueueDeleteArgs::default().queue_name("audit"), &token)
        .await?;

    let remaining = conn.recorded_entities();

    assert_eq!(remaining.len(), 1);
    assert!(matches!(&remaining[0], RecordedEntity::Exchange(args) if args.exchange_name == "events"));

    conn.close().await?;

    Ok(())
}

fn recorded_tags(conn: &RecoveringConnection) -> Vec<String> {
    let mut tags: Vec<String> = conn
        .recorded_entities()
        .iter()
        .filter_map(|e| match e {
            RecordedEntity::Consumer { args, .. } => Some(args.consumer_tag.clone()),
            _ => None,
        })
        .collect();

    tags.sort();
    tags
}

#[tokio::test]
async fn same_tag_on_two_channels_is_recovered_on_both() -> Result<()> {
    let (conn, _connector, mut brokers, broker) = start(helper::config(), Behaviour::default()).await?;
    let successes = count_successes(&conn);
    let token = CancellationToken::new();
    let a = conn.open_channel(&token).await?;
    let b = conn.open_channel(&token).await?;

    for ch in [&a, &b] {
        ch.basic_consume(
            frame::BasicConsumeArgs::default().queue("jobs").consumer_tag("worker"),
            Arc::new(Recorder::default()),
            &token,
        )
        .await?;
    }

    assert_eq!(recorded_tags(&conn), vec!["worker", "worker"]);

    broker.drop_connection();

    let broker = next_broker(&mut brokers).await;

    helper::wait_until(|| successes.lock().unwrap().len() == 1).await;

    assert_eq!(broker.count(frame::BASIC_CONSUME), 2);
    assert_eq!(a.channel().consumer_tags(), vec!["worker"]);
    assert_eq!(b.channel().consumer_tags(), vec!["worker"]);

    // Cancelling on one channel leaves the consumer of the other one recorded.
    a.basic_cancel("worker", &token).await?;

    assert_eq!(recorded_tags(&conn), vec!["worker"]);

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn consumers_survive_a_reopened_channel() -> Result<()> {
    let behaviour = Behaviour {
        refuse_consumer_tags: true,
        ..Default::default()
    };

    let (conn, _connector, mut brokers, broker) = start(helper::config(), behaviour).await?;
    let successes = count_successes(&conn);
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());

    ch.basic_consume(frame::BasicConsumeArgs::default().queue("jobs"), first.clone(), &token)
        .await?;
    ch.basic_consume(frame::BasicConsumeArgs::default().queue("jobs"), second.clone(), &token)
        .await?;

    broker.drop_connection();

    let broker = next_broker(&mut brokers).await;

    helper::wait_until(|| successes.lock().unwrap().len() == 1).await;

    // Both preserved tags are refused, each refusal closes the channel.
    assert_eq!(broker.count(frame::CHANNEL_CLOSE_OK), 2);

    let mut live = ch.channel().consumer_tags();
    live.sort();

    assert_eq!(live.len(), 2);
    assert_eq!(live, recorded_tags(&conn));

    // Every consumer is told its final tag last.
    for recorder in [&first, &second] {
        helper::wait_until(|| {
            recorder
                .calls()
                .last()
                .is_some_and(|call| live.iter().any(|tag| *call == format!("consume-ok {tag}")))
        })
        .await;
    }

    assert_ne!(first.calls().last(), second.calls().last());

    conn.close().await?;

    Ok(())
}
