use super::helper::{self, Behaviour};
use super::kind_of;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warren_client::frame::{self, AMQPFieldValue, MethodFrameArgs};
use warren_client::model::ConnectionError;
use warren_client::{Blocked, ErrorKind, Initiator, Tuning};

#[tokio::test]
async fn handshake_negotiates_and_opens_vhost() -> Result<()> {
    let mut config = helper::config();
    config.frame_max = 4096;
    config.connection_name = Some("order-service".into());

    let (conn, broker) = helper::connect_with(config, Behaviour::default()).await?;

    assert!(conn.is_open());
    assert_eq!(
        conn.tuning(),
        Tuning {
            channel_max: 2047,
            frame_max: 4096,
            heartbeat: 0
        }
    );
    assert!(conn.server_properties().unwrap().contains_key("product"));

    let methods = broker.methods();

    match &methods[0].1 {
        MethodFrameArgs::ConnectionStartOk(start_ok) => {
            assert_eq!(start_ok.mechanism, "PLAIN");
            assert_eq!(start_ok.response, "\u{0}guest\u{0}guest");
            assert_eq!(
                start_ok.properties.as_ref().unwrap().get("connection_name"),
                Some(&AMQPFieldValue::LongString("order-service".into()))
            );
        }
        other => panic!("Unexpected {other:?}"),
    }

    match &methods[1].1 {
        MethodFrameArgs::ConnectionTuneOk(tune_ok) => assert_eq!(tune_ok.frame_max, 4096),
        other => panic!("Unexpected {other:?}"),
    }

    match &methods[2].1 {
        MethodFrameArgs::ConnectionOpen(open) => assert_eq!(open.virtual_host, "/"),
        other => panic!("Unexpected {other:?}"),
    }

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn close_is_idempotent() -> Result<()> {
    let (conn, broker) = helper::connect().await?;

    conn.close().await?;
    conn.close().await?;
    conn.abort().await?;

    assert!(!conn.is_open());
    assert_eq!(broker.count(frame::CONNECTION_CLOSE), 1);

    let reason = conn.shutdown_reason().unwrap();

    assert_eq!(reason.initiator, Initiator::Application);
    assert_eq!(reason.reply_code, 200);
    assert!(reason.is_success());

    let token = CancellationToken::new();

    assert_eq!(kind_of(conn.open_channel(&token).await), ErrorKind::ClosedState);

    Ok(())
}

#[tokio::test]
async fn every_channel_gets_the_connection_reason() -> Result<()> {
    let (conn, _broker) = helper::connect().await?;
    let token = CancellationToken::new();

    let mut channels = vec![];

    for _ in 0..3 {
        channels.push(conn.open_channel(&token).await?);
    }

    let shutdowns = Arc::new(Mutex::new(vec![]));
    let s = shutdowns.clone();

    conn.events().connection_shutdown.subscribe(move |e| {
        s.lock().unwrap().push(e.reason.clone());
        Ok(())
    });

    conn.close_code(320, "maintenance").await?;

    let reason = conn.closed().await;

    assert_eq!(reason.reply_code, 320);
    assert_eq!(shutdowns.lock().unwrap().len(), 1);

    for ch in &channels {
        assert!(!ch.is_open());
        assert!(Arc::ptr_eq(&ch.shutdown_reason().unwrap(), &reason));
    }

    Ok(())
}

#[tokio::test]
async fn broker_close_is_answered() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    broker.send(frame::connection_close(
        ConnectionError::ConnectionForced.into(),
        "CONNECTION_FORCED - broker forced connection closure",
        0,
    ));

    let reason = conn.closed().await;

    assert_eq!(reason.initiator, Initiator::Peer);
    assert_eq!(reason.reply_code, 320);
    assert!(Arc::ptr_eq(&ch.closed().await, &reason));
    assert_eq!(broker.count(frame::CONNECTION_CLOSE_OK), 1);

    // A closed connection closes immediately.
    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn transport_loss_fails_pending_requests() -> Result<()> {
    let behaviour = Behaviour {
        silent: [frame::QUEUE_DECLARE].into(),
        ..Default::default()
    };
    let (conn, broker) = helper::connect_with(helper::config(), behaviour).await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    let declare = tokio::spawn({
        let ch = ch.clone();
        let token = token.clone();

        async move { ch.queue_declare(frame::QueueDeclareArgs::default().name("q"), &token).await }
    });

    broker.wait_for(frame::QUEUE_DECLARE, 1).await;
    broker.drop_connection();

    assert_eq!(kind_of(declare.await?), ErrorKind::ClosedState);

    let reason = conn.closed().await;

    assert_eq!(reason.initiator, Initiator::Library);
    assert!(reason.cause.is_some());
    assert!(Arc::ptr_eq(&ch.shutdown_reason().unwrap(), &reason));

    Ok(())
}

#[tokio::test]
async fn frame_for_unknown_channel_closes_connection() -> Result<()> {
    let (conn, broker) = helper::connect().await?;

    broker.send(frame::channel_open_ok(99));

    let reason = conn.closed().await;

    assert_eq!(reason.initiator, Initiator::Library);
    assert_eq!(reason.reply_code, ConnectionError::ChannelError as u16);

    let closes = broker.wait_for(frame::CONNECTION_CLOSE, 1).await;

    match &closes[0].1 {
        MethodFrameArgs::ConnectionClose(close) => assert_eq!(close.code, 504),
        other => panic!("Unexpected {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn blocked_notifications() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let seen = Arc::new(Mutex::new(vec![]));
    let s = seen.clone();

    conn.events().blocked.subscribe(move |b| {
        s.lock().unwrap().push(b.clone());
        Ok(())
    });

    broker.send(frame::connection_blocked("low on memory"));
    broker.send(frame::connection_unblocked());

    helper::wait_until(|| seen.lock().unwrap().len() == 2).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            Blocked::Blocked {
                reason: "low on memory".into()
            },
            Blocked::Unblocked
        ]
    );

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn missing_heartbeats_close_the_connection() -> Result<()> {
    let mut config = helper::config();
    config.heartbeat = 1;

    let behaviour = Behaviour {
        heartbeat: 1,
        ..Default::default()
    };

    let (conn, _broker) = helper::connect_with(config, behaviour).await?;

    let reason = tokio::time::timeout(Duration::from_secs(5), conn.closed()).await?;

    assert_eq!(reason.initiator, Initiator::Library);
    assert!(reason.to_string().contains("heartbeat"), "{reason}");

    Ok(())
}

#[tokio::test]
async fn channel_numbers_are_limited() -> Result<()> {
    let mut config = helper::config();
    config.channel_max = 2;

    let (conn, _broker) = helper::connect_with(config, Behaviour::default()).await?;
    let token = CancellationToken::new();

    let first = conn.open_channel(&token).await?;
    let _second = conn.open_channel(&token).await?;

    assert_eq!(kind_of(conn.open_channel(&token).await), ErrorKind::ChannelLimit);

    first.close().await?;

    let third = conn.open_channel(&token).await?;

    assert_eq!(third.number(), first.number());

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn closed_resolves_after_the_shutdown() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    broker.drop_connection();

    helper::wait_until(|| !conn.is_open() && ch.is_shutdown()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Nobody waited while the connection went down, the late waiters still return.
    let reason = tokio::time::timeout(Duration::from_secs(2), conn.closed()).await?;
    let channel_reason = tokio::time::timeout(Duration::from_secs(2), ch.closed()).await?;

    assert_eq!(reason.initiator, Initiator::Library);
    assert!(Arc::ptr_eq(&reason, &channel_reason));

    Ok(())
}

#[tokio::test]
async fn body_longer_than_declared_closes_connection() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let recorder = Arc::new(helper::Recorder::default());

    let tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue("q"), recorder.clone(), &token)
        .await?;

    broker.send_all(vec![
        frame::BasicDeliverArgs::new(&tag, 1, "").frame(ch.number()),
        frame::ContentHeaderFrame::new(ch.number(), 2, frame::BasicProperties::default()).frame(),
        frame::ContentBodyFrame {
            channel: ch.number(),
            body: "too long".into(),
        }
        .frame(),
    ]);

    let reason = conn.closed().await;

    assert_eq!(reason.initiator, Initiator::Library);
    assert_eq!(reason.reply_code, ConnectionError::UnexpectedFrame as u16);

    let closes = broker.wait_for(frame::CONNECTION_CLOSE, 1).await;

    match &closes[0].1 {
        MethodFrameArgs::ConnectionClose(close) => assert_eq!(close.code, 505),
        other => panic!("Unexpected {other:?}"),
    }

    helper::wait_until(|| ch.is_shutdown()).await;

    assert!(!recorder.calls().iter().any(|c| c.starts_with("deliver")));

    Ok(())
}
