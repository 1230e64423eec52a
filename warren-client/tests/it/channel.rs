use super::helper::{self, Behaviour, Recorder};
use super::kind_of;
use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use warren_client::error::client_error;
use warren_client::frame::{self, AMQPFrame, MethodFrameArgs};
use warren_client::model::ChannelError;
use warren_client::{ChannelState, Confirm, ErrorKind, Initiator};

#[tokio::test]
async fn declare_bind_purge_delete() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    assert_eq!(ch.state(), ChannelState::Open);

    ch.exchange_declare(frame::ExchangeDeclareArgs::new("prices", "topic").durable(true), &token)
        .await?;

    let ok = ch.queue_declare(frame::QueueDeclareArgs::default().exclusive(true), &token).await?;

    assert!(ok.name.starts_with("amq.gen-"), "{}", ok.name);

    ch.queue_bind(frame::QueueBindArgs::new(&ok.name, "prices").routing_key("eu.#"), &token)
        .await?;
    ch.queue_unbind(frame::QueueUnbindArgs::new(&ok.name, "prices").routing_key("eu.#"), &token)
        .await?;

    assert_eq!(ch.queue_purge(&ok.name, &token).await?, 3);
    assert_eq!(
        ch.queue_delete(frame::QueueDeleteArgs::default().queue_name(&ok.name), &token)
            .await?,
        2
    );

    ch.exchange_delete(frame::ExchangeDeleteArgs::new("prices"), &token).await?;
    ch.basic_qos(frame::BasicQosArgs::default().prefetch_count(10), &token).await?;

    let sent: Vec<u32> = broker
        .methods()
        .iter()
        .filter(|(number, _)| *number == ch.number())
        .map(|(_, args)| args.class_method())
        .collect();

    assert_eq!(
        sent,
        vec![
            frame::CHANNEL_OPEN,
            frame::EXCHANGE_DECLARE,
            frame::QUEUE_DECLARE,
            frame::QUEUE_BIND,
            frame::QUEUE_UNBIND,
            frame::QUEUE_PURGE,
            frame::QUEUE_DELETE,
            frame::EXCHANGE_DELETE,
            frame::BASIC_QOS
        ]
    );

    ch.close().await?;
    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn unanswered_request_times_out() -> Result<()> {
    let mut config = helper::config();
    config.continuation_timeout = Duration::from_millis(100);

    let behaviour = Behaviour {
        silent: [frame::QUEUE_DECLARE].into(),
        ..Default::default()
    };
    let (conn, _broker) = helper::connect_with(config, behaviour).await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    let result = ch.queue_declare(frame::QueueDeclareArgs::default().name("q"), &token).await;

    assert_eq!(kind_of(result), ErrorKind::Rpc);
    assert!(ch.is_open());

    Ok(())
}

#[tokio::test]
async fn cancelled_request() -> Result<()> {
    let behaviour = Behaviour {
        silent: [frame::QUEUE_DECLARE].into(),
        ..Default::default()
    };
    let (conn, _broker) = helper::connect_with(helper::config(), behaviour).await?;
    let ch = conn.open_channel(&CancellationToken::new()).await?;

    let token = CancellationToken::new();
    let canceller = token.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = ch.queue_declare(frame::QueueDeclareArgs::default().name("q"), &token).await;

    assert_eq!(kind_of(result), ErrorKind::Cancelled);

    Ok(())
}

#[tokio::test]
async fn broker_closes_channel_during_request() -> Result<()> {
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

        async move {
            ch.queue_declare(frame::QueueDeclareArgs::default().name("q").passive(true), &token)
                .await
        }
    });

    broker.wait_for(frame::QUEUE_DECLARE, 1).await;
    broker.send(frame::channel_close(
        ch.number(),
        ChannelError::NotFound.into(),
        "NOT_FOUND - no queue 'q'",
        frame::QUEUE_DECLARE,
    ));

    let err = declare.await?.unwrap_err();
    let client_err = client_error(&err).unwrap();

    assert_eq!(client_err.kind, ErrorKind::ClosedState);
    assert_eq!(client_err.code, ChannelError::NotFound as u16);
    assert!(client_err.message.contains("NOT_FOUND"));

    let reason = ch.closed().await;

    assert_eq!(reason.initiator, Initiator::Peer);
    assert_eq!(reason.class_method, frame::QUEUE_DECLARE);

    broker.wait_for(frame::CHANNEL_CLOSE_OK, 1).await;

    assert!(conn.is_open());
    assert!(conn.open_channel(&token).await?.is_open());

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn close_twice_then_use() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    ch.close().await?;
    ch.close().await?;
    ch.abort().await?;

    assert_eq!(ch.state(), ChannelState::Closed);
    assert_eq!(broker.count(frame::CHANNEL_CLOSE), 1);
    assert_eq!(ch.shutdown_reason().unwrap().initiator, Initiator::Application);

    let publish = ch
        .basic_publish(frame::BasicPublishArgs::new(""), frame::BasicProperties::default(), "x")
        .await;

    assert_eq!(kind_of(publish), ErrorKind::ClosedState);
    assert_eq!(
        kind_of(ch.basic_qos(frame::BasicQosArgs::default(), &token).await),
        ErrorKind::ClosedState
    );

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn large_body_is_split_by_frame_max() -> Result<()> {
    let mut config = helper::config();
    config.frame_max = 4096;

    let (conn, broker) = helper::connect_with(config, Behaviour::default()).await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    let body = vec![b'a'; 10_000];

    ch.basic_publish(
        frame::BasicPublishArgs::new("").routing_key("q"),
        frame::BasicProperties::default().content_type("text/plain"),
        body,
    )
    .await?;

    helper::wait_until(|| broker.frames().iter().filter(|f| matches!(f, AMQPFrame::ContentBody(_))).count() == 3)
        .await;

    let frames = broker.frames();
    let publish = frames
        .iter()
        .position(|f| matches!(f, AMQPFrame::Method(_, frame::BASIC_PUBLISH, _)))
        .unwrap();

    match &frames[publish + 1] {
        AMQPFrame::ContentHeader(header) => {
            assert_eq!(header.body_size, 10_000);
            assert_eq!(header.properties.content_type.as_deref(), Some("text/plain"));
        }
        other => panic!("Unexpected {other:?}"),
    }

    let sizes: Vec<usize> = frames[publish + 2..]
        .iter()
        .filter_map(|f| match f {
            AMQPFrame::ContentBody(body) => Some(body.body.len()),
            _ => None,
        })
        .collect();

    assert_eq!(sizes, vec![4088, 4088, 1824]);

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn delivery_reaches_consumer_and_is_acked() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let recorder = Arc::new(Recorder::default());

    let tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue("tasks"), recorder.clone(), &token)
        .await?;

    assert_eq!(ch.consumer_tags(), vec![tag.clone()]);

    broker.send_all(vec![
        frame::BasicDeliverArgs::new(&tag, 1, "")
            .routing_key("tasks")
            .frame(ch.number()),
        frame::ContentHeaderFrame::new(ch.number(), 5, frame::BasicProperties::default()).frame(),
        frame::ContentBodyFrame {
            channel: ch.number(),
            body: "hel".into(),
        }
        .frame(),
        frame::ContentBodyFrame {
            channel: ch.number(),
            body: "lo".into(),
        }
        .frame(),
    ]);

    helper::wait_until(|| recorder.calls().len() == 2).await;

    assert_eq!(recorder.calls(), vec![format!("consume-ok {tag}"), "deliver 1 hello".to_string()]);

    ch.basic_ack(1, false).await?;
    ch.basic_reject(2, true).await?;

    broker.wait_for(frame::BASIC_ACK, 1).await;
    broker.wait_for(frame::BASIC_REJECT, 1).await;

    ch.basic_cancel(&tag, &token).await?;

    helper::wait_until(|| recorder.calls().len() == 3).await;

    assert_eq!(recorder.calls()[2], format!("cancel-ok {tag}"));
    assert!(ch.consumer_tags().is_empty());

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn broker_cancel_is_acknowledged() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let recorder = Arc::new(Recorder::default());

    let tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue("tasks"), recorder.clone(), &token)
        .await?;

    broker.send(frame::BasicCancelArgs::new(&tag).frame(ch.number()));

    broker.wait_for(frame::BASIC_CANCEL_OK, 1).await;
    helper::wait_until(|| recorder.calls().len() == 2).await;

    assert_eq!(recorder.calls()[1], format!("cancel {tag}"));
    assert!(ch.consumer_tags().is_empty());

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn publisher_confirms_and_returns() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    assert_eq!(ch.next_publish_seq_no(), 0);

    ch.confirm_select(&token).await?;

    assert_eq!(ch.next_publish_seq_no(), 1);

    let confirms = Arc::new(Mutex::new(vec![]));
    let returns = Arc::new(Mutex::new(vec![]));

    let c = confirms.clone();
    ch.events().basic_acks.subscribe(move |confirm| {
        c.lock().unwrap().push(confirm.clone());
        Ok(())
    });

    let r = returns.clone();
    ch.events().basic_returns.subscribe(move |returned| {
        r.lock().unwrap().push(returned.clone());
        Ok(())
    });

    ch.basic_publish(
        frame::BasicPublishArgs::new("").routing_key("nowhere").mandatory(true),
        frame::BasicProperties::default(),
        "lost",
    )
    .await?;

    assert_eq!(ch.next_publish_seq_no(), 2);

    broker.send_all(vec![
        frame::BasicReturnArgs {
            reply_code: 312,
            reply_text: "NO_ROUTE".into(),
            exchange_name: "".into(),
            routing_key: "nowhere".into(),
        }
        .frame(ch.number()),
        frame::ContentHeaderFrame::new(ch.number(), 4, frame::BasicProperties::default()).frame(),
        frame::ContentBodyFrame {
            channel: ch.number(),
            body: "lost".into(),
        }
        .frame(),
        frame::BasicAckArgs::default().delivery_tag(1).frame(ch.number()),
    ]);

    helper::wait_until(|| confirms.lock().unwrap().len() == 1 && returns.lock().unwrap().len() == 1).await;

    assert_eq!(
        confirms.lock().unwrap()[0],
        Confirm::Ack {
            delivery_tag: 1,
            multiple: false
        }
    );

    let returned = returns.lock().unwrap()[0].clone();

    assert_eq!(returned.reply_code, 312);
    assert_eq!(returned.routing_key, "nowhere");
    assert_eq!(&returned.body[..], b"lost");

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn flow_control_is_answered() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    broker.send(frame::channel_flow(ch.number(), false));

    let flow_ok = broker.wait_for(frame::CHANNEL_FLOW_OK, 1).await;

    assert_eq!(
        flow_ok[0].1,
        MethodFrameArgs::ChannelFlowOk(frame::ChannelFlowArgs { active: false })
    );
    assert!(!ch.is_flow_active());

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn names_longer_than_a_short_string_are_refused() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let long = "ü".repeat(128);

    assert_eq!(
        kind_of(ch.queue_declare(frame::QueueDeclareArgs::default().name(&long), &token).await),
        ErrorKind::InvalidArgument
    );
    assert_eq!(
        kind_of(
            ch.basic_publish(
                frame::BasicPublishArgs::new("").routing_key(&long),
                frame::BasicProperties::default(),
                "body",
            )
            .await
        ),
        ErrorKind::InvalidArgument
    );

    // 255 bytes still fit.
    let fits = "a".repeat(255);

    ch.queue_declare(frame::QueueDeclareArgs::default().name(&fits), &token)
        .await?;

    assert!(ch.is_open());
    assert_eq!(broker.count(frame::QUEUE_DECLARE), 1);
    assert_eq!(broker.count(frame::BASIC_PUBLISH), 0);

    conn.close().await?;

    Ok(())
}
