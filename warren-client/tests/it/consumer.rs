use super::helper::{self, Behaviour, BrokerHandle, Recorder};
use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use warren_client::error::error_kind;
use warren_client::frame;
use warren_client::{Channel, DefaultConsumer, ErrorKind, Initiator};

fn deliver(broker: &BrokerHandle, ch: &Channel, tag: &str, delivery_tag: u64, body: &'static str) {
    broker.send_all(vec![
        frame::BasicDeliverArgs::new(tag, delivery_tag, "").frame(ch.number()),
        frame::ContentHeaderFrame::new(ch.number(), body.len() as u64, frame::BasicProperties::default()).frame(),
        frame::ContentBodyFrame {
            channel: ch.number(),
            body: body.into(),
        }
        .frame(),
    ]);
}

#[tokio::test]
async fn every_consumer_is_shut_down_once() -> Result<()> {
    let (conn, _broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;

    let mut consumers = vec![];

    for _ in 0..3 {
        let recorder = Arc::new(Recorder::default());
        let tag = ch
            .basic_consume(frame::BasicConsumeArgs::default().queue("q"), recorder.clone(), &token)
            .await?;

        consumers.push((tag, recorder));
    }

    let shutdowns = Arc::new(AtomicUsize::new(0));
    let s = shutdowns.clone();

    ch.events().channel_shutdown.subscribe(move |e| {
        assert_eq!(e.reason.initiator, Initiator::Application);
        s.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    ch.close().await?;
    ch.close().await?;

    helper::wait_until(|| ch.is_shutdown()).await;

    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

    for (tag, recorder) in consumers {
        let calls = recorder.calls();
        let shutdown_calls: Vec<&String> = calls.iter().filter(|c| c.starts_with("shutdown")).collect();

        assert_eq!(shutdown_calls, vec![&format!("shutdown {tag} 200")]);
    }

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn failing_callbacks_are_reported_and_dispatch_continues() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let handled = Arc::new(Mutex::new(vec![]));

    let h = handled.clone();
    let consumer = DefaultConsumer::with_delivery(move |delivery, _| {
        let h = h.clone();

        Box::pin(async move {
            match &delivery.body[..] {
                b"bad" => anyhow::bail!("cannot process"),
                b"boom" => panic!("handler bug"),
                _ => {
                    h.lock().unwrap().push(delivery.delivery_tag);
                    Ok(())
                }
            }
        })
    });

    let exceptions = Arc::new(Mutex::new(vec![]));
    let e = exceptions.clone();

    ch.events().callback_exception.subscribe(move |ex| {
        e.lock().unwrap().push((ex.method, ex.consumer_tag.clone(), error_kind(&ex.error)));
        Ok(())
    });

    let tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue("q"), Arc::new(consumer), &token)
        .await?;

    deliver(&broker, &ch, &tag, 1, "bad");
    deliver(&broker, &ch, &tag, 2, "boom");
    deliver(&broker, &ch, &tag, 3, "good");

    helper::wait_until(|| handled.lock().unwrap().len() == 1).await;

    assert_eq!(*handled.lock().unwrap(), vec![3]);

    let exceptions = exceptions.lock().unwrap().clone();

    assert_eq!(
        exceptions,
        vec![
            ("handle_delivery", tag.clone(), Some(ErrorKind::CallbackException)),
            ("handle_delivery", tag.clone(), Some(ErrorKind::CallbackException))
        ]
    );
    assert!(ch.is_open());

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn slow_consumer_does_not_block_requests() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let release = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(vec![]));

    let (r, o) = (release.clone(), order.clone());
    let consumer = DefaultConsumer::with_delivery(move |delivery, _| {
        let (r, o) = (r.clone(), o.clone());

        Box::pin(async move {
            if delivery.delivery_tag == 1 {
                r.notified().await;
            }

            o.lock().unwrap().push(delivery.delivery_tag);

            Ok(())
        })
    });

    let tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue("q"), Arc::new(consumer), &token)
        .await?;

    deliver(&broker, &ch, &tag, 1, "first");
    deliver(&broker, &ch, &tag, 2, "second");

    // The first delivery is stuck in the handler, the channel still serves requests.
    tokio::time::timeout(
        Duration::from_secs(1),
        ch.queue_declare(frame::QueueDeclareArgs::default().name("other"), &token),
    )
    .await??;

    assert!(order.lock().unwrap().is_empty());

    release.notify_one();

    helper::wait_until(|| order.lock().unwrap().len() == 2).await;

    assert_eq!(*order.lock().unwrap(), vec![1, 2]);

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn handler_token_is_cancelled_on_close() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let stopped = Arc::new(AtomicUsize::new(0));

    let s = stopped.clone();
    let consumer = DefaultConsumer::with_delivery(move |_, token| {
        let s = s.clone();

        Box::pin(async move {
            token.cancelled().await;
            s.fetch_add(1, Ordering::SeqCst);

            Ok(())
        })
    });

    let consumer = Arc::new(consumer);
    let tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue("q"), consumer.clone(), &token)
        .await?;

    assert!(consumer.is_running());

    deliver(&broker, &ch, &tag, 1, "long job");
    broker.wait_for(frame::BASIC_CONSUME, 1).await;

    ch.close().await?;

    helper::wait_until(|| stopped.load(Ordering::SeqCst) == 1 && ch.is_shutdown()).await;

    assert!(!consumer.is_running());
    assert_eq!(consumer.shutdown_reason().unwrap().reply_code, 200);

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn no_delivery_after_channel_shutdown() -> Result<()> {
    let behaviour = Behaviour {
        silent: [frame::CHANNEL_CLOSE].into(),
        ..Default::default()
    };
    let (conn, broker) = helper::connect_with(helper::config(), behaviour).await?;
    let token = CancellationToken::new();
    let ch = conn.open_channel(&token).await?;
    let recorder = Arc::new(Recorder::default());

    let tag = ch
        .basic_consume(frame::BasicConsumeArgs::default().queue("q"), recorder.clone(), &token)
        .await?;

    // Forced close doesn't wait for close-ok, the channel number is kept until it arrives.
    ch.close_with(200, "Goodbye", Duration::from_secs(1), true, &token)
        .await?;

    helper::wait_until(|| ch.is_shutdown()).await;

    deliver(&broker, &ch, &tag, 1, "late");
    broker.send(frame::channel_close_ok(ch.number()));

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(conn.is_open());
    assert_eq!(
        recorder.calls(),
        vec![format!("consume-ok {tag}"), format!("shutdown {tag} 200")]
    );

    conn.close().await?;

    Ok(())
}

#[tokio::test]
async fn failing_consumer_does_not_disturb_others() -> Result<()> {
    let (conn, broker) = helper::connect().await?;
    let token = CancellationToken::new();
    let first = conn.open_channel(&token).await?;
    let second = conn.open_channel(&token).await?;

    let exceptions = Arc::new(Mutex::new(vec![]));

    for ch in [&first, &second] {
        let e = exceptions.clone();
        let number = ch.number();

        ch.events().callback_exception.subscribe(move |ex| {
            e.lock().unwrap().push((number, ex.consumer_tag.clone()));
            Ok(())
        });
    }

    let failing =
        DefaultConsumer::with_delivery(|_, _| Box::pin(async { Err::<(), _>(anyhow::anyhow!("always fails")) }));
    let neighbour = Arc::new(Recorder::default());
    let other = Arc::new(Recorder::default());

    let failing_tag = first
        .basic_consume(frame::BasicConsumeArgs::default().queue("q"), Arc::new(failing), &token)
        .await?;
    let neighbour_tag = first
        .basic_consume(frame::BasicConsumeArgs::default().queue("q"), neighbour.clone(), &token)
        .await?;
    let other_tag = second
        .basic_consume(frame::BasicConsumeArgs::default().queue("q"), other.clone(), &token)
        .await?;

    deliver(&broker, &first, &failing_tag, 1, "a");
    deliver(&broker, &first, &neighbour_tag, 2, "b");
    deliver(&broker, &second, &other_tag, 1, "c");
    deliver(&broker, &first, &failing_tag, 3, "d");
    deliver(&broker, &first, &neighbour_tag, 4, "e");

    helper::wait_until(|| {
        neighbour.calls().contains(&"deliver 4 e".to_string())
            && other.calls().contains(&"deliver 1 c".to_string())
            && exceptions.lock().unwrap().len() == 2
    })
    .await;

    let delivered: Vec<String> = neighbour
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("deliver"))
        .collect();

    assert_eq!(delivered, vec!["deliver 2 b", "deliver 4 e"]);
    assert_eq!(
        *exceptions.lock().unwrap(),
        vec![(first.number(), failing_tag.clone()), (first.number(), failing_tag)]
    );
    assert!(first.is_open());
    assert!(second.is_open());

    conn.close().await?;

    Ok(())
}
