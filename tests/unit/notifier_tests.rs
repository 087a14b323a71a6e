use std::time::Duration;

use activation_orchestrator::notifier::{ReadinessEvent, ReadinessNotifier};

fn ready() -> ReadinessEvent {
    ReadinessEvent::Ready {
        endpoint: "http://127.0.0.1:5005".into(),
    }
}

#[tokio::test]
async fn late_subscriber_sees_cached_event() {
    let notifier = ReadinessNotifier::new();
    notifier.publish("s1", ready());

    let event = tokio::time::timeout(Duration::from_millis(100), notifier.subscribe("s1").wait())
        .await
        .expect("resolves immediately");
    assert_eq!(event, Some(ready()));
    assert_eq!(notifier.current("s1"), Some(ready()));
}

#[tokio::test]
async fn every_waiting_subscriber_gets_the_event() {
    let notifier = ReadinessNotifier::new();
    let waiters: Vec<_> = (0..4)
        .map(|_| tokio::spawn(notifier.subscribe("s1").wait()))
        .collect();

    tokio::task::yield_now().await;
    notifier.publish(
        "s1",
        ReadinessEvent::Failed {
            reason: "launch failed".into(),
        },
    );

    for waiter in waiters {
        let event = waiter.await.expect("join");
        assert!(matches!(event, Some(ReadinessEvent::Failed { .. })));
    }
}

#[tokio::test]
async fn sessions_are_independent() {
    let notifier = ReadinessNotifier::new();
    notifier.publish("s1", ready());

    assert!(notifier.current("s2").is_none());
    let pending = tokio::time::timeout(Duration::from_millis(50), notifier.subscribe("s2").wait()).await;
    assert!(pending.is_err(), "s2 has no event yet");
}

#[tokio::test]
async fn reset_starts_a_new_attempt() {
    let notifier = ReadinessNotifier::new();
    notifier.publish(
        "s1",
        ReadinessEvent::Failed {
            reason: "timeout".into(),
        },
    );

    notifier.reset("s1");
    assert!(notifier.current("s1").is_none());

    let waiter = tokio::spawn(notifier.subscribe("s1").wait());
    tokio::task::yield_now().await;
    assert!(notifier.publish("s1", ready()), "new attempt accepts an event");
    assert_eq!(waiter.await.expect("join"), Some(ready()));
}

#[tokio::test]
async fn remove_releases_waiters() {
    let notifier = ReadinessNotifier::new();
    let waiter = tokio::spawn(notifier.subscribe("s1").wait());
    tokio::task::yield_now().await;

    notifier.remove("s1");
    let event = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter released")
        .expect("join");
    assert_eq!(event, None);
}

#[test]
fn events_serialize_with_tag() {
    let json = serde_json::to_value(ready()).expect("serialize");
    assert_eq!(json["event"], "ready");
    assert_eq!(json["endpoint"], "http://127.0.0.1:5005");

    let json = serde_json::to_value(ReadinessEvent::Failed {
        reason: "boom".into(),
    })
    .expect("serialize");
    assert_eq!(json["event"], "failed");
}
