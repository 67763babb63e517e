//! Resilience tests for the occupancy sync client
//!
//! These tests verify behavior under failure conditions like:
//! - Transport errors and reconnects while consumers are mounted
//! - Subscriptions rejected or ended by the server
//! - Racing activations and deactivations
//! - Cancelled activations
//! - Connection failures on open

mod common;

use common::*;
use occupi_rtc::{ChannelState, CounterStatus, CounterUpdate, SyncError, TransportEvent};
use std::sync::Arc;
use std::time::Duration;

/// Transport errors surface as a stale status and keep the last value
#[tokio::test]
async fn test_transport_error_marks_stale() {
    let h = Harness::new(FakeCountSource::returning(20));
    let mut consumer = h.manager.mount();
    consumer.activate().await.unwrap();
    h.transport.emit(TransportEvent::Connected);
    h.transport.publish_count(21);
    settle().await;
    drain(&mut consumer);

    h.transport.emit(TransportEvent::Error {
        message: "socket reset".to_string(),
    });
    settle().await;

    assert_eq!(
        consumer.status(),
        CounterStatus::Stale {
            reason: "socket reset".to_string()
        }
    );
    assert_eq!(consumer.value(), 21);
    assert!(consumer.is_active());
    // The manager does not tear anything down on its own
    assert_eq!(h.transport.closes(), 0);
    assert_eq!(h.transport.opens(), 1);

    // The transport recovers by itself and publications resume
    h.transport.emit(TransportEvent::Connecting);
    h.transport.emit(TransportEvent::Connected);
    h.transport.publish_count(22);
    settle().await;

    let updates = drain(&mut consumer);
    assert!(updates.contains(&CounterUpdate::Status(CounterStatus::Live)));
    assert_eq!(values(&updates), vec![22]);
    assert_eq!(consumer.status(), CounterStatus::Live);
    assert_eq!(h.transport.subscribes(), 1);
}

/// A dropped socket reports its reason
#[tokio::test]
async fn test_disconnect_event_reason() {
    let h = Harness::new(FakeCountSource::returning(1));
    let consumer = h.manager.mount();
    consumer.activate().await.unwrap();

    h.transport.emit(TransportEvent::Disconnected {
        reason: "connection closed".to_string(),
    });
    settle().await;

    assert_eq!(h.manager.channel().state(), ChannelState::Errored);
    assert_eq!(
        consumer.status(),
        CounterStatus::Stale {
            reason: "connection closed".to_string()
        }
    );
}

/// A retry after a failure keeps consumers stale until it connects
#[tokio::test]
async fn test_reconnect_after_error_stays_stale() {
    let h = Harness::new(FakeCountSource::returning(5));
    let mut consumer = h.manager.mount();
    consumer.activate().await.unwrap();
    h.transport.emit(TransportEvent::Connected);
    settle().await;
    drain(&mut consumer);

    h.transport.emit(TransportEvent::Error {
        message: "socket reset".to_string(),
    });
    settle().await;
    h.transport.emit(TransportEvent::Connecting);
    settle().await;

    let stale = CounterStatus::Stale {
        reason: "reconnecting: socket reset".to_string(),
    };
    assert_eq!(consumer.status(), stale);
    assert!(!drain(&mut consumer).contains(&CounterUpdate::Status(CounterStatus::Connecting)));

    h.transport.emit(TransportEvent::Connected);
    settle().await;
    assert_eq!(consumer.status(), CounterStatus::Live);
}

/// A rejected or server-ended subscription is surfaced as stale
#[tokio::test]
async fn test_lost_subscription_marks_stale() {
    let h = Harness::new(FakeCountSource::returning(12));
    let mut consumer = h.manager.mount();
    consumer.activate().await.unwrap();
    h.transport.emit(TransportEvent::Connected);
    settle().await;
    drain(&mut consumer);

    h.transport.emit(TransportEvent::SubscribeFailed {
        topic: TOPIC.to_string(),
        message: "permission denied".to_string(),
    });
    settle().await;

    match consumer.status() {
        CounterStatus::Stale { reason } => assert!(reason.contains("permission denied"), "{}", reason),
        other => panic!("expected stale status, got {:?}", other),
    }
    assert_eq!(consumer.value(), 12);
    assert!(consumer.is_active());

    // The transport replays the topic once it reconnects
    h.transport.emit(TransportEvent::Connected);
    settle().await;
    assert_eq!(consumer.status(), CounterStatus::Live);

    h.transport.emit(TransportEvent::Unsubscribed {
        topic: TOPIC.to_string(),
        reason: "unsubscribed by server".to_string(),
    });
    settle().await;

    match consumer.status() {
        CounterStatus::Stale { reason } => assert!(reason.contains("unsubscribed by server"), "{}", reason),
        other => panic!("expected stale status, got {:?}", other),
    }
    assert!(drain(&mut consumer)
        .iter()
        .any(|u| matches!(u, CounterUpdate::Status(CounterStatus::Stale { .. }))));
    // Nothing is torn down locally
    assert!(h.manager.is_subscribed());
    assert_eq!(h.transport.unsubscribes(), 0);
    assert_eq!(h.transport.closes(), 0);
}

/// Many consumers activating at once share one mint, connection and subscription
#[tokio::test]
async fn test_concurrent_activations() {
    let h = Harness::new(FakeCountSource::returning(4));
    let consumers: Vec<_> = (0..8).map(|_| h.manager.mount()).collect();

    let results = futures::future::join_all(consumers.iter().map(|c| c.activate())).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(h.minter.calls(), 1);
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.transport.subscribes(), 1);
    assert_eq!(h.manager.ref_count(), 8);
    assert!(consumers.iter().all(|c| c.value() == 4));
}

/// Racing activate calls on one consumer count it once
#[tokio::test]
async fn test_concurrent_activate_same_consumer() {
    let h = Harness::new(FakeCountSource::returning(4));
    let consumer = h.manager.mount();

    let (a, b) = tokio::join!(consumer.activate(), consumer.activate());

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.manager.ref_count(), 1);
    assert_eq!(h.counts.calls(), 1);

    consumer.deactivate();
    assert_eq!(h.transport.closes(), 1);
}

/// Consumers activated on other tasks
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_activations_across_threads() {
    let h = Arc::new(Harness::new(FakeCountSource::returning(9)));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let h = h.clone();
            tokio::spawn(async move {
                let consumer = h.manager.mount();
                consumer.activate().await.unwrap();
                consumer
            })
        })
        .collect();

    let mut consumers = Vec::new();
    for handle in handles {
        consumers.push(handle.await.unwrap());
    }

    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.transport.subscribes(), 1);
    assert_eq!(h.manager.ref_count(), 16);

    drop(consumers);
    assert_eq!(h.manager.ref_count(), 0);
    assert_eq!(h.transport.closes(), 1);
    assert_eq!(h.transport.unsubscribes(), 1);
}

/// The last holder leaving while another activation is mid-flight keeps the connection
#[tokio::test]
async fn test_last_deactivation_during_other_activation() {
    let h = Harness::new(FakeCountSource::returning(2));
    let first = h.manager.mount();
    first.activate().await.unwrap();

    h.counts.hold();
    let second = h.manager.mount();

    let (result, _) = tokio::join!(second.activate(), async {
        wait_until(|| h.counts.calls() == 2).await;
        first.deactivate();
        h.counts.release();
    });

    result.unwrap();
    assert!(second.is_active());
    assert_eq!(h.manager.ref_count(), 1);
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.transport.closes(), 0);
    assert!(h.manager.is_subscribed());
}

/// Dropping a consumer is the same as deactivating it
#[tokio::test]
async fn test_drop_deactivates() {
    let h = Harness::new(FakeCountSource::returning(1));
    {
        let consumer = h.manager.mount();
        consumer.activate().await.unwrap();
        assert_eq!(h.manager.ref_count(), 1);
    }

    assert_eq!(h.manager.ref_count(), 0);
    assert_eq!(h.transport.unsubscribes(), 1);
    assert_eq!(h.transport.closes(), 1);
}

/// Mounting without activating never touches the network
#[tokio::test]
async fn test_mount_without_activate() {
    let h = Harness::new(FakeCountSource::returning(1));
    let consumer = h.manager.mount();
    drop(consumer);

    assert_eq!(h.minter.calls(), 0);
    assert_eq!(h.transport.opens(), 0);
    assert_eq!(h.transport.closes(), 0);
}

/// A failed open surfaces the error and leaves nothing behind
#[tokio::test]
async fn test_open_failure() {
    let h = Harness::new(FakeCountSource::returning(1));
    h.transport.fail_next_open();
    let consumer = h.manager.mount();

    let result = consumer.activate().await;

    assert!(matches!(result, Err(SyncError::Connection(_))));
    assert_eq!(h.manager.ref_count(), 0);
    assert!(!consumer.is_active());
    assert!(h.manager.channel().connection_id().is_none());
    assert_eq!(h.counts.calls(), 0);

    // Not detached: the caller may try again
    consumer.activate().await.unwrap();
    assert_eq!(h.transport.opens(), 2);
    assert!(consumer.is_active());
}

/// An activation abandoned mid-connect releases its reference
#[tokio::test(start_paused = true)]
async fn test_cancelled_activation_releases_reference() {
    let h = Harness::new(FakeCountSource::returning(3));
    h.transport.hold_opens();
    let consumer = h.manager.mount();

    let timed_out = tokio::time::timeout(Duration::from_millis(50), consumer.activate()).await;
    assert!(timed_out.is_err());
    assert_eq!(h.manager.ref_count(), 0);
    assert!(h.manager.channel().connection_id().is_none());

    h.transport.release_opens();
    consumer.activate().await.unwrap();

    assert!(consumer.is_active());
    assert_eq!(h.transport.opens(), 2);
    assert_eq!(h.transport.subscribes(), 1);
}

/// Rapid mount/activate/deactivate cycles leave the manager clean
#[tokio::test]
async fn test_rapid_cycles() {
    let h = Harness::new(FakeCountSource::returning(1));

    for _ in 0..50 {
        let consumer = h.manager.mount();
        consumer.activate().await.unwrap();
        consumer.deactivate();
    }

    assert_eq!(h.manager.ref_count(), 0);
    assert_eq!(h.transport.opens(), 50);
    assert_eq!(h.transport.closes(), 50);
    assert_eq!(h.minter.calls(), 1);
}
