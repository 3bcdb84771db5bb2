//! End-to-end flows through `TelemetryService` over the loopback transport

mod common;

use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

use common::{Harness, base_time, event, events_frame, positions_frame, update};
use fleet_core::{DeviceId, Origin};
use fleet_gateway::{
    ConnectOutcome, MergeOutcome, RepositoryConfig, TelemetryConfig, TransportError,
};
use fleet_ports::PersistenceGateway;

fn config(debounce: Duration) -> TelemetryConfig {
    let mut config = TelemetryConfig::new("loopback://fleet");
    config.repository = RepositoryConfig::default()
        .with_devices(vec![DeviceId::new(1)])
        .with_debounce_window(debounce)
        .with_polling(Duration::from_secs(20), Duration::from_secs(30));
    config
}

#[tokio::test(start_paused = true)]
async fn test_live_position_reaches_subscriber_and_store() {
    let h = Harness::new(config(Duration::ZERO));
    let mut snapshots = h.service.subscribe(DeviceId::new(1)).unwrap();
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server.send_text(&positions_frame(&[(1, 1, t)])).await;
    h.settle().await;

    let snapshot = snapshots.try_recv().unwrap();
    assert_eq!(snapshot.origin, Origin::Live);
    assert_eq!(snapshot.timestamp, t);
    assert_eq!(h.store.snapshot(DeviceId::new(1)).as_ref(), Some(&*snapshot));
    assert_eq!(h.service.repository().anchor(DeviceId::new(1)), Some(t));
}

#[tokio::test(start_paused = true)]
async fn test_debounce_publishes_latest_only() {
    let h = Harness::new(config(Duration::from_millis(250)));
    let mut snapshots = h.service.subscribe(DeviceId::new(1)).unwrap();
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    for (id, offset) in [(1, 1), (2, 2), (3, 3)] {
        server
            .send_text(&positions_frame(&[(id, 1, t + ChronoDuration::seconds(offset))]))
            .await;
    }
    h.settle().await;
    assert!(matches!(snapshots.try_recv(), Err(TryRecvError::Empty)));

    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = snapshots.try_recv().unwrap();
    assert_eq!(snapshot.timestamp, t + ChronoDuration::seconds(3));
    assert!(matches!(snapshots.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(h.service.repository_stats().publishes, 1);
    // Every fix is still stored
    assert_eq!(h.store.position_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fallback_polling_covers_the_outage() {
    let h = Harness::new(config(Duration::ZERO));
    h.transport
        .fail_always(Some(TransportError::Io("connection refused".to_string())));
    let t = base_time();
    h.fetcher.set_position(update(7, 1, t + ChronoDuration::seconds(1)));

    h.service.start().await;
    tokio::time::sleep(Duration::from_secs(19)).await;
    assert_eq!(h.fetcher.position_calls(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.fetcher.position_calls(), 1);
    assert!(h.service.repository().is_polling());

    let polled = h.service.snapshot(DeviceId::new(1)).unwrap();
    assert_eq!(polled.origin, Origin::FallbackPoll);
    // Polled data never moves the replay anchor
    assert_eq!(h.service.repository().anchor(DeviceId::new(1)), None);
}

#[tokio::test(start_paused = true)]
async fn test_polling_stops_once_socket_is_confirmed() {
    let h = Harness::new(config(Duration::ZERO));
    h.transport
        .fail_always(Some(TransportError::Io("connection refused".to_string())));
    h.fetcher.set_position(update(7, 1, base_time()));

    h.service.start().await;
    tokio::time::sleep(Duration::from_secs(55)).await;
    assert_eq!(h.fetcher.position_calls(), 2);

    h.transport.fail_always(None);
    let server = h.confirm_session().await;
    h.settle().await;
    assert!(!h.service.repository().is_polling());
    let calls = h.fetcher.position_calls();

    // Keep the session alive well past several poll intervals
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(server.send_text("{}").await);
    }
    assert_eq!(h.fetcher.position_calls(), calls);
    assert!(!h.service.repository().is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_hung_poll_request_times_out() {
    let mut config = config(Duration::ZERO);
    config.repository = config
        .repository
        .with_devices(vec![DeviceId::new(1), DeviceId::new(2)])
        .with_poll_timeout(Duration::from_secs(10));
    let h = Harness::new(config);
    h.transport
        .fail_always(Some(TransportError::Io("connection refused".to_string())));
    h.fetcher.set_delay(Duration::from_secs(300));

    h.service.start().await;
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(h.fetcher.position_calls(), 1);

    // First device gave up at 30s, second is asked right after
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.fetcher.position_calls(), 2);
    assert!(h.service.repository().is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_startup_backfill_uses_persisted_anchor() {
    let h = Harness::new(config(Duration::ZERO));
    let t = base_time();
    h.store
        .set_replay_anchor(DeviceId::new(1), t - ChronoDuration::minutes(10))
        .await
        .unwrap();
    h.fetcher.add_event(event(40, 1, t - ChronoDuration::minutes(2)));

    let mut completed = h.service.on_backfill_completed();
    h.service.start().await;
    let _server = h.confirm_session().await;

    let done = completed.recv().await.unwrap();
    h.settle().await;

    assert_eq!(done.recovered_count, 1);
    assert_eq!(
        h.fetcher.requested_windows(),
        vec![(DeviceId::new(1), t - ChronoDuration::minutes(15), t)]
    );
    assert_eq!(
        h.service.repository().anchor(DeviceId::new(1)),
        Some(t - ChronoDuration::minutes(2))
    );
    assert_eq!(h.store.event_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_published_timestamps_never_decrease() {
    let h = Harness::new(config(Duration::ZERO));
    let mut snapshots = h.service.subscribe(DeviceId::new(1)).unwrap();
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    let offsets = [100, 50, 150, 120, 200, 200, 10];
    for (id, offset) in offsets.iter().enumerate() {
        server
            .send_text(&positions_frame(&[(
                id as u64 + 1,
                1,
                t + ChronoDuration::seconds(*offset),
            )]))
            .await;
    }
    let repository = h.service.repository();
    repository.merge_position(update(90, 1, t + ChronoDuration::seconds(30)), Origin::Backfill);
    h.settle().await;

    let mut published = Vec::new();
    while let Ok(snapshot) = snapshots.try_recv() {
        published.push(snapshot.timestamp);
    }

    assert!(published.windows(2).all(|pair| pair[0] <= pair[1]));
    assert_eq!(published.last().copied(), Some(t + ChronoDuration::seconds(200)));
    assert_eq!(h.store.position_count(), offsets.len() + 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_are_dropped() {
    let h = Harness::new(config(Duration::ZERO));
    h.service.start().await;
    let server = h.confirm_session().await;

    server.send_text("not json").await;
    server.send_text(r#"{"positions": []}"#).await;
    server.send_text(r#"{"type": "devices", "devices": []}"#).await;
    server
        .send_text(&positions_frame(&[(1, 1, base_time())]))
        .await;
    h.settle().await;

    let stats = h.service.repository_stats();
    assert_eq!(stats.frames_dropped, 3);
    assert_eq!(stats.positions_merged, 1);
    assert!(h.service.snapshot(DeviceId::new(1)).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_flushes_and_releases() {
    let h = Harness::new(config(Duration::ZERO));
    let mut snapshots = h.service.subscribe(DeviceId::new(1)).unwrap();
    h.service.start().await;
    let server = h.confirm_session().await;

    server
        .send_text(&positions_frame(&[(1, 1, base_time())]))
        .await;
    h.settle().await;

    h.service.shutdown().await;

    assert_eq!(h.store.position_count(), 1);
    assert!(h.service.subscribe(DeviceId::new(2)).is_none());
    assert!(snapshots.try_recv().is_ok());
    assert_eq!(snapshots.try_recv(), Err(TryRecvError::Closed));
    assert_eq!(
        h.service
            .repository()
            .merge_position(update(2, 1, base_time()), Origin::Live),
        MergeOutcome::Disposed
    );
    assert!(h.service.connection().is_disposed());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backfill_discards_results() {
    let h = Harness::new(config(Duration::ZERO));
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server.send_text(&events_frame(&[(10, 1, t)])).await;
    h.settle().await;

    h.fetcher.add_event(
        event(11, 1, t + ChronoDuration::minutes(1))
            .with_position(update(12, 1, t + ChronoDuration::minutes(1))),
    );
    h.fetcher.set_delay(Duration::from_secs(20));
    let mut completed = h.service.on_backfill_completed();
    let mut snapshots = h.service.subscribe(DeviceId::new(1)).unwrap();

    h.service.pause();
    tokio::time::sleep(Duration::from_secs(120)).await;
    h.clock.advance(ChronoDuration::seconds(120));
    assert_eq!(h.service.resume(), ConnectOutcome::Started);
    let _server = h.confirm_session().await;
    h.settle().await;
    assert!(h.service.repository().is_backfilling());

    h.service.shutdown().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(completed.try_recv().is_err());
    assert!(snapshots.try_recv().is_err());
    assert!(h.service.snapshot(DeviceId::new(1)).is_none());
    assert_eq!(h.store.position_count(), 0);
    assert_eq!(h.service.repository().anchor(DeviceId::new(1)), Some(t));
    assert_eq!(h.store.anchor(DeviceId::new(1)), Some(t));
    assert_eq!(h.store.event_count(), 1);
    assert_eq!(h.service.repository_stats().backfills, 0);
}
