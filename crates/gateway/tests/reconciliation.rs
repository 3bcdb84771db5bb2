//! Merge ordering, deduplication and reconnect backfill through the full service

mod common;

use chrono::Duration as ChronoDuration;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;

use common::{
    Harness, base_time, connection_config, event, events_frame, positions_frame, update,
};
use fleet_core::{DeviceId, Origin, Position, TelemetryEvent};
use fleet_ports::FetchError;
use fleet_gateway::{
    BackfillCompleted, ConnectOutcome, ConnectionState, DeviceBackfillOutcome, LoopbackServer, MergeOutcome,
    RepositoryConfig, TelemetryConfig,
};

fn config(devices: &[u64]) -> TelemetryConfig {
    let mut config = TelemetryConfig::new("loopback://fleet");
    config.repository = RepositoryConfig::default()
        .with_devices(devices.iter().copied().map(DeviceId::new).collect())
        .with_debounce_window(Duration::ZERO)
        .with_backfill_threshold(Duration::from_secs(30));
    config
}

/// Take the socket down for `length` (both clocks), bring it back and wait
/// for the reconnect backfill to finish
async fn outage(h: &Harness, length: Duration) -> (BackfillCompleted, LoopbackServer) {
    let mut completed = h.service.on_backfill_completed();

    h.service.pause();
    tokio::time::sleep(length).await;
    h.clock.advance(ChronoDuration::from_std(length).unwrap());

    assert_eq!(h.service.resume(), ConnectOutcome::Started);
    let server = h.confirm_session().await;
    let done = completed.recv().await.unwrap();
    h.settle().await;
    (done, server)
}

#[tokio::test(start_paused = true)]
async fn test_stale_position_is_stored_but_not_published() {
    let h = Harness::new(config(&[1]));
    let mut snapshots = h.service.subscribe(DeviceId::new(1)).unwrap();
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server
        .send_text(&positions_frame(&[(1, 1, t + ChronoDuration::seconds(100))]))
        .await;
    server
        .send_text(&positions_frame(&[(2, 1, t + ChronoDuration::seconds(50))]))
        .await;
    h.settle().await;

    let published = snapshots.try_recv().unwrap();
    assert_eq!(published.timestamp, t + ChronoDuration::seconds(100));
    assert!(matches!(snapshots.try_recv(), Err(TryRecvError::Empty)));

    let live = h.service.snapshot(DeviceId::new(1)).unwrap();
    assert_eq!(live.timestamp, t + ChronoDuration::seconds(100));
    assert_eq!(h.store.position_count(), 2);
    assert_eq!(h.service.repository_stats().stale_positions, 1);
}

#[tokio::test(start_paused = true)]
async fn test_ten_minute_outage_is_backfilled() {
    let h = Harness::new(config(&[1]));
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server.send_text(&events_frame(&[(10, 1, t)])).await;
    h.settle().await;
    assert_eq!(h.service.repository().anchor(DeviceId::new(1)), Some(t));

    // One event already seen live, two missed during the outage
    h.fetcher.add_event(event(10, 1, t));
    h.fetcher.add_event(event(11, 1, t + ChronoDuration::minutes(3)));
    h.fetcher.add_event(event(12, 1, t + ChronoDuration::minutes(7)));

    let (done, _server) = outage(&h, Duration::from_secs(600)).await;

    assert_eq!(done.recovered_count, 2);
    assert_eq!(done.summary.inserted_count, 2);
    assert_eq!(done.summary.deduped_count, 1);
    assert!(done.summary.is_complete());

    let windows = h.fetcher.requested_windows();
    assert_eq!(
        windows.last().copied(),
        Some((
            DeviceId::new(1),
            t - ChronoDuration::minutes(5),
            t + ChronoDuration::minutes(10)
        ))
    );

    assert_eq!(
        h.service.repository().anchor(DeviceId::new(1)),
        Some(t + ChronoDuration::minutes(7))
    );
    assert_eq!(h.store.anchor(DeviceId::new(1)), Some(t + ChronoDuration::minutes(7)));
    assert_eq!(h.store.events_for(DeviceId::new(1)).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_short_outage_skips_backfill() {
    let h = Harness::new(config(&[1]));
    h.service.start().await;
    let server = h.confirm_session().await;
    server.send_text(&events_frame(&[(10, 1, base_time())])).await;
    h.settle().await;

    h.service.pause();
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.service.resume();
    let _server = h.confirm_session().await;
    h.settle().await;

    assert_eq!(h.service.repository_stats().backfills, 0);
    assert!(h.fetcher.requested_windows().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_same_position_through_every_path_is_stored_once() {
    let h = Harness::new(config(&[1]));
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server.send_text(&positions_frame(&[(5, 1, t)])).await;
    h.settle().await;

    let repository = h.service.repository();
    assert_eq!(
        repository.merge_position(update(5, 1, t), Origin::FallbackPoll),
        MergeOutcome::Duplicate
    );

    // Backfilled event carrying the very same position fix
    h.fetcher.add_event(
        TelemetryEvent::new(20, 1, "geofenceExit", t + ChronoDuration::seconds(1))
            .with_position(update(5, 1, t)),
    );
    let (done, _server) = outage(&h, Duration::from_secs(120)).await;

    assert_eq!(done.summary.inserted_count, 1);
    assert_eq!(h.store.position_count(), 1);
    assert_eq!(h.store.event_count(), 1);
    assert_eq!(h.service.repository_stats().duplicates, 2);

    let live = h.service.snapshot(DeviceId::new(1)).unwrap();
    assert_eq!(live.origin, Origin::Live);
}

#[tokio::test(start_paused = true)]
async fn test_replayed_backfill_inserts_nothing() {
    let h = Harness::new(config(&[1]));
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server.send_text(&events_frame(&[(10, 1, t)])).await;
    h.settle().await;

    h.fetcher.add_event(event(11, 1, t + ChronoDuration::minutes(3)));
    h.fetcher.add_event(event(12, 1, t + ChronoDuration::minutes(7)));

    let (first, _first_server) = outage(&h, Duration::from_secs(600)).await;
    assert_eq!(first.summary.inserted_count, 2);

    let (second, _server) = outage(&h, Duration::from_secs(600)).await;
    assert_eq!(second.summary.inserted_count, 0);
    assert_eq!(second.summary.deduped_count, second.summary.fetched_count());
    assert_eq!(second.summary.fetched_count(), 2);
    assert_eq!(h.store.events_for(DeviceId::new(1)).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_anchor_never_moves_backwards() {
    let h = Harness::new(config(&[1]));
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server
        .send_text(&events_frame(&[(1, 1, t + ChronoDuration::minutes(7))]))
        .await;
    server
        .send_text(&positions_frame(&[(2, 1, t + ChronoDuration::minutes(1))]))
        .await;
    server
        .send_text(&events_frame(&[(3, 1, t + ChronoDuration::minutes(2))]))
        .await;
    h.settle().await;

    let expected = Some(t + ChronoDuration::minutes(7));
    assert_eq!(h.service.repository().anchor(DeviceId::new(1)), expected);
    assert_eq!(h.store.anchor(DeviceId::new(1)), expected);
}

#[tokio::test(start_paused = true)]
async fn test_generic_endpoint_unsupported_falls_back_per_device() {
    let h = Harness::new(config(&[1]));
    h.fetcher.set_generic_supported(false);
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server.send_text(&events_frame(&[(10, 1, t)])).await;
    h.settle().await;

    h.fetcher.add_event(event(11, 1, t + ChronoDuration::minutes(2)));
    let (done, _server) = outage(&h, Duration::from_secs(300)).await;

    assert_eq!(h.fetcher.generic_calls(), 1);
    assert_eq!(h.fetcher.device_calls(), 1);
    assert_eq!(done.summary.inserted_count, 1);
    assert!(done.summary.failed_devices.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_device_does_not_block_the_others() {
    let h = Harness::new(config(&[1, 2]));
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server
        .send_text(&events_frame(&[(10, 1, t), (20, 2, t)]))
        .await;
    h.settle().await;

    h.fetcher.add_event(event(11, 1, t + ChronoDuration::minutes(4)));
    h.fetcher.add_event(event(21, 2, t + ChronoDuration::minutes(4)));
    h.fetcher.fail_device(
        DeviceId::new(2),
        FetchError::Network("connection reset".to_string()),
    );

    let (done, _server) = outage(&h, Duration::from_secs(600)).await;

    assert_eq!(done.summary.inserted_count, 1);
    assert_eq!(done.summary.failed_devices, vec![DeviceId::new(2)]);
    assert!(matches!(
        done.summary.outcomes.get(&DeviceId::new(2)),
        Some(DeviceBackfillOutcome::Failed { .. })
    ));
    // The failed device keeps its old anchor for the next pass
    assert_eq!(h.service.repository().anchor(DeviceId::new(2)), Some(t));
    assert_eq!(
        h.service.repository().anchor(DeviceId::new(1)),
        Some(t + ChronoDuration::minutes(4))
    );
}

#[tokio::test(start_paused = true)]
async fn test_event_position_advances_snapshot() {
    let h = Harness::new(config(&[1]));
    h.service.start().await;
    let server = h.confirm_session().await;
    let mut events = h.service.subscribe_events();

    let t = base_time();
    let frame = serde_json::json!({
        "type": "events",
        "events": [{
            "id": 30,
            "deviceId": 1,
            "type": "ignitionOn",
            "eventTime": t.to_rfc3339(),
            "position": {
                "id": 31,
                "deviceId": 1,
                "latitude": 41.15,
                "longitude": -8.61,
                "fixTime": t.to_rfc3339()
            }
        }]
    });
    server.send_text(&frame.to_string()).await;
    h.settle().await;

    let received = events.try_recv().unwrap();
    assert_eq!(received.kind, "ignitionOn");

    let live = h.service.snapshot(DeviceId::new(1)).unwrap();
    assert_eq!(live.position, Position::new(41.15, -8.61));
    assert_eq!(h.store.position_count(), 1);
}

/// Connection events overrun while reconnecting; the repository still sees
/// the socket come back, stops polling and backfills
#[tokio::test(start_paused = true)]
async fn test_lagged_event_stream_recovers_connection_state() {
    let h = Harness::with_connection(config(&[1]), connection_config().with_event_capacity(4));
    h.service.start().await;
    let server = h.confirm_session().await;

    let t = base_time();
    server.send_text(&events_frame(&[(10, 1, t)])).await;
    h.settle().await;

    h.service.pause();
    tokio::time::sleep(Duration::from_secs(120)).await;
    h.clock.advance(ChronoDuration::seconds(120));
    assert!(h.service.repository().is_polling());

    let mut completed = h.service.on_backfill_completed();
    assert_eq!(h.service.resume(), ConnectOutcome::Started);
    let server = h.transport.accept().await.unwrap();

    // Confirmation plus a burst larger than the event channel
    assert!(server.send_text("{}").await);
    for i in 0..10u64 {
        let frame = positions_frame(&[(100 + i, 1, t + ChronoDuration::seconds(i as i64))]);
        assert!(server.send_text(&frame).await);
    }
    h.wait_for_state(ConnectionState::Connected).await;

    let done = completed.recv().await.unwrap();
    h.settle().await;

    let repository = h.service.repository();
    assert!(repository.stats().frames_dropped > 0);
    assert_eq!(repository.connection_state(), ConnectionState::Connected);
    assert!(!repository.is_polling());
    assert_eq!(repository.stats().backfills, 1);
    assert!(done.summary.is_complete());
}
