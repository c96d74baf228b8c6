mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{message, segment_url, FakeRpc};
use proctor_stream::config::{CoordinatorConfig, TERMINATE_CONFIRMATION};
use proctor_stream::engine::alerts::ReloadAction;
use proctor_stream::engine::coordinator::Coordinator;
use proctor_stream::engine::events::CoordinatorEvent;
use proctor_stream::engine::liveness::ManualClock;
use proctor_stream::engine::playlist::Direction;
use proctor_stream::engine::session::SessionStatus;
use proctor_stream::engine::view::LiveBadge;
use proctor_stream::error::ProctorError;
use proctor_stream::source::traits::{MessageCategory, MessageOrigin};

const T0: i64 = 1_700_000_000;

#[derive(Default)]
struct CountingReload {
    count: AtomicUsize,
}

impl ReloadAction for CountingReload {
    fn reload(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

fn coordinator(rpc: Arc<FakeRpc>, now_secs: i64) -> (Arc<Coordinator>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(now_secs * 1000));
    let coordinator = Coordinator::builder(CoordinatorConfig::default(), rpc)
        .clock(clock.clone())
        .fetch_retry_backoff(Duration::from_millis(1))
        .build();
    (coordinator, clock)
}

#[tokio::test]
async fn test_one_session_failing_does_not_block_another() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.fail_list("sub-a");
    rpc.set_segments("sub-b", &[T0, T0 + 10, T0 + 20]);
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 25);

    coordinator.watch("sub-a", SessionStatus::Started);
    coordinator.watch("sub-b", SessionStatus::Started);
    let report = coordinator.tick().await;

    let a = report.outcome("sub-a").unwrap();
    assert!(!a.playlist_ok);
    assert!(a.disconnected);
    let b = report.outcome("sub-b").unwrap();
    assert!(b.playlist_ok);
    assert!(!b.disconnected);

    let view_a = coordinator.view("sub-a").unwrap();
    assert!(view_a.stale);
    assert!(view_a.last_error.as_deref().unwrap().contains("connection refused"));
    assert_eq!(view_a.status, SessionStatus::Offline);

    let view_b = coordinator.view("sub-b").unwrap();
    assert_eq!(view_b.badge, LiveBadge::Live);
    assert_eq!(view_b.status, SessionStatus::Started);
    assert!(!view_b.offline_overlay);
    assert_eq!(view_b.segment_count, 3);
    assert_eq!(view_b.cursor, 2);

    let stats = coordinator.stats();
    assert_eq!(stats.refresh_ok, 1);
    assert_eq!(stats.refresh_failed, 1);
}

#[tokio::test]
async fn test_liveness_follows_the_clock() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0, T0 + 10, T0 + 20]);
    let (coordinator, clock) = coordinator(rpc.clone(), T0 + 45);
    coordinator.watch("sub-1", SessionStatus::Started);

    assert_eq!(coordinator.view("sub-1").unwrap().badge, LiveBadge::Loading);

    coordinator.tick().await;
    assert_eq!(coordinator.view("sub-1").unwrap().badge, LiveBadge::Live);

    clock.set_millis((T0 + 51) * 1000);
    coordinator.tick().await;
    let view = coordinator.view("sub-1").unwrap();
    assert_eq!(view.badge, LiveBadge::Offline);
    assert!(view.offline_overlay);
    assert_eq!(view.status, SessionStatus::Offline);

    // A fresh upload brings the session back.
    rpc.set_segments("sub-1", &[T0, T0 + 10, T0 + 20, T0 + 50]);
    coordinator.tick().await;
    let view = coordinator.view("sub-1").unwrap();
    assert_eq!(view.status, SessionStatus::Started);
    assert!(!view.offline_overlay);
}

#[tokio::test(start_paused = true)]
async fn test_critical_message_reloads_once_after_delay() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0]);
    rpc.set_messages(
        "sub-1",
        vec![
            message("sub-1", "2024-05-01 10:00:00", MessageCategory::Critical),
            message("sub-1", "2024-05-01 10:00:00.5", MessageCategory::Critical),
        ],
    );
    let reload = Arc::new(CountingReload::default());
    let coordinator = Coordinator::builder(CoordinatorConfig::default(), rpc.clone())
        .clock(Arc::new(ManualClock::new((T0 + 5) * 1000)))
        .reload_action(reload.clone())
        .build();
    let mut events = coordinator.subscribe();
    coordinator.watch("sub-1", SessionStatus::Started);

    let report = coordinator.tick().await;
    assert_eq!(report.outcome("sub-1").unwrap().new_messages, 2);
    assert!(coordinator.stats().reload_pending);

    // Another critical message while the timer is armed does not schedule a second reload.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    rpc.set_messages(
        "sub-1",
        vec![
            message("sub-1", "2024-05-01 10:00:00", MessageCategory::Critical),
            message("sub-1", "2024-05-01 10:00:00.5", MessageCategory::Critical),
            message("sub-1", "2024-05-01 10:00:01", MessageCategory::Critical),
        ],
    );
    coordinator.tick().await;

    tokio::time::sleep(Duration::from_millis(3999)).await;
    assert_eq!(reload.count.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(reload.count.load(Ordering::SeqCst), 1);
    assert!(!coordinator.stats().reload_pending);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(reload.count.load(Ordering::SeqCst), 1);

    let mut alerts = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, CoordinatorEvent::CriticalAlert { .. }) {
            alerts += 1;
        }
    }
    assert_eq!(alerts, 3);
}

#[tokio::test]
async fn test_busy_session_is_skipped_by_next_tick() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0]);
    rpc.set_segments("sub-2", &[T0]);
    rpc.delay_list("sub-1", Duration::from_millis(300));
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 5);
    coordinator.watch("sub-1", SessionStatus::Started);
    coordinator.watch("sub-2", SessionStatus::Started);

    let slow = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.tick().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = coordinator.tick().await;
    assert_eq!(second.skipped, vec!["sub-1".to_string()]);
    assert!(second.outcome("sub-2").is_some());
    assert!(second.outcome("sub-1").is_none());

    let first = slow.await.unwrap();
    assert!(first.outcome("sub-1").unwrap().playlist_ok);
    assert_eq!(coordinator.stats().skipped_in_flight, 1);

    // Once the slow tick finished the session is eligible again.
    let third = coordinator.tick().await;
    assert!(third.skipped.is_empty());
}

#[tokio::test]
async fn test_navigation_is_clamped_and_playback_advances() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0, T0 + 10, T0 + 20]);
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 25);
    coordinator.watch("sub-1", SessionStatus::Started);
    coordinator.tick().await;

    // Already at the live edge.
    let current = coordinator.advance("sub-1", Direction::Forward).unwrap().unwrap();
    assert_eq!(current.sequence_index, 2);
    assert!(!coordinator.view("sub-1").unwrap().skip_forward_enabled);

    let current = coordinator.advance("sub-1", Direction::Backward).unwrap().unwrap();
    assert_eq!(current.sequence_index, 1);
    let view = coordinator.view("sub-1").unwrap();
    assert_eq!(view.badge, LiveBadge::GoLive);
    assert!(view.skip_forward_enabled);
    assert!(view.skip_back_enabled);
    assert!(view.capture_clock.is_some());

    let playback = coordinator.segment_ended("sub-1").await.unwrap().unwrap();
    assert_eq!(playback.segment.sequence_index, 2);
    assert_eq!(playback.blob, FakeRpc::blob_for(&segment_url("sub-1", T0 + 20)));

    // Nothing after the live edge.
    assert!(coordinator.segment_ended("sub-1").await.unwrap().is_none());

    coordinator.seek("sub-1", 99).unwrap();
    assert_eq!(coordinator.current_segment("sub-1").unwrap().unwrap().sequence_index, 2);
    coordinator.seek("sub-1", 0).unwrap();
    let playback = coordinator.current_playback("sub-1").await.unwrap().unwrap();
    assert_eq!(playback.segment.captured_at, T0);

    coordinator.jump_to_live("sub-1").unwrap();
    assert_eq!(coordinator.view("sub-1").unwrap().badge, LiveBadge::Live);
}

#[tokio::test]
async fn test_cursor_survives_refresh() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0, T0 + 10, T0 + 20]);
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 25);
    coordinator.watch("sub-1", SessionStatus::Started);
    coordinator.tick().await;
    coordinator.seek("sub-1", 1).unwrap();

    rpc.set_segments("sub-1", &[T0, T0 + 10, T0 + 20, T0 + 30]);
    coordinator.tick().await;

    let current = coordinator.current_segment("sub-1").unwrap().unwrap();
    assert_eq!(current.captured_at, T0 + 10);
    assert_eq!(coordinator.view("sub-1").unwrap().segment_count, 4);
}

#[tokio::test]
async fn test_unwatch_tears_down_session() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0, T0 + 10]);
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 15);
    coordinator.watch("sub-1", SessionStatus::Started);
    assert!(!coordinator.watch("sub-1", SessionStatus::Started));

    coordinator.tick().await;
    coordinator.open_chat("sub-1").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(coordinator.unwatch("sub-1"));
    assert!(!coordinator.is_watching("sub-1"));
    assert_eq!(coordinator.cache().len("sub-1"), 0);
    assert!(!coordinator.unwatch("sub-1"));

    let err = coordinator.view("sub-1").unwrap_err();
    assert!(matches!(
        ProctorError::classify(&err),
        Some(ProctorError::UnknownSession(_))
    ));

    let report = coordinator.tick().await;
    assert!(report.outcomes.is_empty());
}

#[tokio::test]
async fn test_terminate_requires_exact_confirmation() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0]);
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 5);
    let mut events = coordinator.subscribe();
    coordinator.watch("sub-1", SessionStatus::Started);

    let err = coordinator
        .terminate("sub-1", "terminate exam")
        .await
        .unwrap_err();
    assert!(matches!(
        ProctorError::classify(&err),
        Some(ProctorError::ConfirmationMismatch)
    ));
    assert!(rpc.terminated.lock().is_empty());

    coordinator
        .terminate("sub-1", TERMINATE_CONFIRMATION)
        .await
        .unwrap();
    assert_eq!(*rpc.terminated.lock(), vec!["sub-1".to_string()]);
    assert_eq!(
        coordinator.view("sub-1").unwrap().status,
        SessionStatus::Terminated
    );
    assert_eq!(
        events.recv().await.unwrap(),
        CoordinatorEvent::SessionTerminated {
            session_id: "sub-1".to_string()
        }
    );

    // Terminal sessions stay listed but are no longer refreshed.
    let before = rpc.list_calls.load(Ordering::SeqCst);
    let report = coordinator.tick().await;
    assert!(report.outcome("sub-1").is_none());
    assert_eq!(rpc.list_calls.load(Ordering::SeqCst), before);
    assert!(coordinator.is_watching("sub-1"));
}

#[tokio::test]
async fn test_send_message_rejects_blank_body() {
    let rpc = Arc::new(FakeRpc::new());
    let (coordinator, _clock) = coordinator(rpc.clone(), T0);
    coordinator.watch("sub-1", SessionStatus::Started);

    assert!(coordinator.send_message("sub-1", "   ").await.is_err());
    assert!(rpc.posted.lock().is_empty());

    coordinator
        .send_message("sub-1", "Please face the camera")
        .await
        .unwrap();
    let posted = rpc.posted.lock();
    assert_eq!(posted.len(), 1);
    assert_eq!(posted[0].0, "sub-1");
    assert_eq!(posted[0].1.body, "Please face the camera");
    assert_eq!(posted[0].1.origin, MessageOrigin::Proctor);
    assert_eq!(posted[0].1.category, MessageCategory::General);
}

#[tokio::test(start_paused = true)]
async fn test_chat_polls_while_open() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_messages(
        "sub-1",
        vec![message("sub-1", "2024-05-01 10:00:00", MessageCategory::General)],
    );
    let (coordinator, _clock) = coordinator(rpc.clone(), T0);
    coordinator.watch("sub-1", SessionStatus::Started);

    coordinator.open_chat("sub-1").unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let view = coordinator.view("sub-1").unwrap();
    assert!(view.chat_open);
    assert_eq!(view.message_count, 1);

    rpc.set_messages(
        "sub-1",
        vec![
            message("sub-1", "2024-05-01 10:00:00", MessageCategory::General),
            message("sub-1", "2024-05-01 10:00:02", MessageCategory::Warning),
        ],
    );
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(coordinator.view("sub-1").unwrap().message_count, 2);

    assert!(coordinator.close_chat("sub-1").unwrap());
    assert!(!coordinator.view("sub-1").unwrap().chat_open);
    assert!(!coordinator.close_chat("sub-1").unwrap());
}

#[tokio::test]
async fn test_resync_keeps_seen_messages() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0]);
    rpc.set_messages(
        "sub-1",
        vec![message("sub-1", "2024-05-01 10:00:00", MessageCategory::General)],
    );
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 5);
    coordinator.watch("sub-1", SessionStatus::Started);
    coordinator.tick().await;

    let report = coordinator.resync().await;
    assert_eq!(report.outcome("sub-1").unwrap().new_messages, 0);
    let view = coordinator.view("sub-1").unwrap();
    assert_eq!(view.message_count, 1);
    assert_eq!(view.badge, LiveBadge::Live);
}

#[tokio::test]
async fn test_unwatch_during_tick_leaves_nothing_behind() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0, T0 + 10, T0 + 20]);
    rpc.delay_list("sub-1", Duration::from_millis(200));
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 25);
    coordinator.watch("sub-1", SessionStatus::Started);

    let tick = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.tick().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(coordinator.unwatch("sub-1"));

    tick.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!coordinator.is_watching("sub-1"));
    assert_eq!(coordinator.cache().len("sub-1"), 0);
    assert_eq!(rpc.segment_fetches.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.fetcher().tracked_sessions(), 0);

    // Watching again starts clean and downloads normally.
    rpc.delay_list("sub-1", Duration::ZERO);
    assert!(coordinator.watch("sub-1", SessionStatus::Started));
    coordinator.tick().await;
    let playback = coordinator.current_playback("sub-1").await.unwrap().unwrap();
    assert_eq!(playback.segment.captured_at, T0 + 20);
}

#[tokio::test]
async fn test_reindex_during_slow_download_serves_right_blob() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0, T0 + 10, T0 + 20]);
    let (coordinator, _clock) = coordinator(rpc.clone(), T0 + 25);
    coordinator.watch("sub-1", SessionStatus::Started);
    coordinator.tick().await;

    rpc.delay_fetch(Duration::from_millis(100));
    coordinator.seek("sub-1", 0).unwrap();
    let oldest = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.current_playback("sub-1").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The oldest segment expires server-side; every position shifts down by one.
    rpc.set_segments("sub-1", &[T0 + 10, T0 + 20, T0 + 30]);
    coordinator.tick().await;
    assert_eq!(
        coordinator.current_segment("sub-1").unwrap().unwrap().captured_at,
        T0 + 10
    );

    let playback = coordinator.current_playback("sub-1").await.unwrap().unwrap();
    assert_eq!(playback.segment.sequence_index, 0);
    assert_eq!(playback.blob, FakeRpc::blob_for(&segment_url("sub-1", T0 + 10)));

    let oldest = oldest.await.unwrap().unwrap().unwrap();
    assert_eq!(oldest.segment.captured_at, T0);
    assert_eq!(oldest.blob, FakeRpc::blob_for(&segment_url("sub-1", T0)));
}

#[tokio::test]
async fn test_view_counts_missed_uploads() {
    let rpc = Arc::new(FakeRpc::new());
    rpc.set_segments("sub-1", &[T0, T0 + 10]);
    let (coordinator, clock) = coordinator(rpc.clone(), T0 + 15);
    coordinator.watch("sub-1", SessionStatus::Started);

    coordinator.tick().await;
    assert_eq!(coordinator.view("sub-1").unwrap().missed_uploads, 0);

    clock.set_millis((T0 + 35) * 1000);
    coordinator.tick().await;
    let view = coordinator.view("sub-1").unwrap();
    assert_eq!(view.missed_uploads, 2);
    assert_eq!(view.badge, LiveBadge::Live);
}
