//! Pipeline tests driving the real poll loop against scripted backends
//! and the in-memory store.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use common::history::WatchHistoryEntry;
use common::store::Store;
use common::streams::{ActiveStream, BackendKind, MediaKind, TranscodeDecision};
use session_tracker::{AdapterError, HouseholdLearner, MediaBackend, NullGeoResolver, Poller, PollerConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::MemoryStore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A backend whose session list the test mutates between polls.
struct LiveBackend {
    name: String,
    sessions: Arc<Mutex<Vec<ActiveStream>>>,
}

#[async_trait]
impl MediaBackend for LiveBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Plex
    }

    async fn get_sessions(&self, _deadline: Duration) -> Result<Vec<ActiveStream>, AdapterError> {
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn test_connection(&self, _deadline: Duration) -> Result<(), AdapterError> {
        Ok(())
    }
}

fn stream(session_id: &str, user: &str, progress_ms: i64) -> ActiveStream {
    let now = Utc::now();
    ActiveStream {
        backend_id: "plex-main".into(),
        session_id: session_id.into(),
        user_name: user.into(),
        media_kind: MediaKind::Movie,
        title: "Some Film".into(),
        parent_title: None,
        grandparent_title: None,
        year: Some(2020),
        item_id: Some("item-1".into()),
        grandparent_item_id: None,
        duration_ms: Some(7_200_000),
        progress_ms,
        paused: false,
        player: "TV".into(),
        platform: "Roku".into(),
        ip_address: Some("203.0.113.9".into()),
        started_at: now - ChronoDuration::milliseconds(progress_ms),
        video_codec: None,
        audio_codec: None,
        resolution: None,
        container: None,
        bitrate_kbps: None,
        audio_channels: None,
        subtitle_codec: None,
        dynamic_range: None,
        transcode_decision: TranscodeDecision::DirectPlay,
        hw_decode: false,
        hw_encode: false,
        transcode_progress: None,
    }
}

fn poller_with(store: Arc<MemoryStore>) -> Arc<Poller> {
    let household = HouseholdLearner::new(store.clone(), Arc::new(NullGeoResolver), 0);
    Arc::new(Poller::new(
        PollerConfig {
            poll_interval: Duration::from_secs(2),
        },
        store,
        household,
    ))
}

#[tokio::test]
async fn poll_loop_tracks_sessions_and_flushes_on_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let poller = poller_with(store.clone());

    let sessions = Arc::new(Mutex::new(vec![stream("s1", "alice", 10_000)]));
    poller
        .add_backend(
            "plex-main",
            Arc::new(LiveBackend {
                name: "plex-main".into(),
                sessions: sessions.clone(),
            }),
        )
        .await;

    let mut snapshots = poller.subscribe();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(poller.clone().run(shutdown.clone()));

    let first = timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("no snapshot before timeout")
        .unwrap();
    assert_eq!(first.streams.len(), 1);
    assert_eq!(first.streams[0].user_name, "alice");

    // Progress advances before the next poll.
    sessions.lock().unwrap()[0].progress_ms = 14_000;
    let second = timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("no second snapshot")
        .unwrap();
    assert_eq!(second.streams[0].progress_ms, 14_000);

    // Shutdown finalizes the open viewing so nothing is lost.
    shutdown.cancel();
    run.await.unwrap();

    let history = store.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].user_name, "alice");
    assert_eq!(history[0].watched_ms, 14_000);
    assert_eq!(history[0].session_count, 1);
    assert!(history[0].stopped_at >= history[0].started_at);
}

#[tokio::test]
async fn completion_events_follow_history_writes() {
    let store = Arc::new(MemoryStore::new());
    let poller = poller_with(store.clone());

    let sessions = Arc::new(Mutex::new(vec![stream("s1", "bob", 500_000)]));
    poller
        .add_backend(
            "plex-main",
            Arc::new(LiveBackend {
                name: "plex-main".into(),
                sessions,
            }),
        )
        .await;

    let mut completions = poller.subscribe_completions();
    let mut snapshots = poller.subscribe();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(poller.clone().run(shutdown.clone()));

    timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("no snapshot")
        .unwrap();

    // Removing the backend finalizes and publishes the completion.
    poller.remove_backend("plex-main").await;

    let completed = timeout(Duration::from_secs(5), completions.recv())
        .await
        .expect("no completion event")
        .unwrap();
    assert_eq!(completed.user_name, "bob");
    assert_eq!(completed.watched_ms, 500_000);

    shutdown.cancel();
    run.await.unwrap();
}

#[tokio::test]
async fn no_ghost_viewings() {
    // Nothing lands in history unless the backend actually reported the
    // session at some tick.
    let store = Arc::new(MemoryStore::new());
    let poller = poller_with(store.clone());

    let sessions = Arc::new(Mutex::new(Vec::new()));
    poller
        .add_backend(
            "plex-main",
            Arc::new(LiveBackend {
                name: "plex-main".into(),
                sessions,
            }),
        )
        .await;

    let mut snapshots = poller.subscribe();
    let shutdown = CancellationToken::new();
    let run = tokio::spawn(poller.clone().run(shutdown.clone()));

    let snapshot = timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("no snapshot")
        .unwrap();
    assert!(snapshot.streams.is_empty());

    shutdown.cancel();
    run.await.unwrap();
    assert!(store.history().await.is_empty());
}

fn entry(title: &str, started_at: chrono::DateTime<Utc>, stopped_at: chrono::DateTime<Utc>) -> WatchHistoryEntry {
    WatchHistoryEntry {
        id: Uuid::new_v4(),
        backend_id: "plex-main".into(),
        user_name: "alice".into(),
        media_kind: MediaKind::Movie,
        title: title.into(),
        parent_title: None,
        grandparent_title: None,
        year: None,
        item_id: Some("item-1".into()),
        grandparent_item_id: None,
        player: "TV".into(),
        platform: "Roku".into(),
        ip_address: Some("203.0.113.9".into()),
        video_codec: None,
        audio_codec: None,
        resolution: None,
        transcode_decision: TranscodeDecision::DirectPlay,
        started_at,
        stopped_at,
        duration_ms: Some(7_200_000),
        watched_ms: 3_000_000,
        paused_ms: 0,
        session_count: 1,
    }
}

#[tokio::test]
async fn adjacent_viewings_consolidate_at_write_time() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();

    // First half watched, stopped 20 minutes ago.
    let first = entry(
        "Some Film",
        now - ChronoDuration::hours(2),
        now - ChronoDuration::minutes(20),
    );
    store.insert_history(&first).await.unwrap();

    // Resumed within the 30-minute consolidation window.
    let mut second = entry("Some Film", now - ChronoDuration::minutes(15), now);
    second.watched_ms = 6_500_000;
    second.session_count = 2;

    assert!(store.consolidate_adjacent_history(&second).await.unwrap());

    let history = store.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].stopped_at, now);
    assert_eq!(history[0].watched_ms, 6_500_000);
    assert_eq!(history[0].session_count, 3);
}

#[tokio::test]
async fn distant_viewings_do_not_consolidate() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();

    let first = entry(
        "Some Film",
        now - ChronoDuration::hours(3),
        now - ChronoDuration::hours(1),
    );
    store.insert_history(&first).await.unwrap();

    let second = entry("Some Film", now - ChronoDuration::minutes(10), now);
    assert!(!store.consolidate_adjacent_history(&second).await.unwrap());
}
