use crate::adapter::MediaBackend;
use crate::household::HouseholdLearner;
use crate::viewing::ViewingTracker;
use chrono::{DateTime, Utc};
use common::history::WatchHistoryEntry;
use common::store::Store;
use common::streams::{ActiveStream, BackendKind, Snapshot};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::{
    ACTIVE_SESSIONS, HISTORY_WRITES, POLL_BACKEND_ERRORS, POLL_TICKS, POLL_TICK_DURATION,
    SESSIONS_COALESCED,
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consecutive failed polls before a backend is flagged unhealthy.
/// Polling continues regardless.
const UNHEALTHY_AFTER_FAILURES: u32 = 5;
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Health summary for one backend, surfaced on the status API.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub id: String,
    pub kind: BackendKind,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    pub active_sessions: usize,
}

struct HealthState {
    consecutive_failures: u32,
    healthy: bool,
    last_success: Option<DateTime<Utc>>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            healthy: true,
            last_success: None,
        }
    }
}

struct BackendEntry {
    adapter: Arc<dyn MediaBackend>,
    tracker: Mutex<ViewingTracker>,
    health: Mutex<HealthState>,
}

/// Polls every registered backend on one ticker, folds the results into
/// per-backend viewing trackers, persists finalized viewings, and
/// broadcasts immutable snapshots.
pub struct Poller {
    interval: Duration,
    backends: RwLock<HashMap<String, Arc<BackendEntry>>>,
    store: Arc<dyn Store>,
    household: HouseholdLearner,
    snapshot_tx: broadcast::Sender<Arc<Snapshot>>,
    completed_tx: broadcast::Sender<Arc<WatchHistoryEntry>>,
    current: RwLock<Arc<Snapshot>>,
    retry_queue: Mutex<Vec<WatchHistoryEntry>>,
}

impl Poller {
    pub fn new(config: PollerConfig, store: Arc<dyn Store>, household: HouseholdLearner) -> Self {
        let interval = config.poll_interval.max(MIN_POLL_INTERVAL);
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        let (completed_tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);

        Self {
            interval,
            backends: RwLock::new(HashMap::new()),
            store,
            household,
            snapshot_tx,
            completed_tx,
            current: RwLock::new(Arc::new(Snapshot::default())),
            retry_queue: Mutex::new(Vec::new()),
        }
    }

    pub async fn add_backend(&self, id: impl Into<String>, adapter: Arc<dyn MediaBackend>) {
        let id = id.into();
        let entry = Arc::new(BackendEntry {
            adapter,
            tracker: Mutex::new(ViewingTracker::new(id.clone())),
            health: Mutex::new(HealthState::default()),
        });

        let previous = self.backends.write().await.insert(id.clone(), entry);
        if let Some(previous) = previous {
            let entries = previous.tracker.lock().await.drain();
            self.finalize_entries(entries).await;
        }
        info!(backend = %id, "backend registered");
    }

    /// Unregister a backend, finalizing its open viewings first.
    pub async fn remove_backend(&self, id: &str) {
        let Some(entry) = self.backends.write().await.remove(id) else {
            return;
        };
        let entries = entry.tracker.lock().await.drain();
        self.finalize_entries(entries).await;
        info!(backend = %id, "backend removed");
    }

    pub async fn current_sessions(&self) -> Vec<ActiveStream> {
        self.current.read().await.streams.clone()
    }

    pub async fn current_snapshot(&self) -> Arc<Snapshot> {
        self.current.read().await.clone()
    }

    /// Snapshot fan-out. Slow subscribers lag and drop snapshots
    /// without ever blocking the poll loop.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// Completed-viewing fan-out, fired after the history row lands.
    pub fn subscribe_completions(&self) -> broadcast::Receiver<Arc<WatchHistoryEntry>> {
        self.completed_tx.subscribe()
    }

    pub async fn backend_statuses(&self) -> Vec<BackendStatus> {
        let backends = self.backends.read().await;
        let mut out = Vec::with_capacity(backends.len());
        for (id, entry) in backends.iter() {
            let health = entry.health.lock().await;
            let active_sessions = entry.tracker.lock().await.active_streams().len();
            out.push(BackendStatus {
                id: id.clone(),
                kind: entry.adapter.kind(),
                healthy: health.healthy,
                consecutive_failures: health.consecutive_failures,
                last_success: health.last_success,
                active_sessions,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Run until the shutdown signal fires, then finalize every open
    /// viewing so no session data is lost.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval = ?self.interval, "poller started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        info!("poller stopping; finalizing open viewings");
        self.finalize_all().await;
    }

    async fn tick(&self) {
        POLL_TICKS.inc();
        let _timer = POLL_TICK_DURATION.start_timer();

        self.retry_pending_history().await;

        let backends: Vec<(String, Arc<BackendEntry>)> = {
            let guard = self.backends.read().await;
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        // One worker per backend, each bounded by the adapter deadline;
        // the tick as a whole never waits past twice the interval.
        let deadline = self.interval.mul_f64(1.5);
        let tick_budget = self.interval * 2;
        let workers = backends.iter().map(|(id, entry)| {
            let task_id = id.clone();
            let entry = entry.clone();
            let handle =
                tokio::spawn(async move { Self::poll_backend(&task_id, &entry, deadline).await });
            let id = id.clone();
            async move {
                match tokio::time::timeout(tick_budget, handle).await {
                    Ok(Ok(finalized)) => finalized,
                    Ok(Err(e)) => {
                        error!(backend = %id, error = %e, "backend worker panicked");
                        Vec::new()
                    }
                    Err(_) => {
                        warn!(
                            backend = %id,
                            "backend exceeded the tick budget; abandoned for this tick"
                        );
                        Vec::new()
                    }
                }
            }
        });
        let finalized: Vec<WatchHistoryEntry> =
            join_all(workers).await.into_iter().flatten().collect();
        self.finalize_entries(finalized).await;

        // Publish a snapshot of every backend's live streams. Backends
        // that failed this tick contribute their previous state.
        let mut streams = Vec::new();
        for (_, entry) in &backends {
            streams.extend(entry.tracker.lock().await.active_streams());
        }
        ACTIVE_SESSIONS.set(streams.len() as i64);

        let snapshot = Arc::new(Snapshot {
            taken_at: Utc::now(),
            streams,
        });
        *self.current.write().await = snapshot.clone();
        let _ = self.snapshot_tx.send(snapshot);
    }

    /// Poll one backend and fold the result into its tracker. Returns
    /// the viewings finalized by this poll.
    async fn poll_backend(
        id: &str,
        entry: &BackendEntry,
        deadline: Duration,
    ) -> Vec<WatchHistoryEntry> {
        match entry.adapter.get_sessions(deadline).await {
            Ok(sessions) => {
                {
                    let mut health = entry.health.lock().await;
                    if !health.healthy {
                        info!(backend = %id, "backend recovered");
                    }
                    health.consecutive_failures = 0;
                    health.healthy = true;
                    health.last_success = Some(Utc::now());
                }

                let outcome = {
                    let mut tracker = entry.tracker.lock().await;
                    tracker.observe(Utc::now(), &sessions)
                };
                if outcome.rebound > 0 {
                    SESSIONS_COALESCED.inc_by(outcome.rebound as u64);
                }
                outcome.finalized
            }
            Err(e) => {
                POLL_BACKEND_ERRORS.with_label_values(&[id]).inc();
                let mut health = entry.health.lock().await;
                health.consecutive_failures += 1;
                warn!(
                    backend = %id,
                    error = %e,
                    consecutive_failures = health.consecutive_failures,
                    "backend poll failed; keeping previous snapshot"
                );
                if health.healthy && health.consecutive_failures >= UNHEALTHY_AFTER_FAILURES {
                    health.healthy = false;
                    error!(backend = %id, "backend flagged unhealthy");
                }
                Vec::new()
            }
        }
    }

    async fn finalize_entries(&self, entries: Vec<WatchHistoryEntry>) {
        for entry in entries {
            if let Err(e) = self.household.observe(&entry).await {
                debug!(user = %entry.user_name, error = %e, "household learning failed");
            }

            match self.write_history(&entry).await {
                Ok(consolidated) => {
                    let status = if consolidated { "consolidated" } else { "inserted" };
                    HISTORY_WRITES.with_label_values(&[status]).inc();
                    let _ = self.completed_tx.send(Arc::new(entry));
                }
                Err(e) => {
                    HISTORY_WRITES.with_label_values(&["failed"]).inc();
                    warn!(
                        user = %entry.user_name,
                        title = %entry.title,
                        error = %e,
                        "history write failed; will retry next tick"
                    );
                    self.retry_queue.lock().await.push(entry);
                }
            }
        }
    }

    /// Persist one finalized viewing, merging into an adjacent earlier
    /// row of the same item when the gap allows it.
    async fn write_history(&self, entry: &WatchHistoryEntry) -> anyhow::Result<bool> {
        if self.store.consolidate_adjacent_history(entry).await? {
            return Ok(true);
        }
        self.store.insert_history(entry).await?;
        Ok(false)
    }

    async fn retry_pending_history(&self) {
        let pending: Vec<WatchHistoryEntry> = {
            let mut queue = self.retry_queue.lock().await;
            std::mem::take(&mut *queue)
        };
        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "retrying deferred history writes");
        self.finalize_entries(pending).await;
    }

    async fn finalize_all(&self) {
        let backends: Vec<Arc<BackendEntry>> =
            self.backends.read().await.values().cloned().collect();
        for entry in backends {
            let entries = entry.tracker.lock().await.drain();
            self.finalize_entries(entries).await;
        }
    }
}
