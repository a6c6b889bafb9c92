use chrono::{DateTime, Duration, Utc};
use common::history::WatchHistoryEntry;
use common::streams::ActiveStream;
use uuid::Uuid;

/// How long a viewing stays open after its session disappears.
pub const GRACE_SECONDS: i64 = 30;
/// A returning session re-binds only when its progress is this close to
/// the last observed progress.
pub const REBIND_PROGRESS_TOLERANCE_MS: i64 = 60_000;
/// A progress drop larger than this splits the viewing.
pub const SCRUB_SPLIT_THRESHOLD_MS: i64 = 5_000;
/// Reported start times within this window count as unchanged.
const STARTED_AT_TOLERANCE_SECONDS: i64 = 5;
/// Progress advancing less than this across a tick counts as paused.
const PAUSE_PROGRESS_EPSILON_MS: i64 = 1_000;

/// One logical viewing, spanning one or more raw backend sessions.
#[derive(Debug, Clone)]
pub struct OpenViewing {
    /// Latest observed stream state; `started_at` is normalized to the
    /// viewing's start and never changes afterwards.
    stream: ActiveStream,
    /// Start time the backend reported on first observation, kept for
    /// backward-scrub detection.
    reported_started_at: DateTime<Utc>,
    started_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_progress_ms: i64,
    max_progress_ms: i64,
    paused_ms: i64,
    session_count: i32,
    /// Whether the bound session appeared in the latest poll.
    live: bool,
}

impl OpenViewing {
    fn open(stream: &ActiveStream, now: DateTime<Utc>) -> Self {
        let started_at = stream.started_at.min(now);
        let mut normalized = stream.clone();
        normalized.started_at = started_at;

        Self {
            reported_started_at: stream.started_at,
            started_at,
            last_seen: now,
            last_progress_ms: stream.progress_ms,
            max_progress_ms: stream.clamped_progress_ms(),
            paused_ms: 0,
            session_count: 1,
            live: true,
            stream: normalized,
        }
    }

    fn update(&mut self, stream: &ActiveStream, now: DateTime<Utc>) {
        let wall_ms = (now - self.last_seen).num_milliseconds().max(0);
        let progressed = stream.progress_ms - self.last_progress_ms;
        if stream.paused || progressed <= PAUSE_PROGRESS_EPSILON_MS {
            self.paused_ms += wall_ms;
        }

        self.last_progress_ms = stream.progress_ms;
        self.max_progress_ms = self.max_progress_ms.max(stream.clamped_progress_ms());
        self.last_seen = now;
        self.live = true;

        let started_at = self.started_at;
        self.stream = stream.clone();
        self.stream.started_at = started_at;
    }

    fn rebind(&mut self, stream: &ActiveStream, now: DateTime<Utc>) {
        self.session_count += 1;
        self.update(stream, now);
    }

    fn into_entry(self) -> WatchHistoryEntry {
        let mut entry = WatchHistoryEntry::from_stream(&self.stream);
        entry.id = Uuid::new_v4();
        entry.started_at = self.started_at;
        entry.stopped_at = self.last_seen;
        entry.watched_ms = self.max_progress_ms;
        entry.paused_ms = self.paused_ms;
        entry.session_count = self.session_count;
        entry
    }

    pub fn stream(&self) -> &ActiveStream {
        &self.stream
    }

    pub fn session_count(&self) -> i32 {
        self.session_count
    }
}

/// Result of folding one poll into the tracker.
#[derive(Debug, Default)]
pub struct ObserveOutcome {
    pub finalized: Vec<WatchHistoryEntry>,
    pub opened: usize,
    pub rebound: usize,
}

/// Per-backend session differ and coalescer. Owned by a single task;
/// all time flows in through `observe` so tests can drive the clock.
#[derive(Debug)]
pub struct ViewingTracker {
    backend_id: String,
    viewings: Vec<OpenViewing>,
}

impl ViewingTracker {
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            viewings: Vec::new(),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Streams whose session appeared in the latest poll, with
    /// normalized start times.
    pub fn active_streams(&self) -> Vec<ActiveStream> {
        self.viewings
            .iter()
            .filter(|v| v.live)
            .map(|v| v.stream.clone())
            .collect()
    }

    /// Fold one poll result into the open viewings. Returns viewings
    /// finalized this tick, ready to persist.
    pub fn observe(&mut self, now: DateTime<Utc>, sessions: &[ActiveStream]) -> ObserveOutcome {
        let mut outcome = ObserveOutcome::default();
        let mut next = Vec::with_capacity(sessions.len());
        let mut remaining = std::mem::take(&mut self.viewings);
        let mut unbound = Vec::new();

        // Bind sessions to viewings by session id.
        for stream in sessions {
            let Some(pos) = remaining
                .iter()
                .position(|v| v.stream.session_id == stream.session_id)
            else {
                unbound.push(stream);
                continue;
            };

            let mut viewing = remaining.swap_remove(pos);
            let user_changed = viewing.stream.user_name != stream.user_name;
            if user_changed || Self::is_backward_scrub(&viewing, stream) {
                // A reused id after a server restart, or a scrub back:
                // either way this is a fresh viewing of the item.
                outcome.finalized.push(viewing.into_entry());
                next.push(OpenViewing::open(stream, now));
                outcome.opened += 1;
            } else {
                viewing.update(stream, now);
                next.push(viewing);
            }
        }

        // Re-bind returning sessions to viewings inside the grace
        // window; anything left opens a new viewing.
        for stream in unbound {
            if let Some(pos) = remaining
                .iter()
                .position(|v| Self::can_rebind(v, stream, now))
            {
                let mut viewing = remaining.swap_remove(pos);
                viewing.rebind(stream, now);
                next.push(viewing);
                outcome.rebound += 1;
            } else {
                next.push(OpenViewing::open(stream, now));
                outcome.opened += 1;
            }
        }

        // Expire viewings whose grace ran out.
        for mut viewing in remaining {
            if now - viewing.last_seen > Duration::seconds(GRACE_SECONDS) {
                outcome.finalized.push(viewing.into_entry());
            } else {
                viewing.live = false;
                next.push(viewing);
            }
        }

        self.viewings = next;
        outcome
    }

    /// Finalize every open viewing as if it had just stopped. Used on
    /// shutdown and backend removal so no session data is lost.
    pub fn drain(&mut self) -> Vec<WatchHistoryEntry> {
        std::mem::take(&mut self.viewings)
            .into_iter()
            .map(OpenViewing::into_entry)
            .collect()
    }

    fn is_backward_scrub(viewing: &OpenViewing, stream: &ActiveStream) -> bool {
        let drop_ms = viewing.last_progress_ms - stream.progress_ms;
        let start_shift = (stream.started_at - viewing.reported_started_at)
            .num_seconds()
            .abs();
        drop_ms > SCRUB_SPLIT_THRESHOLD_MS && start_shift > STARTED_AT_TOLERANCE_SECONDS
    }

    fn can_rebind(viewing: &OpenViewing, stream: &ActiveStream, now: DateTime<Utc>) -> bool {
        if viewing.live || now - viewing.last_seen > Duration::seconds(GRACE_SECONDS) {
            return false;
        }
        if viewing.stream.user_name != stream.user_name {
            return false;
        }

        let same_item = match (&viewing.stream.item_id, &stream.item_id) {
            (Some(a), Some(b)) => a == b,
            _ => viewing.stream.title == stream.title,
        };
        if !same_item {
            return false;
        }

        let delta = (stream.progress_ms - viewing.last_progress_ms).abs();
        if delta > REBIND_PROGRESS_TOLERANCE_MS {
            return false;
        }

        // Split takes precedence over coalescing: a rewind inside the
        // tolerance still opens a new viewing.
        !Self::is_backward_scrub(viewing, stream)
    }
}
