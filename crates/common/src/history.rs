use crate::streams::{ActiveStream, MediaKind, TranscodeDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fraction of the runtime that must have played for a viewing to count
/// as watched.
pub const WATCHED_THRESHOLD: f64 = 0.85;

/// The persisted result of one completed logical viewing. One row may
/// cover several raw backend sessions merged by the coalescer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchHistoryEntry {
    pub id: Uuid,
    pub backend_id: String,

    pub user_name: String,
    pub media_kind: MediaKind,
    pub title: String,
    pub parent_title: Option<String>,
    pub grandparent_title: Option<String>,
    pub year: Option<i32>,
    pub item_id: Option<String>,
    pub grandparent_item_id: Option<String>,

    pub player: String,
    pub platform: String,
    pub ip_address: Option<String>,

    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub resolution: Option<String>,
    pub transcode_decision: TranscodeDecision,

    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub watched_ms: i64,
    pub paused_ms: i64,
    /// How many raw sessions the coalescer merged into this row.
    pub session_count: i32,
}

impl WatchHistoryEntry {
    /// A viewing counts as watched once 85% of the runtime has played.
    pub fn watched(&self) -> bool {
        match self.duration_ms {
            Some(duration) if duration > 0 => {
                self.watched_ms as f64 >= WATCHED_THRESHOLD * duration as f64
            }
            _ => false,
        }
    }

    /// Seed an entry from a live stream; the coalescer fills in the
    /// stop-time fields as the viewing progresses.
    pub fn from_stream(stream: &ActiveStream) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: stream.backend_id.clone(),
            user_name: stream.user_name.clone(),
            media_kind: stream.media_kind,
            title: stream.title.clone(),
            parent_title: stream.parent_title.clone(),
            grandparent_title: stream.grandparent_title.clone(),
            year: stream.year,
            item_id: stream.item_id.clone(),
            grandparent_item_id: stream.grandparent_item_id.clone(),
            player: stream.player.clone(),
            platform: stream.platform.clone(),
            ip_address: stream.ip_address.clone(),
            video_codec: stream.video_codec.clone(),
            audio_codec: stream.audio_codec.clone(),
            resolution: stream.resolution.clone(),
            transcode_decision: stream.transcode_decision,
            started_at: stream.started_at,
            stopped_at: stream.started_at,
            duration_ms: stream.duration_ms,
            watched_ms: stream.clamped_progress_ms(),
            paused_ms: 0,
            session_count: 1,
        }
    }
}
