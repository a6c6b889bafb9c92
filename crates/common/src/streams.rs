use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Plex,
    Jellyfin,
    Emby,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Plex => write!(f, "plex"),
            BackendKind::Jellyfin => write!(f, "jellyfin"),
            BackendKind::Emby => write!(f, "emby"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plex" => Ok(BackendKind::Plex),
            "jellyfin" => Ok(BackendKind::Jellyfin),
            "emby" => Ok(BackendKind::Emby),
            _ => Err(format!("Invalid backend kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Movie,
    Episode,
    LiveTv,
    Track,
    Audiobook,
    Book,
}

impl MediaKind {
    /// Lenient parse of the media type strings the backends report.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "movie" | "video" => Some(MediaKind::Movie),
            "episode" => Some(MediaKind::Episode),
            "livetv" | "live" | "tvchannel" | "channel" => Some(MediaKind::LiveTv),
            "track" | "audio" | "music" => Some(MediaKind::Track),
            "audiobook" => Some(MediaKind::Audiobook),
            "book" => Some(MediaKind::Book),
            _ => None,
        }
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MediaKind::Movie => "movie",
            MediaKind::Episode => "episode",
            MediaKind::LiveTv => "livetv",
            MediaKind::Track => "track",
            MediaKind::Audiobook => "audiobook",
            MediaKind::Book => "book",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MediaKind::parse(s).ok_or_else(|| format!("Invalid media kind: {}", s))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeDecision {
    #[default]
    DirectPlay,
    Copy,
    Transcode,
}

impl TranscodeDecision {
    /// Combine the per-stream video/audio decisions a backend reports.
    /// Absent decisions count as direct play.
    pub fn from_parts(video: Option<&str>, audio: Option<&str>) -> Self {
        let video = video.unwrap_or("directplay").to_lowercase();
        let audio = audio.unwrap_or("directplay").to_lowercase();

        if video == "directplay" && audio == "directplay" {
            TranscodeDecision::DirectPlay
        } else if video == "copy" || audio == "copy" {
            TranscodeDecision::Copy
        } else {
            TranscodeDecision::Transcode
        }
    }
}

impl std::fmt::Display for TranscodeDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeDecision::DirectPlay => write!(f, "direct_play"),
            TranscodeDecision::Copy => write!(f, "copy"),
            TranscodeDecision::Transcode => write!(f, "transcode"),
        }
    }
}

impl std::str::FromStr for TranscodeDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct_play" | "directplay" => Ok(TranscodeDecision::DirectPlay),
            "copy" => Ok(TranscodeDecision::Copy),
            "transcode" => Ok(TranscodeDecision::Transcode),
            _ => Err(format!("Invalid transcode decision: {}", s)),
        }
    }
}

/// Identity of one live playback session, the dedup key for violations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub backend_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(backend_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.backend_id, self.session_id)
    }
}

/// One playback session as currently reported by a backend, normalized
/// across the three protocol families.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveStream {
    pub backend_id: String,
    pub session_id: String,

    pub user_name: String,
    pub media_kind: MediaKind,
    pub title: String,
    pub parent_title: Option<String>,
    pub grandparent_title: Option<String>,
    pub year: Option<i32>,
    pub item_id: Option<String>,
    pub grandparent_item_id: Option<String>,

    pub duration_ms: Option<i64>,
    pub progress_ms: i64,
    pub paused: bool,
    pub player: String,
    pub platform: String,
    pub ip_address: Option<String>,
    pub started_at: DateTime<Utc>,

    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub resolution: Option<String>,
    pub container: Option<String>,
    pub bitrate_kbps: Option<i64>,
    pub audio_channels: Option<i32>,
    pub subtitle_codec: Option<String>,
    pub dynamic_range: Option<String>,
    pub transcode_decision: TranscodeDecision,
    pub hw_decode: bool,
    pub hw_encode: bool,
    pub transcode_progress: Option<f64>,
}

impl ActiveStream {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.backend_id.clone(), self.session_id.clone())
    }

    /// Progress clamped into `[0, duration]` once the duration is known.
    pub fn clamped_progress_ms(&self) -> i64 {
        match self.duration_ms {
            Some(duration) => self.progress_ms.clamp(0, duration),
            None => self.progress_ms.max(0),
        }
    }
}

/// Map a video height in pixels to the resolution label shown to users.
pub fn resolution_label(height: i64) -> Option<String> {
    if height >= 2160 {
        Some("4K".to_string())
    } else if height >= 1080 {
        Some("1080p".to_string())
    } else if height >= 720 {
        Some("720p".to_string())
    } else if height >= 480 {
        Some("480p".to_string())
    } else if height > 0 {
        Some(format!("{}p", height))
    } else {
        None
    }
}

/// Connection settings for one monitored media server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub kind: BackendKind,
    pub base_url: String,
    pub token: String,
    /// Prefer proxy-forwarded client addresses over the socket address
    /// the backend reports.
    pub trust_proxy: bool,
    pub enabled: bool,
}

/// The complete set of active streams across all backends at one tick.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub streams: Vec<ActiveStream>,
}

impl Snapshot {
    pub fn streams_for_user<'a>(&'a self, user_name: &'a str) -> impl Iterator<Item = &'a ActiveStream> {
        self.streams.iter().filter(move |s| s.user_name == user_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_buckets() {
        assert_eq!(resolution_label(2160).as_deref(), Some("4K"));
        assert_eq!(resolution_label(3840).as_deref(), Some("4K"));
        assert_eq!(resolution_label(1080).as_deref(), Some("1080p"));
        assert_eq!(resolution_label(800).as_deref(), Some("720p"));
        assert_eq!(resolution_label(576).as_deref(), Some("480p"));
        assert_eq!(resolution_label(360).as_deref(), Some("360p"));
        assert_eq!(resolution_label(0), None);
    }

    #[test]
    fn transcode_decision_from_parts() {
        assert_eq!(
            TranscodeDecision::from_parts(None, None),
            TranscodeDecision::DirectPlay
        );
        assert_eq!(
            TranscodeDecision::from_parts(Some("directplay"), Some("directplay")),
            TranscodeDecision::DirectPlay
        );
        assert_eq!(
            TranscodeDecision::from_parts(Some("copy"), Some("transcode")),
            TranscodeDecision::Copy
        );
        assert_eq!(
            TranscodeDecision::from_parts(Some("transcode"), Some("copy")),
            TranscodeDecision::Copy
        );
        assert_eq!(
            TranscodeDecision::from_parts(Some("transcode"), Some("transcode")),
            TranscodeDecision::Transcode
        );
    }
}
