use crate::adapter::{AdapterError, MediaBackend};
use crate::adapters::{projected_start, strip_port};
use async_trait::async_trait;
use chrono::Utc;
use common::streams::{
    resolution_label, ActiveStream, BackendConfig, BackendKind, MediaKind, TranscodeDecision,
};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const TICKS_PER_MS: i64 = 10_000;

/// Adapter for Jellyfin. Sessions come from `GET /Sessions` with a
/// `MediaBrowser` authorization header.
pub struct JellyfinAdapter {
    name: String,
    base_url: String,
    auth_header: String,
    client: reqwest::Client,
}

impl JellyfinAdapter {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            name: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header: format!(
                "MediaBrowser Client=\"StreamMon\", Device=\"StreamMon\", DeviceId=\"streammon\", Version=\"0.1\", Token=\"{}\"",
                config.token
            ),
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, path: &str, deadline: Duration) -> Result<Value, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("Authorization", &self.auth_header)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| AdapterError::from_reqwest(e, deadline))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdapterError::Http {
                status: status.as_u16(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| AdapterError::Malformed(e.to_string()))
    }

    fn parse_session(&self, session: &Value) -> Option<ActiveStream> {
        let item = &session["NowPlayingItem"];
        if !item.is_object() {
            return None;
        }

        let session_id = session["Id"].as_str()?.to_string();
        let user_name = session["UserName"].as_str()?.to_string();

        let media_kind = item["Type"]
            .as_str()
            .and_then(MediaKind::parse)
            .unwrap_or_default();

        // Jellyfin applies forwarded-for itself when the reverse proxy
        // is in its known-proxies list, so RemoteEndPoint is already the
        // client address.
        let ip_address = session["RemoteEndPoint"].as_str().map(strip_port);

        let play_state = &session["PlayState"];
        let progress_ms = play_state["PositionTicks"].as_i64().unwrap_or(0) / TICKS_PER_MS;
        let now = Utc::now();

        let mut video_codec = None;
        let mut audio_codec = None;
        let mut resolution = None;
        let mut audio_channels = None;
        let mut subtitle_codec = None;
        let mut dynamic_range = None;
        if let Some(streams) = item["MediaStreams"].as_array() {
            for stream in streams {
                match stream["Type"].as_str() {
                    Some("Video") if video_codec.is_none() => {
                        video_codec = stream["Codec"].as_str().map(str::to_string);
                        resolution = stream["Height"].as_i64().and_then(resolution_label);
                        dynamic_range = stream["VideoRange"].as_str().map(str::to_string);
                    }
                    Some("Audio") if audio_codec.is_none() => {
                        audio_codec = stream["Codec"].as_str().map(str::to_string);
                        audio_channels = stream["Channels"].as_i64().map(|c| c as i32);
                    }
                    Some("Subtitle") if subtitle_codec.is_none() => {
                        subtitle_codec = stream["Codec"].as_str().map(str::to_string);
                    }
                    _ => {}
                }
            }
        }

        let transcoding = &session["TranscodingInfo"];
        let transcode_decision = match play_state["PlayMethod"].as_str() {
            Some("Transcode") => {
                let video = if transcoding["IsVideoDirect"].as_bool().unwrap_or(false) {
                    "copy"
                } else {
                    "transcode"
                };
                let audio = if transcoding["IsAudioDirect"].as_bool().unwrap_or(false) {
                    "copy"
                } else {
                    "transcode"
                };
                TranscodeDecision::from_parts(Some(video), Some(audio))
            }
            Some("DirectStream") => TranscodeDecision::Copy,
            _ => TranscodeDecision::DirectPlay,
        };

        let hw_accel = transcoding["HardwareAccelerationType"]
            .as_str()
            .map(|t| !t.is_empty() && t != "none")
            .unwrap_or(false);

        Some(ActiveStream {
            backend_id: self.name.clone(),
            session_id,
            user_name,
            media_kind,
            title: item["Name"].as_str().unwrap_or_default().to_string(),
            parent_title: item["SeasonName"].as_str().map(str::to_string),
            grandparent_title: item["SeriesName"].as_str().map(str::to_string),
            year: item["ProductionYear"].as_i64().map(|y| y as i32),
            item_id: item["Id"].as_str().map(str::to_string),
            grandparent_item_id: item["SeriesId"].as_str().map(str::to_string),
            duration_ms: item["RunTimeTicks"].as_i64().map(|t| t / TICKS_PER_MS),
            progress_ms,
            paused: play_state["IsPaused"].as_bool().unwrap_or(false),
            player: session["DeviceName"].as_str().unwrap_or("unknown").to_string(),
            platform: session["Client"].as_str().unwrap_or("unknown").to_string(),
            ip_address,
            started_at: projected_start(now, progress_ms),
            video_codec,
            audio_codec,
            resolution,
            container: item["Container"].as_str().map(str::to_string),
            bitrate_kbps: transcoding["Bitrate"].as_i64().map(|b| b / 1000),
            audio_channels,
            subtitle_codec,
            dynamic_range,
            transcode_decision,
            hw_decode: hw_accel,
            hw_encode: hw_accel,
            transcode_progress: transcoding["CompletionPercentage"].as_f64(),
        })
    }
}

#[async_trait]
impl MediaBackend for JellyfinAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Jellyfin
    }

    async fn get_sessions(&self, deadline: Duration) -> Result<Vec<ActiveStream>, AdapterError> {
        let body = self.get_json("/Sessions", deadline).await?;

        let Some(items) = body.as_array() else {
            return Err(AdapterError::Malformed("expected a session array".into()));
        };

        let mut sessions = Vec::new();
        for item in items {
            if !item["NowPlayingItem"].is_object() {
                continue;
            }
            match self.parse_session(item) {
                Some(stream) => sessions.push(stream),
                None => debug!(backend = %self.name, "skipping session without id or user"),
            }
        }
        Ok(sessions)
    }

    async fn test_connection(&self, deadline: Duration) -> Result<(), AdapterError> {
        self.get_json("/System/Info", deadline).await.map(|_| ())
    }
}
