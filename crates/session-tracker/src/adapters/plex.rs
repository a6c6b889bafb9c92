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

/// Adapter for Plex Media Server. Sessions come from
/// `GET /status/sessions` with a `X-Plex-Token` header.
pub struct PlexAdapter {
    name: String,
    base_url: String,
    token: String,
    trust_proxy: bool,
    client: reqwest::Client,
}

impl PlexAdapter {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            name: config.id.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            trust_proxy: config.trust_proxy,
            client: reqwest::Client::new(),
        }
    }

    async fn get_json(&self, path: &str, deadline: Duration) -> Result<Value, AdapterError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .header("X-Plex-Token", &self.token)
            .header("Accept", "application/json")
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

    fn parse_session(&self, item: &Value) -> Option<ActiveStream> {
        let session_id = item["Session"]["id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| item["sessionKey"].as_str().map(str::to_string))?;
        let user_name = item["User"]["title"].as_str()?.to_string();

        let media_kind = item["type"]
            .as_str()
            .and_then(MediaKind::parse)
            .unwrap_or_default();

        let player = &item["Player"];
        let reported = player["address"].as_str().map(strip_port);
        let forwarded = player["remotePublicAddress"].as_str().map(strip_port);
        let ip_address = if self.trust_proxy {
            forwarded.or(reported)
        } else {
            reported.or(forwarded)
        };

        let progress_ms = item["viewOffset"].as_i64().unwrap_or(0);
        let now = Utc::now();

        let media = &item["Media"][0];
        let part = &media["Part"][0];

        let mut subtitle_codec = None;
        let mut dynamic_range = None;
        if let Some(streams) = part["Stream"].as_array() {
            for stream in streams {
                match stream["streamType"].as_i64() {
                    Some(1) if dynamic_range.is_none() => {
                        dynamic_range = if stream["DOVIPresent"].as_bool().unwrap_or(false) {
                            Some("Dolby Vision".to_string())
                        } else if stream["colorTrc"].as_str() == Some("smpte2084") {
                            Some("HDR10".to_string())
                        } else {
                            Some("SDR".to_string())
                        };
                    }
                    Some(3) if subtitle_codec.is_none() => {
                        subtitle_codec = stream["codec"].as_str().map(str::to_string);
                    }
                    _ => {}
                }
            }
        }

        let transcode = &item["TranscodeSession"];
        let transcode_decision = if transcode.is_object() {
            TranscodeDecision::from_parts(
                transcode["videoDecision"].as_str(),
                transcode["audioDecision"].as_str(),
            )
        } else {
            TranscodeDecision::DirectPlay
        };

        Some(ActiveStream {
            backend_id: self.name.clone(),
            session_id,
            user_name,
            media_kind,
            title: item["title"].as_str().unwrap_or_default().to_string(),
            parent_title: item["parentTitle"].as_str().map(str::to_string),
            grandparent_title: item["grandparentTitle"].as_str().map(str::to_string),
            year: item["year"].as_i64().map(|y| y as i32),
            item_id: item["ratingKey"].as_str().map(str::to_string),
            grandparent_item_id: item["grandparentRatingKey"].as_str().map(str::to_string),
            duration_ms: item["duration"].as_i64(),
            progress_ms,
            paused: player["state"].as_str() == Some("paused"),
            player: player["title"].as_str().unwrap_or("unknown").to_string(),
            platform: player["platform"].as_str().unwrap_or("unknown").to_string(),
            ip_address,
            started_at: projected_start(now, progress_ms),
            video_codec: media["videoCodec"].as_str().map(str::to_string),
            audio_codec: media["audioCodec"].as_str().map(str::to_string),
            resolution: media["height"].as_i64().and_then(resolution_label),
            container: media["container"].as_str().map(str::to_string),
            bitrate_kbps: media["bitrate"].as_i64(),
            audio_channels: media["audioChannels"].as_i64().map(|c| c as i32),
            subtitle_codec,
            dynamic_range,
            transcode_decision,
            hw_decode: transcode["transcodeHwDecoding"].as_bool().unwrap_or(false),
            hw_encode: transcode["transcodeHwEncoding"].as_bool().unwrap_or(false),
            transcode_progress: transcode["progress"].as_f64(),
        })
    }
}

#[async_trait]
impl MediaBackend for PlexAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Plex
    }

    async fn get_sessions(&self, deadline: Duration) -> Result<Vec<ActiveStream>, AdapterError> {
        let body = self.get_json("/status/sessions", deadline).await?;

        let Some(items) = body["MediaContainer"]["Metadata"].as_array() else {
            // An idle server omits the Metadata array entirely.
            return Ok(Vec::new());
        };

        let mut sessions = Vec::with_capacity(items.len());
        for item in items {
            match self.parse_session(item) {
                Some(stream) => sessions.push(stream),
                None => debug!(backend = %self.name, "skipping session without id or user"),
            }
        }
        Ok(sessions)
    }

    async fn test_connection(&self, deadline: Duration) -> Result<(), AdapterError> {
        self.get_json("/identity", deadline).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter(trust_proxy: bool) -> PlexAdapter {
        PlexAdapter::new(&BackendConfig {
            id: "plex-main".into(),
            kind: BackendKind::Plex,
            base_url: "http://localhost:32400".into(),
            token: "token".into(),
            trust_proxy,
            enabled: true,
        })
    }

    fn sample_session() -> Value {
        json!({
            "sessionKey": "42",
            "Session": { "id": "abc123", "bandwidth": 12000 },
            "type": "episode",
            "title": "Pilot",
            "parentTitle": "Season 1",
            "grandparentTitle": "Some Show",
            "year": 2020,
            "ratingKey": "1001",
            "grandparentRatingKey": "900",
            "duration": 2_700_000,
            "viewOffset": 600_000,
            "User": { "title": "alice" },
            "Player": {
                "title": "Living Room TV",
                "platform": "Roku",
                "state": "playing",
                "address": "10.0.0.5",
                "remotePublicAddress": "203.0.113.9"
            },
            "Media": [{
                "videoCodec": "hevc",
                "audioCodec": "eac3",
                "height": 2160,
                "container": "mkv",
                "bitrate": 24000,
                "audioChannels": 6,
                "Part": [{
                    "Stream": [
                        { "streamType": 1, "codec": "hevc", "colorTrc": "smpte2084" },
                        { "streamType": 2, "codec": "eac3" },
                        { "streamType": 3, "codec": "srt" }
                    ]
                }]
            }],
            "TranscodeSession": {
                "videoDecision": "copy",
                "audioDecision": "transcode",
                "transcodeHwDecoding": true,
                "transcodeHwEncoding": false,
                "progress": 43.5
            }
        })
    }

    #[test]
    fn parses_full_session() {
        let stream = adapter(false).parse_session(&sample_session()).unwrap();

        assert_eq!(stream.session_id, "abc123");
        assert_eq!(stream.user_name, "alice");
        assert_eq!(stream.media_kind, MediaKind::Episode);
        assert_eq!(stream.grandparent_title.as_deref(), Some("Some Show"));
        assert_eq!(stream.resolution.as_deref(), Some("4K"));
        assert_eq!(stream.subtitle_codec.as_deref(), Some("srt"));
        assert_eq!(stream.dynamic_range.as_deref(), Some("HDR10"));
        assert_eq!(stream.transcode_decision, TranscodeDecision::Copy);
        assert!(stream.hw_decode);
        assert!(!stream.hw_encode);
        assert_eq!(stream.ip_address.as_deref(), Some("10.0.0.5"));
        assert!(!stream.paused);
    }

    #[test]
    fn trust_proxy_prefers_forwarded_address() {
        let stream = adapter(true).parse_session(&sample_session()).unwrap();
        assert_eq!(stream.ip_address.as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn direct_play_without_transcode_session() {
        let mut session = sample_session();
        session.as_object_mut().unwrap().remove("TranscodeSession");

        let stream = adapter(false).parse_session(&session).unwrap();
        assert_eq!(stream.transcode_decision, TranscodeDecision::DirectPlay);
        assert!(!stream.hw_decode);
    }

    #[test]
    fn session_without_user_is_skipped() {
        let mut session = sample_session();
        session.as_object_mut().unwrap().remove("User");
        assert!(adapter(false).parse_session(&session).is_none());
    }
}
