use crate::types::{
    DiscordChannelConfig, NtfyChannelConfig, PushoverChannelConfig, WebhookChannelConfig,
};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use common::rules::{Channel, ChannelKind, Severity, Violation};
use futures::future::join_all;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use telemetry::metrics::NOTIFICATIONS;
use tracing::info;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// One delivery transport. Channels parse their own config blob on
/// every send, so a misconfigured channel fails in isolation.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send(&self, violation: &Violation, channel: &Channel) -> Result<()>;
    fn kind(&self) -> ChannelKind;
}

fn discord_color(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 0xFF0000,
        Severity::Warning => 0xFFA500,
        Severity::Info => 0x0000FF,
    }
}

pub struct DiscordChannel {
    client: reqwest::Client,
}

#[async_trait]
impl NotificationChannel for DiscordChannel {
    async fn send(&self, violation: &Violation, channel: &Channel) -> Result<()> {
        let config: DiscordChannelConfig = serde_json::from_value(channel.config_json.clone())
            .context("invalid discord channel config")?;

        let payload = json!({
            "embeds": [{
                "title": format!("Rule Violation: {}", violation.rule_name),
                "description": violation.message,
                "color": discord_color(violation.severity),
                "fields": [
                    { "name": "User", "value": violation.user_name, "inline": true },
                    { "name": "Severity", "value": violation.severity.to_string(), "inline": true },
                    { "name": "Confidence", "value": format!("{}%", violation.confidence), "inline": true }
                ],
                "timestamp": violation.occurred_at.to_rfc3339(),
            }]
        });

        let response = self
            .client
            .post(&config.webhook_url)
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            bail!("discord webhook returned {}", response.status());
        }
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Discord
    }
}

pub struct WebhookChannel {
    client: reqwest::Client,
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    async fn send(&self, violation: &Violation, channel: &Channel) -> Result<()> {
        let config: WebhookChannelConfig = serde_json::from_value(channel.config_json.clone())
            .context("invalid webhook channel config")?;

        let method: reqwest::Method = config
            .method
            .as_deref()
            .unwrap_or("POST")
            .parse()
            .context("invalid HTTP method")?;

        let payload = json!({
            "event": "rule_violation",
            "rule_id": violation.rule_id,
            "rule_name": violation.rule_name,
            "user_name": violation.user_name,
            "severity": violation.severity,
            "message": violation.message,
            "confidence": violation.confidence,
            "details": violation.details,
            "occurred_at": violation.occurred_at,
        });

        let mut request = self.client.request(method, &config.url).json(&payload);
        if let Some(headers) = &config.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            bail!("webhook returned {}", response.status());
        }
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Webhook
    }
}

pub struct PushoverChannel {
    client: reqwest::Client,
}

const PUSHOVER_API: &str = "https://api.pushover.net/1/messages.json";

#[async_trait]
impl NotificationChannel for PushoverChannel {
    async fn send(&self, violation: &Violation, channel: &Channel) -> Result<()> {
        let config: PushoverChannelConfig = serde_json::from_value(channel.config_json.clone())
            .context("invalid pushover channel config")?;

        let priority = match violation.severity {
            Severity::Critical => 2,
            Severity::Warning => 1,
            Severity::Info => 0,
        };

        let mut form = vec![
            ("token".to_string(), config.token),
            ("user".to_string(), config.user_key),
            (
                "title".to_string(),
                format!("StreamMon: {}", violation.rule_name),
            ),
            ("message".to_string(), violation.message.clone()),
            ("priority".to_string(), priority.to_string()),
        ];
        if priority == 2 {
            // Emergency priority requires a retry cadence.
            form.push(("retry".to_string(), "60".to_string()));
            form.push(("expire".to_string(), "3600".to_string()));
        }

        let response = self.client.post(PUSHOVER_API).form(&form).send().await?;
        if !response.status().is_success() {
            bail!("pushover returned {}", response.status());
        }
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Pushover
    }
}

pub struct NtfyChannel {
    client: reqwest::Client,
}

#[async_trait]
impl NotificationChannel for NtfyChannel {
    async fn send(&self, violation: &Violation, channel: &Channel) -> Result<()> {
        let config: NtfyChannelConfig = serde_json::from_value(channel.config_json.clone())
            .context("invalid ntfy channel config")?;

        let priority = match violation.severity {
            Severity::Critical => "urgent",
            Severity::Warning => "high",
            Severity::Info => "default",
        };

        let url = format!("{}/{}", config.url.trim_end_matches('/'), config.topic);
        let mut request = self
            .client
            .post(&url)
            .header("Title", format!("Rule Violation: {}", violation.rule_name))
            .header("Priority", priority)
            .body(violation.message.clone());
        if let Some(token) = &config.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            bail!("ntfy returned {}", response.status());
        }
        Ok(())
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Ntfy
    }
}

/// Fans a violation out to every linked channel in parallel. No retries
/// here; a failed channel is reported in the aggregated error and left
/// to the operator.
pub struct Notifier {
    channels: HashMap<ChannelKind, Arc<dyn NotificationChannel>>,
}

impl Notifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .unwrap_or_default();

        let transports: Vec<Arc<dyn NotificationChannel>> = vec![
            Arc::new(DiscordChannel {
                client: client.clone(),
            }),
            Arc::new(WebhookChannel {
                client: client.clone(),
            }),
            Arc::new(PushoverChannel {
                client: client.clone(),
            }),
            Arc::new(NtfyChannel { client }),
        ];

        Self {
            channels: transports.into_iter().map(|t| (t.kind(), t)).collect(),
        }
    }

    /// Deliver to every enabled channel in parallel. Returns an error
    /// naming each channel that failed; successful deliveries stand.
    pub async fn notify(&self, violation: &Violation, channels: &[Channel]) -> Result<()> {
        let attempts = channels.iter().filter(|c| c.enabled).map(|channel| {
            let transport = self.channels.get(&channel.kind).cloned();
            async move {
                let result = match transport {
                    Some(transport) => transport.send(violation, channel).await,
                    None => Err(anyhow::anyhow!("no transport for {}", channel.kind)),
                };
                (channel, result)
            }
        });

        let mut failures = Vec::new();
        for (channel, result) in join_all(attempts).await {
            let kind = channel.kind.to_string();
            match result {
                Ok(()) => {
                    NOTIFICATIONS.with_label_values(&[&kind, "sent"]).inc();
                    info!(
                        channel = %channel.name,
                        kind = %kind,
                        user = %violation.user_name,
                        "notification sent"
                    );
                }
                Err(e) => {
                    NOTIFICATIONS.with_label_values(&[&kind, "failed"]).inc();
                    failures.push(format!("{}: {}", channel.name, e));
                }
            }
        }

        if !failures.is_empty() {
            bail!("delivery failed for {}", failures.join("; "));
        }
        Ok(())
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;
    use common::streams::SessionKey;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use uuid::Uuid;

    type Captured = Arc<Mutex<Vec<serde_json::Value>>>;

    async fn capture(State(seen): State<Captured>, body: String) -> &'static str {
        let value = serde_json::from_str(&body).unwrap_or(serde_json::Value::String(body));
        seen.lock().unwrap().push(value);
        "ok"
    }

    async fn spawn_receiver() -> (SocketAddr, Captured) {
        let seen: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hook", post(capture))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, seen)
    }

    fn violation() -> Violation {
        Violation {
            rule_id: Uuid::new_v4(),
            rule_name: "concurrent streams".into(),
            user_name: "bob".into(),
            severity: Severity::Warning,
            message: "bob has 3 concurrent streams (limit 2)".into(),
            details: HashMap::new(),
            confidence: 100,
            occurred_at: Utc::now(),
            session_key: Some(SessionKey::new("b1", "s1")),
        }
    }

    fn webhook_channel(url: String) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            name: "ops hook".into(),
            kind: ChannelKind::Webhook,
            enabled: true,
            config_json: json!({ "url": url }),
        }
    }

    #[tokio::test]
    async fn webhook_delivers_payload() {
        let (addr, seen) = spawn_receiver().await;
        let notifier = Notifier::new();

        notifier
            .notify(
                &violation(),
                &[webhook_channel(format!("http://{}/hook", addr))],
            )
            .await
            .unwrap();

        let captured = seen.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0]["event"], "rule_violation");
        assert_eq!(captured[0]["user_name"], "bob");
        assert_eq!(captured[0]["severity"], "warning");
    }

    #[tokio::test]
    async fn failures_are_aggregated_without_blocking_others() {
        let (addr, seen) = spawn_receiver().await;
        let notifier = Notifier::new();

        let good = webhook_channel(format!("http://{}/hook", addr));
        let mut bad = webhook_channel(format!("http://{}/missing", addr));
        bad.name = "broken hook".into();

        let err = notifier
            .notify(&violation(), &[good, bad])
            .await
            .unwrap_err();

        assert!(err.to_string().contains("broken hook"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_channels_are_skipped() {
        let (addr, seen) = spawn_receiver().await;
        let notifier = Notifier::new();

        let mut channel = webhook_channel(format!("http://{}/hook", addr));
        channel.enabled = false;

        notifier.notify(&violation(), &[channel]).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn notify_is_at_least_once_per_call() {
        let (addr, seen) = spawn_receiver().await;
        let notifier = Notifier::new();
        let channels = [webhook_channel(format!("http://{}/hook", addr))];

        let v = violation();
        notifier.notify(&v, &channels).await.unwrap();
        notifier.notify(&v, &channels).await.unwrap();

        // Duplicate suppression is the dedup layer's job, not ours.
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
