use crate::context::EvalContext;
use crate::evaluators::{violation, RuleEvaluator};
use crate::types::NewDeviceConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;

/// Informational notice the first time a (player, platform) pair shows
/// up for a user.
pub struct NewDeviceEvaluator;

#[async_trait]
impl RuleEvaluator for NewDeviceEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::NewDevice
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>> {
        let config: NewDeviceConfig = serde_json::from_value(rule.config_json.clone())
            .context("invalid new_device config")?;
        config.validate()?;

        if !config.notify_on_new {
            return Ok(None);
        }

        let used = ctx
            .store
            .has_device_been_used(
                &stream.user_name,
                &stream.player,
                &stream.platform,
                stream.started_at,
            )
            .await?;
        if used {
            return Ok(None);
        }

        let mut v = violation(
            rule,
            stream,
            Severity::Info,
            format!(
                "{} started streaming on a new device: {} ({})",
                stream.user_name, stream.player, stream.platform
            ),
            100,
        );
        v.details.insert("player".into(), stream.player.clone().into());
        v.details
            .insert("platform".into(), stream.platform.clone().into());
        Ok(Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::testutil::{history_entry, rule, stream, ContextBuilder};
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn first_use_fires_info() {
        let mut s = stream("s1", "bob", "203.0.113.9");
        s.started_at = Utc::now();

        let ctx = ContextBuilder::new().with_stream(s.clone()).build(&s).await;

        let rule = rule(RuleKind::NewDevice, json!({}));
        let v = NewDeviceEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v.severity, Severity::Info);
    }

    #[tokio::test]
    async fn known_device_is_silent() {
        let mut s = stream("s1", "bob", "203.0.113.9");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new().with_stream(s.clone());
        builder
            .store()
            .seed_history(history_entry(
                "bob",
                "203.0.113.9",
                s.started_at - Duration::days(3),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        let rule = rule(RuleKind::NewDevice, json!({}));
        assert!(NewDeviceEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn disabled_notify_is_silent() {
        let s = stream("s1", "bob", "203.0.113.9");
        let ctx = ContextBuilder::new().with_stream(s.clone()).build(&s).await;

        let rule = rule(RuleKind::NewDevice, json!({ "notify_on_new": false }));
        assert!(NewDeviceEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }
}
