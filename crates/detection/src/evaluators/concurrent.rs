use crate::context::EvalContext;
use crate::evaluators::{violation, RuleEvaluator};
use crate::types::ConcurrentConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;
use std::collections::HashSet;

/// Flags users running more simultaneous streams than the rule allows,
/// counted across all backends.
pub struct ConcurrentEvaluator;

#[async_trait]
impl RuleEvaluator for ConcurrentEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::Concurrent
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>> {
        let config: ConcurrentConfig = serde_json::from_value(rule.config_json.clone())
            .context("invalid concurrent config")?;
        config.validate()?;

        if config.exempt_household && ctx.is_household_ip(stream.ip_address.as_deref()) {
            return Ok(None);
        }

        let user_streams: Vec<&ActiveStream> =
            ctx.snapshot.streams_for_user(&stream.user_name).collect();

        let count = if config.count_paused_as_one {
            let playing = user_streams.iter().filter(|s| !s.paused).count();
            let paused_groups: HashSet<(&str, Option<&str>)> = user_streams
                .iter()
                .filter(|s| s.paused)
                .map(|s| (s.player.as_str(), s.ip_address.as_deref()))
                .collect();
            playing + paused_groups.len()
        } else {
            user_streams.len()
        };

        if count <= config.max_streams as usize {
            return Ok(None);
        }

        // Attribute the violation to the newest session only, so one
        // over-limit user yields one violation per tick rather than one
        // per stream.
        let newest = user_streams
            .iter()
            .max_by(|a, b| {
                a.started_at
                    .cmp(&b.started_at)
                    .then_with(|| a.session_id.cmp(&b.session_id))
            })
            .map(|s| (s.backend_id.as_str(), s.session_id.as_str()));
        if newest != Some((stream.backend_id.as_str(), stream.session_id.as_str())) {
            return Ok(None);
        }

        let mut v = violation(
            rule,
            stream,
            Severity::Warning,
            format!(
                "{} has {} concurrent streams (limit {})",
                stream.user_name, count, config.max_streams
            ),
            100,
        );
        v.details.insert("stream_count".into(), count.into());
        v.details
            .insert("max_streams".into(), config.max_streams.into());
        v.details.insert(
            "backends".into(),
            user_streams
                .iter()
                .map(|s| s.backend_id.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect::<Vec<_>>()
                .into(),
        );
        Ok(Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::testutil::{household, rule, stream, ContextBuilder};
    use serde_json::json;

    #[tokio::test]
    async fn fires_above_limit_across_backends() {
        // S2: two streams on backend A, one on backend B, limit 2.
        use chrono::Duration;

        let mut s1 = stream("s1", "bob", "203.0.113.9");
        s1.started_at = chrono::Utc::now() - Duration::minutes(30);
        let mut s2 = stream("s2", "bob", "203.0.113.9");
        s2.started_at = chrono::Utc::now() - Duration::minutes(10);
        let mut s3 = stream("s3", "bob", "198.51.100.7");
        s3.backend_id = "emby-main".into();
        s3.started_at = chrono::Utc::now();

        let ctx = ContextBuilder::new()
            .with_stream(s1.clone())
            .with_stream(s2)
            .with_stream(s3.clone())
            .build(&s3)
            .await;

        let rule = rule(RuleKind::Concurrent, json!({ "max_streams": 2 }));

        // Only the newest session carries the violation.
        assert!(ConcurrentEvaluator
            .evaluate(&rule, &s1, &ctx)
            .await
            .unwrap()
            .is_none());

        let result = ConcurrentEvaluator
            .evaluate(&rule, &s3, &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.severity, Severity::Warning);
        assert_eq!(result.confidence, 100);
        assert_eq!(result.details["stream_count"], json!(3));
    }

    #[tokio::test]
    async fn within_limit_is_silent() {
        let s1 = stream("s1", "bob", "203.0.113.9");
        let s2 = stream("s2", "bob", "203.0.113.9");

        let ctx = ContextBuilder::new()
            .with_stream(s1.clone())
            .with_stream(s2)
            .build(&s1)
            .await;

        let rule = rule(RuleKind::Concurrent, json!({ "max_streams": 2 }));
        assert!(ConcurrentEvaluator
            .evaluate(&rule, &s1, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn paused_streams_collapse_when_configured() {
        let s1 = stream("s1", "bob", "203.0.113.9");
        let mut s2 = stream("s2", "bob", "203.0.113.9");
        s2.paused = true;
        let mut s3 = stream("s3", "bob", "203.0.113.9");
        s3.paused = true;

        let ctx = ContextBuilder::new()
            .with_stream(s1.clone())
            .with_stream(s2)
            .with_stream(s3)
            .build(&s1)
            .await;

        let rule = rule(
            RuleKind::Concurrent,
            json!({ "max_streams": 2, "count_paused_as_one": true }),
        );
        // Two paused streams on the same player/IP collapse to one:
        // 1 playing + 1 paused group = 2, within the limit.
        assert!(ConcurrentEvaluator
            .evaluate(&rule, &s1, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn household_ip_is_exempt() {
        let s1 = stream("s1", "carol", "192.0.2.1");
        let s2 = stream("s2", "carol", "192.0.2.1");
        let s3 = stream("s3", "carol", "192.0.2.1");

        let ctx = ContextBuilder::new()
            .with_stream(s1.clone())
            .with_stream(s2)
            .with_stream(s3)
            .with_household(household("carol", "192.0.2.1", "Paris"))
            .build(&s1)
            .await;

        let rule = rule(
            RuleKind::Concurrent,
            json!({ "max_streams": 2, "exempt_household": true }),
        );
        assert!(ConcurrentEvaluator
            .evaluate(&rule, &s1, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn bad_config_is_an_error() {
        let s1 = stream("s1", "bob", "203.0.113.9");
        let ctx = ContextBuilder::new().with_stream(s1.clone()).build(&s1).await;

        let rule = rule(RuleKind::Concurrent, json!({ "max_streams": 0 }));
        assert!(ConcurrentEvaluator.evaluate(&rule, &s1, &ctx).await.is_err());
    }
}
