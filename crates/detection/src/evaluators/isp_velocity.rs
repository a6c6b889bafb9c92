use crate::context::EvalContext;
use crate::evaluators::{violation, RuleEvaluator};
use crate::types::IspVelocityConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;

/// Flags users hopping across more ISPs in the window than the rule
/// allows. ISPs come from cached geo lookups of historical IPs.
pub struct IspVelocityEvaluator;

#[async_trait]
impl RuleEvaluator for IspVelocityEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::IspVelocity
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>> {
        let config: IspVelocityConfig = serde_json::from_value(rule.config_json.clone())
            .context("invalid isp_velocity config")?;
        config.validate()?;

        let isps = ctx
            .store
            .get_recent_isps(&stream.user_name, stream.started_at, config.time_window_hours)
            .await?;

        let current_isp = ctx.geo.as_ref().and_then(|g| g.isp.clone());
        let count = match &current_isp {
            Some(isp) if !isps.contains(isp) => isps.len() + 1,
            _ => isps.len(),
        };

        if count <= config.max_isps as usize {
            return Ok(None);
        }

        let mut v = violation(
            rule,
            stream,
            Severity::Warning,
            format!(
                "{} appeared on {} ISPs within {:.1} h (limit {})",
                stream.user_name, count, config.time_window_hours, config.max_isps
            ),
            100,
        );
        v.details.insert("isp_count".into(), count.into());
        if let Some(isp) = current_isp {
            v.details.insert("current_isp".into(), isp.into());
        }
        Ok(Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::testutil::{geo, history_entry, rule, stream, ContextBuilder};
    use chrono::{Duration, Utc};
    use common::geo::GeoResult;
    use serde_json::json;

    fn with_isp(ip: &str, isp: &str) -> GeoResult {
        let mut g = geo(ip, 37.0, -122.0, "Somewhere", "US");
        g.isp = Some(isp.into());
        g
    }

    #[tokio::test]
    async fn many_isps_fire() {
        let mut s = stream("s1", "bob", "203.0.113.9");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(with_isp("203.0.113.9", "ISP C"))
            .with_geo(with_isp("198.51.100.7", "ISP A"))
            .with_geo(with_isp("192.0.2.33", "ISP B"));
        for (i, ip) in ["198.51.100.7", "192.0.2.33"].iter().enumerate() {
            builder
                .store()
                .seed_history(history_entry(
                    "bob",
                    ip,
                    s.started_at - Duration::minutes(20 + i as i64),
                    "TV",
                    "Roku",
                ))
                .await;
        }
        let ctx = builder.build(&s).await;

        let rule = rule(
            RuleKind::IspVelocity,
            json!({ "max_isps": 2, "time_window_hours": 1 }),
        );
        let v = IspVelocityEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(v.severity, Severity::Warning);
        assert_eq!(v.details["isp_count"], json!(3));
    }

    #[tokio::test]
    async fn same_isp_is_silent() {
        let mut s = stream("s1", "bob", "203.0.113.9");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(with_isp("203.0.113.9", "ISP A"))
            .with_geo(with_isp("198.51.100.7", "ISP A"));
        builder
            .store()
            .seed_history(history_entry(
                "bob",
                "198.51.100.7",
                s.started_at - Duration::minutes(20),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        let rule = rule(RuleKind::IspVelocity, json!({ "max_isps": 1 }));
        assert!(IspVelocityEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }
}
