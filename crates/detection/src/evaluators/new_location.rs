use crate::context::EvalContext;
use crate::evaluators::{violation, RuleEvaluator};
use crate::types::NewLocationConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::geo::haversine_km;
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;

const HISTORICAL_IP_LIMIT: i64 = 100;

/// Flags streams from a location far from everywhere the user has
/// streamed before. Severity scales with how far away the nearest
/// known location is.
pub struct NewLocationEvaluator;

#[async_trait]
impl RuleEvaluator for NewLocationEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::NewLocation
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>> {
        let config: NewLocationConfig = serde_json::from_value(rule.config_json.clone())
            .context("invalid new_location config")?;
        config.validate()?;

        if !config.notify_on_new {
            return Ok(None);
        }
        if config.exempt_household && ctx.is_household_ip(stream.ip_address.as_deref()) {
            return Ok(None);
        }

        let Some(current) = ctx.geo.as_ref().filter(|g| g.has_coordinates()) else {
            return Ok(None);
        };
        let Some(current_ip) = stream.ip_address.as_deref() else {
            return Ok(None);
        };

        let historical_ips = ctx
            .store
            .get_user_distinct_ips(&stream.user_name, stream.started_at, HISTORICAL_IP_LIMIT)
            .await?;
        if historical_ips.iter().any(|ip| ip == current_ip) {
            return Ok(None);
        }

        let mut min_distance_km: Option<f64> = None;
        for ip in &historical_ips {
            let Some(geo) = ctx.store.get_cached_geo(ip).await? else {
                continue;
            };
            let Some(distance) = haversine_km(current.lat, current.lng, geo.lat, geo.lng) else {
                continue;
            };
            // Any known location nearby settles it.
            if distance < config.min_distance_km {
                return Ok(None);
            }
            min_distance_km = Some(min_distance_km.map_or(distance, |m: f64| m.min(distance)));
        }

        // A user with no resolvable history has no baseline to be far
        // away from.
        let Some(min_distance_km) = min_distance_km else {
            return Ok(None);
        };

        let severity = if min_distance_km >= config.severity_threshold_km {
            Severity::Warning
        } else {
            Severity::Info
        };

        let mut v = violation(
            rule,
            stream,
            severity,
            format!(
                "{} is streaming from a new location {:.0} km from any known one",
                stream.user_name, min_distance_km
            ),
            90,
        );
        v.details
            .insert("min_distance_km".into(), (min_distance_km.round() as i64).into());
        if let Some(city) = current.city.clone() {
            v.details.insert("city".into(), city.into());
        }
        if let Some(country) = current.country.clone() {
            v.details.insert("country".into(), country.into());
        }
        Ok(Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::testutil::{geo, history_entry, household, rule, stream, ContextBuilder};
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn far_location_fires_warning() {
        let mut s = stream("s1", "bob", "1.1.1.1");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(geo("1.1.1.1", -33.868, 151.209, "Sydney", "AU"))
            .with_geo(geo("8.8.8.8", 37.386, -122.084, "Mountain View", "US"));
        builder
            .store()
            .seed_history(history_entry(
                "bob",
                "8.8.8.8",
                s.started_at - Duration::days(2),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        let rule = rule(
            RuleKind::NewLocation,
            json!({ "min_distance_km": 100, "severity_threshold_km": 1000 }),
        );
        let v = NewLocationEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(v.severity, Severity::Warning);
        assert_eq!(v.confidence, 90);
    }

    #[tokio::test]
    async fn moderate_distance_is_info() {
        let mut s = stream("s1", "bob", "198.51.100.7");
        s.started_at = Utc::now();

        // ~130 km apart: beyond min_distance, below the threshold.
        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(geo("198.51.100.7", 38.58, -121.49, "Sacramento", "US"))
            .with_geo(geo("8.8.8.8", 37.386, -122.084, "Mountain View", "US"));
        builder
            .store()
            .seed_history(history_entry(
                "bob",
                "8.8.8.8",
                s.started_at - Duration::days(2),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        let rule = rule(
            RuleKind::NewLocation,
            json!({ "min_distance_km": 100, "severity_threshold_km": 1000 }),
        );
        let v = NewLocationEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(v.severity, Severity::Info);
    }

    #[tokio::test]
    async fn known_ip_is_silent() {
        let mut s = stream("s1", "bob", "8.8.8.8");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(geo("8.8.8.8", 37.386, -122.084, "Mountain View", "US"));
        builder
            .store()
            .seed_history(history_entry(
                "bob",
                "8.8.8.8",
                s.started_at - Duration::days(2),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        let rule = rule(RuleKind::NewLocation, json!({}));
        assert!(NewLocationEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn nearby_history_early_exits() {
        let mut s = stream("s1", "bob", "198.51.100.7");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(geo("198.51.100.7", 37.77, -122.42, "San Francisco", "US"))
            .with_geo(geo("8.8.8.8", 37.386, -122.084, "Mountain View", "US"));
        builder
            .store()
            .seed_history(history_entry(
                "bob",
                "8.8.8.8",
                s.started_at - Duration::days(2),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        let rule = rule(RuleKind::NewLocation, json!({ "min_distance_km": 100 }));
        assert!(NewLocationEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn household_ip_is_exempt() {
        // S4: carol's trusted household includes the stream's IP.
        let mut s = stream("s1", "carol", "192.0.2.1");
        s.started_at = Utc::now();

        let ctx = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(geo("192.0.2.1", 48.85, 2.35, "Paris", "FR"))
            .with_household(household("carol", "192.0.2.1", "Paris"))
            .build(&s)
            .await;

        let rule = rule(RuleKind::NewLocation, json!({ "exempt_household": true }));
        assert!(NewLocationEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }
}
