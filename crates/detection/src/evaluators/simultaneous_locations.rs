use crate::context::EvalContext;
use crate::evaluators::{violation, RuleEvaluator};
use crate::types::SimultaneousLocationsConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::geo::haversine_km;
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;

/// Flags a user streaming concurrently from places far enough apart
/// that one person cannot be in both.
pub struct SimultaneousLocationsEvaluator;

#[async_trait]
impl RuleEvaluator for SimultaneousLocationsEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::SimultaneousLocations
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>> {
        let config: SimultaneousLocationsConfig = serde_json::from_value(rule.config_json.clone())
            .context("invalid simultaneous_locations config")?;
        config.validate()?;

        if config.exempt_household && ctx.is_household_ip(stream.ip_address.as_deref()) {
            return Ok(None);
        }

        let Some(current) = ctx.geo.as_ref().filter(|g| g.has_coordinates()) else {
            return Ok(None);
        };

        for other in ctx.snapshot.streams_for_user(&stream.user_name) {
            if other.session_id == stream.session_id && other.backend_id == stream.backend_id {
                continue;
            }
            let Some(other_ip) = other.ip_address.as_deref() else {
                continue;
            };
            if Some(other_ip) == stream.ip_address.as_deref() {
                continue;
            }
            let Some(other_geo) = ctx.geo_by_ip.get(other_ip) else {
                continue;
            };
            let Some(distance_km) =
                haversine_km(current.lat, current.lng, other_geo.lat, other_geo.lng)
            else {
                continue;
            };

            if distance_km >= config.min_distance_km {
                let mut v = violation(
                    rule,
                    stream,
                    Severity::Critical,
                    format!(
                        "{} is streaming from two locations {:.0} km apart at the same time",
                        stream.user_name, distance_km
                    ),
                    100,
                );
                v.details
                    .insert("distance_km".into(), (distance_km.round() as i64).into());
                v.details.insert("other_ip".into(), other_ip.into());
                if let Some(city) = &current.city {
                    v.details.insert("current_city".into(), city.clone().into());
                }
                if let Some(city) = &other_geo.city {
                    v.details.insert("other_city".into(), city.clone().into());
                }
                return Ok(Some(v));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::testutil::{geo, household, rule, stream, ContextBuilder};
    use serde_json::json;

    #[tokio::test]
    async fn distant_concurrent_streams_fire() {
        let s1 = stream("s1", "bob", "8.8.8.8");
        let mut s2 = stream("s2", "bob", "1.1.1.1");
        s2.backend_id = "emby-main".into();

        let ctx = ContextBuilder::new()
            .with_stream(s1.clone())
            .with_stream(s2)
            .with_geo(geo("8.8.8.8", 37.386, -122.084, "Mountain View", "US"))
            .with_geo(geo("1.1.1.1", -33.868, 151.209, "Sydney", "AU"))
            .build(&s1)
            .await;

        let rule = rule(
            RuleKind::SimultaneousLocations,
            json!({ "min_distance_km": 500 }),
        );
        let v = SimultaneousLocationsEvaluator
            .evaluate(&rule, &s1, &ctx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(v.severity, Severity::Critical);
        assert!(v.details["distance_km"].as_i64().unwrap() > 10_000);
    }

    #[tokio::test]
    async fn nearby_streams_are_silent() {
        let s1 = stream("s1", "bob", "8.8.8.8");
        let s2 = stream("s2", "bob", "198.51.100.7");

        let ctx = ContextBuilder::new()
            .with_stream(s1.clone())
            .with_stream(s2)
            .with_geo(geo("8.8.8.8", 37.386, -122.084, "Mountain View", "US"))
            .with_geo(geo("198.51.100.7", 37.77, -122.42, "San Francisco", "US"))
            .build(&s1)
            .await;

        let rule = rule(
            RuleKind::SimultaneousLocations,
            json!({ "min_distance_km": 500 }),
        );
        assert!(SimultaneousLocationsEvaluator
            .evaluate(&rule, &s1, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn household_ip_is_exempt() {
        let s1 = stream("s1", "carol", "192.0.2.1");
        let s2 = stream("s2", "carol", "1.1.1.1");

        let ctx = ContextBuilder::new()
            .with_stream(s1.clone())
            .with_stream(s2)
            .with_geo(geo("192.0.2.1", 48.85, 2.35, "Paris", "FR"))
            .with_geo(geo("1.1.1.1", -33.868, 151.209, "Sydney", "AU"))
            .with_household(household("carol", "192.0.2.1", "Paris"))
            .build(&s1)
            .await;

        let rule = rule(
            RuleKind::SimultaneousLocations,
            json!({ "min_distance_km": 500, "exempt_household": true }),
        );
        assert!(SimultaneousLocationsEvaluator
            .evaluate(&rule, &s1, &ctx)
            .await
            .unwrap()
            .is_none());
    }
}
