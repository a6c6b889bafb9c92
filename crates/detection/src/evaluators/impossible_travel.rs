use crate::context::EvalContext;
use crate::evaluators::{violation, RuleEvaluator};
use crate::types::ImpossibleTravelConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::geo::{haversine_km, GeoResult};
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;

/// Flags a stream whose location implies the user travelled faster than
/// physically possible since their previous stream.
pub struct ImpossibleTravelEvaluator;

struct PreviousFix {
    geo: GeoResult,
    at: DateTime<Utc>,
    ip: String,
}

impl ImpossibleTravelEvaluator {
    /// The user's most recent known position before this stream
    /// started: the last completed viewing in the window, or an already
    /// active stream that started earlier.
    async fn previous_fix(
        stream: &ActiveStream,
        ctx: &EvalContext,
        window_hours: f64,
    ) -> Result<Option<PreviousFix>> {
        let mut best: Option<PreviousFix> = None;

        if let Some(last) = ctx
            .store
            .get_last_stream_before(&stream.user_name, stream.started_at, window_hours)
            .await?
        {
            if let Some(ip) = last.ip_address.clone() {
                if ip != stream.ip_address.clone().unwrap_or_default() {
                    if let Some(geo) = ctx.store.get_cached_geo(&ip).await? {
                        if geo.has_coordinates() {
                            best = Some(PreviousFix {
                                geo,
                                at: last.stopped_at,
                                ip,
                            });
                        }
                    }
                }
            }
        }

        for other in ctx.snapshot.streams_for_user(&stream.user_name) {
            if other.session_id == stream.session_id && other.backend_id == stream.backend_id {
                continue;
            }
            if other.started_at >= stream.started_at {
                continue;
            }
            let Some(ip) = other.ip_address.clone() else {
                continue;
            };
            if Some(ip.as_str()) == stream.ip_address.as_deref() {
                continue;
            }
            let Some(geo) = ctx.geo_by_ip.get(&ip).cloned() else {
                continue;
            };
            if !geo.has_coordinates() {
                continue;
            }
            if best.as_ref().map(|b| other.started_at > b.at).unwrap_or(true) {
                best = Some(PreviousFix {
                    geo,
                    at: other.started_at,
                    ip,
                });
            }
        }

        Ok(best)
    }
}

#[async_trait]
impl RuleEvaluator for ImpossibleTravelEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::ImpossibleTravel
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>> {
        let config: ImpossibleTravelConfig = serde_json::from_value(rule.config_json.clone())
            .context("invalid impossible_travel config")?;
        config.validate()?;

        let Some(current) = ctx.geo.as_ref().filter(|g| g.has_coordinates()) else {
            return Ok(None);
        };

        let Some(previous) =
            Self::previous_fix(stream, ctx, config.time_window_hours).await?
        else {
            return Ok(None);
        };

        let Some(distance_km) =
            haversine_km(previous.geo.lat, previous.geo.lng, current.lat, current.lng)
        else {
            return Ok(None);
        };
        if distance_km < config.min_distance_km {
            return Ok(None);
        }

        let delta_hours = (stream.started_at - previous.at).num_seconds() as f64 / 3600.0;
        if delta_hours <= 0.0 {
            // Overlapping sessions are the simultaneous-locations
            // rule's concern.
            return Ok(None);
        }

        let speed_km_h = distance_km / delta_hours;
        if speed_km_h <= config.max_speed_km_h {
            return Ok(None);
        }

        let confidence =
            (50.0 + (speed_km_h - config.max_speed_km_h) * 0.1).clamp(50.0, 100.0) as u8;

        let mut v = violation(
            rule,
            stream,
            Severity::Critical,
            format!(
                "{} appeared {:.0} km away after {:.1} h (implied speed {:.0} km/h)",
                stream.user_name, distance_km, delta_hours, speed_km_h
            ),
            confidence,
        );
        v.details
            .insert("distance_km".into(), (distance_km.round() as i64).into());
        v.details
            .insert("speed_km_h".into(), (speed_km_h.round() as i64).into());
        v.details.insert("previous_ip".into(), previous.ip.into());
        if let Some(city) = previous.geo.city {
            v.details.insert("previous_city".into(), city.into());
        }
        if let Some(city) = current.city.clone() {
            v.details.insert("current_city".into(), city.into());
        }
        Ok(Some(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluators::testutil::{geo, history_entry, rule, stream, ContextBuilder};
    use chrono::Duration;
    use serde_json::json;

    // Mountain View, US and Sydney, AU: roughly 12 000 km apart.
    fn mountain_view(ip: &str) -> GeoResult {
        geo(ip, 37.386, -122.084, "Mountain View", "US")
    }

    fn sydney(ip: &str) -> GeoResult {
        geo(ip, -33.868, 151.209, "Sydney", "AU")
    }

    #[tokio::test]
    async fn transcontinental_hop_in_an_hour_fires() {
        // S1: completed viewing from 8.8.8.8, new stream from 1.1.1.1
        // one hour later.
        let mut s = stream("s1", "alice", "1.1.1.1");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(mountain_view("8.8.8.8"))
            .with_geo(sydney("1.1.1.1"));
        builder
            .store()
            .seed_history(history_entry(
                "alice",
                "8.8.8.8",
                s.started_at - Duration::hours(1),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        let rule = rule(
            RuleKind::ImpossibleTravel,
            json!({ "max_speed_km_h": 800, "min_distance_km": 100, "time_window_hours": 24 }),
        );
        let v = ImpossibleTravelEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(v.severity, Severity::Critical);
        assert!(v.confidence >= 90, "confidence was {}", v.confidence);
        assert!(v.details["speed_km_h"].as_i64().unwrap() > 800);
    }

    #[tokio::test]
    async fn plausible_travel_is_silent() {
        // Same coast-to-coast distance but 20 hours apart: ~600 km/h.
        let mut s = stream("s1", "alice", "1.1.1.1");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(mountain_view("8.8.8.8"))
            .with_geo(sydney("1.1.1.1"));
        builder
            .store()
            .seed_history(history_entry(
                "alice",
                "8.8.8.8",
                s.started_at - Duration::hours(20),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        let rule = rule(RuleKind::ImpossibleTravel, json!({ "time_window_hours": 48 }));
        assert!(ImpossibleTravelEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn short_distances_are_ignored() {
        let mut s = stream("s1", "alice", "198.51.100.7");
        s.started_at = Utc::now();

        let builder = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(geo("8.8.8.8", 37.386, -122.084, "Mountain View", "US"))
            .with_geo(geo("198.51.100.7", 37.77, -122.42, "San Francisco", "US"));
        builder
            .store()
            .seed_history(history_entry(
                "alice",
                "8.8.8.8",
                s.started_at - Duration::minutes(1),
                "TV",
                "Roku",
            ))
            .await;
        let ctx = builder.build(&s).await;

        // ~60 km in a minute would be absurd speed, but under the
        // 100 km floor the rule stays quiet.
        let rule = rule(RuleKind::ImpossibleTravel, json!({}));
        assert!(ImpossibleTravelEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn no_history_is_silent() {
        let s = stream("s1", "alice", "1.1.1.1");
        let ctx = ContextBuilder::new()
            .with_stream(s.clone())
            .with_geo(sydney("1.1.1.1"))
            .build(&s)
            .await;

        let rule = rule(RuleKind::ImpossibleTravel, json!({}));
        assert!(ImpossibleTravelEvaluator
            .evaluate(&rule, &s, &ctx)
            .await
            .unwrap()
            .is_none());
    }
}
