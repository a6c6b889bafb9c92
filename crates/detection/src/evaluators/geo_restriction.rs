use crate::context::EvalContext;
use crate::evaluators::{violation, RuleEvaluator};
use crate::types::GeoRestrictionConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;

/// Flags streams originating from blocked countries, or from outside an
/// allow-list when one is configured. Skips streams without a
/// resolvable country.
pub struct GeoRestrictionEvaluator;

fn contains_country(list: &[String], country: &str) -> bool {
    list.iter().any(|c| c.eq_ignore_ascii_case(country))
}

#[async_trait]
impl RuleEvaluator for GeoRestrictionEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::GeoRestriction
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>> {
        let config: GeoRestrictionConfig = serde_json::from_value(rule.config_json.clone())
            .context("invalid geo_restriction config")?;
        config.validate()?;

        if config.exempt_household && ctx.is_household_ip(stream.ip_address.as_deref()) {
            return Ok(None);
        }

        let Some(country) = ctx.geo.as_ref().and_then(|g| g.country.as_deref()) else {
            return Ok(None);
        };

        let blocked = !config.blocked_countries.is_empty()
            && contains_country(&config.blocked_countries, country);
        let outside_allowed = !blocked
            && !config.allowed_countries.is_empty()
            && !contains_country(&config.allowed_countries, country);

        if !blocked && !outside_allowed {
            return Ok(None);
        }

        let reason = if blocked {
            format!("country {} is blocked", country)
        } else {
            format!("country {} is not in the allowed list", country)
        };
        let mut v = violation(
            rule,
            stream,
            Severity::Warning,
            format!("{} is streaming from a restricted location: {}", stream.user_name, reason),
            100,
        );
        v.details.insert("country".into(), country.into());
        if let Some(city) = ctx.geo.as_ref().and_then(|g| g.city.clone()) {
            v.details.insert("city".into(), city.into());
        }
        Ok(Some(v))
    }
}
