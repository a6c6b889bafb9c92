use crate::context::EvalContext;
use crate::evaluators::{violation, RuleEvaluator};
use crate::types::DeviceVelocityConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;

/// Flags users cycling through more distinct devices in the window than
/// the rule allows.
pub struct DeviceVelocityEvaluator;

#[async_trait]
impl RuleEvaluator for DeviceVelocityEvaluator {
    fn kind(&self) -> RuleKind {
        RuleKind::DeviceVelocity
    }

    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>> {
        let config: DeviceVelocityConfig = serde_json::from_value(rule.config_json.clone())
            .context("invalid device_velocity config")?;
        config.validate()?;

        let devices = ctx
            .store
            .get_recent_devices(&stream.user_name, stream.started_at, config.time_window_hours)
            .await?;

        let current_known = devices
            .iter()
            .any(|d| d.player == stream.player && d.platform == stream.platform);
        let count = devices.len() + usize::from(!current_known);

        if count <= config.max_devices_per_hour as usize {
            return Ok(None);
        }

        let mut v = violation(
            rule,
            stream,
            Severity::Warning,
            format!(
                "{} used {} distinct devices within {:.1} h (limit {})",
                stream.user_name, count, config.time_window_hours, config.max_devices_per_hour
            ),
            100,
        );
        v.details.insert("device_count".into(), count.into());
        v.details.insert(
            "window_hours".into(),
            serde_json::json!(config.time_window_hours),
        );
        Ok(Some(v))
    }
}
