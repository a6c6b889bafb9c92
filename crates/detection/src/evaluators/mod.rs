pub mod concurrent;
pub mod device_velocity;
pub mod geo_restriction;
pub mod impossible_travel;
pub mod isp_velocity;
pub mod new_device;
pub mod new_location;
pub mod simultaneous_locations;

use crate::context::EvalContext;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use common::rules::{Rule, RuleKind, Severity, Violation};
use common::streams::ActiveStream;
use std::collections::HashMap;
use std::sync::Arc;

/// One rule kind's detection logic. Evaluators are pure with respect to
/// the store (read-only access through the context) and safe to call
/// concurrently across distinct streams.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    fn kind(&self) -> RuleKind;

    /// Produce at most one violation for this stream under this rule.
    /// A config that fails to parse or validate is an error; the engine
    /// quarantines the rule until the next reload.
    async fn evaluate(
        &self,
        rule: &Rule,
        stream: &ActiveStream,
        ctx: &EvalContext,
    ) -> Result<Option<Violation>>;
}

/// The full evaluator registry, keyed by rule kind.
pub fn builtin_evaluators() -> HashMap<RuleKind, Arc<dyn RuleEvaluator>> {
    let evaluators: Vec<Arc<dyn RuleEvaluator>> = vec![
        Arc::new(concurrent::ConcurrentEvaluator),
        Arc::new(geo_restriction::GeoRestrictionEvaluator),
        Arc::new(impossible_travel::ImpossibleTravelEvaluator),
        Arc::new(simultaneous_locations::SimultaneousLocationsEvaluator),
        Arc::new(device_velocity::DeviceVelocityEvaluator),
        Arc::new(isp_velocity::IspVelocityEvaluator),
        Arc::new(new_device::NewDeviceEvaluator),
        Arc::new(new_location::NewLocationEvaluator),
    ];

    evaluators.into_iter().map(|e| (e.kind(), e)).collect()
}

/// Violation scaffold shared by all evaluators. `occurred_at` is
/// overwritten at sink entry.
pub(crate) fn violation(
    rule: &Rule,
    stream: &ActiveStream,
    severity: Severity,
    message: String,
    confidence: u8,
) -> Violation {
    Violation {
        rule_id: rule.id,
        rule_name: rule.name.clone(),
        user_name: stream.user_name.clone(),
        severity,
        message,
        details: HashMap::new(),
        confidence: confidence.min(100),
        occurred_at: Utc::now(),
        session_key: Some(stream.session_key()),
    }
}
