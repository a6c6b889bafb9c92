use chrono::{DateTime, Utc};
use common::geo::GeoResult;
use common::store::{HouseholdLocation, Store};
use common::streams::Snapshot;
use std::collections::HashMap;
use std::sync::Arc;

/// Shared inputs for one stream's rule evaluations: the full snapshot,
/// pre-resolved geolocations, the user's trusted households, and
/// read-only store access for history-backed rules.
#[derive(Clone)]
pub struct EvalContext {
    pub snapshot: Arc<Snapshot>,
    /// Geolocation of the stream under evaluation, when resolvable.
    pub geo: Option<GeoResult>,
    /// Geolocations for every resolvable IP in the snapshot.
    pub geo_by_ip: Arc<HashMap<String, GeoResult>>,
    pub households: Arc<Vec<HouseholdLocation>>,
    pub store: Arc<dyn Store>,
    pub now: DateTime<Utc>,
}

impl EvalContext {
    /// Whether an IP is a trusted household location for the user this
    /// context was built for.
    pub fn is_household_ip(&self, ip: Option<&str>) -> bool {
        let Some(ip) = ip else {
            return false;
        };
        self.households.iter().any(|h| h.ip == ip)
    }
}
