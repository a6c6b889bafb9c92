use crate::geo::GeoResult;
use crate::history::WatchHistoryEntry;
use crate::rules::{Channel, Rule, Violation};
use crate::streams::BackendConfig;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A trusted (user, location) pair. Trusted locations exempt the user
/// from geographic rules whose config requests it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HouseholdLocation {
    pub user_name: String,
    pub ip: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub trusted: bool,
    pub auto_learned: bool,
    pub session_count: i32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// One distinct (player, platform) pair observed in a user's history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DeviceUse {
    pub player: String,
    pub platform: String,
}

/// Outcome of a violation insert. A duplicate key is not an error; the
/// database's unique index is the last line of dedup defense.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    DuplicateKey,
}

/// How long a cached geo lookup stays valid.
pub const GEO_CACHE_TTL_DAYS: i64 = 30;

/// The persistence contract the session pipeline and rule engine consume.
/// Implementations live in the storage crate; evaluators only ever touch
/// the read-only subset.
#[async_trait]
pub trait Store: Send + Sync {
    // Rules and channels
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>>;
    async fn list_channels_for_rule(&self, rule_id: Uuid) -> Result<Vec<Channel>>;

    // Violations
    async fn insert_violation(&self, violation: &Violation) -> Result<InsertOutcome>;

    // History reads used by evaluators
    async fn get_user_distinct_ips(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>>;
    async fn get_recent_devices(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Vec<DeviceUse>>;
    async fn get_recent_isps(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Vec<String>>;
    async fn has_device_been_used(
        &self,
        user_name: &str,
        player: &str,
        platform: &str,
        before: DateTime<Utc>,
    ) -> Result<bool>;
    async fn get_last_stream_before(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Option<WatchHistoryEntry>>;

    // Households
    #[allow(clippy::too_many_arguments)]
    async fn upsert_household_location(
        &self,
        user_name: &str,
        ip: &str,
        city: Option<&str>,
        country: Option<&str>,
        lat: Option<f64>,
        lng: Option<f64>,
        trusted: bool,
        auto_learned: bool,
    ) -> Result<HouseholdLocation>;
    /// Flag an existing household location as trusted without touching
    /// its session counter.
    async fn promote_household_location(
        &self,
        user_name: &str,
        ip: &str,
        city: Option<&str>,
        country: Option<&str>,
        auto_learned: bool,
    ) -> Result<()>;
    async fn list_trusted_households(&self, user_name: &str) -> Result<Vec<HouseholdLocation>>;

    // Watch history
    async fn insert_history(&self, entry: &WatchHistoryEntry) -> Result<()>;
    /// Merge the entry into the previous row of the same
    /// `{backend, user, title}` when the gap is at most 30 minutes.
    /// Returns true when the entry was absorbed.
    async fn consolidate_adjacent_history(&self, entry: &WatchHistoryEntry) -> Result<bool>;

    // Geo cache (30-day TTL)
    async fn get_cached_geo(&self, ip: &str) -> Result<Option<GeoResult>>;
    async fn get_cached_geos(&self, ips: &[String]) -> Result<HashMap<String, GeoResult>>;
    async fn set_cached_geo(&self, result: &GeoResult) -> Result<()>;

    // Trust scores
    /// Apply a delta and return the new score, clamped to [0, 100].
    async fn adjust_trust_score(&self, user_name: &str, delta: i32) -> Result<i32>;
    async fn get_trust_score(&self, user_name: &str) -> Result<i32>;

    // Monitored backends (managed by the configuration surface, which
    // is out of scope here; the poller only ever reads them)
    async fn list_backends(&self) -> Result<Vec<BackendConfig>>;

    // Liveness probe for readiness endpoints
    async fn health_check(&self) -> Result<bool>;
}
