use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::geo::GeoResult;
use common::history::WatchHistoryEntry;
use common::rules::{Channel, Rule, Violation};
use common::store::{DeviceUse, HouseholdLocation, InsertOutcome, Store, GEO_CACHE_TTL_DAYS};
use common::streams::BackendConfig;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

/// In-memory `Store` implementation backing tests and scenario runs.
/// Mirrors the Postgres store's observable behavior, including the
/// unique violation index and the geo-cache TTL.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    rules: Vec<Rule>,
    channels: HashMap<Uuid, Channel>,
    violations: Vec<Violation>,
    violation_keys: HashSet<(Uuid, String, String)>,
    history: Vec<WatchHistoryEntry>,
    households: HashMap<HouseholdKey, HouseholdLocation>,
    geo_cache: HashMap<String, GeoResult>,
    trust: HashMap<String, i32>,
    backends: Vec<BackendConfig>,
}

type HouseholdKey = (String, String, String, String);

fn household_key(user: &str, ip: &str, city: Option<&str>, country: Option<&str>) -> HouseholdKey {
    (
        user.to_string(),
        ip.to_string(),
        city.unwrap_or_default().to_string(),
        country.unwrap_or_default().to_string(),
    )
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Test/scenario seeding helpers; the live configuration surface is
    // out of scope for the core.
    pub async fn add_rule(&self, rule: Rule) {
        self.inner.write().await.rules.push(rule);
    }

    pub async fn add_channel(&self, channel: Channel) {
        self.inner.write().await.channels.insert(channel.id, channel);
    }

    pub async fn clear_rules(&self) {
        self.inner.write().await.rules.clear();
    }

    pub async fn seed_history(&self, entry: WatchHistoryEntry) {
        self.inner.write().await.history.push(entry);
    }

    pub async fn violations(&self) -> Vec<Violation> {
        self.inner.read().await.violations.clone()
    }

    pub async fn history(&self) -> Vec<WatchHistoryEntry> {
        self.inner.read().await.history.clone()
    }

    pub async fn households(&self) -> Vec<HouseholdLocation> {
        self.inner.read().await.households.values().cloned().collect()
    }

    pub async fn add_backend(&self, config: BackendConfig) {
        self.inner.write().await.backends.push(config);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        let inner = self.inner.read().await;
        Ok(inner.rules.iter().filter(|r| r.enabled).cloned().collect())
    }

    async fn list_channels_for_rule(&self, rule_id: Uuid) -> Result<Vec<Channel>> {
        let inner = self.inner.read().await;
        let Some(rule) = inner.rules.iter().find(|r| r.id == rule_id) else {
            return Ok(Vec::new());
        };
        Ok(rule
            .channel_ids
            .iter()
            .filter_map(|id| inner.channels.get(id))
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    async fn insert_violation(&self, violation: &Violation) -> Result<InsertOutcome> {
        let mut inner = self.inner.write().await;

        if let Some(key) = &violation.session_key {
            let unique = (
                violation.rule_id,
                violation.user_name.clone(),
                key.to_string(),
            );
            if !inner.violation_keys.insert(unique) {
                return Ok(InsertOutcome::DuplicateKey);
            }
        }

        inner.violations.push(violation.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_user_distinct_ips(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let inner = self.inner.read().await;
        let mut rows: Vec<&WatchHistoryEntry> = inner
            .history
            .iter()
            .filter(|e| e.user_name == user_name && e.started_at < before && e.ip_address.is_some())
            .collect();
        rows.sort_by_key(|e| std::cmp::Reverse(e.stopped_at));

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in rows {
            let Some(ip) = entry.ip_address.clone() else {
                continue;
            };
            if seen.insert(ip.clone()) {
                out.push(ip);
                if out.len() as i64 >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn get_recent_devices(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Vec<DeviceUse>> {
        let window_start = before - Duration::seconds((window_hours * 3600.0) as i64);
        let inner = self.inner.read().await;

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in inner.history.iter().filter(|e| {
            e.user_name == user_name && e.started_at < before && e.stopped_at >= window_start
        }) {
            let device = DeviceUse {
                player: entry.player.clone(),
                platform: entry.platform.clone(),
            };
            if seen.insert(device.clone()) {
                out.push(device);
            }
        }
        Ok(out)
    }

    async fn get_recent_isps(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Vec<String>> {
        let window_start = before - Duration::seconds((window_hours * 3600.0) as i64);
        let inner = self.inner.read().await;

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for entry in inner.history.iter().filter(|e| {
            e.user_name == user_name && e.started_at < before && e.stopped_at >= window_start
        }) {
            let Some(ip) = &entry.ip_address else { continue };
            let Some(isp) = inner.geo_cache.get(ip).and_then(|g| g.isp.clone()) else {
                continue;
            };
            if seen.insert(isp.clone()) {
                out.push(isp);
            }
        }
        Ok(out)
    }

    async fn has_device_been_used(
        &self,
        user_name: &str,
        player: &str,
        platform: &str,
        before: DateTime<Utc>,
    ) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.history.iter().any(|e| {
            e.user_name == user_name
                && e.player == player
                && e.platform == platform
                && e.started_at < before
        }))
    }

    async fn get_last_stream_before(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Option<WatchHistoryEntry>> {
        let window_start = before - Duration::seconds((window_hours * 3600.0) as i64);
        let inner = self.inner.read().await;
        Ok(inner
            .history
            .iter()
            .filter(|e| {
                e.user_name == user_name && e.stopped_at <= before && e.stopped_at >= window_start
            })
            .max_by_key(|e| e.stopped_at)
            .cloned())
    }

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
    ) -> Result<HouseholdLocation> {
        let mut inner = self.inner.write().await;
        let key = household_key(user_name, ip, city, country);
        let now = Utc::now();

        let location = inner
            .households
            .entry(key)
            .and_modify(|loc| {
                loc.session_count += 1;
                loc.last_seen = now;
                loc.trusted |= trusted;
                loc.auto_learned |= auto_learned;
                if loc.lat.is_none() {
                    loc.lat = lat;
                    loc.lng = lng;
                }
            })
            .or_insert_with(|| HouseholdLocation {
                user_name: user_name.to_string(),
                ip: ip.to_string(),
                city: city.map(str::to_string),
                country: country.map(str::to_string),
                lat,
                lng,
                trusted,
                auto_learned,
                session_count: 1,
                first_seen: now,
                last_seen: now,
            });

        Ok(location.clone())
    }

    async fn promote_household_location(
        &self,
        user_name: &str,
        ip: &str,
        city: Option<&str>,
        country: Option<&str>,
        auto_learned: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = household_key(user_name, ip, city, country);
        if let Some(loc) = inner.households.get_mut(&key) {
            loc.trusted = true;
            loc.auto_learned |= auto_learned;
        }
        Ok(())
    }

    async fn list_trusted_households(&self, user_name: &str) -> Result<Vec<HouseholdLocation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .households
            .values()
            .filter(|h| h.user_name == user_name && h.trusted)
            .cloned()
            .collect())
    }

    async fn insert_history(&self, entry: &WatchHistoryEntry) -> Result<()> {
        self.inner.write().await.history.push(entry.clone());
        Ok(())
    }

    async fn consolidate_adjacent_history(&self, entry: &WatchHistoryEntry) -> Result<bool> {
        let mut inner = self.inner.write().await;

        let Some(previous) = inner
            .history
            .iter_mut()
            .filter(|e| {
                e.backend_id == entry.backend_id
                    && e.user_name == entry.user_name
                    && e.title == entry.title
                    && e.stopped_at <= entry.started_at
            })
            .max_by_key(|e| e.stopped_at)
        else {
            return Ok(false);
        };

        let gap = entry.started_at - previous.stopped_at;
        if gap > Duration::minutes(30) {
            return Ok(false);
        }

        previous.stopped_at = entry.stopped_at;
        previous.watched_ms = previous.watched_ms.max(entry.watched_ms);
        previous.paused_ms += entry.paused_ms;
        previous.session_count += entry.session_count;
        Ok(true)
    }

    async fn get_cached_geo(&self, ip: &str) -> Result<Option<GeoResult>> {
        let inner = self.inner.read().await;
        Ok(inner
            .geo_cache
            .get(ip)
            .filter(|g| g.resolved_at + Duration::days(GEO_CACHE_TTL_DAYS) > Utc::now())
            .cloned())
    }

    async fn get_cached_geos(&self, ips: &[String]) -> Result<HashMap<String, GeoResult>> {
        let inner = self.inner.read().await;
        let cutoff = Utc::now() - Duration::days(GEO_CACHE_TTL_DAYS);
        Ok(ips
            .iter()
            .filter_map(|ip| {
                inner
                    .geo_cache
                    .get(ip)
                    .filter(|g| g.resolved_at > cutoff)
                    .map(|g| (ip.clone(), g.clone()))
            })
            .collect())
    }

    async fn set_cached_geo(&self, result: &GeoResult) -> Result<()> {
        self.inner
            .write()
            .await
            .geo_cache
            .insert(result.ip.clone(), result.clone());
        Ok(())
    }

    async fn adjust_trust_score(&self, user_name: &str, delta: i32) -> Result<i32> {
        let mut inner = self.inner.write().await;
        let score = inner.trust.entry(user_name.to_string()).or_insert(100);
        *score = (*score + delta).clamp(0, 100);
        Ok(*score)
    }

    async fn get_trust_score(&self, user_name: &str) -> Result<i32> {
        let inner = self.inner.read().await;
        Ok(*inner.trust.get(user_name).unwrap_or(&100))
    }

    async fn list_backends(&self) -> Result<Vec<BackendConfig>> {
        let inner = self.inner.read().await;
        Ok(inner.backends.iter().filter(|b| b.enabled).cloned().collect())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::rules::Severity;
    use common::streams::SessionKey;

    fn violation(rule_id: Uuid, user: &str, session: Option<SessionKey>) -> Violation {
        Violation {
            rule_id,
            rule_name: "test".into(),
            user_name: user.into(),
            severity: Severity::Warning,
            message: "too many streams".into(),
            details: HashMap::new(),
            confidence: 100,
            occurred_at: Utc::now(),
            session_key: session,
        }
    }

    #[tokio::test]
    async fn duplicate_session_key_is_rejected() {
        let store = MemoryStore::new();
        let rule_id = Uuid::new_v4();
        let key = SessionKey::new("b1", "s1");

        let first = store
            .insert_violation(&violation(rule_id, "bob", Some(key.clone())))
            .await
            .unwrap();
        let second = store
            .insert_violation(&violation(rule_id, "bob", Some(key)))
            .await
            .unwrap();

        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::DuplicateKey);
        assert_eq!(store.violations().await.len(), 1);
    }

    #[tokio::test]
    async fn trust_score_clamps_at_zero() {
        let store = MemoryStore::new();
        for _ in 0..6 {
            store.adjust_trust_score("dave", -20).await.unwrap();
        }
        assert_eq!(store.get_trust_score("dave").await.unwrap(), 0);

        let up = store.adjust_trust_score("dave", 150).await.unwrap();
        assert_eq!(up, 100);
    }

    #[tokio::test]
    async fn household_upsert_counts_sessions() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store
                .upsert_household_location(
                    "carol",
                    "192.0.2.1",
                    Some("Paris"),
                    Some("FR"),
                    Some(48.85),
                    Some(2.35),
                    false,
                    false,
                )
                .await
                .unwrap();
        }

        let loc = store
            .upsert_household_location(
                "carol",
                "192.0.2.1",
                Some("Paris"),
                Some("FR"),
                None,
                None,
                true,
                true,
            )
            .await
            .unwrap();

        assert_eq!(loc.session_count, 4);
        assert!(loc.trusted);
        assert!(loc.auto_learned);
        assert_eq!(store.list_trusted_households("carol").await.unwrap().len(), 1);
    }
}
