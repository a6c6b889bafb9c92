use anyhow::Result;
use common::geo::GeoResolver;
use common::history::WatchHistoryEntry;
use common::store::Store;
use std::sync::Arc;
use tracing::{debug, info};

/// Learns trusted household locations from completed viewings. A
/// (user, ip, city, country) that accumulates enough sessions is
/// promoted to trusted, which exempts the user from geographic rules
/// that opt into the exemption.
pub struct HouseholdLearner {
    store: Arc<dyn Store>,
    geo: Arc<dyn GeoResolver>,
    min_sessions: u32,
}

impl HouseholdLearner {
    pub fn new(store: Arc<dyn Store>, geo: Arc<dyn GeoResolver>, min_sessions: u32) -> Self {
        Self {
            store,
            geo,
            min_sessions,
        }
    }

    pub async fn observe(&self, entry: &WatchHistoryEntry) -> Result<()> {
        // A threshold of zero disables auto-learning.
        if self.min_sessions == 0 {
            return Ok(());
        }
        let Some(ip) = entry.ip_address.as_deref() else {
            return Ok(());
        };

        let geo = self.geo.lookup(ip).await.unwrap_or_else(|e| {
            debug!(ip = %ip, error = %e, "geo lookup failed during household learn");
            None
        });
        let (city, country, lat, lng) = match &geo {
            Some(g) => (g.city.as_deref(), g.country.as_deref(), Some(g.lat), Some(g.lng)),
            None => (None, None, None, None),
        };

        let location = self
            .store
            .upsert_household_location(
                &entry.user_name,
                ip,
                city,
                country,
                lat,
                lng,
                false,
                false,
            )
            .await?;

        if !location.trusted && location.session_count >= self.min_sessions as i32 {
            self.store
                .promote_household_location(&entry.user_name, ip, city, country, true)
                .await?;
            info!(
                user = %entry.user_name,
                ip = %ip,
                sessions = location.session_count,
                "household location auto-learned"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo::StaticGeoResolver;
    use chrono::Utc;
    use common::geo::GeoResult;
    use common::history::WatchHistoryEntry;
    use common::streams::{MediaKind, TranscodeDecision};
    use storage::MemoryStore;
    use uuid::Uuid;

    fn entry(user: &str, ip: &str) -> WatchHistoryEntry {
        WatchHistoryEntry {
            id: Uuid::new_v4(),
            backend_id: "plex-main".into(),
            user_name: user.into(),
            media_kind: MediaKind::Movie,
            title: "Some Film".into(),
            parent_title: None,
            grandparent_title: None,
            year: None,
            item_id: None,
            grandparent_item_id: None,
            player: "TV".into(),
            platform: "Roku".into(),
            ip_address: Some(ip.into()),
            video_codec: None,
            audio_codec: None,
            resolution: None,
            transcode_decision: TranscodeDecision::DirectPlay,
            started_at: Utc::now(),
            stopped_at: Utc::now(),
            duration_ms: Some(1_000_000),
            watched_ms: 900_000,
            paused_ms: 0,
            session_count: 1,
        }
    }

    fn paris(ip: &str) -> GeoResult {
        GeoResult {
            ip: ip.into(),
            lat: 48.85,
            lng: 2.35,
            city: Some("Paris".into()),
            country: Some("FR".into()),
            isp: Some("Example ISP".into()),
            resolved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn promotes_after_threshold() {
        let store = Arc::new(MemoryStore::new());
        let resolver = Arc::new(StaticGeoResolver::new().with(paris("192.0.2.1")));
        let learner = HouseholdLearner::new(store.clone(), resolver, 3);

        for _ in 0..2 {
            learner.observe(&entry("carol", "192.0.2.1")).await.unwrap();
            assert!(store.list_trusted_households("carol").await.unwrap().is_empty());
        }

        learner.observe(&entry("carol", "192.0.2.1")).await.unwrap();

        let trusted = store.list_trusted_households("carol").await.unwrap();
        assert_eq!(trusted.len(), 1);
        assert!(trusted[0].auto_learned);
        assert_eq!(trusted[0].session_count, 3);
        assert_eq!(trusted[0].city.as_deref(), Some("Paris"));
    }

    #[tokio::test]
    async fn zero_threshold_disables_learning() {
        let store = Arc::new(MemoryStore::new());
        let learner = HouseholdLearner::new(store.clone(), Arc::new(StaticGeoResolver::new()), 0);

        for _ in 0..20 {
            learner.observe(&entry("carol", "192.0.2.1")).await.unwrap();
        }
        assert!(store.households().await.is_empty());
    }
}
