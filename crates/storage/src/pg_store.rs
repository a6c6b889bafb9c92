use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::geo::GeoResult;
use common::history::WatchHistoryEntry;
use common::rules::{Channel, ChannelKind, Rule, RuleKind, Violation};
use common::store::{DeviceUse, HouseholdLocation, InsertOutcome, Store, GEO_CACHE_TTL_DAYS};
use common::streams::{BackendConfig, BackendKind};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

/// Postgres-backed `Store`. Queries use the runtime API so the crate
/// builds without a reachable database.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn window_start(before: DateTime<Utc>, window_hours: f64) -> DateTime<Utc> {
        before - Duration::seconds((window_hours * 3600.0) as i64)
    }

    fn opt_text(value: Option<&str>) -> String {
        value.unwrap_or_default().to_string()
    }

    fn text_opt(value: String) -> Option<String> {
        if value.is_empty() {
            None
        } else {
            Some(value)
        }
    }

    fn map_rule(row: &PgRow) -> Rule {
        let kind_str: String = row.get("kind");
        let kind = kind_str.parse::<RuleKind>().unwrap_or_else(|e| {
            warn!(kind = %kind_str, error = %e, "unknown rule kind in database, treating as concurrent");
            RuleKind::Concurrent
        });

        Rule {
            id: row.get("id"),
            name: row.get("name"),
            kind,
            enabled: row.get("enabled"),
            config_json: row.get("config_json"),
            channel_ids: row.get("channel_ids"),
        }
    }

    fn map_channel(row: &PgRow) -> Channel {
        let kind_str: String = row.get("kind");
        let kind = kind_str.parse::<ChannelKind>().unwrap_or_else(|e| {
            warn!(kind = %kind_str, error = %e, "unknown channel kind in database, treating as webhook");
            ChannelKind::Webhook
        });

        Channel {
            id: row.get("id"),
            name: row.get("name"),
            kind,
            enabled: row.get("enabled"),
            config_json: row.get("config_json"),
        }
    }

    fn map_history(row: &PgRow) -> WatchHistoryEntry {
        let media_kind_str: String = row.get("media_kind");
        let transcode_str: String = row.get("transcode_decision");

        WatchHistoryEntry {
            id: row.get("id"),
            backend_id: row.get("backend_id"),
            user_name: row.get("user_name"),
            media_kind: media_kind_str.parse().unwrap_or_default(),
            title: row.get("title"),
            parent_title: row.get("parent_title"),
            grandparent_title: row.get("grandparent_title"),
            year: row.get("year"),
            item_id: row.get("item_id"),
            grandparent_item_id: row.get("grandparent_item_id"),
            player: row.get("player"),
            platform: row.get("platform"),
            ip_address: row.get("ip_address"),
            video_codec: row.get("video_codec"),
            audio_codec: row.get("audio_codec"),
            resolution: row.get("resolution"),
            transcode_decision: transcode_str.parse().unwrap_or_default(),
            started_at: row.get("started_at"),
            stopped_at: row.get("stopped_at"),
            duration_ms: row.get("duration_ms"),
            watched_ms: row.get("watched_ms"),
            paused_ms: row.get("paused_ms"),
            session_count: row.get("session_count"),
        }
    }

    fn map_household(row: &PgRow) -> HouseholdLocation {
        HouseholdLocation {
            user_name: row.get("user_name"),
            ip: row.get("ip"),
            city: Self::text_opt(row.get("city")),
            country: Self::text_opt(row.get("country")),
            lat: row.get("lat"),
            lng: row.get("lng"),
            trusted: row.get("trusted"),
            auto_learned: row.get("auto_learned"),
            session_count: row.get("session_count"),
            first_seen: row.get("first_seen"),
            last_seen: row.get("last_seen"),
        }
    }

    fn map_geo(row: &PgRow) -> GeoResult {
        GeoResult {
            ip: row.get("ip"),
            lat: row.get("lat"),
            lng: row.get("lng"),
            city: row.get("city"),
            country: row.get("country"),
            isp: row.get("isp"),
            resolved_at: row.get("resolved_at"),
        }
    }
}

const HISTORY_COLUMNS: &str = "id, backend_id, user_name, media_kind, title, parent_title, \
     grandparent_title, year, item_id, grandparent_item_id, player, platform, ip_address, \
     video_codec, audio_codec, resolution, transcode_decision, started_at, stopped_at, \
     duration_ms, watched_ms, paused_ms, session_count";

#[async_trait]
impl Store for PgStore {
    async fn list_enabled_rules(&self) -> Result<Vec<Rule>> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.name, r.kind, r.enabled, r.config_json,
                   COALESCE(array_agg(rc.channel_id) FILTER (WHERE rc.channel_id IS NOT NULL), '{}') AS channel_ids
            FROM rules r
            LEFT JOIN rule_channels rc ON rc.rule_id = r.id
            WHERE r.enabled = true
            GROUP BY r.id
            ORDER BY r.created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::map_rule).collect())
    }

    async fn list_channels_for_rule(&self, rule_id: Uuid) -> Result<Vec<Channel>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.name, c.kind, c.enabled, c.config_json
            FROM channels c
            JOIN rule_channels rc ON rc.channel_id = c.id
            WHERE rc.rule_id = $1 AND c.enabled = true
            ORDER BY c.created_at ASC
            "#,
        )
        .bind(rule_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::map_channel).collect())
    }

    async fn insert_violation(&self, violation: &Violation) -> Result<InsertOutcome> {
        let details = serde_json::to_value(&violation.details)?;
        let session_key = violation.session_key.as_ref().map(|k| k.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO violations
                (id, rule_id, rule_name, user_name, severity, message, details_json,
                 confidence, occurred_at, session_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(violation.rule_id)
        .bind(&violation.rule_name)
        .bind(&violation.user_name)
        .bind(violation.severity.to_string())
        .bind(&violation.message)
        .bind(details)
        .bind(violation.confidence as i32)
        .bind(violation.occurred_at)
        .bind(session_key)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(InsertOutcome::DuplicateKey)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_user_distinct_ips(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT ip_address, MAX(stopped_at) AS last_seen
            FROM watch_history
            WHERE user_name = $1 AND started_at < $2 AND ip_address IS NOT NULL
            GROUP BY ip_address
            ORDER BY last_seen DESC
            LIMIT $3
            "#,
        )
        .bind(user_name)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("ip_address")).collect())
    }

    async fn get_recent_devices(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Vec<DeviceUse>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT player, platform
            FROM watch_history
            WHERE user_name = $1 AND started_at < $2 AND stopped_at >= $3
            "#,
        )
        .bind(user_name)
        .bind(before)
        .bind(Self::window_start(before, window_hours))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| DeviceUse {
                player: r.get("player"),
                platform: r.get("platform"),
            })
            .collect())
    }

    async fn get_recent_isps(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT g.isp
            FROM watch_history h
            JOIN geo_cache g ON g.ip = h.ip_address
            WHERE h.user_name = $1 AND h.started_at < $2 AND h.stopped_at >= $3
              AND g.isp IS NOT NULL
            "#,
        )
        .bind(user_name)
        .bind(before)
        .bind(Self::window_start(before, window_hours))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("isp")).collect())
    }

    async fn has_device_been_used(
        &self,
        user_name: &str,
        player: &str,
        platform: &str,
        before: DateTime<Utc>,
    ) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM watch_history
                WHERE user_name = $1 AND player = $2 AND platform = $3 AND started_at < $4
            ) AS used
            "#,
        )
        .bind(user_name)
        .bind(player)
        .bind(platform)
        .bind(before)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("used"))
    }

    async fn get_last_stream_before(
        &self,
        user_name: &str,
        before: DateTime<Utc>,
        window_hours: f64,
    ) -> Result<Option<WatchHistoryEntry>> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM watch_history \
             WHERE user_name = $1 AND stopped_at <= $2 AND stopped_at >= $3 \
             ORDER BY stopped_at DESC LIMIT 1"
        );

        let row = sqlx::query(&sql)
            .bind(user_name)
            .bind(before)
            .bind(Self::window_start(before, window_hours))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(Self::map_history))
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
        let row = sqlx::query(
            r#"
            INSERT INTO household_locations
                (user_name, ip, city, country, lat, lng, trusted, auto_learned,
                 session_count, first_seen, last_seen)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 1, NOW(), NOW())
            ON CONFLICT (user_name, ip, city, country) DO UPDATE
            SET session_count = household_locations.session_count + 1,
                last_seen = NOW(),
                trusted = household_locations.trusted OR EXCLUDED.trusted,
                auto_learned = household_locations.auto_learned OR EXCLUDED.auto_learned,
                lat = COALESCE(household_locations.lat, EXCLUDED.lat),
                lng = COALESCE(household_locations.lng, EXCLUDED.lng)
            RETURNING user_name, ip, city, country, lat, lng, trusted, auto_learned,
                      session_count, first_seen, last_seen
            "#,
        )
        .bind(user_name)
        .bind(ip)
        .bind(Self::opt_text(city))
        .bind(Self::opt_text(country))
        .bind(lat)
        .bind(lng)
        .bind(trusted)
        .bind(auto_learned)
        .fetch_one(&self.pool)
        .await?;

        Ok(Self::map_household(&row))
    }

    async fn promote_household_location(
        &self,
        user_name: &str,
        ip: &str,
        city: Option<&str>,
        country: Option<&str>,
        auto_learned: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE household_locations
            SET trusted = true, auto_learned = auto_learned OR $5
            WHERE user_name = $1 AND ip = $2 AND city = $3 AND country = $4
            "#,
        )
        .bind(user_name)
        .bind(ip)
        .bind(Self::opt_text(city))
        .bind(Self::opt_text(country))
        .bind(auto_learned)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_trusted_households(&self, user_name: &str) -> Result<Vec<HouseholdLocation>> {
        let rows = sqlx::query(
            r#"
            SELECT user_name, ip, city, country, lat, lng, trusted, auto_learned,
                   session_count, first_seen, last_seen
            FROM household_locations
            WHERE user_name = $1 AND trusted = true
            "#,
        )
        .bind(user_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::map_household).collect())
    }

    async fn insert_history(&self, entry: &WatchHistoryEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watch_history
                (id, backend_id, user_name, media_kind, title, parent_title,
                 grandparent_title, year, item_id, grandparent_item_id, player, platform,
                 ip_address, video_codec, audio_codec, resolution, transcode_decision,
                 started_at, stopped_at, duration_ms, watched_ms, paused_ms, session_count,
                 watched)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.backend_id)
        .bind(&entry.user_name)
        .bind(entry.media_kind.to_string())
        .bind(&entry.title)
        .bind(&entry.parent_title)
        .bind(&entry.grandparent_title)
        .bind(entry.year)
        .bind(&entry.item_id)
        .bind(&entry.grandparent_item_id)
        .bind(&entry.player)
        .bind(&entry.platform)
        .bind(&entry.ip_address)
        .bind(&entry.video_codec)
        .bind(&entry.audio_codec)
        .bind(&entry.resolution)
        .bind(entry.transcode_decision.to_string())
        .bind(entry.started_at)
        .bind(entry.stopped_at)
        .bind(entry.duration_ms)
        .bind(entry.watched_ms)
        .bind(entry.paused_ms)
        .bind(entry.session_count)
        .bind(entry.watched())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn consolidate_adjacent_history(&self, entry: &WatchHistoryEntry) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM watch_history \
             WHERE backend_id = $1 AND user_name = $2 AND title = $3 AND stopped_at <= $4 \
             ORDER BY stopped_at DESC LIMIT 1 FOR UPDATE"
        );

        let Some(row) = sqlx::query(&sql)
            .bind(&entry.backend_id)
            .bind(&entry.user_name)
            .bind(&entry.title)
            .bind(entry.started_at)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(false);
        };

        let previous = Self::map_history(&row);
        if entry.started_at - previous.stopped_at > Duration::minutes(30) {
            return Ok(false);
        }

        let watched_ms = previous.watched_ms.max(entry.watched_ms);
        let merged = WatchHistoryEntry {
            watched_ms,
            ..previous.clone()
        };

        sqlx::query(
            r#"
            UPDATE watch_history
            SET stopped_at = $2,
                watched_ms = $3,
                paused_ms = paused_ms + $4,
                session_count = session_count + $5,
                watched = $6
            WHERE id = $1
            "#,
        )
        .bind(previous.id)
        .bind(entry.stopped_at)
        .bind(watched_ms)
        .bind(entry.paused_ms)
        .bind(entry.session_count)
        .bind(merged.watched())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_cached_geo(&self, ip: &str) -> Result<Option<GeoResult>> {
        let row = sqlx::query(
            r#"
            SELECT ip, lat, lng, city, country, isp, resolved_at
            FROM geo_cache
            WHERE ip = $1 AND resolved_at > $2
            "#,
        )
        .bind(ip)
        .bind(Utc::now() - Duration::days(GEO_CACHE_TTL_DAYS))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::map_geo))
    }

    async fn get_cached_geos(&self, ips: &[String]) -> Result<HashMap<String, GeoResult>> {
        if ips.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT ip, lat, lng, city, country, isp, resolved_at
            FROM geo_cache
            WHERE ip = ANY($1) AND resolved_at > $2
            "#,
        )
        .bind(ips)
        .bind(Utc::now() - Duration::days(GEO_CACHE_TTL_DAYS))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let geo = Self::map_geo(r);
                (geo.ip.clone(), geo)
            })
            .collect())
    }

    async fn set_cached_geo(&self, result: &GeoResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO geo_cache (ip, lat, lng, city, country, isp, resolved_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (ip) DO UPDATE
            SET lat = $2, lng = $3, city = $4, country = $5, isp = $6, resolved_at = $7
            "#,
        )
        .bind(&result.ip)
        .bind(result.lat)
        .bind(result.lng)
        .bind(&result.city)
        .bind(&result.country)
        .bind(&result.isp)
        .bind(result.resolved_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn adjust_trust_score(&self, user_name: &str, delta: i32) -> Result<i32> {
        let row = sqlx::query(
            r#"
            INSERT INTO trust_scores (user_name, score, updated_at)
            VALUES ($1, LEAST(100, GREATEST(0, 100 + $2)), NOW())
            ON CONFLICT (user_name) DO UPDATE
            SET score = LEAST(100, GREATEST(0, trust_scores.score + $2)),
                updated_at = NOW()
            RETURNING score
            "#,
        )
        .bind(user_name)
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("score"))
    }

    async fn get_trust_score(&self, user_name: &str) -> Result<i32> {
        let row = sqlx::query("SELECT score FROM trust_scores WHERE user_name = $1")
            .bind(user_name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("score")).unwrap_or(100))
    }

    async fn list_backends(&self) -> Result<Vec<BackendConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, base_url, token, trust_proxy, enabled
            FROM backends
            WHERE enabled = true
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let kind_str: String = row.get("kind");
                let kind = match kind_str.parse::<BackendKind>() {
                    Ok(kind) => kind,
                    Err(e) => {
                        warn!(kind = %kind_str, error = %e, "skipping backend with unknown kind");
                        return None;
                    }
                };
                Some(BackendConfig {
                    id: row.get("id"),
                    kind,
                    base_url: row.get("base_url"),
                    token: row.get("token"),
                    trust_proxy: row.get("trust_proxy"),
                    enabled: row.get("enabled"),
                })
            })
            .collect())
    }

    async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}
