use anyhow::Result;
use async_trait::async_trait;
use common::geo::{GeoResolver, GeoResult};
use common::store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Wraps a resolver with the store's geo cache (30-day TTL). Cache
/// misses fall through to the inner resolver and are written back.
pub struct CachedGeoResolver {
    inner: Arc<dyn GeoResolver>,
    store: Arc<dyn Store>,
}

impl CachedGeoResolver {
    pub fn new(inner: Arc<dyn GeoResolver>, store: Arc<dyn Store>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl GeoResolver for CachedGeoResolver {
    async fn lookup(&self, ip: &str) -> Result<Option<GeoResult>> {
        if let Some(cached) = self.store.get_cached_geo(ip).await? {
            return Ok(Some(cached));
        }

        let Some(resolved) = self.inner.lookup(ip).await? else {
            return Ok(None);
        };

        if let Err(e) = self.store.set_cached_geo(&resolved).await {
            debug!(ip = %ip, error = %e, "failed to cache geo result");
        }
        Ok(Some(resolved))
    }

    async fn lookup_many(&self, ips: &[String]) -> Result<HashMap<String, GeoResult>> {
        let mut out = self.store.get_cached_geos(ips).await?;

        for ip in ips {
            if out.contains_key(ip) {
                continue;
            }
            if let Some(resolved) = self.inner.lookup(ip).await? {
                if let Err(e) = self.store.set_cached_geo(&resolved).await {
                    debug!(ip = %ip, error = %e, "failed to cache geo result");
                }
                out.insert(ip.clone(), resolved);
            }
        }
        Ok(out)
    }
}

/// Resolver used when no geo database is configured. Geo-dependent
/// rules skip every stream.
pub struct NullGeoResolver;

#[async_trait]
impl GeoResolver for NullGeoResolver {
    async fn lookup(&self, _ip: &str) -> Result<Option<GeoResult>> {
        Ok(None)
    }
}

/// Fixed-table resolver for tests and scripted scenarios.
#[derive(Default)]
pub struct StaticGeoResolver {
    entries: HashMap<String, GeoResult>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, result: GeoResult) -> Self {
        self.entries.insert(result.ip.clone(), result);
        self
    }

    pub fn insert(&mut self, result: GeoResult) {
        self.entries.insert(result.ip.clone(), result);
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn lookup(&self, ip: &str) -> Result<Option<GeoResult>> {
        Ok(self.entries.get(ip).cloned())
    }
}
