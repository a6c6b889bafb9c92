use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Mean Earth radius in kilometers, used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A resolved geolocation for one IP address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoResult {
    pub ip: String,
    pub lat: f64,
    pub lng: f64,
    pub city: Option<String>,
    pub country: Option<String>,
    pub isp: Option<String>,
    pub resolved_at: DateTime<Utc>,
}

impl GeoResult {
    /// NaN or out-of-range coordinates disqualify a location entirely;
    /// a missing fix must never be treated as the equatorial origin.
    pub fn has_coordinates(&self) -> bool {
        coordinates_valid(self.lat, self.lng)
    }
}

pub fn coordinates_valid(lat: f64, lng: f64) -> bool {
    lat.is_finite() && lng.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng)
}

/// Great-circle distance between two points in kilometers (haversine).
/// Returns `None` when either coordinate pair is unusable.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> Option<f64> {
    if !coordinates_valid(lat1, lng1) || !coordinates_valid(lat2, lng2) {
        return None;
    }

    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    Some(EARTH_RADIUS_KM * c)
}

/// IP-to-location lookup. Implementations typically wrap an mmdb reader;
/// a missing result is benign and geo-dependent rules simply skip.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    async fn lookup(&self, ip: &str) -> Result<Option<GeoResult>>;

    /// Resolve a batch of IPs. Unresolvable addresses are absent from
    /// the result map. Caching implementations override this with a
    /// bulk cache read.
    async fn lookup_many(
        &self,
        ips: &[String],
    ) -> Result<std::collections::HashMap<String, GeoResult>> {
        let mut out = std::collections::HashMap::new();
        for ip in ips {
            if let Some(geo) = self.lookup(ip).await? {
                out.insert(ip.clone(), geo);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Mountain View, US and Sydney, AU.
    const MTV: (f64, f64) = (37.386, -122.084);
    const SYD: (f64, f64) = (-33.868, 151.209);

    #[test]
    fn haversine_known_distance() {
        let d = haversine_km(MTV.0, MTV.1, SYD.0, SYD.1).unwrap();
        assert!((11_900.0..12_100.0).contains(&d), "got {}", d);
    }

    #[test]
    fn haversine_zero_distance() {
        let d = haversine_km(MTV.0, MTV.1, MTV.0, MTV.1).unwrap();
        assert!(d < 0.001);
    }

    #[test]
    fn invalid_coordinates_rejected() {
        assert!(haversine_km(f64::NAN, 0.0, 0.0, 0.0).is_none());
        assert!(haversine_km(0.0, 0.0, 91.0, 0.0).is_none());
        assert!(haversine_km(0.0, 181.0, 0.0, 0.0).is_none());
    }
}
