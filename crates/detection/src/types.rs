use anyhow::{ensure, Result};
use serde::Deserialize;
use std::collections::HashMap;

fn default_true() -> bool {
    true
}

fn default_max_speed_km_h() -> f64 {
    800.0
}

fn default_min_distance_km() -> f64 {
    100.0
}

fn default_travel_window_hours() -> f64 {
    24.0
}

fn default_simultaneous_distance_km() -> f64 {
    50.0
}

fn default_device_window_hours() -> f64 {
    1.0
}

fn default_isp_window_hours() -> f64 {
    24.0
}

fn default_severity_threshold_km() -> f64 {
    500.0
}

/// Typed config for the concurrent-streams rule.
#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrentConfig {
    pub max_streams: u32,
    #[serde(default)]
    pub exempt_household: bool,
    #[serde(default)]
    pub count_paused_as_one: bool,
}

impl ConcurrentConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_streams >= 1, "max_streams must be at least 1");
        Ok(())
    }
}

/// Typed config for the geo-restriction rule. Country codes compare
/// case-insensitively.
#[derive(Debug, Clone, Deserialize)]
pub struct GeoRestrictionConfig {
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    #[serde(default)]
    pub exempt_household: bool,
}

impl GeoRestrictionConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.allowed_countries.is_empty() || !self.blocked_countries.is_empty(),
            "at least one of allowed_countries or blocked_countries must be set"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpossibleTravelConfig {
    #[serde(default = "default_max_speed_km_h")]
    pub max_speed_km_h: f64,
    #[serde(default = "default_min_distance_km")]
    pub min_distance_km: f64,
    #[serde(default = "default_travel_window_hours")]
    pub time_window_hours: f64,
}

impl ImpossibleTravelConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_speed_km_h > 0.0, "max_speed_km_h must be positive");
        ensure!(self.min_distance_km >= 0.0, "min_distance_km must not be negative");
        ensure!(self.time_window_hours > 0.0, "time_window_hours must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimultaneousLocationsConfig {
    #[serde(default = "default_simultaneous_distance_km")]
    pub min_distance_km: f64,
    #[serde(default)]
    pub exempt_household: bool,
}

impl SimultaneousLocationsConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.min_distance_km > 0.0, "min_distance_km must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceVelocityConfig {
    pub max_devices_per_hour: u32,
    #[serde(default = "default_device_window_hours")]
    pub time_window_hours: f64,
}

impl DeviceVelocityConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_devices_per_hour >= 1, "max_devices_per_hour must be at least 1");
        ensure!(self.time_window_hours > 0.0, "time_window_hours must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IspVelocityConfig {
    pub max_isps: u32,
    #[serde(default = "default_isp_window_hours")]
    pub time_window_hours: f64,
}

impl IspVelocityConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.max_isps >= 1, "max_isps must be at least 1");
        ensure!(self.time_window_hours > 0.0, "time_window_hours must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewDeviceConfig {
    #[serde(default = "default_true")]
    pub notify_on_new: bool,
}

impl NewDeviceConfig {
    pub fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLocationConfig {
    #[serde(default = "default_true")]
    pub notify_on_new: bool,
    #[serde(default = "default_min_distance_km")]
    pub min_distance_km: f64,
    #[serde(default = "default_severity_threshold_km")]
    pub severity_threshold_km: f64,
    #[serde(default)]
    pub exempt_household: bool,
}

impl NewLocationConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.min_distance_km >= 0.0, "min_distance_km must not be negative");
        ensure!(
            self.severity_threshold_km >= self.min_distance_km,
            "severity_threshold_km must not be below min_distance_km"
        );
        Ok(())
    }
}

// Per-kind notification channel configs, parsed from the channel's
// config blob on every delivery.

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordChannelConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookChannelConfig {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushoverChannelConfig {
    pub token: String,
    pub user_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NtfyChannelConfig {
    pub url: String,
    pub topic: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn concurrent_config_defaults() {
        let config: ConcurrentConfig = serde_json::from_value(json!({ "max_streams": 2 })).unwrap();
        assert!(config.validate().is_ok());
        assert!(!config.exempt_household);
        assert!(!config.count_paused_as_one);
    }

    #[test]
    fn concurrent_config_rejects_zero() {
        let config: ConcurrentConfig = serde_json::from_value(json!({ "max_streams": 0 })).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn impossible_travel_defaults() {
        let config: ImpossibleTravelConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(config.max_speed_km_h, 800.0);
        assert_eq!(config.min_distance_km, 100.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn geo_restriction_requires_a_list() {
        let config: GeoRestrictionConfig = serde_json::from_value(json!({})).unwrap();
        assert!(config.validate().is_err());

        let config: GeoRestrictionConfig =
            serde_json::from_value(json!({ "blocked_countries": ["KP"] })).unwrap();
        assert!(config.validate().is_ok());
    }
}
