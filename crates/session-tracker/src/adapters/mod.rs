pub mod emby;
pub mod jellyfin;
pub mod plex;

pub use emby::EmbyAdapter;
pub use jellyfin::JellyfinAdapter;
pub use plex::PlexAdapter;

use crate::adapter::MediaBackend;
use chrono::{DateTime, Duration, Utc};
use common::streams::{BackendConfig, BackendKind};
use std::sync::Arc;

/// Build the adapter matching a backend's protocol family.
pub fn build(config: &BackendConfig) -> Arc<dyn MediaBackend> {
    match config.kind {
        BackendKind::Plex => Arc::new(PlexAdapter::new(config)),
        BackendKind::Jellyfin => Arc::new(JellyfinAdapter::new(config)),
        BackendKind::Emby => Arc::new(EmbyAdapter::new(config)),
    }
}

/// Session start projected back from the current playback position.
/// None of the three protocols report an authoritative start time.
pub(crate) fn projected_start(now: DateTime<Utc>, progress_ms: i64) -> DateTime<Utc> {
    now - Duration::milliseconds(progress_ms.max(0))
}

/// Drop the port from `host:port` / `[v6]:port` endpoint strings.
pub(crate) fn strip_port(endpoint: &str) -> String {
    if let Some(rest) = endpoint.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return rest[..end].to_string();
        }
    }
    match endpoint.rfind(':') {
        // A lone colon means v4:port; more than one means a bare v6 address.
        Some(idx) if endpoint.matches(':').count() == 1 => endpoint[..idx].to_string(),
        _ => endpoint.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_variants() {
        assert_eq!(strip_port("203.0.113.9:42010"), "203.0.113.9");
        assert_eq!(strip_port("203.0.113.9"), "203.0.113.9");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }
}
