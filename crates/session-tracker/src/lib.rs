pub mod adapter;
pub mod adapters;
pub mod geo;
pub mod household;
pub mod poller;
pub mod viewing;

pub use adapter::{AdapterError, MediaBackend};
pub use geo::{CachedGeoResolver, NullGeoResolver, StaticGeoResolver};
pub use household::HouseholdLearner;
pub use poller::{BackendStatus, Poller, PollerConfig};
pub use viewing::ViewingTracker;
