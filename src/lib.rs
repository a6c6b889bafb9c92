pub mod config;
pub mod routes;

pub use config::AppConfig;
pub use routes::{create_router, AppState};
