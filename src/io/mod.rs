//! IO modules - external system interfaces
//!
//! - `upstream` - HTTP client for the facility occupancy API
//! - `store` - SQLite persistence for readings
//! - `dashboard` - HTTP endpoint for the dashboard, live feed and metrics

pub mod dashboard;
pub mod store;
pub mod upstream;

// Re-export commonly used types
pub use store::{SqliteStore, Store, StoreError};
pub use upstream::{FetchError, Fetcher, HttpFetcher};
