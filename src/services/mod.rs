//! Services - polling logic and state management
//!
//! - `scheduler` - Fetch loop, lifecycle and dashboard queries
//! - `business_hours` - Opening hours policy
//! - `retention` - Buffer of readings awaiting persistence
//! - `broadcaster` - Live fan-out to subscribers
//! - `error` - Service error kinds

pub mod broadcaster;
pub mod business_hours;
pub mod error;
pub mod retention;
pub mod scheduler;

// Re-export commonly used types
pub use broadcaster::{LiveBroadcaster, PublishReport, Subscription};
pub use business_hours::BusinessHours;
pub use error::{PollError, SchedulerError, SubscriptionId};
pub use retention::{FlushReport, RetentionBuffer};
pub use scheduler::{LiveFeed, PollingScheduler, SchedulerState, SchedulerTiming};
