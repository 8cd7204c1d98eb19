//! Domain models - core value types
//!
//! - `Reading` - one occupancy sample (timestamp + per-room head counts)

pub mod reading;

pub use reading::{Occupancy, Reading};
