//! Error kinds surfaced by the polling service
//!
//! None of these stop the scheduler; only an explicit shutdown does.

use crate::io::store::StoreError;
use crate::io::upstream::FetchError;
use thiserror::Error;

/// Identifier handed out by the live broadcaster, in subscription order
pub type SubscriptionId = u64;

#[derive(Debug, Error)]
pub enum PollError {
    /// Transient upstream failure; retried after the error delay
    #[error("fetch failed: {0}")]
    FetchFailed(#[from] FetchError),

    /// Store write failed; buffered readings are kept for the next flush
    #[error("flush of {pending} readings failed: {source}")]
    FlushFailed {
        pending: usize,
        #[source]
        source: StoreError,
    },

    /// A live subscriber's callback failed; it has been unsubscribed
    #[error("subscriber {id} failed: {reason}")]
    SubscriberFailed { id: SubscriptionId, reason: String },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler already started")]
    AlreadyStarted,

    #[error("scheduler is shutting down or stopped")]
    Stopped,

    #[error("snapshot query failed: {0}")]
    Store(#[from] StoreError),
}
