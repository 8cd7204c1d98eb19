//! Upstream occupancy API client
//!
//! The facility API returns a JSON object keyed by room, each value a
//! `[current, max]` pair where either element may be a number or a numeric
//! string:
//!
//! ```text
//! {"swim": ["42", "180"], "gym": [17, 60]}
//! ```
//!
//! Room keys are renamed through the configured alias table; keys without an
//! alias keep their upstream name.

use crate::domain::{Occupancy, Reading};
use crate::infra::clock::Clock;
use crate::infra::config::Config;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("invalid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Source of occupancy readings
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Produce one reading stamped with the fetch time
    async fn fetch(&self) -> Result<Reading, FetchError>;

    /// Last known per-room capacity, if the source reports one
    fn capacities(&self) -> BTreeMap<String, u32> {
        BTreeMap::new()
    }
}

/// Current and maximum head count for one room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomStatus {
    pub current: u32,
    pub max: u32,
}

/// Decode an upstream payload into per-room status, applying room aliases
pub fn parse_payload(
    body: &[u8],
    aliases: &HashMap<String, String>,
) -> Result<BTreeMap<String, RoomStatus>, FetchError> {
    let raw: BTreeMap<String, Value> = serde_json::from_slice(body)?;
    let mut rooms = BTreeMap::new();

    for (key, entry) in raw {
        let pair = entry
            .as_array()
            .filter(|pair| pair.len() >= 2)
            .ok_or_else(|| FetchError::Malformed(format!("room '{key}' is not a [current, max] pair")))?;
        let current = count_value(&pair[0])
            .ok_or_else(|| FetchError::Malformed(format!("room '{key}' has bad current count {}", pair[0])))?;
        let max = count_value(&pair[1])
            .ok_or_else(|| FetchError::Malformed(format!("room '{key}' has bad max count {}", pair[1])))?;

        let room = aliases.get(&key).cloned().unwrap_or(key);
        rooms.insert(room, RoomStatus { current, max });
    }

    if rooms.is_empty() {
        return Err(FetchError::Malformed("no rooms in payload".to_string()));
    }
    Ok(rooms)
}

fn count_value(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// HTTP fetcher for the facility API
pub struct HttpFetcher {
    client: reqwest::Client,
    url: String,
    aliases: HashMap<String, String>,
    clock: Arc<dyn Clock>,
    capacities: RwLock<BTreeMap<String, u32>>,
}

impl HttpFetcher {
    pub fn new(config: &Config, clock: Arc<dyn Clock>) -> Result<Self, FetchError> {
        Self::with_settings(
            config.upstream_url(),
            Duration::from_millis(config.upstream_timeout_ms()),
            config.room_aliases().clone(),
            clock,
        )
    }

    pub fn with_settings(
        url: &str,
        timeout: Duration,
        aliases: HashMap<String, String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, FetchError> {
        // One client for the lifetime of the poller (connection pooling)
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            aliases,
            clock,
            capacities: RwLock::new(BTreeMap::new()),
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self) -> Result<Reading, FetchError> {
        let start = Instant::now();
        let response = self.client.get(&self.url).header("Accept", "application/json").send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.bytes().await?;
        let rooms = parse_payload(&body, &self.aliases)?;
        let timestamp = self.clock.now();

        let occupancy: Occupancy = rooms.iter().map(|(room, s)| (room.clone(), s.current)).collect();
        {
            let mut capacities = self.capacities.write();
            for (room, s) in &rooms {
                capacities.insert(room.clone(), s.max);
            }
        }

        debug!(
            rooms = rooms.len(),
            latency_us = start.elapsed().as_micros() as u64,
            "upstream_fetched"
        );
        Ok(Reading::new(timestamp, occupancy))
    }

    fn capacities(&self) -> BTreeMap<String, u32> {
        self.capacities.read().clone()
    }
}
