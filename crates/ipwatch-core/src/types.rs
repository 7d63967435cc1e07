//! Indicator records shared by collectors, the store and the read plane.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::to_chrono;
use crate::error::{Error, Result};

/// One indicator as produced by a collector, before it is tied to a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedIndicator {
    pub ip: String,
    pub detected_at: DateTime<Utc>,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A provenance row: one ip as reported by one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub ip: String,
    pub source: String,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl IndicatorRecord {
    /// Attach a collected indicator to `source`. The record stays active for
    /// `ttl` from `ingested_at`, so every re-collection refreshes it.
    pub fn from_collected(
        source: &str,
        item: CollectedIndicator,
        ingested_at: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Self {
        let expires_at = ingested_at.max(item.detected_at) + to_chrono(ttl);
        Self {
            ip: item.ip,
            source: source.to_string(),
            detected_at: item.detected_at,
            expires_at,
            confidence: item.confidence,
            metadata: item.metadata,
        }
    }

    /// Check the record can be stored under `source`. Returns the canonical ip.
    pub fn validate(&self, source: &str) -> Result<String> {
        if self.source != source {
            return Err(Error::Ingest(format!(
                "record for {} belongs to source {}, not {}",
                self.ip, self.source, source
            )));
        }
        let ip = normalize_ip(&self.ip)?;
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::Ingest(format!(
                "confidence {} for {} is outside [0, 1]",
                self.confidence, self.ip
            )));
        }
        if self.expires_at <= self.detected_at {
            return Err(Error::Ingest(format!(
                "record for {} expires before it was detected",
                self.ip
            )));
        }
        Ok(ip)
    }

    /// Whether the record is in the active set at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Parse and canonicalize an ip address (`010.0.0.1` is rejected, `::FFFF:1` lowercased).
pub fn normalize_ip(raw: &str) -> Result<String> {
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| ip.to_string())
        .map_err(|_| Error::Ingest(format!("invalid ip address: {:?}", raw)))
}
