//! The collector contract and the variant factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use ipwatch_core::{CollectedIndicator, Error, Result};
use tracing::debug;

use crate::regtech::RegtechCollector;
use crate::secudium::SecudiumCollector;
use crate::types::{CollectorKind, CollectorSettings, RawPayload, Session};

/// A source adapter. Produces a normalized batch and never touches storage.
///
/// Every step is safe to repeat; a failed `collect` can simply be retried.
pub trait SourceCollector: Send + Sync {
    fn source(&self) -> &str;

    /// Log in to the portal. Rejected credentials fail with `Authentication`.
    fn authenticate(&self) -> Result<Session>;

    fn fetch_raw(&self, session: &Session) -> Result<RawPayload>;

    fn parse_to_records(&self, raw: RawPayload) -> Result<Vec<CollectedIndicator>>;

    /// Full pass: login, fetch, parse, then collapse duplicate ips.
    fn collect(&self) -> Result<Vec<CollectedIndicator>> {
        let session = self.authenticate()?;
        let raw = self.fetch_raw(&session)?;
        let parsed = self.parse_to_records(raw)?;
        let total = parsed.len();
        let batch = dedup_latest(parsed);
        debug!(
            "{}: parsed {} rows, {} unique ips",
            self.source(),
            total,
            batch.len()
        );
        Ok(batch)
    }
}

/// Build the collector variant matching `settings.source`.
pub fn build_collector(settings: CollectorSettings) -> Result<Arc<dyn SourceCollector>> {
    match CollectorKind::from_source(&settings.source) {
        Some(CollectorKind::Regtech) => Ok(Arc::new(RegtechCollector::new(settings))),
        Some(CollectorKind::Secudium) => Ok(Arc::new(SecudiumCollector::new(settings))),
        None => Err(Error::UnknownSource(settings.source)),
    }
}

/// Keep one entry per ip: the latest detection, later rows winning ties.
pub fn dedup_latest(items: Vec<CollectedIndicator>) -> Vec<CollectedIndicator> {
    let mut by_ip: BTreeMap<String, CollectedIndicator> = BTreeMap::new();
    for item in items {
        match by_ip.get(&item.ip) {
            Some(existing) if existing.detected_at > item.detected_at => {}
            _ => {
                by_ip.insert(item.ip.clone(), item);
            }
        }
    }
    by_ip.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    fn item(ip: &str, day: u32, confidence: f64) -> CollectedIndicator {
        CollectedIndicator {
            ip: ip.into(),
            detected_at: chrono::Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
            confidence,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_dedup_keeps_latest_detection() {
        let batch = vec![
            item("192.0.2.1", 2, 0.5),
            item("192.0.2.2", 1, 0.5),
            item("192.0.2.1", 5, 0.9),
            item("192.0.2.1", 3, 0.7),
        ];
        let out = dedup_latest(batch);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ip, "192.0.2.1");
        assert_eq!(out[0].confidence, 0.9);
    }

    #[test]
    fn test_dedup_tie_goes_to_later_row() {
        let out = dedup_latest(vec![item("192.0.2.1", 2, 0.5), item("192.0.2.1", 2, 0.8)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.8);
    }

    #[test]
    fn test_build_collector_by_name() {
        let settings = |source: &str| CollectorSettings {
            source: source.into(),
            base_url: "https://portal.example".into(),
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(build_collector(settings("regtech")).unwrap().source(), "regtech");
        assert_eq!(build_collector(settings("secudium")).unwrap().source(), "secudium");
        assert!(matches!(
            build_collector(settings("unknown")),
            Err(Error::UnknownSource(_))
        ));
    }
}
