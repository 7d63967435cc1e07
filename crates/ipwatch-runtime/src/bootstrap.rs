//! Service wiring. Registers every long-lived service with its factory so
//! the daemon resolves them by name.

use std::sync::Arc;

use ipwatch_cache::CacheLayer;
use ipwatch_collectors::{build_collector, CollectorSettings, SourceCollector};
use ipwatch_core::{Clock, IpwatchConfig, Registry, Result};
use ipwatch_store::RecordStore;

use crate::orchestrator::CollectionOrchestrator;
use crate::service::IndicatorService;

pub const CONFIG: &str = "config";
pub const CLOCK: &str = "clock";
pub const STORE: &str = "store";
pub const CACHE: &str = "cache";
pub const INDICATORS: &str = "indicators";
pub const ORCHESTRATOR: &str = "orchestrator";

/// Registry name of the collector for `source`.
pub fn collector_name(source: &str) -> String {
    format!("collector:{}", source)
}

/// Register config, clock, store, cache, read service, one collector per
/// configured source, and the orchestrator. Nothing is built until resolved.
pub fn build_registry(config: IpwatchConfig, clock: Arc<dyn Clock>) -> Result<Registry> {
    let registry = Registry::new();
    let sources = config.sources.clone();

    registry.register_instance(CONFIG, Arc::new(config))?;
    registry.register_instance::<dyn Clock>(CLOCK, clock)?;

    registry.register(STORE, |r| {
        let config: Arc<IpwatchConfig> = r.resolve(CONFIG)?;
        let clock: Arc<dyn Clock> = r.resolve(CLOCK)?;
        let store = RecordStore::open(&config.data_paths.db, clock, config.retention.grace_period)?;
        Ok(Arc::new(store))
    })?;

    registry.register(CACHE, |r| {
        let config: Arc<IpwatchConfig> = r.resolve(CONFIG)?;
        Ok(Arc::new(CacheLayer::from_settings(&config.cache)))
    })?;

    registry.register(INDICATORS, |r| {
        Ok(Arc::new(IndicatorService::new(
            r.resolve(STORE)?,
            r.resolve(CACHE)?,
        )))
    })?;

    for source in &sources {
        let settings = CollectorSettings::from_config(source);
        registry.register::<dyn SourceCollector, _>(&collector_name(&source.name), move |_| {
            build_collector(settings.clone())
        })?;
    }

    registry.register(ORCHESTRATOR, |r| {
        let config: Arc<IpwatchConfig> = r.resolve(CONFIG)?;
        let mut orchestrator = CollectionOrchestrator::new(
            r.resolve(INDICATORS)?,
            r.resolve(CLOCK)?,
            config.collection.clone(),
            config.retention.record_ttl,
        )?;
        for source in &config.sources {
            let collector: Arc<dyn SourceCollector> = r.resolve(&collector_name(&source.name))?;
            orchestrator.add_source(collector, source.enabled)?;
        }
        Ok(Arc::new(orchestrator))
    })?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipwatch_core::{Error, SourceConfig, SystemClock};
    use std::time::Duration;
    use tempfile::TempDir;

    fn source(name: &str) -> SourceConfig {
        SourceConfig {
            name: name.into(),
            base_url: "https://portal.example".into(),
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(5),
            enabled: false,
        }
    }

    #[test]
    fn test_registry_builds_lazily() {
        let dir = TempDir::new().unwrap();
        let mut config = IpwatchConfig::with_defaults(dir.path()).unwrap();
        config.sources = vec![source("regtech"), source("secudium")];

        let registry = build_registry(config, Arc::new(SystemClock)).unwrap();
        assert_eq!(registry.get_service_info().instantiated, 0);
        assert!(registry.contains("collector:regtech"));

        let orchestrator: Arc<CollectionOrchestrator> = registry.resolve(ORCHESTRATOR).unwrap();
        assert_eq!(
            orchestrator.sources().collect::<Vec<_>>(),
            vec!["regtech", "secudium"]
        );

        let info = registry.get_service_info();
        assert!(info.services[STORE].instantiated);
        assert!(info.services[INDICATORS].instantiated);
        assert!(dir.path().join("db").join("ipwatch.db").exists());
    }

    #[test]
    fn test_unknown_source_fails_orchestrator() {
        let dir = TempDir::new().unwrap();
        let mut config = IpwatchConfig::with_defaults(dir.path()).unwrap();
        config.sources = vec![source("nowhere")];

        let registry = build_registry(config, Arc::new(SystemClock)).unwrap();
        let result: Result<Arc<CollectionOrchestrator>> = registry.resolve(ORCHESTRATOR);
        assert!(matches!(result, Err(Error::UnknownSource(_))));
    }
}
