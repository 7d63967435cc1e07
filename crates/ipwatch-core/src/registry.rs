//! Capability registry: explicit name to factory table with lazy, memoized
//! construction.
//!
//! Every long-lived service (store, cache, orchestrator, collectors) is
//! registered once at startup and built on first `resolve`. Factories get the
//! registry so they can resolve their own dependencies.

use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Registry) -> Result<Instance> + Send + Sync>;

struct Entry {
    factory: Factory,
    type_name: &'static str,
    instance: OnceCell<Instance>,
}

thread_local! {
    /// Names currently being constructed on this thread, innermost last.
    static RESOLVING: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Diagnostic view of one registered service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceEntryInfo {
    #[serde(rename = "type")]
    pub type_name: &'static str,
    pub instantiated: bool,
}

/// Registered vs. instantiated services.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub registered: usize,
    pub instantiated: usize,
    pub services: BTreeMap<String, ServiceEntryInfo>,
}

/// Thread-safe lazy singleton registry.
#[derive(Default)]
pub struct Registry {
    entries: RwLock<BTreeMap<String, Arc<Entry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under `name`.
    ///
    /// Replacing a factory is allowed until the service has been built.
    pub fn register<T, F>(&self, name: &str, factory: F) -> Result<()>
    where
        T: ?Sized + Send + Sync + 'static,
        F: Fn(&Registry) -> Result<Arc<T>> + Send + Sync + 'static,
    {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(name) {
            if existing.instance.get().is_some() {
                return Err(Error::ServiceAlreadyInstantiated(name.to_string()));
            }
        }

        let erased: Factory = Arc::new(move |registry: &Registry| {
            factory(registry).map(|service| Arc::new(service) as Instance)
        });
        entries.insert(
            name.to_string(),
            Arc::new(Entry {
                factory: erased,
                type_name: std::any::type_name::<T>(),
                instance: OnceCell::new(),
            }),
        );
        debug!("Registered service {}", name);
        Ok(())
    }

    /// Register an already-built instance.
    pub fn register_instance<T>(&self, name: &str, instance: Arc<T>) -> Result<()>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.register(name, move |_| Ok(instance.clone()))
    }

    /// Resolve `name`, constructing it on first use.
    pub fn resolve<T>(&self, name: &str) -> Result<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        // Clone the entry out so factories can resolve other services
        // without holding the table lock.
        let entry = self
            .entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;

        let instance = match entry.instance.get() {
            Some(instance) => instance,
            None => self.construct(name, &entry)?,
        };

        instance
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or_else(|| Error::ServiceTypeMismatch {
                name: name.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    fn construct<'e>(&self, name: &str, entry: &'e Entry) -> Result<&'e Instance> {
        let cycle = RESOLVING.with(|stack| {
            let stack = stack.borrow();
            if stack.iter().any(|n| n == name) {
                let mut chain = stack.clone();
                chain.push(name.to_string());
                Some(chain.join(" -> "))
            } else {
                None
            }
        });
        if let Some(chain) = cycle {
            return Err(Error::ServiceCycle(chain));
        }

        RESOLVING.with(|stack| stack.borrow_mut().push(name.to_string()));
        let result = entry.instance.get_or_try_init(|| {
            let instance = (entry.factory)(self)?;
            info!("Instantiated service {} ({})", name, entry.type_name);
            Ok::<_, Error>(instance)
        });
        RESOLVING.with(|stack| {
            stack.borrow_mut().pop();
        });
        result
    }

    /// Whether a factory is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Registered vs. instantiated services, for diagnostics.
    pub fn get_service_info(&self) -> ServiceInfo {
        let entries = self.entries.read();
        let services: BTreeMap<String, ServiceEntryInfo> = entries
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    ServiceEntryInfo {
                        type_name: entry.type_name,
                        instantiated: entry.instance.get().is_some(),
                    },
                )
            })
            .collect();
        ServiceInfo {
            registered: services.len(),
            instantiated: services.values().filter(|s| s.instantiated).count(),
            services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Greeter: Send + Sync {
        fn greet(&self) -> String;
    }

    struct English;

    impl Greeter for English {
        fn greet(&self) -> String {
            "hello".into()
        }
    }

    #[test]
    fn test_resolve_unregistered() {
        let registry = Registry::new();
        let err = registry.resolve::<String>("missing").unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound(name) if name == "missing"));
    }

    #[test]
    fn test_resolve_memoizes() {
        let registry = Registry::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        registry
            .register("name", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(String::from("ipwatch")))
            })
            .unwrap();

        let a = registry.resolve::<String>("name").unwrap();
        let b = registry.resolve::<String>("name").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_resolve_builds_once() {
        let registry = Arc::new(Registry::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = builds.clone();
        registry
            .register("slow", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
                Ok(Arc::new(42u64))
            })
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.resolve::<u64>("slow").unwrap())
            })
            .collect();
        let values: Vec<Arc<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(values.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_trait_object_services() {
        let registry = Registry::new();
        registry
            .register::<dyn Greeter, _>("greeter", |_| Ok(Arc::new(English)))
            .unwrap();
        let greeter = registry.resolve::<dyn Greeter>("greeter").unwrap();
        assert_eq!(greeter.greet(), "hello");
    }

    #[test]
    fn test_dependencies_resolved_through_registry() {
        let registry = Registry::new();
        registry
            .register("base", |_| Ok(Arc::new(10u32)))
            .unwrap();
        registry
            .register("derived", |r| {
                let base = r.resolve::<u32>("base")?;
                Ok(Arc::new(*base * 2))
            })
            .unwrap();
        assert_eq!(*registry.resolve::<u32>("derived").unwrap(), 20);
        assert_eq!(registry.get_service_info().instantiated, 2);
    }

    #[test]
    fn test_type_mismatch() {
        let registry = Registry::new();
        registry.register("n", |_| Ok(Arc::new(1u8))).unwrap();
        assert!(matches!(
            registry.resolve::<String>("n"),
            Err(Error::ServiceTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let registry = Registry::new();
        registry
            .register("a", |r| r.resolve::<u8>("b"))
            .unwrap();
        registry
            .register("b", |r| r.resolve::<u8>("a"))
            .unwrap();
        assert!(matches!(registry.resolve::<u8>("a"), Err(Error::ServiceCycle(_))));
    }

    #[test]
    fn test_failed_factory_can_retry() {
        let registry = Registry::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        registry
            .register("flaky", move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::Config("not yet".into()))
                } else {
                    Ok(Arc::new(7i32))
                }
            })
            .unwrap();
        assert!(registry.resolve::<i32>("flaky").is_err());
        assert_eq!(*registry.resolve::<i32>("flaky").unwrap(), 7);
    }

    #[test]
    fn test_service_info_and_reregistration() {
        let registry = Registry::new();
        registry.register("a", |_| Ok(Arc::new(1u8))).unwrap();
        registry.register("b", |_| Ok(Arc::new(2u8))).unwrap();
        // Replacing an unbuilt factory is fine.
        registry.register("b", |_| Ok(Arc::new(3u8))).unwrap();

        registry.resolve::<u8>("a").unwrap();
        let info = registry.get_service_info();
        assert_eq!(info.registered, 2);
        assert_eq!(info.instantiated, 1);
        assert!(info.services["a"].instantiated);
        assert!(!info.services["b"].instantiated);

        assert!(matches!(
            registry.register("a", |_| Ok(Arc::new(9u8))),
            Err(Error::ServiceAlreadyInstantiated(_))
        ));
        assert_eq!(*registry.resolve::<u8>("b").unwrap(), 3);
    }
}
