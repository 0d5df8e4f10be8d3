//! Services and their filter chains.
//!
//! A service is a routable destination with an ordered list of filter slots.
//! Slots are declared when the service is defined; a tee slot gets its
//! duplication target only once its instance has been built, so during staged
//! startup a slot may exist without a target.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::router::Router;

/// Module name of the tee filter.
pub const TEE_MODULE: &str = "tee";

/// One filter position in a service's chain.
#[derive(Debug)]
pub struct FilterSlot {
    name: String,
    module: String,
    tee_target: OnceLock<String>,
}

impl FilterSlot {
    /// Declares a slot for filter `name` implemented by `module`.
    pub fn new(name: &str, module: &str) -> Self {
        Self {
            name: name.to_string(),
            module: module.to_string(),
            tee_target: OnceLock::new(),
        }
    }

    /// Filter definition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Implementing module.
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Returns true for tee slots.
    pub fn is_tee(&self) -> bool {
        self.module.eq_ignore_ascii_case(TEE_MODULE)
    }

    /// Records the duplication target once the tee instance exists.
    /// Returns false if a target was already bound.
    pub fn bind_tee_target(&self, target: &str) -> bool {
        self.tee_target.set(target.to_string()).is_ok()
    }

    /// Duplication target, if this is a tee slot whose instance is built.
    pub fn tee_target(&self) -> Option<&str> {
        if !self.is_tee() {
            return None;
        }
        self.tee_target.get().map(String::as_str)
    }
}

/// A routable destination.
pub struct Service {
    name: String,
    router: Arc<dyn Router>,
    filters: RwLock<Vec<Arc<FilterSlot>>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("filters", &self.filters.read().len())
            .finish()
    }
}

impl Service {
    /// Creates a service with an empty filter chain.
    pub fn new(name: &str, router: Arc<dyn Router>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            router,
            filters: RwLock::new(Vec::new()),
        })
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Router driving this service's sessions.
    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Appends a filter slot and returns it.
    pub fn add_filter(&self, name: &str, module: &str) -> Arc<FilterSlot> {
        let slot = Arc::new(FilterSlot::new(name, module));
        self.filters.write().push(Arc::clone(&slot));
        slot
    }

    /// Looks up a slot by filter name.
    pub fn filter(&self, name: &str) -> Option<Arc<FilterSlot>> {
        self.filters.read().iter().find(|s| s.name == name).cloned()
    }

    /// Number of filter slots.
    pub fn filter_count(&self) -> usize {
        self.filters.read().len()
    }

    /// Targets of every tee slot whose instance is built, in chain order.
    pub fn tee_targets(&self) -> Vec<String> {
        self.filters
            .read()
            .iter()
            .filter_map(|s| s.tee_target().map(str::to_string))
            .collect()
    }
}

/// All services known to the process, by name.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a service and registers it, replacing any previous one.
    pub fn define(&self, name: &str, router: Arc<dyn Router>) -> Arc<Service> {
        let service = Service::new(name, router);
        self.insert(Arc::clone(&service));
        service
    }

    /// Registers an existing service.
    pub fn insert(&self, service: Arc<Service>) {
        debug!(service = service.name(), "service registered");
        self.services.insert(service.name().to_string(), service);
    }

    /// Looks up a service.
    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.get(name).map(|s| Arc::clone(s.value()))
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns true if no services are registered.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
