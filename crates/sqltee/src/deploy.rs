//! Builds services and tee instances from a topology file.
//!
//! Services and their filter chains are registered first with every tee slot
//! unresolved. Tee instances are then created one by one and their slots bound
//! to the branch service, the same order a proxy follows at startup.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::TopologyConfig;
use crate::error::Result;
use crate::filter::TeeFilter;
use crate::loop_detect::LoopDetector;
use crate::orphan::OrphanRegistry;
use crate::router::Router;
use crate::topology::{Service, ServiceRegistry, TEE_MODULE};

/// A tee instance and the services whose chains contain it.
#[derive(Debug)]
pub struct TeeBinding {
    /// The instance
    pub filter: Arc<TeeFilter>,
    /// Services using it, in definition order
    pub pipelines: Vec<Arc<Service>>,
}

/// Every service and tee instance defined by one topology.
#[derive(Debug)]
pub struct Deployment {
    registry: Arc<ServiceRegistry>,
    tees: BTreeMap<String, TeeBinding>,
}

impl Deployment {
    /// Registers the services of `config`, each with the router `router_for`
    /// returns for its name, and builds every tee instance.
    pub fn build<F>(
        config: &TopologyConfig,
        orphans: Arc<OrphanRegistry>,
        mut router_for: F,
    ) -> Result<Self>
    where
        F: FnMut(&str) -> Arc<dyn Router>,
    {
        config.validate()?;
        let registry = Arc::new(ServiceRegistry::new());
        let mut pipelines: BTreeMap<&str, Vec<Arc<Service>>> = BTreeMap::new();

        for def in &config.services {
            let service = registry.define(&def.name, router_for(&def.name));
            for filter in &def.filters {
                // validate() guarantees the definition exists
                let module = config
                    .filters
                    .get(filter)
                    .map(|f| f.module.as_str())
                    .unwrap_or_default();
                service.add_filter(filter, module);
                if module.eq_ignore_ascii_case(TEE_MODULE) {
                    pipelines
                        .entry(filter.as_str())
                        .or_default()
                        .push(Arc::clone(&service));
                }
            }
        }

        let mut tees = BTreeMap::new();
        for (name, def) in &config.filters {
            if !def.module.eq_ignore_ascii_case(TEE_MODULE) {
                continue;
            }
            let filter = TeeFilter::create(
                name,
                &def.params,
                Arc::clone(&registry),
                Arc::clone(&orphans),
            )?;
            let target = filter.config().target().name().to_string();
            let users = pipelines.remove(name.as_str()).unwrap_or_default();
            if users.is_empty() {
                warn!(filter = %name, "tee filter is not used by any service");
            }
            for service in &users {
                if let Some(slot) = service.filter(name) {
                    slot.bind_tee_target(&target);
                }
            }
            tees.insert(
                name.clone(),
                TeeBinding {
                    filter: Arc::new(filter),
                    pipelines: users,
                },
            );
        }

        info!(
            services = registry.len(),
            tees = tees.len(),
            "topology deployed"
        );
        Ok(Self { registry, tees })
    }

    /// Service registry.
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Tee instance by filter name.
    pub fn tee(&self, name: &str) -> Option<&TeeBinding> {
        self.tees.get(name)
    }

    /// Tee instances by filter name.
    pub fn tees(&self) -> impl Iterator<Item = (&str, &TeeBinding)> {
        self.tees.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Services from which duplication leads back onto the current path.
    pub fn looping_services(&self) -> Vec<String> {
        let detector = LoopDetector::new(&self.registry);
        self.registry
            .names()
            .into_iter()
            .filter(|name| detector.has_loop(name))
            .collect()
    }
}
