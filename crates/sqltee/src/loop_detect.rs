//! Duplication loop detection.
//!
//! Walks the graph whose nodes are services and whose edges are tee slots
//! pointing at another service, remembering every service visited. Reaching a
//! visited service again counts as a loop, so two tee paths that converge on
//! the same service are refused as well. A tee slot whose instance is not
//! built yet, or whose target is not registered, cannot be resolved and is a
//! dead end.

use std::collections::HashSet;

use tracing::debug;

use crate::topology::ServiceRegistry;

/// Depth-first cycle search over a service registry.
pub struct LoopDetector<'a> {
    registry: &'a ServiceRegistry,
}

impl<'a> LoopDetector<'a> {
    /// Creates a detector over `registry`.
    pub fn new(registry: &'a ServiceRegistry) -> Self {
        Self { registry }
    }

    /// Returns true if duplication starting at `start` reaches any service
    /// twice.
    pub fn has_loop(&self, start: &str) -> bool {
        let mut visited = HashSet::new();
        self.visit(start, &mut visited)
    }

    /// Returns true if adding the edge `origin -> target` closes a loop:
    /// either `target` is `origin` itself, or the walk from `target` reaches
    /// `origin` or any other service twice.
    pub fn would_loop(&self, origin: &str, target: &str) -> bool {
        if origin == target {
            return true;
        }
        let mut visited = HashSet::from([origin.to_string()]);
        self.visit(target, &mut visited)
    }

    fn visit(&self, node: &str, visited: &mut HashSet<String>) -> bool {
        let Some(service) = self.registry.get(node) else {
            return false;
        };
        if !visited.insert(node.to_string()) {
            debug!(service = node, "duplication loop found");
            return true;
        }
        service
            .tee_targets()
            .iter()
            .any(|next| self.visit(next, visited))
    }
}
