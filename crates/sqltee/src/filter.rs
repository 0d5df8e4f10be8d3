//! Tee filter instance: the entry point the host pipeline drives.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::branch::BranchSession;
use crate::config::{Admission, TeeConfig, TeeParams};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, TeeError};
use crate::loop_detect::LoopDetector;
use crate::orphan::OrphanRegistry;
use crate::router::{ClientInfo, Downstream, Upstream};
use crate::session::{SessionId, SessionParts, TeeSession};
use crate::stats::FilterStats;
use crate::topology::{Service, ServiceRegistry};

/// What the host hands over when a client session enters the pipeline.
pub struct SessionContext {
    /// Service whose chain this instance sits in
    pub pipeline: Arc<Service>,
    /// Admission attributes of the client
    pub client: ClientInfo,
    /// Main route
    pub downstream: Arc<dyn Downstream>,
    /// Reply route back to the client
    pub upstream: Arc<dyn Upstream>,
}

/// One configured tee filter.
pub struct TeeFilter {
    config: Arc<TeeConfig>,
    registry: Arc<ServiceRegistry>,
    orphans: Arc<OrphanRegistry>,
    stats: Arc<FilterStats>,
    next_session_id: AtomicU64,
}

impl std::fmt::Debug for TeeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeeFilter")
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl TeeFilter {
    /// Builds an instance named `name`. Fails on a missing or unknown branch
    /// service and on patterns that do not compile.
    pub fn create(
        name: &str,
        params: &TeeParams,
        registry: Arc<ServiceRegistry>,
        orphans: Arc<OrphanRegistry>,
    ) -> Result<Self> {
        let config = TeeConfig::build(name, params, &registry)?;
        info!(
            filter = name,
            service = config.target().name(),
            "tee filter created"
        );
        Ok(Self {
            config: Arc::new(config),
            registry,
            orphans,
            stats: Arc::new(FilterStats::new()),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Instance configuration.
    pub fn config(&self) -> &Arc<TeeConfig> {
        &self.config
    }

    /// Instance-wide counters.
    pub fn stats(&self) -> &Arc<FilterStats> {
        &self.stats
    }

    /// Orphan registry the sessions park their branches in.
    pub fn orphans(&self) -> &Arc<OrphanRegistry> {
        &self.orphans
    }

    /// Admits a client session.
    ///
    /// Refused when duplicating into the branch service would lead back to the
    /// pipeline, or when the branch session cannot be opened. A client that
    /// fails the source or user filter gets a session that only forwards.
    pub fn new_session(&self, ctx: SessionContext) -> Result<TeeSession> {
        let pipeline = ctx.pipeline.name();
        let target = self.config.target();

        if LoopDetector::new(&self.registry).would_loop(pipeline, target.name()) {
            error!("{}: Recursive use of tee filter in service.", pipeline);
            FilterStats::incr(&self.stats.sessions_looped);
            return Err(TeeError::DuplicationLoop {
                service: pipeline.to_string(),
            });
        }

        let id = SessionId::from(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let branch = match self.config.admit(&ctx.client) {
            Admission::Admitted => match BranchSession::open(target, &ctx.client) {
                Ok(branch) => {
                    FilterStats::incr(&self.stats.sessions_active);
                    Some(branch)
                }
                Err(e) => {
                    error!(
                        filter = self.config.name(),
                        error = %e,
                        "Creating client session for Tee filter failed. Terminating session."
                    );
                    FilterStats::incr(&self.stats.branch_open_failures);
                    return Err(e);
                }
            },
            refused => {
                debug!(session = %id, admission = ?refused, "admission filter not met");
                warn!("Tee filter is not active.");
                FilterStats::incr(&self.stats.sessions_inactive);
                None
            }
        };

        Ok(TeeSession::new(SessionParts {
            id,
            config: Arc::clone(&self.config),
            branch,
            downstream: ctx.downstream,
            upstream: ctx.upstream,
            orphans: Arc::clone(&self.orphans),
            stats: Arc::clone(&self.stats),
        }))
    }

    /// Diagnostics for the instance, or for one of its sessions.
    pub fn diagnostics(&self, session: Option<&TeeSession>) -> Diagnostics {
        Diagnostics::collect(&self.config, &self.stats, session)
    }
}
