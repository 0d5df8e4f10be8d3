#![warn(missing_docs)]

//! sqltee: conditional query duplication for a database-proxy pipeline.
//!
//! A tee filter sits in a service's filter chain, forwards every request on
//! the main route and clones selected requests onto a branch service whose
//! replies are discarded.

pub mod branch;
pub mod config;
pub mod decision;
pub mod deploy;
pub mod diagnostics;
pub mod error;
pub mod filter;
pub mod loop_detect;
pub mod orphan;
pub mod packet;
pub mod router;
pub mod session;
pub mod stats;
pub mod topology;

pub use branch::{BranchSession, BranchState, SessionStatus};
pub use config::{MatchOptions, StatementFilter, TeeConfig, TeeParams, TopologyConfig};
pub use decision::{decide, CloneDecision};
pub use deploy::Deployment;
pub use diagnostics::Diagnostics;
pub use error::{ErrorClass, Result, TeeError};
pub use filter::{SessionContext, TeeFilter};
pub use loop_detect::LoopDetector;
pub use orphan::{spawn_reclaimer, OrphanRegistry, MIN_RECLAIM_PERIOD};
pub use packet::Packet;
pub use router::{ClientInfo, DiscardRouter, Downstream, Router, Upstream};
pub use session::{BranchOutcome, TeeSession};
pub use stats::FilterStats;
pub use topology::{Service, ServiceRegistry};
