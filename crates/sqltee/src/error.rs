//! Error types for the tee filter

use thiserror::Error;

/// Broad failure class, used by hosts to decide whether an error aborts
/// instance creation, session admission, or only the duplication path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad filter configuration: the instance is never created.
    Configuration,
    /// Duplication loop: the session is not created.
    Topology,
    /// Branch connection or session could not be created or used.
    BranchUnavailable,
    /// A route refused a packet.
    Routing,
    /// Local I/O (topology file loading).
    Io,
}

/// Errors raised while building tee instances, admitting sessions or routing.
#[derive(Error, Debug)]
pub enum TeeError {
    /// No `service` parameter was given
    #[error("tee: no branch service configured")]
    MissingService,
    /// The `service` parameter names an unknown service
    #[error("tee: service '{name}' not found")]
    ServiceNotFound {
        /// The service name that was not found
        name: String,
    },
    /// A `match` or `exclude` pattern failed to compile
    #[error("tee: invalid regular expression '{pattern}' for the {parameter} parameter: {reason}")]
    InvalidPattern {
        /// Parameter that carried the pattern
        parameter: String,
        /// The pattern text
        pattern: String,
        /// Compiler message
        reason: String,
    },
    /// Following duplication targets leads back to the pipeline
    #[error("{service}: recursive use of tee filter in service")]
    DuplicationLoop {
        /// The pipeline whose session was rejected
        service: String,
    },
    /// Branch connection or session could not be created
    #[error("branch unavailable on service '{service}': {reason}")]
    BranchUnavailable {
        /// Branch service name
        service: String,
        /// Details from the destination route
        reason: String,
    },
    /// A route refused a packet
    #[error("routing failed: {reason}")]
    RouteFailed {
        /// Details from the route
        reason: String,
    },
    /// Topology file could not be parsed or is inconsistent
    #[error("topology file error: {reason}")]
    TopologyFile {
        /// Parse or validation details
        reason: String,
    },
    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl TeeError {
    /// Maps the error onto the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            TeeError::MissingService
            | TeeError::ServiceNotFound { .. }
            | TeeError::InvalidPattern { .. }
            | TeeError::TopologyFile { .. } => ErrorClass::Configuration,
            TeeError::DuplicationLoop { .. } => ErrorClass::Topology,
            TeeError::BranchUnavailable { .. } => ErrorClass::BranchUnavailable,
            TeeError::RouteFailed { .. } => ErrorClass::Routing,
            TeeError::IoError(_) => ErrorClass::Io,
        }
    }
}

/// Result type alias using TeeError as the error type.
pub type Result<T> = std::result::Result<T, TeeError>;
