//! Per-request duplication decision.

use crate::config::StatementFilter;
use crate::packet::{is_consistency_command, Packet};

/// Whether a request is cloned onto the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneDecision {
    /// Do not duplicate
    Skip,
    /// Forward a clone to the branch
    Clone,
}

impl CloneDecision {
    /// Returns true for [`CloneDecision::Clone`].
    pub fn is_clone(self) -> bool {
        self == CloneDecision::Clone
    }
}

/// Decides whether `packet` is duplicated.
///
/// Session-state commands are always cloned so the branch connection tracks
/// the primary one. Without matchers everything is cloned. Otherwise only
/// `COM_QUERY` text is considered; anything without extractable text is not
/// duplicated.
pub fn decide(filter: &StatementFilter, packet: &Packet) -> CloneDecision {
    if packet.command_byte().is_some_and(is_consistency_command) || filter.is_empty() {
        return CloneDecision::Clone;
    }
    match packet.statement() {
        Some(sql) if filter.accepts(sql) => CloneDecision::Clone,
        _ => CloneDecision::Skip,
    }
}

/// Returns a clone of `packet` if it should be duplicated.
pub fn clone_request(filter: &StatementFilter, packet: &Packet) -> Option<Packet> {
    decide(filter, packet).is_clone().then(|| packet.clone())
}
