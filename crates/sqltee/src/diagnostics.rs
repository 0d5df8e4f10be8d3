//! Read-only configuration and counter summary of a tee instance

use std::fmt;

use serde::Serialize;

use crate::config::TeeConfig;
use crate::session::TeeSession;
use crate::stats::{FilterStats, FilterStatsSnapshot};

/// Per-session part of a [`Diagnostics`] report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionDiagnostics {
    /// Whether duplication is still enabled
    pub active: bool,
    /// Statements duplicated
    pub duplicated: u64,
    /// Statements rejected
    pub rejected: u64,
}

/// Diagnostics report. `Display` renders the tab-indented text form used in
/// admin listings; serde gives the same data as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Filter definition name
    pub filter: String,
    /// Branch service
    pub service: String,
    /// Source address filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// User filter
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Include pattern
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
    /// Exclude pattern
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
    /// Instance-wide counters
    pub totals: FilterStatsSnapshot,
    /// Present when reporting on one session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDiagnostics>,
}

impl Diagnostics {
    /// Collects the report for an instance, and optionally one of its sessions.
    pub fn collect(config: &TeeConfig, stats: &FilterStats, session: Option<&TeeSession>) -> Self {
        Self {
            filter: config.name().to_string(),
            service: config.target().name().to_string(),
            source: config.source().map(str::to_string),
            user: config.user().map(str::to_string),
            include: config.filter().include_pattern().map(str::to_string),
            exclude: config.filter().exclude_pattern().map(str::to_string),
            totals: stats.snapshot(),
            session: session.map(|s| {
                let counters = s.stats();
                SessionDiagnostics {
                    active: counters.active,
                    duplicated: counters.duplicated,
                    rejected: counters.rejected,
                }
            }),
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            writeln!(f, "\t\tLimit to connections from \t\t{}", source)?;
        }
        writeln!(f, "\t\tDuplicate statements to service\t\t{}", self.service)?;
        if let Some(user) = &self.user {
            writeln!(f, "\t\tLimit to user\t\t\t{}", user)?;
        }
        if let Some(include) = &self.include {
            writeln!(f, "\t\tInclude queries that match\t\t{}", include)?;
        }
        if let Some(exclude) = &self.exclude {
            writeln!(f, "\t\tExclude queries that match\t\t{}", exclude)?;
        }
        if let Some(session) = &self.session {
            writeln!(f, "\t\tNo. of statements duplicated:\t{}.", session.duplicated)?;
            writeln!(f, "\t\tNo. of statements rejected:\t{}.", session.rejected)?;
        }
        Ok(())
    }
}
