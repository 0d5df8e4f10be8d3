//! Tee filter configuration

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::{Result, TeeError};
use crate::router::ClientInfo;
use crate::topology::{Service, ServiceRegistry};

/// Parameters every filter definition may carry besides its own.
const STANDARD_PARAMETERS: &[&str] = &["type", "module"];

/// Raw parameters of a tee filter definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeeParams {
    /// Service receiving the duplicates
    pub service: Option<String>,
    /// Only duplicate sessions from this source address
    pub source: Option<String>,
    /// Only duplicate sessions of this user
    pub user: Option<String>,
    /// Duplicate statements matching this pattern
    #[serde(rename = "match")]
    pub include: Option<String>,
    /// Duplicate statements not matching this pattern
    pub exclude: Option<String>,
    /// Matcher options: `ignorecase`, `case`, `extended`
    #[serde(default)]
    pub options: Vec<String>,
}

impl TeeParams {
    /// Collects parameters from name/value pairs as handed over by the proxy.
    /// Unknown names are logged and ignored.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut params = Self::default();
        for (name, value) in pairs {
            match name {
                "service" => params.service = Some(value.to_string()),
                "source" => params.source = Some(value.to_string()),
                "user" => params.user = Some(value.to_string()),
                "match" => params.include = Some(value.to_string()),
                "exclude" => params.exclude = Some(value.to_string()),
                "options" => params
                    .options
                    .extend(value.split(',').map(|o| o.trim().to_string())),
                other if STANDARD_PARAMETERS.contains(&other) => {}
                other => warn!("tee: Unexpected parameter '{}'.", other),
            }
        }
        params
    }
}

/// Regex compilation flags derived from the `options` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    /// Case-insensitive matching (default)
    pub case_insensitive: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            case_insensitive: true,
        }
    }
}

impl MatchOptions {
    /// Applies options in order; later ones override earlier ones.
    pub fn parse(options: &[String]) -> Self {
        let mut opts = Self::default();
        for option in options {
            match option.to_ascii_lowercase().as_str() {
                "ignorecase" => opts.case_insensitive = true,
                "case" => opts.case_insensitive = false,
                // Patterns are always compiled with extended syntax.
                "extended" => {}
                "" => {}
                _ => warn!("tee: unsupported option '{}'.", option),
            }
        }
        opts
    }
}

/// Compiled include/exclude statement matchers. Never mutated once built.
#[derive(Debug, Clone, Default)]
pub struct StatementFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl StatementFilter {
    /// Compiles the given patterns.
    pub fn compile(
        include: Option<&str>,
        exclude: Option<&str>,
        options: MatchOptions,
    ) -> Result<Self> {
        Ok(Self {
            include: include
                .map(|p| compile_pattern("match", p, options))
                .transpose()?,
            exclude: exclude
                .map(|p| compile_pattern("exclude", p, options))
                .transpose()?,
        })
    }

    /// Returns true if neither matcher is configured.
    pub fn is_empty(&self) -> bool {
        self.include.is_none() && self.exclude.is_none()
    }

    /// Include-or-not-excluded: either satisfied condition accepts.
    pub fn accepts(&self, statement: &str) -> bool {
        let included = self
            .include
            .as_ref()
            .is_some_and(|re| re.is_match(statement));
        let not_excluded = self
            .exclude
            .as_ref()
            .is_some_and(|re| !re.is_match(statement));
        included || not_excluded
    }

    /// Source text of the include pattern.
    pub fn include_pattern(&self) -> Option<&str> {
        self.include.as_ref().map(Regex::as_str)
    }

    /// Source text of the exclude pattern.
    pub fn exclude_pattern(&self) -> Option<&str> {
        self.exclude.as_ref().map(Regex::as_str)
    }
}

fn compile_pattern(parameter: &str, pattern: &str, options: MatchOptions) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.case_insensitive)
        .build()
        .map_err(|e| {
            error!(
                "tee: Invalid regular expression '{}' for the {} parameter.",
                pattern, parameter
            );
            TeeError::InvalidPattern {
                parameter: parameter.to_string(),
                pattern: pattern.to_string(),
                reason: e.to_string(),
            }
        })
}

/// Outcome of checking a client against the admission filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Duplication enabled for the session
    Admitted,
    /// Client address differs from the configured source
    SourceMismatch {
        /// Address the session came from
        remote: String,
    },
    /// Client user differs from the configured user
    UserMismatch {
        /// User the session authenticated as
        user: String,
    },
}

impl Admission {
    /// Returns true if duplication is enabled.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Immutable configuration of one tee instance.
#[derive(Debug, Clone)]
pub struct TeeConfig {
    name: String,
    target: Arc<Service>,
    source: Option<String>,
    user: Option<String>,
    filter: StatementFilter,
}

impl TeeConfig {
    /// Validates `params` and resolves the branch service in `registry`.
    pub fn build(name: &str, params: &TeeParams, registry: &ServiceRegistry) -> Result<Self> {
        let service_name = params.service.as_deref().ok_or_else(|| {
            error!("tee: filter '{}' has no service parameter.", name);
            TeeError::MissingService
        })?;
        let target = registry.get(service_name).ok_or_else(|| {
            error!("tee: service '{}' not found.", service_name);
            TeeError::ServiceNotFound {
                name: service_name.to_string(),
            }
        })?;
        let options = MatchOptions::parse(&params.options);
        let filter =
            StatementFilter::compile(params.include.as_deref(), params.exclude.as_deref(), options)?;

        Ok(Self {
            name: name.to_string(),
            target,
            source: params.source.clone(),
            user: params.user.clone(),
            filter,
        })
    }

    /// Filter definition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Branch service.
    pub fn target(&self) -> &Arc<Service> {
        &self.target
    }

    /// Required source address, if any.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Required user, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Statement matchers.
    pub fn filter(&self) -> &StatementFilter {
        &self.filter
    }

    /// Checks the admission filters. An attribute the client did not
    /// supply is not compared.
    pub fn admit(&self, client: &ClientInfo) -> Admission {
        if let (Some(source), Some(remote)) = (&self.source, &client.remote) {
            if source != remote {
                return Admission::SourceMismatch {
                    remote: remote.clone(),
                };
            }
        }
        if let (Some(user), Some(client_user)) = (&self.user, &client.user) {
            if user != client_user {
                return Admission::UserMismatch {
                    user: client_user.clone(),
                };
            }
        }
        Admission::Admitted
    }
}

/// Service entry of a topology file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDef {
    /// Service name
    pub name: String,
    /// Filter names, in chain order
    #[serde(default)]
    pub filters: Vec<String>,
}

/// Filter entry of a topology file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDef {
    /// Implementing module
    pub module: String,
    /// Tee parameters; ignored for other modules
    #[serde(flatten)]
    pub params: TeeParams,
}

/// Services and filter definitions loaded from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Services, in definition order
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceDef>,
    /// Filter definitions by name
    #[serde(default, rename = "filter")]
    pub filters: BTreeMap<String, FilterDef>,
}

impl TopologyConfig {
    /// Parses a TOML document and validates it.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| TeeError::TopologyFile {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a topology file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Checks names and references. Tee parameters are checked later, when
    /// the instances are built.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(TeeError::TopologyFile {
                    reason: "service name cannot be empty".to_string(),
                });
            }
            if !seen.insert(service.name.as_str()) {
                return Err(TeeError::TopologyFile {
                    reason: format!("service '{}' defined twice", service.name),
                });
            }
            for filter in &service.filters {
                if !self.filters.contains_key(filter) {
                    return Err(TeeError::TopologyFile {
                        reason: format!(
                            "service '{}' uses undefined filter '{}'",
                            service.name, filter
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DiscardRouter;

    fn registry() -> ServiceRegistry {
        let registry = ServiceRegistry::new();
        registry.define("primary", Arc::new(DiscardRouter::new()));
        registry.define("shadow", Arc::new(DiscardRouter::new()));
        registry
    }

    fn params(service: &str) -> TeeParams {
        TeeParams {
            service: Some(service.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_params_from_pairs() {
        let params = TeeParams::from_pairs([
            ("type", "filter"),
            ("module", "tee"),
            ("service", "shadow"),
            ("match", "^SELECT"),
            ("exclude", "FOR UPDATE"),
            ("source", "10.0.0.1"),
            ("user", "alice"),
            ("options", "case, extended"),
            ("bogus", "x"),
        ]);
        assert_eq!(params.service.as_deref(), Some("shadow"));
        assert_eq!(params.include.as_deref(), Some("^SELECT"));
        assert_eq!(params.exclude.as_deref(), Some("FOR UPDATE"));
        assert_eq!(params.source.as_deref(), Some("10.0.0.1"));
        assert_eq!(params.user.as_deref(), Some("alice"));
        assert_eq!(params.options, vec!["case", "extended"]);
    }

    #[test]
    fn test_match_options_default_ignorecase() {
        assert!(MatchOptions::parse(&[]).case_insensitive);
    }

    #[test]
    fn test_match_options_case() {
        let opts = MatchOptions::parse(&["case".to_string()]);
        assert!(!opts.case_insensitive);
        let opts = MatchOptions::parse(&["case".to_string(), "IGNORECASE".to_string()]);
        assert!(opts.case_insensitive);
    }

    #[test]
    fn test_match_options_unknown_ignored() {
        let opts = MatchOptions::parse(&["nonsense".to_string()]);
        assert_eq!(opts, MatchOptions::default());
    }

    #[test]
    fn test_filter_empty() {
        let filter = StatementFilter::compile(None, None, MatchOptions::default()).unwrap();
        assert!(filter.is_empty());
        assert!(!filter.accepts("SELECT 1"));
    }

    #[test]
    fn test_filter_include_and_exclude_is_inclusive_or() {
        let filter =
            StatementFilter::compile(Some("^SELECT"), Some("users"), MatchOptions::default())
                .unwrap();
        assert!(filter.accepts("SELECT * FROM users"));
        assert!(filter.accepts("DELETE FROM orders"));
        assert!(!filter.accepts("DELETE FROM users"));
    }

    #[test]
    fn test_filter_case_sensitivity() {
        let insensitive =
            StatementFilter::compile(Some("^SELECT"), None, MatchOptions::default()).unwrap();
        assert!(insensitive.accepts("select 1"));

        let sensitive = StatementFilter::compile(
            Some("^SELECT"),
            None,
            MatchOptions {
                case_insensitive: false,
            },
        )
        .unwrap();
        assert!(!sensitive.accepts("select 1"));
    }

    #[test]
    fn test_filter_pattern_text() {
        let filter =
            StatementFilter::compile(Some("a+"), Some("b+"), MatchOptions::default()).unwrap();
        assert_eq!(filter.include_pattern(), Some("a+"));
        assert_eq!(filter.exclude_pattern(), Some("b+"));
    }

    #[test]
    fn test_build_missing_service() {
        let err = TeeConfig::build("dup", &TeeParams::default(), &registry()).unwrap_err();
        assert!(matches!(err, TeeError::MissingService));
    }

    #[test]
    fn test_build_unknown_service() {
        let err = TeeConfig::build("dup", &params("nowhere"), &registry()).unwrap_err();
        assert!(matches!(err, TeeError::ServiceNotFound { .. }));
    }

    #[test]
    fn test_build_invalid_include() {
        let mut p = params("shadow");
        p.include = Some("(unclosed".to_string());
        let err = TeeConfig::build("dup", &p, &registry()).unwrap_err();
        match err {
            TeeError::InvalidPattern { parameter, .. } => assert_eq!(parameter, "match"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_invalid_exclude() {
        let mut p = params("shadow");
        p.exclude = Some("[".to_string());
        let err = TeeConfig::build("dup", &p, &registry()).unwrap_err();
        match err {
            TeeError::InvalidPattern { parameter, .. } => assert_eq!(parameter, "exclude"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_ok() {
        let mut p = params("shadow");
        p.user = Some("alice".to_string());
        let config = TeeConfig::build("dup", &p, &registry()).unwrap();
        assert_eq!(config.name(), "dup");
        assert_eq!(config.target().name(), "shadow");
        assert_eq!(config.user(), Some("alice"));
        assert_eq!(config.source(), None);
        assert!(config.filter().is_empty());
    }

    #[test]
    fn test_admit_without_filters() {
        let config = TeeConfig::build("dup", &params("shadow"), &registry()).unwrap();
        assert!(config.admit(&ClientInfo::new("10.0.0.1", "bob")).is_admitted());
    }

    #[test]
    fn test_admit_user_mismatch() {
        let mut p = params("shadow");
        p.user = Some("alice".to_string());
        let config = TeeConfig::build("dup", &p, &registry()).unwrap();
        assert_eq!(
            config.admit(&ClientInfo::new("10.0.0.1", "bob")),
            Admission::UserMismatch {
                user: "bob".to_string()
            }
        );
        assert!(config.admit(&ClientInfo::new("10.0.0.1", "alice")).is_admitted());
    }

    #[test]
    fn test_admit_source_mismatch() {
        let mut p = params("shadow");
        p.source = Some("10.0.0.1".to_string());
        let config = TeeConfig::build("dup", &p, &registry()).unwrap();
        assert!(matches!(
            config.admit(&ClientInfo::new("10.0.0.2", "alice")),
            Admission::SourceMismatch { .. }
        ));
    }

    #[test]
    fn test_admit_unknown_attributes_not_compared() {
        let mut p = params("shadow");
        p.source = Some("10.0.0.1".to_string());
        p.user = Some("alice".to_string());
        let config = TeeConfig::build("dup", &p, &registry()).unwrap();
        assert!(config.admit(&ClientInfo::default()).is_admitted());
    }

    #[test]
    fn test_topology_from_toml() {
        let text = r#"
            [[service]]
            name = "primary"
            filters = ["dup"]

            [[service]]
            name = "shadow"

            [filter.dup]
            module = "tee"
            service = "shadow"
            match = "^SELECT"
            options = ["case"]
        "#;
        let config = TopologyConfig::from_toml(text).unwrap();
        assert_eq!(config.services.len(), 2);
        let dup = &config.filters["dup"];
        assert_eq!(dup.module, "tee");
        assert_eq!(dup.params.service.as_deref(), Some("shadow"));
        assert_eq!(dup.params.include.as_deref(), Some("^SELECT"));
        assert_eq!(dup.params.options, vec!["case"]);
    }

    #[test]
    fn test_topology_undefined_filter() {
        let text = r#"
            [[service]]
            name = "primary"
            filters = ["missing"]
        "#;
        assert!(matches!(
            TopologyConfig::from_toml(text),
            Err(TeeError::TopologyFile { .. })
        ));
    }

    #[test]
    fn test_topology_duplicate_service() {
        let config = TopologyConfig {
            services: vec![
                ServiceDef {
                    name: "a".to_string(),
                    filters: vec![],
                },
                ServiceDef {
                    name: "a".to_string(),
                    filters: vec![],
                },
            ],
            filters: BTreeMap::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topology_empty_service_name() {
        let config = TopologyConfig {
            services: vec![ServiceDef {
                name: String::new(),
                filters: vec![],
            }],
            filters: BTreeMap::new(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_topology_syntax_error() {
        assert!(TopologyConfig::from_toml("[[service]\nname=").is_err());
    }
}
