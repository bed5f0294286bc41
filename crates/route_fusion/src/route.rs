//! Compiled route definitions: parameters, cache policy, dependencies, query body.
//!
//! Definitions are produced by the route compiler and are immutable once
//! registered. They deserialize from JSON so compiled routes can be loaded
//! from disk.

use std::path::PathBuf;
use std::time::Duration;

use route_store::{InvariantColumn, SortKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{ErrorKind, RouteError, Stage};
use crate::query::referenced_placeholders;

/// Declared parameter type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ParamType {
    String,
    Int,
    Float,
    Bool,
    Date,
    Timestamp,
    List { element: Box<ParamType> },
    /// Filesystem path that must stay inside `root`.
    Path { root: PathBuf },
    /// SQL-style identifier (`[A-Za-z_][A-Za-z0-9_]*`).
    Identifier,
}

impl ParamType {
    pub fn list(element: ParamType) -> Self {
        Self::List {
            element: Box::new(element),
        }
    }

    pub fn label(&self) -> String {
        match self {
            Self::String => "string".to_string(),
            Self::Int => "int".to_string(),
            Self::Float => "float".to_string(),
            Self::Bool => "bool".to_string(),
            Self::Date => "date".to_string(),
            Self::Timestamp => "timestamp".to_string(),
            Self::List { element } => format!("list<{}>", element.label()),
            Self::Path { .. } => "path".to_string(),
            Self::Identifier => "identifier".to_string(),
        }
    }
}

/// One declared route parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(flatten)]
    pub ty: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    /// Accepted values, compared on their canonical text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<String>>,
    /// Separator for list values supplied as one string (default `,`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    /// List order is meaningful to the query and must survive canonicalization.
    #[serde(default)]
    pub order_sensitive: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
            allowed_values: None,
            separator: None,
            order_sensitive: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: JsonValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn allowed<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    pub fn order_sensitive(mut self) -> Self {
        self.order_sensitive = true;
        self
    }
}

/// Declares a parameter whose value space shards the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantFilter {
    /// Parameter carrying the requested values.
    pub param: String,
    /// Result column the values filter.
    pub column: String,
    /// Splits string values into several tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub separator: Option<String>,
    #[serde(default)]
    pub case_insensitive: bool,
}

impl InvariantFilter {
    pub fn new(param: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            param: param.into(),
            column: column.into(),
            separator: None,
            case_insensitive: false,
        }
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = Some(separator.into());
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub(crate) fn column_mapping(&self) -> InvariantColumn {
        InvariantColumn {
            param: self.param.clone(),
            column: self.column.clone(),
            case_insensitive: self.case_insensitive,
        }
    }
}

/// Per-route cache behavior.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CachePolicy {
    #[serde(default)]
    pub enabled: bool,
    /// Falls back to the executor default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_per_page: Option<usize>,
    #[serde(default)]
    pub order_by: Vec<SortKey>,
    /// Snap request windows to page boundaries unless explicitly `false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforce_page_size: Option<bool>,
    #[serde(default)]
    pub invariant_filters: Vec<InvariantFilter>,
}

impl CachePolicy {
    pub fn enabled(order_by: Vec<SortKey>) -> Self {
        Self {
            enabled: true,
            order_by,
            ..Self::default()
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn rows_per_page(mut self, rows: usize) -> Self {
        self.rows_per_page = Some(rows);
        self
    }

    pub fn enforce_page_size(mut self, enforce: bool) -> Self {
        self.enforce_page_size = Some(enforce);
        self
    }

    pub fn invariant(mut self, filter: InvariantFilter) -> Self {
        self.invariant_filters.push(filter);
        self
    }

    pub fn has_invariants(&self) -> bool {
        !self.invariant_filters.is_empty()
    }

    pub fn invariant_for(&self, param: &str) -> Option<&InvariantFilter> {
        self.invariant_filters
            .iter()
            .find(|filter| filter.param == param)
    }
}

/// How a dependency's rows reach the parent query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyMode {
    /// Result registered as an in-memory table.
    Relation,
    /// Result forced through the cache and scanned from its pages.
    MaterializedPath,
}

impl DependencyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relation => "relation",
            Self::MaterializedPath => "materialized_path",
        }
    }
}

/// Where a dependency argument value comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "from", content = "value")]
pub enum ArgSource {
    /// Parent parameter with the same name.
    PassThrough,
    /// Parent parameter with a different name.
    Rename(String),
    Literal(JsonValue),
}

/// One argument handed to a dependency route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgMapping {
    /// Parameter name on the target route.
    pub param: String,
    pub source: ArgSource,
}

/// Upstream route consumed by this route's query under `alias`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub alias: String,
    pub target: String,
    pub mode: DependencyMode,
    #[serde(default)]
    pub args: Vec<ArgMapping>,
}

impl Dependency {
    pub fn relation(alias: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            target: target.into(),
            mode: DependencyMode::Relation,
            args: Vec::new(),
        }
    }

    pub fn materialized(alias: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            mode: DependencyMode::MaterializedPath,
            ..Self::relation(alias, target)
        }
    }

    pub fn pass(mut self, param: impl Into<String>) -> Self {
        self.args.push(ArgMapping {
            param: param.into(),
            source: ArgSource::PassThrough,
        });
        self
    }

    pub fn rename(mut self, param: impl Into<String>, from: impl Into<String>) -> Self {
        self.args.push(ArgMapping {
            param: param.into(),
            source: ArgSource::Rename(from.into()),
        });
        self
    }

    pub fn literal(mut self, param: impl Into<String>, value: JsonValue) -> Self {
        self.args.push(ArgMapping {
            param: param.into(),
            source: ArgSource::Literal(value),
        });
        self
    }
}

/// A compiled route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    #[serde(default)]
    pub cache: CachePolicy,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Query body; parameters appear as `$name`, dependencies by alias.
    pub body: String,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, version: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            params: Vec::new(),
            cache: CachePolicy::default(),
            dependencies: Vec::new(),
            body: body.into(),
        }
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    pub fn cache(mut self, policy: CachePolicy) -> Self {
        self.cache = policy;
        self
    }

    pub fn depends_on(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn param_spec(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|spec| spec.name == name)
    }

    /// Checks the definition in isolation (no registry lookups).
    pub fn validate(&self) -> Result<(), RouteError> {
        let config_error = |message: String| {
            Err(RouteError::static_check(
                ErrorKind::Configuration,
                &self.id,
                Stage::Validate,
                message,
            ))
        };

        if !is_identifier(&self.id) {
            return config_error(format!("route id `{}` is not an identifier", self.id));
        }
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.params {
            if !seen.insert(spec.name.as_str()) {
                return config_error(format!("parameter `{}` declared twice", spec.name));
            }
            if spec.name.starts_with("__") {
                return config_error(format!(
                    "parameter `{}` uses the reserved `__` prefix",
                    spec.name
                ));
            }
        }

        let referenced = referenced_placeholders(&self.body);
        let mut invariant_params = std::collections::BTreeSet::new();
        for filter in &self.cache.invariant_filters {
            if !invariant_params.insert(filter.param.as_str()) {
                return config_error(format!(
                    "invariant filter on `{}` declared twice",
                    filter.param
                ));
            }
            if referenced.contains(&filter.param) {
                return config_error(format!(
                    "query body references invariant parameter `${}`; invariant values are applied as filters",
                    filter.param
                ));
            }
            if filter.separator.as_deref() == Some("") {
                return config_error(format!(
                    "invariant filter on `{}` has an empty separator",
                    filter.param
                ));
            }
        }
        if self.cache.enabled && self.cache.order_by.is_empty() {
            return config_error("cached routes must declare order_by".to_string());
        }
        if self.cache.rows_per_page == Some(0) {
            return config_error("rows_per_page must be positive".to_string());
        }

        let mut aliases = std::collections::BTreeSet::new();
        for dependency in &self.dependencies {
            if !is_identifier(&dependency.alias) {
                return config_error(format!(
                    "dependency alias `{}` is not an identifier",
                    dependency.alias
                ));
            }
            if !aliases.insert(dependency.alias.to_ascii_lowercase()) {
                return config_error(format!(
                    "dependency alias `{}` declared twice",
                    dependency.alias
                ));
            }
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_identifier(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cached() -> RouteDefinition {
        RouteDefinition::new("sales", "1", "SELECT day, id, category FROM sales")
            .param(ParamSpec::new("category", ParamType::list(ParamType::String)))
            .cache(
                CachePolicy::enabled(vec![SortKey::asc("day")])
                    .invariant(InvariantFilter::new("category", "category")),
            )
    }

    #[test]
    fn valid_definition_passes() {
        cached().validate().expect("valid");
    }

    #[test]
    fn invariant_parameter_in_body_is_rejected() {
        let mut route = cached();
        route.body = "SELECT * FROM sales WHERE category = $category".to_string();
        let err = route.validate().expect_err("invariant in body");
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn cached_route_without_order_is_rejected() {
        let mut route = cached();
        route.cache.order_by.clear();
        assert_eq!(
            route.validate().expect_err("no order").kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn definitions_load_from_json() {
        let route: RouteDefinition = serde_json::from_value(serde_json::json!({
            "id": "sales",
            "version": "3",
            "body": "SELECT * FROM sales WHERE day >= $since",
            "params": [
                {"name": "since", "type": "date", "required": true},
                {"name": "tags", "type": "list", "element": {"type": "string"}, "separator": "|"}
            ],
            "cache": {"enabled": true, "order_by": [{"column": "day"}], "rows_per_page": 50},
            "dependencies": [
                {"alias": "up", "target": "base", "mode": "materialized_path",
                 "args": [{"param": "since", "source": {"from": "pass_through"}}]}
            ]
        }))
        .expect("decode");
        assert_eq!(route.params[1].ty, ParamType::list(ParamType::String));
        assert_eq!(route.dependencies[0].mode, DependencyMode::MaterializedPath);
        route.validate().expect("valid");
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("_a1"));
        assert!(!is_identifier("1a"));
        assert!(!is_identifier("a-b"));
        assert!(!is_identifier(""));
    }
}
