//! Cache key derivation.
//!
//! The base key hashes everything that changes the result except the
//! concrete invariant filter values, which become [`InvariantTokens`] so
//! requests that differ only in those values share one cache entry and can
//! reuse each other's shards.

use std::collections::BTreeSet;

use route_store::{normalize_token, InvariantTokens};
use sha2::{Digest, Sha256};

use crate::binder::CanonicalParameters;
use crate::route::{InvariantFilter, RouteDefinition};
use crate::value::Value;

/// Derived cache identity of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Hex SHA-256 over route identity and non-invariant parameters.
    pub base_key: String,
    /// Requested invariant values, normalized.
    pub tokens: InvariantTokens,
}

/// Computes the cache key for bound parameters.
///
/// `referenced` lists placeholders used by the query body; pass-through
/// parameters only contribute when referenced there.
pub fn cache_key(
    route: &RouteDefinition,
    params: &CanonicalParameters,
    referenced: &BTreeSet<String>,
) -> CacheKey {
    let invariant_params = route
        .cache
        .invariant_filters
        .iter()
        .map(|filter| filter.param.as_str())
        .collect::<BTreeSet<_>>();

    let mut hasher = Sha256::new();
    let mut field = |label: &str, value: &str| {
        hasher.update((label.len() as u64).to_le_bytes());
        hasher.update(label.as_bytes());
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    };
    field("format", "route-cache-key/v1");
    field("route", &route.id);
    field("version", &route.version);

    for (name, value) in &params.declared {
        if invariant_params.contains(name.as_str()) {
            continue;
        }
        let order_sensitive = route
            .param_spec(name)
            .is_some_and(|spec| spec.order_sensitive);
        field(&format!("param:{name}"), &value.canonical(order_sensitive));
    }
    for (name, value) in &params.passthrough {
        if invariant_params.contains(name.as_str()) || !referenced.contains(name) {
            continue;
        }
        field(&format!("extra:{name}"), &value.canonical(false));
    }

    let mut declarations = route.cache.invariant_filters.iter().collect::<Vec<_>>();
    declarations.sort_by(|left, right| left.param.cmp(&right.param));
    for filter in declarations {
        field(
            &format!("invariant:{}", filter.param),
            &format!(
                "{}|ci={}|sep={}",
                filter.column,
                filter.case_insensitive,
                filter.separator.as_deref().unwrap_or("")
            ),
        );
    }

    CacheKey {
        base_key: hex::encode(hasher.finalize()),
        tokens: invariant_tokens(route, params),
    }
}

/// Normalized invariant value sets requested by `params`.
///
/// An absent, null or empty value leaves the filter unconstrained.
pub fn invariant_tokens(route: &RouteDefinition, params: &CanonicalParameters) -> InvariantTokens {
    let mut tokens = InvariantTokens::new();
    for filter in &route.cache.invariant_filters {
        let Some(value) = params.get(&filter.param) else {
            continue;
        };
        let mut values = BTreeSet::new();
        collect_tokens(filter, value, &mut values);
        tokens.insert(filter.param.clone(), values);
    }
    tokens
}

fn collect_tokens(filter: &InvariantFilter, value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Null => {}
        Value::List(items) => {
            for item in items {
                collect_tokens(filter, item, out);
            }
        }
        scalar => {
            let raw = scalar.column_text();
            let parts: Vec<&str> = match filter.separator.as_deref() {
                Some(separator) if !separator.is_empty() => raw.split(separator).collect(),
                _ => vec![raw.as_str()],
            };
            out.extend(
                parts
                    .into_iter()
                    .filter_map(|part| normalize_token(part, filter.case_insensitive)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{CachePolicy, ParamSpec, ParamType};
    use route_store::SortKey;

    fn route() -> RouteDefinition {
        RouteDefinition::new("sales", "2", "SELECT * FROM sales WHERE amount > $min")
            .param(ParamSpec::new("min", ParamType::Float))
            .param(ParamSpec::new("ids", ParamType::list(ParamType::Int)))
            .param(ParamSpec::new("cols", ParamType::list(ParamType::String)).order_sensitive())
            .param(ParamSpec::new("category", ParamType::String))
            .cache(
                CachePolicy::enabled(vec![SortKey::asc("day")]).invariant(
                    InvariantFilter::new("category", "category")
                        .separator(",")
                        .case_insensitive(),
                ),
            )
    }

    fn params(pairs: Vec<(&str, Value)>) -> CanonicalParameters {
        let mut bound = CanonicalParameters::default();
        for (name, value) in pairs {
            if route().param_spec(name).is_some() {
                bound.declared.insert(name.to_string(), value);
            } else {
                bound.passthrough.insert(name.to_string(), value);
            }
        }
        bound
    }

    fn key(pairs: Vec<(&str, Value)>) -> CacheKey {
        let referenced = BTreeSet::from(["min".to_string()]);
        cache_key(&route(), &params(pairs), &referenced)
    }

    #[test]
    fn equivalent_requests_collide() {
        let first = key(vec![
            ("min", Value::Float(2.0)),
            ("ids", Value::List(vec![Value::Int(3), Value::Int(1), Value::Int(3)])),
            ("category", Value::String("B, a".into())),
        ]);
        let second = key(vec![
            ("category", Value::String("a,b".into())),
            ("ids", Value::List(vec![Value::Int(1), Value::Int(3)])),
            ("min", Value::Int(2)),
        ]);
        assert_eq!(first, second);
        assert_eq!(first.tokens.flatten().len(), 2);
    }

    #[test]
    fn invariant_values_do_not_change_the_base_key() {
        let a = key(vec![("category", Value::String("a".into()))]);
        let b = key(vec![("category", Value::String("b".into()))]);
        assert_eq!(a.base_key, b.base_key);
        assert_ne!(a.tokens, b.tokens);
    }

    #[test]
    fn order_sensitive_lists_and_values_matter() {
        let forward = key(vec![(
            "cols",
            Value::List(vec![Value::String("x".into()), Value::String("y".into())]),
        )]);
        let backward = key(vec![(
            "cols",
            Value::List(vec![Value::String("y".into()), Value::String("x".into())]),
        )]);
        assert_ne!(forward.base_key, backward.base_key);
        assert_ne!(
            key(vec![("min", Value::Float(1.5))]).base_key,
            key(vec![("min", Value::Float(2.5))]).base_key
        );
    }

    #[test]
    fn only_referenced_passthrough_parameters_count() {
        let plain = key(vec![]);
        let noise = key(vec![("utm_source", Value::String("mail".into()))]);
        assert_eq!(plain.base_key, noise.base_key);
    }

    #[test]
    fn float_tokens_keep_the_column_rendering() {
        let priced = RouteDefinition::new("prices", "1", "SELECT * FROM prices")
            .param(ParamSpec::new("price", ParamType::list(ParamType::Float)))
            .cache(
                CachePolicy::enabled(vec![SortKey::asc("id")])
                    .invariant(InvariantFilter::new("price", "price")),
            );
        let mut bound = CanonicalParameters::default();
        bound.declared.insert(
            "price".to_string(),
            Value::List(vec![Value::Float(2.0), Value::Float(2.5)]),
        );
        let tokens = invariant_tokens(&priced, &bound);
        let values = tokens.get("price").expect("price constrained");
        assert_eq!(
            values.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["2.0", "2.5"]
        );
    }

    #[test]
    fn empty_invariant_value_is_unconstrained() {
        assert!(key(vec![("category", Value::String(" , ".into()))])
            .tokens
            .is_unconstrained());
        assert!(key(vec![]).tokens.is_unconstrained());
    }
}
